//! Alignment arithmetic shared by the allocators.

/// Alignment used for heap-backed objects when the caller does not ask for
/// one: enough for any primitive type on the supported targets.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Resolves a requested alignment to the power of two actually used.
///
/// Zero selects `line_size`. Any other value is rounded up to the next power
/// of two. Returns `None` if the rounding overflows.
///
/// # Examples
///
/// ```
/// use cistern::align;
///
/// assert_eq!(align::power_of_two(0, 64), Some(64));
/// assert_eq!(align::power_of_two(24, 64), Some(32));
/// assert_eq!(align::power_of_two(32, 64), Some(32));
/// ```
#[must_use]
pub fn power_of_two(alignment: usize, line_size: usize) -> Option<usize> {
    let alignment = if alignment == 0 { line_size } else { alignment };
    alignment.max(1).checked_next_power_of_two()
}

/// Rounds `size` up to a multiple of the power of two `alignment`.
///
/// Returns `None` on overflow.
#[must_use]
pub fn stride(size: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    size.checked_next_multiple_of(alignment)
}

/// Returns `true` if `addr` is a multiple of the power of two `alignment`.
#[must_use]
pub fn is_aligned(addr: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    addr & (alignment - 1) == 0
}

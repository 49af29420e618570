//! Page and cache-line size queries.
//!
//! Values come from `sysconf(3)` the first time they are asked for and are
//! cached afterwards. A query that fails, or returns something that is not a
//! power of two, falls back to a conventional default.

use core::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_LINE_SIZE: usize = 64;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static LINE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the virtual memory page size.
#[must_use]
pub fn page_size() -> usize {
    cached(&PAGE_SIZE, query_page_size)
}

/// Returns the level 1 data cache line size.
#[must_use]
pub fn line_size() -> usize {
    cached(&LINE_SIZE, query_line_size)
}

fn cached(cell: &AtomicUsize, query: fn() -> usize) -> usize {
    match cell.load(Ordering::Relaxed) {
        0 => {
            let value = query();
            cell.store(value, Ordering::Relaxed);
            value
        }
        value => value,
    }
}

#[cfg(unix)]
fn query_page_size() -> usize {
    sanitize(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }, DEFAULT_PAGE_SIZE)
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn query_line_size() -> usize {
    sanitize(
        unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) },
        DEFAULT_LINE_SIZE,
    )
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn query_line_size() -> usize {
    DEFAULT_LINE_SIZE
}

#[cfg(unix)]
fn sanitize(value: libc::c_long, default: usize) -> usize {
    usize::try_from(value)
        .ok()
        .filter(|v| v.is_power_of_two())
        .unwrap_or(default)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_powers_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(line_size().is_power_of_two());
        assert!(line_size() <= page_size());
    }

    #[test]
    fn test_cached_value_is_stable() {
        assert_eq!(page_size(), page_size());
        assert_eq!(line_size(), line_size());
    }

    #[cfg(unix)]
    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(-1, 4096), 4096);
        assert_eq!(sanitize(0, 64), 64);
        assert_eq!(sanitize(48, 64), 64);
        assert_eq!(sanitize(16384, 4096), 16384);
    }
}

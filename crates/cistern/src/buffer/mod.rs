//! Malloc-style buffers carved from fixed size classes.
//!
//! [`BufferPool`] is the allocator itself and can be used directly. The free
//! functions in this module forward to one process-wide table guarded by a
//! spin lock. The default table ([`DEFAULT_SIZES`]) is built on first use,
//! and [`set`] swaps in a caller-supplied one.
//!
//! Heap-fallback suppression ([`set_nomalloc`]) is a process-wide flag. It
//! survives table swaps.
//!
//! ```
//! use cistern::buffer;
//!
//! let ptr = buffer::malloc(100).unwrap();
//! unsafe { buffer::free(ptr) };
//! ```

use alloc::vec::Vec;
use core::{
    ffi::CStr,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

pub use self::table::{BufferPool, ClassStats, DEFAULT_SIZES};
use crate::error::AllocError;

mod table;

static ACTIVE: Mutex<Option<BufferPool>> = Mutex::new(None);
static NOMALLOC: AtomicBool = AtomicBool::new(false);

fn with_active<T, F>(f: F) -> T
where
    F: FnOnce(&mut BufferPool) -> T,
{
    let mut active = ACTIVE.lock();
    let pool = active.get_or_insert_with(BufferPool::default);
    pool.set_nomalloc(NOMALLOC.load(Ordering::Acquire));
    f(pool)
}

/// Makes `pool` the process-wide table and returns the previous one.
///
/// Buffers allocated from the previous table may still be freed through
/// this module; they land on the new table's rings when their capacity
/// matches one of its classes, and go back to the heap otherwise.
pub fn set(pool: BufferPool) -> BufferPool {
    let mut active = ACTIVE.lock();
    active.replace(pool).unwrap_or_default()
}

/// Reinstates a default table and returns the table that was active.
pub fn restore() -> BufferPool {
    set(BufferPool::default())
}

/// Enables or disables heap fallback suppression for every table, returning
/// the previous setting.
pub fn set_nomalloc(enable: bool) -> bool {
    NOMALLOC.swap(enable, Ordering::AcqRel)
}

#[must_use]
pub fn nomalloc() -> bool {
    NOMALLOC.load(Ordering::Acquire)
}

/// See [`BufferPool::malloc`].
pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    with_active(|pool| pool.malloc(size))
}

/// See [`BufferPool::calloc`].
pub fn calloc(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    with_active(|pool| pool.calloc(count, size))
}

/// See [`BufferPool::realloc`].
///
/// # Safety
///
/// `ptr` must be a live buffer from this module or a [`BufferPool`].
pub unsafe fn realloc(
    ptr: Option<NonNull<u8>>,
    size: usize,
) -> Result<Option<NonNull<u8>>, AllocError> {
    with_active(|pool| unsafe { pool.realloc(ptr, size) })
}

/// See [`BufferPool::free`].
///
/// # Safety
///
/// `ptr` must be a live buffer from this module or a [`BufferPool`].
pub unsafe fn free(ptr: NonNull<u8>) {
    with_active(|pool| unsafe { pool.free(ptr) });
}

pub fn strdup(s: &CStr) -> Result<NonNull<u8>, AllocError> {
    with_active(|pool| pool.strdup(s))
}

pub fn strndup(s: &CStr, n: usize) -> Result<NonNull<u8>, AllocError> {
    with_active(|pool| pool.strndup(s, n))
}

/// See [`BufferPool::prealloc`].
pub fn prealloc(count: usize, size: usize) -> usize {
    with_active(|pool| pool.prealloc(count, size))
}

/// Releases every free-listed buffer of the active table.
pub fn fini() {
    with_active(BufferPool::fini);
}

#[must_use]
pub fn stats() -> Vec<ClassStats> {
    with_active(|pool| pool.stats())
}

pub fn log() {
    with_active(|pool| pool.log());
}

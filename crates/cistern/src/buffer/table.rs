use alloc::{
    alloc::{alloc, dealloc},
    vec::Vec,
};
use core::{alloc::Layout, ffi::CStr, fmt, ptr::NonNull};

use log::{debug, info, trace};
use ring_list::{NodeId, Ring};
use snafu::{OptionExt as _, ensure};

use crate::error::{AllocError, HeapSnafu, InvalidConfigSnafu, OverflowSnafu, SuppressedSnafu};

/// Size classes used when no table is supplied.
pub const DEFAULT_SIZES: [usize; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Prefix of every buffer block.
///
/// The header keeps the payload aligned to 16 bytes and records the payload
/// capacity, which decides where the block goes when it is freed.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
struct Header {
    size: usize,
}

const HEADER_SIZE: usize = size_of::<Header>();
const HEADER_ALIGN: usize = align_of::<Header>();
const _: () = assert!(HEADER_SIZE == HEADER_ALIGN);

fn block_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(HEADER_SIZE.checked_add(size)?, HEADER_ALIGN).ok()
}

unsafe fn payload(block: NonNull<u8>) -> NonNull<u8> {
    unsafe { block.add(HEADER_SIZE) }
}

unsafe fn block(payload: NonNull<u8>) -> NonNull<u8> {
    unsafe { payload.sub(HEADER_SIZE) }
}

unsafe fn header(payload: NonNull<u8>) -> Header {
    unsafe { block(payload).cast::<Header>().read() }
}

unsafe fn release(block: NonNull<u8>, size: usize) {
    trace!("buffer pool: {size} bytes back to the heap");
    unsafe {
        dealloc(
            block.as_ptr(),
            Layout::from_size_align_unchecked(HEADER_SIZE + size, HEADER_ALIGN),
        );
    }
}

/// Free-list occupancy of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub size: usize,
    pub free: usize,
}

/// A segregated free-list allocator over fixed size classes.
///
/// Requests are rounded up to the smallest class that fits and served from
/// that class's free ring. When the ring is empty, or no class fits, the
/// request is served from the heap at exactly the requested size. A freed
/// buffer joins the ring of the class whose size equals its capacity, and
/// goes back to the heap if there is none. Rings are filled by freeing
/// class-sized buffers or with [`prealloc`](Self::prealloc).
///
/// With [`set_nomalloc`](Self::set_nomalloc) enabled, any request the free
/// rings cannot satisfy fails with [`AllocError::Suppressed`] instead of
/// touching the heap.
pub struct BufferPool {
    sizes: Vec<usize>,
    ring: Ring<Option<NonNull<u8>>>,
    roots: Vec<NodeId>,
    spare: NodeId,
    nomalloc: bool,
}

// The table exclusively owns every free-listed block.
unsafe impl Send for BufferPool {}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("sizes", &self.sizes)
            .field("nomalloc", &self.nomalloc)
            .finish_non_exhaustive()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::build(DEFAULT_SIZES.to_vec())
    }
}

impl BufferPool {
    /// Creates a table with the given class sizes.
    ///
    /// Sizes must be non-empty, non-zero and strictly increasing.
    ///
    /// # Examples
    ///
    /// ```
    /// use cistern::buffer::BufferPool;
    ///
    /// let mut pool = BufferPool::new(&[16, 64, 256]).unwrap();
    /// assert_eq!(pool.class_of(40), Some(1));
    /// assert_eq!(pool.class_of(300), None);
    ///
    /// pool.prealloc(1, 64);
    /// let ptr = pool.malloc(40).unwrap();
    /// assert_eq!(pool.stats()[1].free, 0);
    /// unsafe { pool.free(ptr) };
    /// assert_eq!(pool.stats()[1].free, 1);
    /// ```
    pub fn new(sizes: &[usize]) -> Result<Self, AllocError> {
        ensure!(
            !sizes.is_empty(),
            InvalidConfigSnafu {
                reason: "at least one size class is required"
            }
        );
        ensure!(
            sizes[0] > 0,
            InvalidConfigSnafu {
                reason: "size classes must not be zero"
            }
        );
        ensure!(
            sizes.windows(2).all(|w| w[0] < w[1]),
            InvalidConfigSnafu {
                reason: "size classes must be strictly increasing"
            }
        );
        block_layout(sizes[sizes.len() - 1]).context(OverflowSnafu)?;
        Ok(Self::build(sizes.to_vec()))
    }

    fn build(sizes: Vec<usize>) -> Self {
        let mut ring = Ring::with_capacity(sizes.len() + 1);
        let roots = sizes.iter().map(|_| ring.node(None)).collect();
        let spare = ring.node(None);
        debug!("buffer pool: classes {sizes:?}");
        Self {
            sizes,
            ring,
            roots,
            spare,
            nomalloc: false,
        }
    }

    /// Class sizes in increasing order.
    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Index of the smallest class that holds `size` bytes, or `None` if
    /// the request exceeds every class.
    #[must_use]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        self.sizes.iter().position(|&s| s >= size)
    }

    /// Enables or disables heap-fallback suppression, returning the
    /// previous setting.
    pub fn set_nomalloc(&mut self, enable: bool) -> bool {
        core::mem::replace(&mut self.nomalloc, enable)
    }

    #[must_use]
    pub fn nomalloc(&self) -> bool {
        self.nomalloc
    }

    /// Allocates `size` bytes.
    ///
    /// The returned buffer is uninitialized. Fails with
    /// [`AllocError::Suppressed`] when the heap would be needed but
    /// fallback is suppressed, or [`AllocError::Heap`] if the heap refuses or
    /// `size` is too large to ever be served.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if let Some(block) = self.class_of(size).and_then(|c| self.take(c)) {
            return Ok(unsafe { payload(block) });
        }
        ensure!(!self.nomalloc, SuppressedSnafu { size });
        let block = Self::heap(size)?;
        Ok(unsafe { payload(block) })
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).context(HeapSnafu {
            size: count.saturating_mul(size),
        })?;
        let ptr = self.malloc(total)?;
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    /// Resizes a buffer.
    ///
    /// `None` behaves like [`malloc`](Self::malloc). A zero `size` frees
    /// `ptr` and returns `Ok(None)`. Otherwise a new buffer is allocated, the
    /// first `min(old capacity, size)` bytes are copied, and the old buffer
    /// is freed. On failure the old buffer is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of this module's allocation
    /// functions and not freed since.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return self.malloc(size).map(Some);
        };
        if size == 0 {
            unsafe { self.free(old) };
            return Ok(None);
        }
        let old_size = unsafe { header(old).size };
        let new = self.malloc(size)?;
        unsafe {
            new.as_ptr()
                .copy_from_nonoverlapping(old.as_ptr(), old_size.min(size));
            self.free(old);
        }
        Ok(Some(new))
    }

    /// Copies a C string, terminator included, into a new buffer.
    pub fn strdup(&mut self, s: &CStr) -> Result<NonNull<u8>, AllocError> {
        let bytes = s.to_bytes_with_nul();
        let ptr = self.malloc(bytes.len())?;
        unsafe {
            ptr.as_ptr()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(ptr)
    }

    /// Copies at most `n` bytes of a C string into a new, terminated buffer.
    pub fn strndup(&mut self, s: &CStr, n: usize) -> Result<NonNull<u8>, AllocError> {
        let bytes = s.to_bytes();
        let len = bytes.len().min(n);
        let ptr = self.malloc(len.checked_add(1).context(HeapSnafu { size: usize::MAX })?)?;
        unsafe {
            ptr.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), len);
            ptr.as_ptr().add(len).write(0);
        }
        Ok(ptr)
    }

    /// Returns a buffer to the ring of the class whose size equals its
    /// capacity, or to the heap if no class matches.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of this module's allocation
    /// functions and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Header { size } = unsafe { header(ptr) };
        let block = unsafe { block(ptr) };
        match self.sizes.binary_search(&size) {
            Ok(class) => {
                self.put(class, block);
            }
            Err(_) => unsafe { release(block, size) },
        }
    }

    /// Payload capacity of a buffer: its class size if it came from a ring,
    /// the requested size otherwise.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live buffer from this module.
    #[must_use]
    pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
        unsafe { header(ptr).size }
    }

    /// Puts `count` fresh buffers able to hold `size` bytes on the matching
    /// class ring.
    ///
    /// Returns the number of bytes committed, headers included, or 0 if
    /// `size` exceeds every class. Stops early if the heap refuses.
    pub fn prealloc(&mut self, count: usize, size: usize) -> usize {
        let Some(class) = self.class_of(size) else {
            return 0;
        };
        let capacity = self.sizes[class];
        let mut total = 0;
        for _ in 0..count {
            let Ok(block) = Self::heap(capacity) else {
                break;
            };
            if !self.put(class, block) {
                break;
            }
            total += HEADER_SIZE + capacity;
        }
        debug!("buffer pool: preallocated {total} bytes for class {capacity}");
        total
    }

    /// Releases every free-listed buffer to the heap.
    ///
    /// Outstanding buffers are not reachable from the table and are left
    /// alone.
    pub fn fini(&mut self) {
        let mut released = 0;
        for (class, &size) in self.sizes.iter().enumerate() {
            while let Some(node) = self.ring.pop(self.roots[class]) {
                if let Some(block) = self.ring.data_mut(node).take() {
                    unsafe { release(block, size) };
                    released += 1;
                }
                self.ring.push(self.spare, node);
            }
        }
        debug!("buffer pool: released {released} buffers");
    }

    /// Free-list occupancy of every class.
    #[must_use]
    pub fn stats(&self) -> Vec<ClassStats> {
        self.sizes
            .iter()
            .zip(&self.roots)
            .map(|(&size, &root)| ClassStats {
                size,
                free: self.ring.len(root),
            })
            .collect()
    }

    /// Writes the free-list occupancy of every class to the log.
    pub fn log(&self) {
        for ClassStats { size, free } in self.stats() {
            info!("buffer pool: class {size}: {free} free");
        }
    }

    fn take(&mut self, class: usize) -> Option<NonNull<u8>> {
        let node = self.ring.pop(self.roots[class])?;
        let block = self.ring.data_mut(node).take();
        self.ring.push(self.spare, node);
        block
    }

    /// Free-lists `block`, or hands it back to the heap and returns `false`
    /// if no list node can be allocated for it.
    fn put(&mut self, class: usize, block: NonNull<u8>) -> bool {
        let node = match self.ring.pop(self.spare) {
            Some(node) => node,
            None => match self.ring.try_node(None) {
                Ok(node) => node,
                Err(_) => {
                    unsafe { release(block, self.sizes[class]) };
                    return false;
                }
            },
        };
        *self.ring.data_mut(node) = Some(block);
        self.ring.push(self.roots[class], node);
        true
    }

    fn heap(size: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = block_layout(size).context(HeapSnafu { size })?;
        let block = NonNull::new(unsafe { alloc(layout) }).context(HeapSnafu { size })?;
        unsafe { block.cast::<Header>().write(Header { size }) };
        trace!("buffer pool: {size} bytes from the heap");
        Ok(block)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.fini();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{align, error::ErrorKind};

    fn free_counts(pool: &BufferPool) -> Vec<usize> {
        pool.stats().iter().map(|s| s.free).collect()
    }

    #[test]
    fn test_default_sizes() {
        let pool = BufferPool::default();
        assert_eq!(pool.sizes(), &DEFAULT_SIZES);
        assert_eq!(pool.class_of(0), Some(0));
        assert_eq!(pool.class_of(4096), Some(9));
        assert_eq!(pool.class_of(4097), None);
    }

    #[test]
    fn test_invalid_tables() {
        let tables: [&[usize]; 4] = [&[], &[0, 8], &[16, 16], &[64, 32]];
        for sizes in tables {
            let err = BufferPool::new(sizes).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config);
        }
        assert!(matches!(
            BufferPool::new(&[8, usize::MAX]),
            Err(AllocError::Overflow { .. })
        ));
    }

    #[test]
    fn test_three_class_scenario() {
        let mut pool = BufferPool::new(&[16, 64, 256]).unwrap();
        pool.prealloc(1, 40);

        let small = pool.malloc(40).unwrap();
        assert_eq!(unsafe { BufferPool::usable_size(small) }, 64);
        assert_eq!(free_counts(&pool), [0, 0, 0]);

        let large = pool.malloc(300).unwrap();
        assert_eq!(unsafe { BufferPool::usable_size(large) }, 300);

        unsafe { pool.free(large) };
        assert_eq!(free_counts(&pool), [0, 0, 0]);

        unsafe { pool.free(small) };
        assert_eq!(free_counts(&pool), [0, 1, 0]);

        let again = pool.malloc(50).unwrap();
        assert_eq!(again, small);
        assert_eq!(free_counts(&pool), [0, 0, 0]);
        unsafe { pool.free(again) };
    }

    #[test]
    fn test_heap_fallback_uses_requested_size() {
        let mut pool = BufferPool::new(&[16, 64, 256]).unwrap();

        let odd = pool.malloc(40).unwrap();
        assert_eq!(unsafe { BufferPool::usable_size(odd) }, 40);
        unsafe { pool.free(odd) };
        assert_eq!(free_counts(&pool), [0, 0, 0]);

        let exact = pool.malloc(64).unwrap();
        assert_eq!(unsafe { BufferPool::usable_size(exact) }, 64);
        unsafe { pool.free(exact) };
        assert_eq!(free_counts(&pool), [0, 1, 0]);
    }

    #[test]
    fn test_payload_alignment() {
        let mut pool = BufferPool::default();
        let ptrs: Vec<_> = [1, 9, 100, 5000]
            .into_iter()
            .map(|n| pool.malloc(n).unwrap())
            .collect();
        for &p in &ptrs {
            assert!(align::is_aligned(p.as_ptr().addr(), HEADER_ALIGN));
        }
        for p in ptrs {
            unsafe { pool.free(p) };
        }
    }

    #[test]
    fn test_calloc_zeroes() {
        let mut pool = BufferPool::new(&[64]).unwrap();
        let p = pool.malloc(64).unwrap();
        unsafe { p.as_ptr().write_bytes(0xff, 64) };
        unsafe { pool.free(p) };

        let z = pool.calloc(8, 8).unwrap();
        assert_eq!(z, p);
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { pool.free(z) };

        let err = pool.calloc(usize::MAX, 2).unwrap_err();
        assert!(matches!(err, AllocError::Heap { .. }));
        assert_eq!(err.errno(), libc::ENOMEM);
    }

    #[test]
    fn test_oversized_requests_are_out_of_memory() {
        let mut pool = BufferPool::default();
        for size in [usize::MAX - 8, usize::MAX, isize::MAX.unsigned_abs()] {
            let err = pool.malloc(size).unwrap_err();
            assert!(matches!(err, AllocError::Heap { .. }));
            assert_eq!(err.kind(), ErrorKind::Exhausted);
            assert_eq!(err.errno(), libc::ENOMEM);
        }
        let err = unsafe { pool.realloc(None, usize::MAX) }.unwrap_err();
        assert_eq!(err.errno(), libc::ENOMEM);
    }

    #[test]
    fn test_realloc_semantics() {
        let mut pool = BufferPool::new(&[16, 64]).unwrap();
        pool.prealloc(1, 16);

        let p = unsafe { pool.realloc(None, 10) }.unwrap().unwrap();
        assert_eq!(unsafe { BufferPool::usable_size(p) }, 16);
        for i in 0..10_u8 {
            unsafe { p.as_ptr().add(usize::from(i)).write(i) };
        }

        let q = unsafe { pool.realloc(Some(p), 100) }.unwrap().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 10) };
        assert_eq!(bytes, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(free_counts(&pool), [1, 0]);

        let r = unsafe { pool.realloc(Some(q), 4) }.unwrap().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(r.as_ptr(), 4) };
        assert_eq!(bytes, [0, 1, 2, 3]);

        assert_eq!(unsafe { pool.realloc(Some(r), 0) }.unwrap(), None);
        assert_eq!(free_counts(&pool), [1, 0]);
    }

    #[test]
    fn test_strdup_and_strndup() {
        let mut pool = BufferPool::default();
        let s = c"cistern";

        let p = pool.strdup(s).unwrap();
        let copy = unsafe { CStr::from_ptr(p.as_ptr().cast()) };
        assert_eq!(copy, s);

        let q = pool.strndup(s, 3).unwrap();
        let copy = unsafe { CStr::from_ptr(q.as_ptr().cast()) };
        assert_eq!(copy, c"cis");

        let r = pool.strndup(s, 100).unwrap();
        let copy = unsafe { CStr::from_ptr(r.as_ptr().cast()) };
        assert_eq!(copy, s);

        for ptr in [p, q, r] {
            unsafe { pool.free(ptr) };
        }
    }

    #[test]
    fn test_prealloc() {
        let mut pool = BufferPool::new(&[16, 64, 256]).unwrap();
        assert_eq!(pool.prealloc(3, 50), 3 * (HEADER_SIZE + 64));
        assert_eq!(free_counts(&pool), [0, 3, 0]);
        assert_eq!(pool.prealloc(3, 257), 0);
        assert_eq!(pool.prealloc(0, 8), 0);
    }

    #[test]
    fn test_nomalloc() {
        let mut pool = BufferPool::new(&[16, 64]).unwrap();
        pool.prealloc(1, 64);
        assert!(!pool.set_nomalloc(true));
        assert!(pool.nomalloc());

        let p = pool.malloc(60).unwrap();
        let err = pool.malloc(60).unwrap_err();
        assert!(matches!(err, AllocError::Suppressed { size: 60, .. }));
        assert_eq!(err.errno(), libc::ENOMEM);
        assert!(pool.malloc(1000).is_err());

        unsafe { pool.free(p) };
        let q = pool.malloc(33).unwrap();
        assert_eq!(q, p);
        unsafe { pool.free(q) };

        assert!(pool.set_nomalloc(false));
        let big = pool.malloc(1000).unwrap();
        unsafe { pool.free(big) };
    }

    #[test]
    fn test_free_into_other_table_uses_current_classes() {
        let mut a = BufferPool::new(&[16, 64]).unwrap();
        let mut b = BufferPool::new(&[32, 64]).unwrap();
        a.prealloc(1, 16);
        a.prealloc(1, 64);

        let p16 = a.malloc(10).unwrap();
        let p64 = a.malloc(50).unwrap();

        // `b` has no 16-byte class.
        unsafe { b.free(p16) };
        unsafe { b.free(p64) };

        assert_eq!(free_counts(&a), [0, 0]);
        assert_eq!(free_counts(&b), [0, 1]);
    }

    #[test]
    fn test_fini_keeps_working() {
        let mut pool = BufferPool::new(&[16]).unwrap();
        pool.prealloc(4, 16);
        pool.fini();
        assert_eq!(free_counts(&pool), [0]);

        let p = pool.malloc(16).unwrap();
        unsafe { pool.free(p) };
        assert_eq!(free_counts(&pool), [1]);
    }

    #[test]
    fn test_spare_nodes_are_recycled() {
        let mut pool = BufferPool::new(&[16]).unwrap();
        for _ in 0..100 {
            let p = pool.malloc(16).unwrap();
            unsafe { pool.free(p) };
        }
        assert_eq!(pool.ring.node_count(), 1 + 1 + 1);
    }

    proptest! {
        #[test]
        fn prop_smallest_fitting_class(
            sizes in prop::collection::btree_set(1_usize..=4096, 1..8),
            request in 0_usize..=5000,
        ) {
            let sizes: Vec<_> = sizes.into_iter().collect();
            let pool = BufferPool::new(&sizes).unwrap();
            match pool.class_of(request) {
                Some(c) => {
                    prop_assert!(sizes[c] >= request);
                    prop_assert!(c == 0 || sizes[c - 1] < request);
                }
                None => prop_assert!(request > sizes[sizes.len() - 1]),
            }
        }

        #[test]
        fn prop_realloc_preserves_prefix(old in 1_usize..600, new in 1_usize..600) {
            let mut pool = BufferPool::new(&[16, 64, 256]).unwrap();
            let p = pool.malloc(old).unwrap();
            for i in 0..old {
                unsafe { p.as_ptr().add(i).write(u8::try_from(i % 251).unwrap()) };
            }
            let q = unsafe { pool.realloc(Some(p), new) }.unwrap().unwrap();
            for i in 0..old.min(new) {
                let b = unsafe { q.as_ptr().add(i).read() };
                prop_assert_eq!(usize::from(b), i % 251);
            }
            unsafe { pool.free(q) };
        }
    }
}

//! Growable pool of equally sized heap objects.
//!
//! A [`Pool`] starts empty. When its free ring runs dry it allocates one more
//! object from the heap; objects handed back with [`Pool::free`] go onto the
//! free ring instead of back to the heap, so the object count only grows
//! until the pool is finalized.
//!
//! Objects are handed out as [`PoolObject`] handles. A handle records which
//! pool and which ring node it came from, so ownership is carried by the
//! handle rather than recovered from raw memory, and a handle cannot be freed
//! twice because freeing consumes it.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::{
    alloc::Layout,
    fmt,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace, warn};
use ring_list::{NodeId, Ring};
use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    align::DEFAULT_ALIGNMENT,
    error::{
        AllocError, FaultSnafu, ForeignHandleSnafu, HeapSnafu, InvalidConfigSnafu,
        OutstandingSnafu,
    },
};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-unique identity of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(usize);

/// An object checked out of a [`Pool`].
///
/// Hand it back with [`Pool::free`] on the pool that produced it. Dropping a
/// handle without freeing it leaves the object outstanding.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a pool object leaks it until the pool is finalized"]
pub struct PoolObject {
    pool: PoolId,
    node: NodeId,
    ptr: NonNull<u8>,
    size: usize,
}

// The handle is only an address and two indices.
unsafe impl Send for PoolObject {}

impl PoolObject {
    /// Address of the object's first byte.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the object in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Identity of the pool this object belongs to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

/// A single-size object pool that grows on demand.
pub struct Pool {
    id: PoolId,
    ring: Ring<NonNull<u8>>,
    free: NodeId,
    layout: Layout,
    outstanding: usize,
}

// The pool exclusively owns every object it has allocated.
unsafe impl Send for Pool {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("object_size", &self.layout.size())
            .field("alignment", &self.layout.align())
            .field("object_count", &self.object_count())
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Creates an empty pool of `size`-byte objects with the default
    /// alignment.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        Self::with_alignment(size, DEFAULT_ALIGNMENT)
    }

    /// Creates an empty pool of `size`-byte objects aligned to `alignment`.
    ///
    /// Fails with [`AllocError::InvalidConfig`] if `size` is zero or
    /// `alignment` is not a power of two.
    pub fn with_alignment(size: usize, alignment: usize) -> Result<Self, AllocError> {
        ensure!(
            size > 0,
            InvalidConfigSnafu {
                reason: "object size must not be zero"
            }
        );
        let layout = Layout::from_size_align(size, alignment)
            .ok()
            .context(InvalidConfigSnafu {
                reason: "alignment must be a power of two",
            })?;

        let mut ring = Ring::new();
        let free = ring.node(NonNull::dangling());
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        debug!("pool {}: {size}-byte objects aligned to {alignment}", id.0);

        Ok(Self {
            id,
            ring,
            free,
            layout,
            outstanding: 0,
        })
    }

    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn object_size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Number of objects ever allocated from the heap.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.ring.node_count() - 1
    }

    /// Number of objects waiting on the free ring.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.object_count() - self.outstanding
    }

    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding
    }

    /// Checks out an object, growing the pool if its free ring is empty.
    ///
    /// New objects are zero-filled; recycled ones keep their previous
    /// contents. Fails only with [`AllocError::Heap`].
    pub fn alloc(&mut self) -> Result<PoolObject, AllocError> {
        let node = match self.ring.pop(self.free) {
            Some(node) => node,
            None => {
                let ptr = NonNull::new(unsafe { alloc_zeroed(self.layout) }).context(
                    HeapSnafu {
                        size: self.layout.size(),
                    },
                )?;
                let Ok(node) = self.ring.try_node(ptr) else {
                    unsafe { dealloc(ptr.as_ptr(), self.layout) };
                    return HeapSnafu {
                        size: Ring::<NonNull<u8>>::node_size(),
                    }
                    .fail();
                };
                trace!("pool {}: grew to {} objects", self.id.0, self.object_count());
                node
            }
        };
        self.outstanding += 1;
        Ok(PoolObject {
            pool: self.id,
            node,
            ptr: *self.ring.data(node),
            size: self.layout.size(),
        })
    }

    /// Puts `object` back on the free ring.
    ///
    /// A handle from another pool is rejected with
    /// [`AllocError::ForeignHandle`] and stays outstanding in its own pool.
    pub fn free(&mut self, object: PoolObject) -> Result<(), AllocError> {
        self.check(&object)?;
        self.ring.push(self.free, object.node);
        self.outstanding -= 1;
        Ok(())
    }

    /// Borrows the bytes of an outstanding object.
    pub fn bytes(&self, object: &PoolObject) -> Result<&[u8], AllocError> {
        self.check(object)?;
        Ok(unsafe { slice::from_raw_parts(object.ptr.as_ptr(), object.size) })
    }

    /// Mutably borrows the bytes of an outstanding object.
    pub fn bytes_mut(&mut self, object: &PoolObject) -> Result<&mut [u8], AllocError> {
        self.check(object)?;
        Ok(unsafe { slice::from_raw_parts_mut(object.ptr.as_ptr(), object.size) })
    }

    fn check(&self, object: &PoolObject) -> Result<(), AllocError> {
        ensure!(object.pool == self.id, ForeignHandleSnafu);
        let addr = object.ptr.as_ptr().addr();
        // Outstanding nodes are solitary; anything else is already free.
        ensure!(
            object.node != self.free
                && self.ring.is_empty(object.node)
                && *self.ring.data(object.node) == object.ptr,
            FaultSnafu { addr }
        );
        Ok(())
    }

    /// Releases every free object back to the heap.
    ///
    /// Outstanding objects cannot be reclaimed: they are leaked and reported
    /// with [`AllocError::Outstanding`].
    pub fn fini(self) -> Result<(), AllocError> {
        let count = self.outstanding;
        drop(self);
        ensure!(count == 0, OutstandingSnafu { count });
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let mut released = 0;
        while let Some(node) = self.ring.pop(self.free) {
            unsafe { dealloc(self.ring.data(node).as_ptr(), self.layout) };
            released += 1;
        }
        if self.outstanding > 0 {
            warn!(
                "pool {}: {} objects outstanding, leaking them",
                self.id.0, self.outstanding
            );
        }
        debug!("pool {}: released {released} objects", self.id.0);
    }
}

/// A [`Pool`] behind a mutex, built lazily on first use.
///
/// ```
/// use cistern::pool::LockedPool;
///
/// static POOL: LockedPool = LockedPool::new(48);
///
/// let object = POOL.alloc().unwrap();
/// assert_eq!(object.size(), 48);
/// POOL.free(object).unwrap();
/// POOL.fini().unwrap();
/// ```
#[derive(Debug)]
pub struct LockedPool {
    size: usize,
    alignment: usize,
    pool: Mutex<Option<Pool>>,
}

impl LockedPool {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self::with_alignment(size, DEFAULT_ALIGNMENT)
    }

    #[must_use]
    pub const fn with_alignment(size: usize, alignment: usize) -> Self {
        Self {
            size,
            alignment,
            pool: Mutex::new(None),
        }
    }

    /// Builds the pool now instead of on first allocation.
    pub fn init(&self) -> Result<(), AllocError> {
        let mut pool = self.pool.lock();
        self.get_or_init(&mut pool)?;
        Ok(())
    }

    pub fn alloc(&self) -> Result<PoolObject, AllocError> {
        let mut pool = self.pool.lock();
        self.get_or_init(&mut pool)?.alloc()
    }

    pub fn free(&self, object: PoolObject) -> Result<(), AllocError> {
        let mut pool = self.pool.lock();
        let pool = pool.as_mut().context(ForeignHandleSnafu)?;
        pool.free(object)
    }

    /// Releases the pool, refusing while objects are outstanding.
    pub fn fini(&self) -> Result<(), AllocError> {
        let mut pool = self.pool.lock();
        if let Some(p) = pool.as_ref() {
            ensure!(
                p.outstanding_count() == 0,
                OutstandingSnafu {
                    count: p.outstanding_count()
                }
            );
        }
        match pool.take() {
            Some(p) => p.fini(),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, Pool::outstanding_count)
    }

    fn get_or_init<'a>(&self, slot: &'a mut Option<Pool>) -> Result<&'a mut Pool, AllocError> {
        let pool = match slot.take() {
            Some(pool) => pool,
            None => Pool::with_alignment(self.size, self.alignment)?,
        };
        Ok(slot.insert(pool))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{align, error::ErrorKind};

    #[test]
    fn test_starts_empty_and_grows() {
        let mut pool = Pool::new(40).unwrap();
        assert_eq!(pool.object_count(), 0);
        assert_eq!(pool.free_count(), 0);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.object_count(), 2);
        assert_eq!(pool.outstanding_count(), 2);
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.size(), 40);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.object_count(), 2);
        assert_eq!(pool.free_count(), 2);
        pool.fini().unwrap();
    }

    #[test]
    fn test_freed_objects_are_reused() {
        let mut pool = Pool::new(16).unwrap();
        let a = pool.alloc().unwrap();
        let addr = a.as_ptr();
        pool.free(a).unwrap();

        let b = pool.alloc().unwrap();
        assert_eq!(b.as_ptr(), addr);
        assert_eq!(pool.object_count(), 1);
        pool.free(b).unwrap();
    }

    #[test]
    fn test_round_trip_restores_counts() {
        let mut pool = Pool::new(8).unwrap();
        let warm = pool.alloc().unwrap();
        pool.free(warm).unwrap();
        let before = (pool.free_count(), pool.outstanding_count());

        let object = pool.alloc().unwrap();
        pool.free(object).unwrap();

        assert_eq!((pool.free_count(), pool.outstanding_count()), before);
    }

    #[test]
    fn test_alignment() {
        let mut pool = Pool::with_alignment(24, 256).unwrap();
        let object = pool.alloc().unwrap();
        assert!(align::is_aligned(object.as_ptr().as_ptr().addr(), 256));
        pool.free(object).unwrap();

        let err = Pool::with_alignment(24, 24).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Pool::new(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_bytes_access() {
        let mut pool = Pool::new(32).unwrap();
        let object = pool.alloc().unwrap();
        assert!(pool.bytes(&object).unwrap().iter().all(|&b| b == 0));

        pool.bytes_mut(&object).unwrap().fill(0xa5);
        assert!(pool.bytes(&object).unwrap().iter().all(|&b| b == 0xa5));

        pool.free(object).unwrap();
        let again = pool.alloc().unwrap();
        assert!(pool.bytes(&again).unwrap().iter().all(|&b| b == 0xa5));
        pool.free(again).unwrap();
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let mut p1 = Pool::new(16).unwrap();
        let mut p2 = Pool::new(16).unwrap();
        assert_ne!(p1.id(), p2.id());

        let object = p1.alloc().unwrap();
        assert!(matches!(
            p2.bytes(&object),
            Err(AllocError::ForeignHandle { .. })
        ));
        let err = p2.free(object).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fault);
        assert_eq!(p1.outstanding_count(), 1);
        assert_eq!(p2.free_count(), 0);
    }

    #[test]
    fn test_forged_handle_is_fault() {
        let mut pool = Pool::new(16).unwrap();
        let object = pool.alloc().unwrap();
        let forged = PoolObject {
            pool: object.pool,
            node: object.node,
            ptr: object.ptr,
            size: object.size,
        };
        pool.free(object).unwrap();

        assert!(matches!(pool.free(forged), Err(AllocError::Fault { .. })));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_fini_with_outstanding_objects() {
        let mut pool = Pool::new(16).unwrap();
        let kept = pool.alloc().unwrap();
        let returned = pool.alloc().unwrap();
        pool.free(returned).unwrap();

        let err = pool.fini().unwrap_err();
        assert!(matches!(err, AllocError::Outstanding { count: 1, .. }));
        // The leaked object is still valid memory.
        unsafe { kept.as_ptr().as_ptr().write_bytes(0, kept.size()) };
    }

    #[test]
    fn test_locked_pool() {
        let pool = LockedPool::new(24);
        assert_eq!(pool.outstanding_count(), 0);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.outstanding_count(), 2);

        pool.free(a).unwrap();
        assert!(matches!(
            pool.fini(),
            Err(AllocError::Outstanding { count: 1, .. })
        ));
        pool.free(b).unwrap();
        pool.fini().unwrap();
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_locked_pool_free_before_init() {
        let source = LockedPool::new(8);
        let target = LockedPool::new(8);
        let object = source.alloc().unwrap();
        let err = target.free(object).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fault);
    }
}

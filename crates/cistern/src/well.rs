//! Fixed-capacity arena of equally sized objects.
//!
//! A [`Well`] carves `count` objects out of one page-aligned payload region at
//! construction time and never grows. Every object slot owns one node in a
//! [`Ring`]: two rings, FREE and USED, partition the slots, so allocation and
//! release only relink a node.
//!
//! ```text
//!   control (ring arena)                 payload region (page aligned)
//!   ┌──────┬──────┬────┬────┬────┐      ┌────────┬────────┬────────┐
//!   │ FREE │ USED │ s0 │ s1 │ s2 │ ───▶ │ stride │ stride │ stride │
//!   └──────┴──────┴────┴────┴────┘      └────────┴────────┴────────┘
//! ```
//!
//! At all times `free_count() + used_count() == capacity()`.
//!
//! # Examples
//!
//! ```
//! use cistern::well::{Well, WellConfig};
//!
//! let mut well = Well::new(&WellConfig::new(32, 4)).unwrap();
//! let a = well.alloc().unwrap();
//! assert_eq!(well.used_count(), 1);
//! well.free(a).unwrap();
//! assert!(well.is_full());
//! well.fini().unwrap();
//! ```

use alloc::alloc::{alloc, dealloc};
use core::{alloc::Layout, fmt, ptr::NonNull};

use log::{debug, warn};
use ring_list::{NodeId, Ring};
use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    align,
    error::{
        AllocError, ExhaustedSnafu, FaultSnafu, HeapSnafu, InvalidConfigSnafu, OutstandingSnafu,
        OverflowSnafu,
    },
    platform,
};

/// Arena position of the first slot node; 0 and 1 are the FREE and USED roots.
const FIRST_SLOT: usize = 2;

/// Construction parameters for a [`Well`].
///
/// Zero for `alignment`, `page_size` or `line_size` means "detect": the
/// alignment defaults to the cache-line size, and the sizes are queried from
/// the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellConfig {
    object_size: usize,
    count: usize,
    alignment: usize,
    page_size: usize,
    line_size: usize,
}

impl WellConfig {
    #[must_use]
    pub const fn new(object_size: usize, count: usize) -> Self {
        Self {
            object_size,
            count,
            alignment: 0,
            page_size: 0,
            line_size: 0,
        }
    }

    /// Requested object alignment, rounded up to a power of two.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Overrides the detected page size. Must be a power of two.
    #[must_use]
    pub const fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Overrides the detected cache-line size. Must be a power of two.
    #[must_use]
    pub const fn line_size(mut self, line_size: usize) -> Self {
        self.line_size = line_size;
        self
    }

    fn resolve(&self) -> Result<Geometry, AllocError> {
        ensure!(
            self.object_size > 0,
            InvalidConfigSnafu {
                reason: "object size must not be zero"
            }
        );
        ensure!(
            self.count > 0,
            InvalidConfigSnafu {
                reason: "capacity must not be zero"
            }
        );
        let page_size = detect(self.page_size, platform::page_size)?;
        let line_size = detect(self.line_size, platform::line_size)?;

        let alignment = align::power_of_two(self.alignment, line_size).context(OverflowSnafu)?;
        let stride = align::stride(self.object_size, alignment).context(OverflowSnafu)?;
        let size = stride.checked_mul(self.count).context(OverflowSnafu)?;
        let layout = Layout::from_size_align(size, page_size.max(alignment))
            .ok()
            .context(OverflowSnafu)?;

        Ok(Geometry {
            stride,
            alignment,
            layout,
        })
    }
}

fn detect(value: usize, query: fn() -> usize) -> Result<usize, AllocError> {
    if value == 0 {
        return Ok(query());
    }
    ensure!(
        value.is_power_of_two(),
        InvalidConfigSnafu {
            reason: "page and line sizes must be powers of two"
        }
    );
    Ok(value)
}

struct Geometry {
    stride: usize,
    alignment: usize,
    layout: Layout,
}

/// A fixed-capacity arena.
///
/// Payload pointers returned by [`alloc`](Self::alloc) are borrowed from the
/// well: they stay valid until handed back with [`free`](Self::free), and the
/// well must not be finalized while any of them is outstanding.
pub struct Well {
    ring: Ring<NonNull<u8>>,
    free: NodeId,
    used: NodeId,
    base: NonNull<u8>,
    layout: Layout,
    stride: usize,
    alignment: usize,
    capacity: usize,
    outstanding: usize,
}

// The well exclusively owns its payload region.
unsafe impl Send for Well {}

impl fmt::Debug for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Well")
            .field("base", &self.base)
            .field("stride", &self.stride)
            .field("alignment", &self.alignment)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

impl Well {
    /// Builds a well and threads every slot onto the FREE ring.
    ///
    /// Fails with [`AllocError::InvalidConfig`] for a zero object size or
    /// capacity or a page/line size that is not a power of two, with
    /// [`AllocError::Overflow`] if the region size does not fit, and with
    /// [`AllocError::Heap`] if the region or its ring nodes cannot be
    /// allocated.
    pub fn new(config: &WellConfig) -> Result<Self, AllocError> {
        let Geometry {
            stride,
            alignment,
            layout,
        } = config.resolve()?;

        let nodes = FIRST_SLOT.saturating_add(config.count);
        let mut ring = Ring::try_with_capacity(nodes).ok().context(HeapSnafu {
            size: nodes.saturating_mul(Ring::<NonNull<u8>>::node_size()),
        })?;
        let base = NonNull::new(unsafe { alloc(layout) }).context(HeapSnafu {
            size: layout.size(),
        })?;

        let free = ring.node(NonNull::dangling());
        let used = ring.node(NonNull::dangling());
        for i in 0..config.count {
            let node = ring.node(unsafe { base.add(i * stride) });
            ring.enqueue(free, node);
        }

        debug!(
            "well: {} objects, stride {stride}, alignment {alignment}, region {:p}+{}",
            config.count,
            base,
            layout.size()
        );

        Ok(Self {
            ring,
            free,
            used,
            base,
            layout,
            stride,
            alignment,
            capacity: config.count,
            outstanding: 0,
        })
    }

    /// Takes an object from the FREE ring.
    ///
    /// Fails with [`AllocError::Exhausted`] when every slot is in use; the
    /// well never grows.
    pub fn alloc(&mut self) -> Result<NonNull<u8>, AllocError> {
        let node = self.ring.pop(self.free).context(ExhaustedSnafu)?;
        self.ring.push(self.used, node);
        self.outstanding += 1;
        Ok(*self.ring.data(node))
    }

    /// Returns an object to the FREE ring.
    ///
    /// Fails with [`AllocError::Fault`] if nothing is outstanding, or if `ptr`
    /// is not the start of a slot of this well that is currently in use.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr().addr();
        ensure!(!self.ring.is_empty(self.used), FaultSnafu { addr });
        let node = self.slot(ptr).context(FaultSnafu { addr })?;
        ensure!(self.ring.root(node) == self.used, FaultSnafu { addr });

        self.ring.push(self.free, node);
        self.outstanding -= 1;
        Ok(())
    }

    /// Returns `true` if no object is outstanding.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ring.is_empty(self.used)
    }

    /// Returns `true` if every object is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty(self.free)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        self.outstanding
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity - self.outstanding
    }

    /// Distance in bytes between consecutive objects.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Alignment every object address satisfies.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Returns `true` if `ptr` is the start of one of this well's slots.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.slot(ptr).is_some()
    }

    fn slot(&self, ptr: NonNull<u8>) -> Option<NodeId> {
        let offset = ptr
            .as_ptr()
            .addr()
            .checked_sub(self.base.as_ptr().addr())?;
        if !offset.is_multiple_of(self.stride) {
            return None;
        }
        let index = offset / self.stride;
        if index >= self.capacity {
            return None;
        }
        self.ring.id(FIRST_SLOT + index)
    }

    /// Releases the well.
    ///
    /// If objects are still outstanding the payload region is leaked rather
    /// than freed under them, and [`AllocError::Outstanding`] is returned.
    pub fn fini(self) -> Result<(), AllocError> {
        let count = self.outstanding;
        drop(self);
        ensure!(count == 0, OutstandingSnafu { count });
        Ok(())
    }
}

impl Drop for Well {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            warn!(
                "well: {} objects outstanding, leaking {} bytes at {:p}",
                self.outstanding,
                self.layout.size(),
                self.base
            );
            return;
        }
        debug!("well: released {:p}+{}", self.base, self.layout.size());
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// A [`Well`] behind a mutex, built lazily on first use.
///
/// Every operation holds the lock for its whole duration, including the
/// construction triggered by the first [`alloc`](Self::alloc), so racing
/// first users build the well exactly once. One lock covers the whole well.
///
/// ```
/// use cistern::well::{LockedWell, WellConfig};
///
/// static WELL: LockedWell = LockedWell::new(WellConfig::new(64, 8));
///
/// let ptr = WELL.alloc().unwrap();
/// WELL.free(ptr).unwrap();
/// WELL.fini().unwrap();
/// ```
#[derive(Debug)]
pub struct LockedWell {
    config: WellConfig,
    well: Mutex<Option<Well>>,
}

impl LockedWell {
    #[must_use]
    pub const fn new(config: WellConfig) -> Self {
        Self {
            config,
            well: Mutex::new(None),
        }
    }

    /// Builds the well now instead of on first allocation.
    pub fn init(&self) -> Result<(), AllocError> {
        let mut well = self.well.lock();
        self.get_or_init(&mut well)?;
        Ok(())
    }

    pub fn alloc(&self) -> Result<NonNull<u8>, AllocError> {
        let mut well = self.well.lock();
        self.get_or_init(&mut well)?.alloc()
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut well = self.well.lock();
        let well = well.as_mut().context(FaultSnafu {
            addr: ptr.as_ptr().addr(),
        })?;
        well.free(ptr)
    }

    /// Releases the well.
    ///
    /// Unlike [`Well::fini`], a well with outstanding objects is left in
    /// place and [`AllocError::Outstanding`] is returned. A later call to
    /// [`alloc`](Self::alloc) after a successful `fini` builds a fresh well.
    pub fn fini(&self) -> Result<(), AllocError> {
        let mut well = self.well.lock();
        if let Some(w) = well.as_ref() {
            ensure!(
                w.is_full(),
                OutstandingSnafu {
                    count: w.used_count()
                }
            );
        }
        match well.take() {
            Some(w) => w.fini(),
            None => Ok(()),
        }
    }

    /// Returns `true` if no object is outstanding.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.well.lock().as_ref().is_none_or(Well::is_full)
    }

    /// Returns `true` if the well exists and every object is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.well.lock().as_ref().is_some_and(Well::is_empty)
    }

    fn get_or_init<'a>(&self, slot: &'a mut Option<Well>) -> Result<&'a mut Well, AllocError> {
        let well = match slot.take() {
            Some(well) => well,
            None => Well::new(&self.config)?,
        };
        Ok(slot.insert(well))
    }
}

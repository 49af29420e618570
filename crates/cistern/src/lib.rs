//! Arenas, object pools and size-class buffers for long-running services.
//!
//! Every allocator in this crate keeps its bookkeeping in
//! [`ring_list::Ring`]s: free objects wait on one ring and, where the
//! allocator tracks them, outstanding objects sit on another. Objects move
//! between rings in constant time and are never handed back to the heap
//! until the allocator is finalized.
//!
//! The allocators are `no_std` compatible and only need `alloc`.
//!
//! # Available Allocators
//!
//! ## [`Well`](well::Well)
//!
//! A fixed-capacity arena. One page-aligned region is carved into `N` equal
//! slots when the well is built. Best suited for:
//!
//! - Objects with a known upper bound on their count
//! - Strict alignment needs (cache line, page, or larger)
//! - Catching stray frees, since every freed pointer is checked
//!
//! **Performance**: O(1) allocation and deallocation. The well never grows.
//!
//! ## [`Pool`](pool::Pool)
//!
//! A growable pool of same-size objects. Freed objects are reused before
//! the heap is asked for more. Best suited for:
//!
//! - Hot paths that allocate and release the same type repeatedly
//! - Workloads whose peak size is not known up front
//!
//! **Performance**: O(1) allocation once warmed up, O(1) deallocation.
//!
//! ## [`BufferPool`](buffer::BufferPool)
//!
//! A `malloc`-style allocator over fixed size classes. Requests are rounded
//! up to the nearest class; larger requests bypass the classes. Best suited
//! for:
//!
//! - Variable-sized byte buffers and C strings
//! - Code that must avoid the heap at steady state ([`buffer::set_nomalloc`])
//!
//! **Performance**: O(k) class lookup where k is the number of classes, then
//! O(1) allocation and deallocation.
//!
//! # Usage Examples
//!
//! ## Basic `Well` Usage
//!
//! ```rust
//! use cistern::well::{Well, WellConfig};
//!
//! let mut well = Well::new(&WellConfig::new(24, 4).alignment(32)).unwrap();
//! let a = well.alloc().unwrap();
//! assert_eq!(a.as_ptr().addr() % 32, 0);
//!
//! well.free(a).unwrap();
//! well.fini().unwrap();
//! ```
//!
//! ## Basic `Pool` Usage
//!
//! ```rust
//! use cistern::pool::Pool;
//!
//! let mut pool = Pool::new(64).unwrap();
//! let object = pool.alloc().unwrap();
//! pool.free(object).unwrap();
//!
//! // The freed object is handed out again.
//! let again = pool.alloc().unwrap();
//! assert_eq!(pool.object_count(), 1);
//! pool.free(again).unwrap();
//! ```
//!
//! # Design Considerations
//!
//! ## Failure Reporting
//!
//! No allocator panics or aborts on the caller's behalf. Exhaustion, stray
//! frees and misconfiguration are reported as [`AllocError`], which also
//! maps onto the `errno` value a C caller would expect.
//!
//! ## Thread Safety
//!
//! [`Well`](well::Well), [`Pool`](pool::Pool) and
//! [`BufferPool`](buffer::BufferPool) are `Send` but not `Sync`.
//! [`LockedWell`](well::LockedWell) and [`LockedPool`](pool::LockedPool)
//! wrap them in a spin lock, build them on first use, and can be placed in
//! a `static`. The free functions of [`buffer`] share one locked table.
//!
//! ## Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Memory Overhead | Best Use Case |
//! |-----------|------------|--------------|-----------------|---------------|
//! | `Well` | O(1) | O(1) | 1 ring node/slot | Bounded object sets |
//! | `Pool` | O(1)* | O(1) | 1 ring node/object | Same-size objects |
//! | `BufferPool` | O(k) | O(1) | 16 bytes/buffer | Byte buffers |
//!
//! *Once the pool holds enough free objects

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::error::{AllocError, ErrorKind};

pub mod align;
pub mod buffer;
pub mod error;
pub mod platform;
pub mod pool;
pub mod well;

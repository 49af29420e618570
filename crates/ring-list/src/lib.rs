//! Circular doubly-linked rings stored in an index arena.
//!
//! A [`Ring`] owns every node it has ever created. Each node carries three
//! links expressed as [`NodeId`]s into the same arena:
//!
//! - `next` and `prev`, its peers in a circular ring
//! - `root`, the anchor node of the ring it currently belongs to
//!
//! A node that has never been inserted (or has been removed) is *solitary*:
//! `next == prev == root == self`. Any solitary node can act as the root of a
//! new ring; being a root is purely a matter of convention.
//!
//! ```text
//!            ┌──────────────────────────────────────┐
//!            ▼                                      │
//!   ┌──────────────┐  next  ┌──────┐  next  ┌──────┐│
//!   │ root (R)     │───────▶│  A   │───────▶│  B   │┘
//!   │ root: R      │◀───────│ root:R│◀──────│ root:R│
//!   └──────────────┘  prev  └──────┘  prev  └──────┘
//! ```
//!
//! For every node `N` reachable from a root `R` via `next`, `N.root == R`.
//! Every operation preserves that invariant, and none of them can fail:
//! misuse such as removing a root or inserting a node after itself is a
//! no-op.
//!
//! # Examples
//!
//! ```
//! use core::cmp::Ordering;
//!
//! use ring_list::Ring;
//!
//! let mut ring = Ring::new();
//! let root = ring.node(0);
//! let a = ring.node(1);
//! let b = ring.node(2);
//!
//! ring.enqueue(root, a);
//! ring.enqueue(root, b);
//! assert_eq!(ring.len(root), 2);
//! assert_eq!(ring.head(root), Some(a));
//!
//! // Search forward for the first payload greater than one.
//! let found = ring.apply(root, |_, &value| {
//!     if value > 1 { Ordering::Equal } else { Ordering::Greater }
//! });
//! assert_eq!(found, b);
//!
//! ring.remove(a);
//! assert!(ring.is_empty(a));
//! assert_eq!(ring.len(root), 1);
//! ```
//!
//! # Performance
//!
//! - Insert, remove, push, pop, enqueue, dequeue: O(1)
//! - Reroot, len, splice: O(n) in the ring length
//! - Nodes are never freed individually; recycle solitary nodes instead

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{collections::TryReserveError, vec::Vec};
use core::{cmp::Ordering, fmt, iter::FusedIterator};

/// Index of a node inside a [`Ring`] arena.
///
/// Ids are only meaningful for the ring that created them. Passing an id
/// from a different arena is not undefined behavior, but it either panics
/// (out of range) or operates on an unrelated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Returns the position of this node in its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node<T> {
    next: NodeId,
    prev: NodeId,
    root: NodeId,
    data: T,
}

/// An arena of circular-list nodes.
///
/// The arena may hold any number of independent rings. Nodes move between
/// rings with [`insert`](Self::insert) and [`remove`](Self::remove); the
/// arena itself only ever grows.
pub struct Ring<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("node_count", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl<T> Ring<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Creates an empty arena with room for `capacity` nodes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Like [`with_capacity`](Self::with_capacity), but reports allocation
    /// failure instead of aborting.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut nodes = Vec::new();
        nodes.try_reserve_exact(capacity)?;
        Ok(Self { nodes })
    }

    /// Bytes of arena storage taken by one node.
    #[must_use]
    pub const fn node_size() -> usize {
        size_of::<Node<T>>()
    }

    /// Returns the number of nodes ever created in this arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up the node created `index`-th in this arena.
    #[must_use]
    pub fn id(&self, index: usize) -> Option<NodeId> {
        (index < self.nodes.len()).then_some(NodeId(index))
    }

    /// Creates a new solitary node carrying `data`.
    pub fn node(&mut self, data: T) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            next: id,
            prev: id,
            root: id,
            data,
        });
        id
    }

    /// Like [`node`](Self::node), but reports allocation failure instead of
    /// aborting.
    pub fn try_node(&mut self, data: T) -> Result<NodeId, TryReserveError> {
        self.nodes.try_reserve(1)?;
        Ok(self.node(data))
    }

    /// Returns the root of the ring `node` belongs to.
    #[must_use]
    pub fn root(&self, node: NodeId) -> NodeId {
        self.nodes[node.0].root
    }

    /// Returns the successor of `node`.
    #[must_use]
    pub fn next(&self, node: NodeId) -> NodeId {
        self.nodes[node.0].next
    }

    /// Returns the predecessor of `node`.
    #[must_use]
    pub fn prev(&self, node: NodeId) -> NodeId {
        self.nodes[node.0].prev
    }

    /// Returns the payload of `node`.
    #[must_use]
    pub fn data(&self, node: NodeId) -> &T {
        &self.nodes[node.0].data
    }

    /// Returns the payload of `node` mutably.
    pub fn data_mut(&mut self, node: NodeId) -> &mut T {
        &mut self.nodes[node.0].data
    }

    /// Returns `true` if `node` anchors its own ring.
    ///
    /// Solitary nodes are roots of an empty ring.
    #[must_use]
    pub fn is_root(&self, node: NodeId) -> bool {
        self.nodes[node.0].root == node
    }

    /// Returns `true` if `node` is solitary.
    ///
    /// For a root this means its ring has no members.
    #[must_use]
    pub fn is_empty(&self, node: NodeId) -> bool {
        let n = &self.nodes[node.0];
        n.next == node && n.prev == node
    }

    /// Returns the first member of the ring containing `node`.
    #[must_use]
    pub fn head(&self, node: NodeId) -> Option<NodeId> {
        let root = self.root(node);
        let head = self.next(root);
        (head != root).then_some(head)
    }

    /// Returns the last member of the ring containing `node`.
    #[must_use]
    pub fn tail(&self, node: NodeId) -> Option<NodeId> {
        let root = self.root(node);
        let tail = self.prev(root);
        (tail != root).then_some(tail)
    }

    /// Counts the members of the ring containing `node`, excluding its root.
    #[must_use]
    pub fn len(&self, node: NodeId) -> usize {
        self.iter(node).count()
    }

    /// Iterates over the members of the ring containing `node` in `next`
    /// order, starting at the head.
    #[must_use]
    pub fn iter(&self, node: NodeId) -> Iter<'_, T> {
        let root = self.root(node);
        Iter {
            ring: self,
            root,
            cur: self.next(root),
        }
    }

    /// Makes `node` solitary.
    ///
    /// A member is removed from its ring. A root that still anchors members
    /// hands its ring over to its first member before detaching, so none of
    /// the members is left pointing at a root that is no longer in the ring.
    pub fn init(&mut self, node: NodeId) {
        if !self.is_root(node) {
            self.remove(node);
            return;
        }
        if self.is_empty(node) {
            return;
        }
        let head = self.next(node);
        self.reroot(head);
        self.remove(node);
    }

    /// Splices `node` into the ring of `at`, immediately after `at`.
    ///
    /// A node that is already linked elsewhere is removed first, so this is
    /// also a move. Inserting a node after itself, or inserting a root that
    /// still anchors members, leaves both rings untouched.
    pub fn insert(&mut self, at: NodeId, node: NodeId) {
        if at == node {
            return;
        }
        if self.is_root(node) && !self.is_empty(node) {
            return;
        }
        self.remove(node);

        let root = self.root(at);
        let next = self.next(at);
        {
            let n = &mut self.nodes[node.0];
            n.prev = at;
            n.next = next;
            n.root = root;
        }
        self.nodes[next.0].prev = node;
        self.nodes[at.0].next = node;
    }

    /// Unsplices `node` from its ring and makes it solitary.
    ///
    /// Roots are never removed: calling this on a root (including a solitary
    /// node) does nothing. Returns `node`.
    pub fn remove(&mut self, node: NodeId) -> NodeId {
        if self.is_root(node) {
            return node;
        }
        let (next, prev) = {
            let n = &self.nodes[node.0];
            (n.next, n.prev)
        };
        self.nodes[prev.0].next = next;
        self.nodes[next.0].prev = prev;

        let n = &mut self.nodes[node.0];
        n.next = node;
        n.prev = node;
        n.root = node;
        node
    }

    /// Relabels every node of `node`'s ring so that `node` becomes its root.
    ///
    /// The previous root, if any, becomes an ordinary member.
    pub fn reroot(&mut self, node: NodeId) {
        let mut cur = node;
        loop {
            self.nodes[cur.0].root = node;
            cur = self.nodes[cur.0].next;
            if cur == node {
                break;
            }
        }
    }

    /// Walks the ring starting at `start`, letting `f` steer.
    ///
    /// `f` sees each visited node and its payload. [`Ordering::Less`] moves
    /// to the predecessor, [`Ordering::Greater`] to the successor, and
    /// [`Ordering::Equal`] stops the walk and returns the current node. Roots
    /// are visited like any other node. Context for the walk is whatever the
    /// closure captures.
    ///
    /// The walk never terminates on its own; `f` must eventually answer
    /// [`Ordering::Equal`].
    pub fn apply<F>(&self, start: NodeId, mut f: F) -> NodeId
    where
        F: FnMut(NodeId, &T) -> Ordering,
    {
        let mut cur = start;
        loop {
            let n = &self.nodes[cur.0];
            match f(cur, &n.data) {
                Ordering::Less => cur = n.prev,
                Ordering::Greater => cur = n.next,
                Ordering::Equal => return cur,
            }
        }
    }

    /// Like [`apply`](Self::apply), but hands out mutable payloads.
    pub fn apply_mut<F>(&mut self, start: NodeId, mut f: F) -> NodeId
    where
        F: FnMut(NodeId, &mut T) -> Ordering,
    {
        let mut cur = start;
        loop {
            let n = &mut self.nodes[cur.0];
            match f(cur, &mut n.data) {
                Ordering::Less => cur = n.prev,
                Ordering::Greater => cur = n.next,
                Ordering::Equal => return cur,
            }
        }
    }

    /// Inserts `node` at the head of `root`'s ring.
    pub fn push(&mut self, root: NodeId, node: NodeId) {
        let root = self.root(root);
        self.insert(root, node);
    }

    /// Removes and returns the head of `root`'s ring.
    pub fn pop(&mut self, root: NodeId) -> Option<NodeId> {
        let head = self.head(root)?;
        Some(self.remove(head))
    }

    /// Inserts `node` at the tail of `root`'s ring.
    pub fn enqueue(&mut self, root: NodeId, node: NodeId) {
        let root = self.root(root);
        if node == root {
            return;
        }
        // Detach first: `node` may currently be the tail we would link after.
        if !self.is_root(node) {
            self.remove(node);
        }
        let tail = self.prev(root);
        self.insert(tail, node);
    }

    /// Removes and returns the head of `root`'s ring.
    ///
    /// Together with [`enqueue`](Self::enqueue) this gives FIFO order.
    pub fn dequeue(&mut self, root: NodeId) -> Option<NodeId> {
        self.pop(root)
    }

    /// Puts `new` in the position `old` occupies and makes `old` solitary.
    ///
    /// Roots cannot be replaced; use [`reroot`](Self::reroot) instead.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        if old == new || self.is_root(old) {
            return;
        }
        if self.is_root(new) && !self.is_empty(new) {
            return;
        }
        self.remove(new);
        let at = self.prev(old);
        self.insert(at, new);
        self.remove(old);
    }

    /// Moves every member of `from`'s ring to just after `to`, preserving
    /// their order. `from`'s root is left empty.
    pub fn splice(&mut self, to: NodeId, from: NodeId) {
        let from = self.root(from);
        if self.root(to) == from {
            return;
        }
        while let Some(node) = self.tail(from) {
            self.insert(to, node);
        }
    }

    /// Verifies the link structure of the ring containing `node`.
    ///
    /// Returns `false` if any member points at a different root or if a
    /// `next`/`prev` pair disagrees.
    #[must_use]
    pub fn check(&self, node: NodeId) -> bool {
        let root = self.root(node);
        if !self.is_root(root) {
            return false;
        }
        let mut cur = root;
        for _ in 0..=self.nodes.len() {
            let n = &self.nodes[cur.0];
            if self.nodes[n.next.0].prev != cur || n.root != root {
                return false;
            }
            cur = n.next;
            if cur == root {
                return true;
            }
        }
        false
    }
}

/// Iterator over the members of one ring.
///
/// Created by [`Ring::iter`].
pub struct Iter<'a, T> {
    ring: &'a Ring<T>,
    root: NodeId,
    cur: NodeId,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.root {
            return None;
        }
        let id = self.cur;
        let n = &self.ring.nodes[id.0];
        self.cur = n.next;
        Some((id, &n.data))
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

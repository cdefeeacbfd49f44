//! Scalable non-zero indicator
//!
//! A fixed-shape k-ary tree of counters supporting concurrent `arrive` and
//! `depart` at the leaves, with a contention-free zero test at the root.
//! Interior nodes pack `(count, version)` into one 64-bit word; the count is
//! stored doubled so the intermediate half state of the arrive protocol is
//! representable. An arrive that raises a node from zero first arrives at the
//! parent and only then publishes the node as nonzero, so the root count
//! conservatively covers every in-flight surplus; a depart that empties a
//! node departs the parent after the fact. The depart that takes the root to
//! zero reports it, exactly once per quiescence.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;
use foldhash::fast::FixedState;
use std::hash::BuildHasher;

/// Encoded half unit: an arrive observed zero and is still publishing to the
/// parent.
const HALF: u64 = 1;
/// Encoded whole unit.
const ONE: u64 = 2;

#[inline]
fn pack(count: u64, version: u64) -> u64 {
    debug_assert!(count < (1 << 32));
    debug_assert!(version < (1 << 32));
    (count << 32) | version
}

#[inline]
fn unpack(state: u64) -> (u64, u64) {
    (state >> 32, state & 0xffff_ffff)
}

/// One counter of the indicator tree.
pub struct SnziNode {
    state: AtomicU64,
    parent: *const SnziNode,
    /// Owner pointer, meaningful on the root only.
    annotation: AtomicUsize,
}

unsafe impl Send for SnziNode {}
unsafe impl Sync for SnziNode {}

impl SnziNode {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            parent: core::ptr::null(),
            annotation: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn cas(&self, current: u64, new: u64) -> bool {
        self.state
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records one unit of surplus at this node.
    pub fn arrive(&self) {
        if self.parent.is_null() {
            self.state.fetch_add(ONE << 32, Ordering::AcqRel);
            return;
        }
        let parent = unsafe { &*self.parent };
        let mut undo = 0usize;
        let mut succ = false;
        while !succ {
            let s = self.state.load(Ordering::Acquire);
            let (mut c, mut v) = unpack(s);
            if c >= ONE {
                if self.cas(s, pack(c + ONE, v)) {
                    succ = true;
                }
                continue;
            }
            if c == 0 {
                if self.cas(s, pack(HALF, v + 1)) {
                    succ = true;
                    c = HALF;
                    v += 1;
                } else {
                    continue;
                }
            }
            if c == HALF {
                parent.arrive();
                if !self.cas(pack(HALF, v), pack(ONE, v)) {
                    // A helper completed the transition; our parent arrive
                    // is surplus and gets undone below.
                    undo += 1;
                }
            }
        }
        for _ in 0..undo {
            parent.depart();
        }
    }

    /// Removes one unit of surplus.
    ///
    /// Returns true exactly when this depart took the whole tree to zero.
    pub fn depart(&self) -> bool {
        if self.parent.is_null() {
            let old = self.state.fetch_sub(ONE << 32, Ordering::AcqRel);
            let (c, _) = unpack(old);
            assert!(c >= ONE, "snzi depart without matching arrive");
            return c == ONE;
        }
        let parent = unsafe { &*self.parent };
        let backoff = Backoff::new();
        loop {
            let s = self.state.load(Ordering::Acquire);
            let (c, v) = unpack(s);
            assert!(c >= ONE, "snzi depart without matching arrive");
            if self.cas(s, pack(c - ONE, v)) {
                if c == ONE {
                    return parent.depart();
                }
                return false;
            }
            backoff.spin();
        }
    }

    /// Walks parent links to the root and reads its annotation.
    pub fn root_annotation(&self) -> usize {
        let mut current = self;
        while !current.parent.is_null() {
            current = unsafe { &*current.parent };
        }
        current.annotation.load(Ordering::Acquire)
    }
}

/// A fixed-shape indicator tree.
///
/// Node 0 is the root; the children of node `i` are `i*b + 1 ..= i*b + b`.
/// The last `b^(levels-1)` nodes are the leaves that accept `arrive` and
/// `depart`. Leaf selection hashes the caller-supplied key so an arrive and
/// its matching depart land on the same leaf.
pub struct SnziTree {
    nodes: Box<[SnziNode]>,
    first_leaf: usize,
    hasher: FixedState,
}

impl SnziTree {
    /// Builds a tree with the given branching factor and level count.
    pub fn new(branching_factor: usize, levels: usize) -> Self {
        assert!(branching_factor >= 2);
        assert!(levels >= 1);
        let mut total = 0usize;
        let mut width = 1usize;
        for _ in 0..levels {
            total += width;
            width *= branching_factor;
        }
        let first_leaf = total - width / branching_factor;

        let mut nodes: Box<[SnziNode]> = (0..total).map(|_| SnziNode::new()).collect();
        let base = nodes.as_mut_ptr();
        for i in 1..total {
            let parent = (i - 1) / branching_factor;
            // Parent links point into the boxed slice, which never moves.
            nodes[i].parent = unsafe { base.add(parent) } as *const SnziNode;
        }
        Self {
            nodes,
            first_leaf,
            hasher: FixedState::default(),
        }
    }

    /// Stores the owner pointer on the root, once, at construction time.
    pub fn set_root_annotation(&self, owner: usize) {
        self.nodes[0].annotation.store(owner, Ordering::Release);
    }

    /// Picks the leaf assigned to `key`.
    #[inline]
    pub fn leaf_for(&self, key: usize) -> &SnziNode {
        let leaves = self.nodes.len() - self.first_leaf;
        let idx = self.first_leaf + (self.hasher.hash_one(key) as usize % leaves);
        &self.nodes[idx]
    }

    /// True while the arrive/depart multiset is non-zero.
    #[inline]
    pub fn is_nonzero(&self) -> bool {
        let (c, _) = unpack(self.nodes[0].state.load(Ordering::Acquire));
        c >= ONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shape() {
        let t = SnziTree::new(2, 3);
        assert_eq!(t.nodes.len(), 7);
        assert_eq!(t.first_leaf, 3);
        let t = SnziTree::new(4, 2);
        assert_eq!(t.nodes.len(), 5);
        assert_eq!(t.first_leaf, 1);
    }

    #[test]
    fn single_level_tree_is_just_the_root() {
        let t = SnziTree::new(2, 1);
        assert!(!t.is_nonzero());
        t.leaf_for(1).arrive();
        assert!(t.is_nonzero());
        assert!(t.leaf_for(1).depart());
        assert!(!t.is_nonzero());
    }

    #[test]
    fn sequential_balance() {
        let t = SnziTree::new(2, 3);
        for key in 0..16usize {
            t.leaf_for(key).arrive();
        }
        assert!(t.is_nonzero());
        let mut activations = 0;
        for key in 0..16usize {
            if t.leaf_for(key).depart() {
                activations += 1;
            }
        }
        assert_eq!(activations, 1);
        assert!(!t.is_nonzero());
    }

    #[test]
    fn concurrent_balance_reports_zero_once() {
        const THREADS: usize = 8;
        const OPS: usize = 10_000;

        let tree = Arc::new(SnziTree::new(2, 3));
        let zero_reports = Arc::new(core::sync::atomic::AtomicUsize::new(0));

        // A baseline surplus keeps the tree nonzero while threads churn.
        tree.leaf_for(usize::MAX).arrive();

        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let tree = tree.clone();
                let zero_reports = zero_reports.clone();
                thread::spawn(move || {
                    for i in 0..OPS {
                        let key = tid * OPS + i;
                        tree.leaf_for(key).arrive();
                        if tree.leaf_for(key).depart() {
                            zero_reports.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(tree.is_nonzero());
        assert_eq!(zero_reports.load(Ordering::Relaxed), 0);
        assert!(tree.leaf_for(usize::MAX).depart());
        assert!(!tree.is_nonzero());
    }

    #[test]
    fn annotation_reachable_from_any_leaf() {
        let t = SnziTree::new(3, 3);
        t.set_root_annotation(0xdead_bee8);
        for key in 0..32usize {
            assert_eq!(t.leaf_for(key).root_annotation(), 0xdead_bee8);
        }
    }
}

//! In-strategies and out-strategies
//!
//! Each DAG node carries two tagged words: the in-strategy (how incoming
//! edges are counted) and the out-strategy (how successors are notified).
//! Hot paths inspect the tag first and touch no object at all for the
//! tag-only strategies; tag zero means the word is an owned structure.
//!
//! The in-strategy word is one of:
//! - `READY`: no predecessors, immediately schedulable;
//! - `UNARY`: exactly one predecessor, any decrement schedules;
//! - `FETCH_ADD`: the word itself is the counter, shifted above the tag;
//! - an owned [`Incounter`] (SNZI-backed or dynamic-tree).
//!
//! The out-strategy word is one of:
//! - `NOOP`: nobody to notify;
//! - `UNARY`: a direct pointer to the sole successor;
//! - `DIRECT_DIST`: a pointer to a SNZI leaf of the sole successor's
//!   in-counter, departed without walking the tree;
//! - an owned [`Outset`] (Treiber stack or dynamic tree).

use core::ptr;
use core::sync::atomic::Ordering;
use crossbeam_utils::Backoff;

use crate::config::EdgeAlgorithm;
use crate::dyntree::{self, DyntreeIncounter, DyntreeOutset};
use crate::node::{Node, NodeRef};
use crate::pool;
use crate::snzi::{SnziNode, SnziTree};
use crate::tagged::{pack, ptr_of, tag_of, Tagged, TaggedAtomic, TAG_BITS};

/// In-strategy tags.
pub(crate) const IN_OBJ: usize = 0;
pub(crate) const IN_READY: usize = 1;
pub(crate) const IN_UNARY: usize = 2;
pub(crate) const IN_FETCH_ADD: usize = 3;

/// Out-strategy tags.
pub(crate) const OUT_OBJ: usize = 0;
pub(crate) const OUT_NOOP: usize = 1;
pub(crate) const OUT_UNARY: usize = 2;
pub(crate) const OUT_DIRECT_DIST: usize = 3;

pub(crate) const OUT_NOOP_WORD: usize = OUT_NOOP;

/// Result of an in-counter decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// The decrement removed the last outstanding edge.
    Activated,
    /// Edges remain.
    NotActivated,
}

/// An owned in-counter instance.
pub(crate) enum Incounter {
    /// SNZI tree; the leaf is picked by hashing the source.
    Distributed(SnziTree),
    /// Randomised dynamic tree.
    Dyntree(DyntreeIncounter),
}

impl Incounter {
    pub(crate) fn is_activated(&self) -> bool {
        match self {
            Incounter::Distributed(tree) => !tree.is_nonzero(),
            Incounter::Dyntree(tree) => tree.is_activated(),
        }
    }

    pub(crate) fn increment(&self, source: usize) {
        match self {
            Incounter::Distributed(tree) => tree.leaf_for(source).arrive(),
            Incounter::Dyntree(tree) => tree.increment(),
        }
    }

    pub(crate) fn decrement(&self, source: usize) -> Activation {
        match self {
            Incounter::Distributed(tree) => {
                if tree.leaf_for(source).depart() {
                    Activation::Activated
                } else {
                    Activation::NotActivated
                }
            }
            Incounter::Dyntree(tree) => tree.decrement(),
        }
    }
}

/// Release rendezvous of a future out-set: the notify walk and the
/// consumer's explicit deallocation can land in either order, and whichever
/// arrives second frees the structure.
pub(crate) const RELEASE_LIVE: u8 = 0;
pub(crate) const RELEASE_NOTIFIED: u8 = 1;
pub(crate) const RELEASE_REQUESTED: u8 = 2;

/// An owned out-set instance.
pub struct Outset {
    /// Cleared for futures, whose deallocation is an explicit operation of
    /// the consumer.
    pub(crate) auto_dealloc: bool,
    pub(crate) release: core::sync::atomic::AtomicU8,
    pub(crate) kind: OutsetKind,
}

pub(crate) enum OutsetKind {
    Simple(SimpleOutset),
    Dyntree(DyntreeOutset),
}

impl Outset {
    pub(crate) fn new(auto_dealloc: bool, kind: OutsetKind) -> Outset {
        Outset {
            auto_dealloc,
            release: core::sync::atomic::AtomicU8::new(RELEASE_LIVE),
            kind,
        }
    }

    /// Attempts to record `target` as a successor. Fails exactly when the
    /// out-set has already been finished.
    pub(crate) fn insert(&self, target: *mut Node) -> bool {
        match &self.kind {
            OutsetKind::Simple(s) => s.insert(target),
            OutsetKind::Dyntree(d) => d.insert(target),
        }
    }
}

/// Walk-completion half of the rendezvous: auto out-sets are freed on the
/// spot, futures wait for the consumer unless it already asked.
pub(crate) unsafe fn outset_walk_done(out: *mut Outset) {
    unsafe {
        if (*out).auto_dealloc {
            drop(Box::from_raw(out));
            return;
        }
        match (*out).release.compare_exchange(
            RELEASE_LIVE,
            RELEASE_NOTIFIED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(state) => {
                debug_assert_eq!(state, RELEASE_REQUESTED);
                drop(Box::from_raw(out));
            }
        }
    }
}

/// A Treiber stack of successor records with a finished tag on the head.
pub struct SimpleOutset {
    head: TaggedAtomic<ListCell>,
}

unsafe impl Send for SimpleOutset {}
unsafe impl Sync for SimpleOutset {}

struct ListCell {
    n: *mut Node,
    next: *mut ListCell,
}

const FINISHED_CODE: usize = 1;

impl SimpleOutset {
    pub fn new() -> Self {
        Self {
            head: TaggedAtomic::null(),
        }
    }

    /// Splices a successor record at the head, unless the head already
    /// carries the finished tag.
    pub fn insert(&self, n: *mut Node) -> bool {
        let cell = Box::into_raw(Box::new(ListCell {
            n,
            next: ptr::null_mut(),
        }));
        let backoff = Backoff::new();
        loop {
            let orig = self.head.load(Ordering::Acquire);
            if orig.tag() == FINISHED_CODE {
                unsafe { drop(Box::from_raw(cell)) };
                return false;
            }
            unsafe { (*cell).next = orig.ptr() };
            if self
                .head
                .compare_exchange(orig, Tagged::new(cell, 0), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    /// Swings the head to the finished sentinel and notifies every captured
    /// successor exactly once.
    ///
    /// # Safety
    ///
    /// Every recorded successor must still be live; each one receives one
    /// in-counter decrement.
    pub unsafe fn finish(&self) {
        let prev = self
            .head
            .swap(Tagged::null_with(FINISHED_CODE), Ordering::AcqRel);
        let mut todo = prev.ptr();
        while !todo.is_null() {
            let cell = unsafe { Box::from_raw(todo) };
            todo = cell.next;
            unsafe { decrement_incounter(ptr::null_mut(), cell.n) };
        }
    }
}

impl Default for SimpleOutset {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a future's out-set, returned by the `future` combinator and
/// consumed by `force` and explicit deallocation.
#[derive(Clone, Copy)]
pub struct FutureHandle(pub(crate) *mut Outset);

unsafe impl Send for FutureHandle {}
unsafe impl Sync for FutureHandle {}

impl FutureHandle {
    /// Releases the out-set of a future. The structure is freed here when
    /// the finish walk has already completed, and by the walk otherwise.
    pub fn deallocate(self) {
        unsafe {
            assert!(
                !(*self.0).auto_dealloc,
                "only future out-sets are deallocated explicitly"
            );
            match (*self.0).release.compare_exchange(
                RELEASE_LIVE,
                RELEASE_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(RELEASE_NOTIFIED) => drop(Box::from_raw(self.0)),
                Err(_) => panic!("future deallocated twice"),
            }
        }
    }
}

/// Allocates an out-set object for the configured edge algorithm.
fn outset_obj(auto_dealloc: bool) -> *mut Outset {
    let kind = match pool::edge_algorithm() {
        EdgeAlgorithm::Simple => OutsetKind::Simple(SimpleOutset::new()),
        EdgeAlgorithm::Distributed | EdgeAlgorithm::Dyntree => {
            OutsetKind::Dyntree(DyntreeOutset::new(pool::dyntree_branching_factor()))
        }
    };
    Box::into_raw(Box::new(Outset::new(auto_dealloc, kind)))
}

pub(crate) fn outset_new_word() -> usize {
    pack(outset_obj(true), OUT_OBJ)
}

pub(crate) fn allocate_future() -> FutureHandle {
    FutureHandle(outset_obj(false))
}

/// The word for a node with no predecessors.
pub(crate) fn ready_word() -> usize {
    IN_READY
}

/// The word for a node with exactly one predecessor.
pub(crate) fn unary_in_word() -> usize {
    IN_UNARY
}

/// A fresh in-counter word for `n` under the configured edge algorithm.
pub(crate) fn incounter_new_word(n: NodeRef) -> usize {
    match pool::edge_algorithm() {
        EdgeAlgorithm::Simple => IN_FETCH_ADD,
        EdgeAlgorithm::Distributed => {
            let (branching, levels) = pool::snzi_shape();
            let tree = SnziTree::new(branching, levels);
            tree.set_root_annotation(n.0 as usize);
            pack(Box::into_raw(Box::new(Incounter::Distributed(tree))), IN_OBJ)
        }
        EdgeAlgorithm::Dyntree => pack(
            Box::into_raw(Box::new(Incounter::Dyntree(DyntreeIncounter::new(
                pool::dyntree_branching_factor(),
            )))),
            IN_OBJ,
        ),
    }
}

/// The out word for a node with a single successor. Under the distributed
/// algorithm this starts as a direct leaf slot, filled in at insertion.
pub(crate) fn outset_unary_word() -> usize {
    if pool::edge_algorithm() == EdgeAlgorithm::Distributed {
        OUT_DIRECT_DIST
    } else {
        OUT_UNARY
    }
}

/// Installs the in-strategy and out-strategy on a freshly built node.
pub(crate) fn prepare_node_with(n: NodeRef, in_word: usize, out_word: usize) {
    unsafe {
        (*n.0).hdr.in_word.store(in_word, Ordering::Release);
        (*n.0).hdr.out_word.store(out_word, Ordering::Release);
    }
}

/// Installs a fresh in-counter and a fresh out-set on `n`, both chosen by
/// the configured edge algorithm.
pub fn prepare_node(n: NodeRef) {
    prepare_node_with(n, incounter_new_word(n), outset_new_word());
}

/// Takes the out word of the currently running node, leaving a noop behind,
/// so a combinator can transplant it to a successor.
pub(crate) fn capture_outset() -> usize {
    let running = pool::running_node() as *mut Node;
    assert!(!running.is_null(), "no node is being run on this worker");
    unsafe { (*running).hdr.out_word.swap(OUT_NOOP_WORD, Ordering::AcqRel) }
}

/// Re-prepares `n` with the given in word and its own transplanted out word.
pub(crate) fn join_with(n: NodeRef, in_word: usize) {
    prepare_node_with(n, in_word, capture_outset());
}

pub(crate) fn continue_with(n: NodeRef) {
    join_with(n, ready_word());
    add_node(n);
}

/// Pushes a run of `n` through its publication state machine.
pub(crate) unsafe fn schedule_node(n: *mut Node) {
    if unsafe { (*n).hdr.request_run() } {
        pool::push_run(n as usize);
    }
}

/// Activation: destroys an owned in-counter, marks the node ready and hands
/// it to the pool.
pub(crate) unsafe fn start(target: *mut Node) {
    let w = unsafe { (*target).hdr.in_word.swap(IN_READY, Ordering::AcqRel) };
    if tag_of(w) == IN_OBJ {
        let obj = ptr_of::<Incounter>(w);
        if !obj.is_null() {
            unsafe { drop(Box::from_raw(obj)) };
        }
    }
    unsafe { schedule_node(target) };
}

/// Hands a node to the pool; it becomes runnable once its in-counter is
/// zero.
pub fn add_node(n: NodeRef) {
    unsafe {
        let w = (*n.0).hdr.in_word.load(Ordering::Acquire);
        match tag_of(w) {
            IN_READY | IN_UNARY => schedule_node(n.0),
            IN_FETCH_ADD => {
                if w >> TAG_BITS == 0 {
                    schedule_node(n.0);
                }
            }
            IN_OBJ => {
                if (*ptr_of::<Incounter>(w)).is_activated() {
                    start(n.0);
                }
            }
            _ => unreachable!("corrupt in-strategy tag"),
        }
    }
}

/// Adds one outstanding edge to `target`'s in-counter, dispatching on the
/// given in word.
pub(crate) unsafe fn increment_incounter_with(
    source: *mut Node,
    target: *mut Node,
    in_word: usize,
) {
    match tag_of(in_word) {
        IN_UNARY => {}
        IN_FETCH_ADD => {
            unsafe {
                (*target)
                    .hdr
                    .in_word
                    .fetch_add(1 << TAG_BITS, Ordering::AcqRel)
            };
        }
        IN_OBJ => {
            unsafe { (*ptr_of::<Incounter>(in_word)).increment(source as usize) };
        }
        _ => unreachable!("edge added to a ready node"),
    }
}

/// Removes one outstanding edge; scheduling the target is the duty of
/// whichever decrement observed the transition to zero.
pub(crate) unsafe fn decrement_incounter_with(
    source: *mut Node,
    target: *mut Node,
    in_word: usize,
) {
    match tag_of(in_word) {
        IN_UNARY => unsafe { schedule_node(target) },
        IN_FETCH_ADD => {
            let old = unsafe {
                (*target)
                    .hdr
                    .in_word
                    .fetch_sub(1 << TAG_BITS, Ordering::AcqRel)
            };
            if old >> TAG_BITS == 1 {
                unsafe { schedule_node(target) };
            }
        }
        IN_OBJ => {
            let status = unsafe { (*ptr_of::<Incounter>(in_word)).decrement(source as usize) };
            if status == Activation::Activated {
                unsafe { start(target) };
            }
        }
        _ => unreachable!("edge removed from a ready node"),
    }
}

pub(crate) unsafe fn decrement_incounter(source: *mut Node, target: *mut Node) {
    let in_word = unsafe { (*target).hdr.in_word.load(Ordering::Acquire) };
    unsafe { decrement_incounter_with(source, target, in_word) };
}

/// Records `target` in `source`'s out-strategy.
///
/// Returns false exactly when the out-set has already been finished; the
/// caller then undoes its in-counter increment.
pub(crate) unsafe fn outset_insert(
    source: *mut Node,
    out_word: usize,
    target: *mut Node,
) -> bool {
    match tag_of(out_word) {
        OUT_UNARY => {
            unsafe {
                (*source)
                    .hdr
                    .out_word
                    .store(pack(target, OUT_UNARY), Ordering::Release)
            };
            true
        }
        OUT_DIRECT_DIST => {
            // Coupled with the distributed in-counter: pin the leaf keyed by
            // the source so the final depart skips the tree walk.
            let target_in = unsafe { (*target).hdr.in_word.load(Ordering::Acquire) };
            let mut direct = ptr::null_mut::<SnziNode>();
            if tag_of(target_in) == IN_OBJ
                && pool::edge_algorithm() == EdgeAlgorithm::Distributed
            {
                if let Incounter::Distributed(tree) =
                    unsafe { &*ptr_of::<Incounter>(target_in) }
                {
                    direct = tree.leaf_for(source as usize) as *const SnziNode as *mut SnziNode;
                }
            }
            let word = if direct.is_null() {
                pack(target, OUT_UNARY)
            } else {
                pack(direct, OUT_DIRECT_DIST)
            };
            unsafe { (*source).hdr.out_word.store(word, Ordering::Release) };
            true
        }
        OUT_OBJ => unsafe { (*ptr_of::<Outset>(out_word)).insert(target) },
        _ => unreachable!("inserting into a noop out-strategy"),
    }
}

/// Wires the edge `source -> target` against explicit strategy words.
///
/// The increment happens first; if the insertion then reports the out-set
/// finished, the compensating decrement runs. Exactly one of the two
/// decrement paths fires, so no wakeup is lost and none is duplicated.
pub(crate) unsafe fn add_edge_with(
    source: *mut Node,
    out_word: usize,
    target: *mut Node,
    in_word: usize,
) {
    unsafe {
        increment_incounter_with(source, target, in_word);
        if !outset_insert(source, out_word, target) {
            decrement_incounter_with(source, target, in_word);
        }
    }
}

/// Wires the edge `source -> target` against their installed strategies.
pub fn add_edge(source: NodeRef, target: NodeRef) {
    unsafe {
        let out_word = (*source.0).hdr.out_word.load(Ordering::Acquire);
        let in_word = (*target.0).hdr.in_word.load(Ordering::Acquire);
        add_edge_with(source.0, out_word, target.0, in_word);
    }
}

/// Notifies and releases the out-strategy of a node that ran its last block.
pub(crate) unsafe fn finished(n: *mut Node) {
    let w = unsafe { (*n).hdr.out_word.load(Ordering::Acquire) };
    match tag_of(w) {
        OUT_NOOP => {}
        OUT_UNARY => {
            let target = ptr_of::<Node>(w);
            if !target.is_null() {
                unsafe { decrement_incounter(n, target) };
            }
        }
        OUT_DIRECT_DIST => {
            let leaf = ptr_of::<SnziNode>(w);
            if !leaf.is_null() {
                let leaf = unsafe { &*leaf };
                if leaf.depart() {
                    let owner = leaf.root_annotation() as *mut Node;
                    unsafe { start(owner) };
                }
            }
        }
        OUT_OBJ => {
            let out = ptr_of::<Outset>(w);
            if !out.is_null() {
                unsafe { outset_finished(out) };
            }
        }
        _ => unreachable!("corrupt out-strategy tag"),
    }
    unsafe { drop(Box::from_raw(n)) };
}

/// Runs the finish protocol of an owned out-set.
pub(crate) unsafe fn outset_finished(out: *mut Outset) {
    unsafe {
        match &(*out).kind {
            OutsetKind::Simple(s) => {
                s.finish();
                outset_walk_done(out);
            }
            OutsetKind::Dyntree(_) => dyntree::notify_outset(out),
        }
    }
}

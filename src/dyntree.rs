//! Randomised dynamic trees
//!
//! The dyntree in-counter and out-set are k-ary trees of heap nodes whose
//! child slots are tagged words. Operations walk random paths, so workers
//! spread over the structure instead of serialising on one cell.
//!
//! The in-counter keeps two trees: the in-tree grows one leaf per increment
//! and is empty exactly when the counter is zero; detached leaves are
//! transplanted into the out-tree, whose only purpose is deferred bulk
//! deallocation. The out-set encodes six slot states in the tag bits and is
//! finished by a freeze-and-notify walk.
//!
//! Tearing down a large tree is itself DAG work: the walkers below process a
//! communication-delay worth of nodes per block and split by handing
//! subtrees to thieves. Off the pool (unit tests, teardown after shutdown)
//! the same walkers just run to completion synchronously.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;

use crate::node::{Node, NodeBody, NodeRef};
use crate::pool;
use crate::rng::random_int;
use crate::strategy::{
    add_edge, add_node, decrement_incounter, outset_unary_word, outset_walk_done,
    prepare_node_with, ready_word, Activation, Outset, OutsetKind, OUT_NOOP_WORD,
};
use crate::tagged::{pack, ptr_of, tag_of, Tagged, TaggedAtomic, TAG_MASK};

/// Tag marking an in-tree slot claimed by a detaching decrement.
const MINUS: usize = 1;

/// Nodes of both in-counter trees: an array of tagged child slots.
pub(crate) struct IncounterNode {
    children: Box<[TaggedAtomic<IncounterNode>]>,
}

impl IncounterNode {
    fn alloc(branching: usize, init: Tagged<IncounterNode>) -> *mut IncounterNode {
        let children = (0..branching)
            .map(|_| TaggedAtomic::new(init))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(IncounterNode { children }))
    }

    /// A node with no attached children, whatever the slot tags say.
    fn is_leaf(&self) -> bool {
        self.children
            .iter()
            .all(|c| c.load(Ordering::Acquire).is_null())
    }
}

/// In-counter backed by a pair of randomised trees.
pub struct DyntreeIncounter {
    in_tree: TaggedAtomic<IncounterNode>,
    out_tree: TaggedAtomic<IncounterNode>,
    branching: usize,
}

unsafe impl Send for DyntreeIncounter {}
unsafe impl Sync for DyntreeIncounter {}

impl DyntreeIncounter {
    pub fn new(branching: usize) -> Self {
        assert!(branching >= 2);
        let out_root = IncounterNode::alloc(branching, Tagged::null_with(MINUS));
        Self {
            in_tree: TaggedAtomic::null(),
            out_tree: TaggedAtomic::new(Tagged::new(out_root, MINUS)),
            branching,
        }
    }

    /// The counter is zero exactly when the in-tree is empty.
    #[inline]
    pub fn is_activated(&self) -> bool {
        self.in_tree.load(Ordering::Acquire).is_null()
    }

    /// Adds one outstanding edge. Cannot fail: a descent blocked by a
    /// detaching leaf restarts from the root, rebinding it if the tree
    /// emptied meanwhile.
    pub fn increment(&self) {
        let leaf = IncounterNode::alloc(self.branching, Tagged::null());
        'outer: loop {
            let root = self.in_tree.load(Ordering::Acquire);
            if root.is_null() {
                if self
                    .in_tree
                    .compare_exchange(root, Tagged::new(leaf, 0), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue 'outer;
            }
            let mut current = root.ptr();
            loop {
                let i = random_int(0, self.branching);
                let branch = unsafe { &(*current).children[i] };
                let next = branch.load(Ordering::Acquire);
                if next.tag() == MINUS {
                    continue 'outer;
                }
                if next.is_null() {
                    if branch
                        .compare_exchange(
                            next,
                            Tagged::new(leaf, 0),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    continue 'outer;
                }
                current = next.ptr();
            }
        }
    }

    /// Removes one outstanding edge. Returns [`Activation::Activated`] iff
    /// this call removed the last leaf.
    pub fn decrement(&self) -> Activation {
        loop {
            let root = self.in_tree.load(Ordering::Acquire);
            let current = root.ptr();
            assert!(!current.is_null(), "decrement on an empty in-counter");
            if unsafe { (*current).is_leaf() } {
                if self.try_to_detach(current) {
                    self.in_tree.store(Tagged::null(), Ordering::Release);
                    self.add_to_out(current);
                    return Activation::Activated;
                }
            }
            let mut cur = current;
            loop {
                let i = random_int(0, self.branching);
                let branch = unsafe { &(*cur).children[i] };
                let next = branch.load(Ordering::Acquire);
                if next.is_null() || next.tag() == MINUS {
                    break;
                }
                let np = next.ptr();
                if unsafe { (*np).is_leaf() } {
                    if self.try_to_detach(np) {
                        branch.store(Tagged::null(), Ordering::Release);
                        self.add_to_out(np);
                        return Activation::NotActivated;
                    }
                    break;
                }
                cur = np;
            }
        }
    }

    /// All-or-nothing claim of a leaf: marks every child slot minus, rolling
    /// written slots back to null when a racing increment occupied one.
    fn try_to_detach(&self, n: *mut IncounterNode) -> bool {
        let children = unsafe { &(*n).children };
        for i in 0..self.branching {
            if children[i]
                .compare_exchange(
                    Tagged::null(),
                    Tagged::null_with(MINUS),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                for j in (0..i).rev() {
                    children[j].store(Tagged::null(), Ordering::Release);
                }
                return false;
            }
        }
        true
    }

    /// Transplants a detached leaf into the out-tree for bulk deallocation.
    fn add_to_out(&self, n: *mut IncounterNode) {
        let retired = Tagged::new(n, MINUS);
        loop {
            let mut current = self.out_tree.load(Ordering::Acquire).ptr();
            loop {
                let i = random_int(0, self.branching);
                let branch = unsafe { &(*current).children[i] };
                let next = branch.load(Ordering::Acquire);
                if next.is_null() {
                    if branch
                        .compare_exchange(next, retired, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    break;
                }
                current = next.ptr();
            }
        }
    }
}

impl Drop for DyntreeIncounter {
    fn drop(&mut self) {
        debug_assert!(self.is_activated());
        let root = self.out_tree.load(Ordering::Relaxed).ptr();
        deallocate_incounter_tree(root);
    }
}

/// Out-set slot states, encoded in the tag bits of one word.
const SLOT_EMPTY: usize = 1;
const SLOT_LEAF: usize = 2;
const SLOT_INTERIOR: usize = 3;
const SLOT_FINISHED_EMPTY: usize = 4;
const SLOT_FINISHED_LEAF: usize = 5;
const SLOT_FINISHED_INTERIOR: usize = 6;

enum SlotState {
    Empty,
    Leaf(*mut Node),
    Interior(*mut OutsetNode),
    FinishedEmpty,
    FinishedLeaf(*mut Node),
    FinishedInterior(*mut OutsetNode),
}

#[inline]
fn decode(word: usize) -> SlotState {
    match tag_of(word) {
        SLOT_EMPTY => SlotState::Empty,
        SLOT_LEAF => SlotState::Leaf(ptr_of(word)),
        SLOT_INTERIOR => SlotState::Interior(ptr_of(word)),
        SLOT_FINISHED_EMPTY => SlotState::FinishedEmpty,
        SLOT_FINISHED_LEAF => SlotState::FinishedLeaf(ptr_of(word)),
        SLOT_FINISHED_INTERIOR => SlotState::FinishedInterior(ptr_of(word)),
        _ => unreachable!("corrupt out-set slot"),
    }
}

/// The finished counterpart of a live slot word.
#[inline]
fn make_finished(word: usize) -> usize {
    let tag = tag_of(word);
    debug_assert!((SLOT_EMPTY..=SLOT_INTERIOR).contains(&tag));
    (word & !TAG_MASK) | (tag + 3)
}

pub(crate) struct OutsetNode {
    children: Box<[AtomicUsize]>,
}

impl OutsetNode {
    fn alloc(branching: usize) -> *mut OutsetNode {
        let children = (0..branching)
            .map(|_| AtomicUsize::new(SLOT_EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(OutsetNode { children }))
    }

    /// An interior node whose first two slots hold the displaced values.
    fn alloc_interior(branching: usize, first: usize, second: usize) -> *mut OutsetNode {
        let n = Self::alloc(branching);
        unsafe {
            (*n).children[0].store(first, Ordering::Relaxed);
            (*n).children[1].store(second, Ordering::Relaxed);
        }
        n
    }
}

/// Out-set backed by a randomised tree with tag-encoded slot states.
pub struct DyntreeOutset {
    pub(crate) root: *mut OutsetNode,
    branching: usize,
}

unsafe impl Send for DyntreeOutset {}
unsafe impl Sync for DyntreeOutset {}

impl DyntreeOutset {
    pub fn new(branching: usize) -> Self {
        assert!(branching >= 2);
        Self {
            root: OutsetNode::alloc(branching),
            branching,
        }
    }

    /// Records a successor. Fails exactly when the freeze walk already
    /// passed through every slot this insert could land in.
    pub fn insert(&self, target: *mut Node) -> bool {
        let leaf_word = pack(target, SLOT_LEAF);
        let mut current = self.root;
        loop {
            let next;
            'slots: loop {
                let i = random_int(0, self.branching);
                let slot = unsafe { &(*current).children[i] };
                let word = slot.load(Ordering::Acquire);
                match decode(word) {
                    SlotState::FinishedEmpty
                    | SlotState::FinishedLeaf(_)
                    | SlotState::FinishedInterior(_) => return false,
                    SlotState::Empty => {
                        if slot
                            .compare_exchange(word, leaf_word, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return true;
                        }
                        continue 'slots;
                    }
                    SlotState::Leaf(_) => {
                        let interior =
                            OutsetNode::alloc_interior(self.branching, leaf_word, word);
                        if slot
                            .compare_exchange(
                                word,
                                pack(interior, SLOT_INTERIOR),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return true;
                        }
                        unsafe { drop(Box::from_raw(interior)) };
                        continue 'slots;
                    }
                    SlotState::Interior(p) => {
                        next = p;
                        break 'slots;
                    }
                }
            }
            current = next;
        }
    }
}

impl Drop for DyntreeOutset {
    fn drop(&mut self) {
        deallocate_outset_tree(self.root);
    }
}

fn teardown_budget() -> usize {
    if pool::is_worker() {
        pool::communication_delay()
    } else {
        usize::MAX
    }
}

/// Frees up to `budget` nodes of a retired in-counter tree.
fn deallocate_incounter_partial(todo: &mut VecDeque<*mut IncounterNode>, budget: usize) {
    let mut k = 0;
    while k < budget {
        let Some(current) = todo.pop_back() else { break };
        unsafe {
            for slot in (*current).children.iter() {
                let child = slot.load(Ordering::Acquire).ptr();
                if !child.is_null() {
                    todo.push_back(child);
                }
            }
            drop(Box::from_raw(current));
        }
        k += 1;
    }
}

/// Frees a retired in-counter tree, continuing as a DAG task when the walk
/// outgrows one block.
pub(crate) fn deallocate_incounter_tree(root: *mut IncounterNode) {
    let mut todo = VecDeque::new();
    todo.push_back(root);
    deallocate_incounter_partial(&mut todo, teardown_budget());
    if !todo.is_empty() {
        let n = Node::new(DeallocIncounterTree { todo });
        prepare_node_with(n, ready_word(), OUT_NOOP_WORD);
        add_node(n);
    }
}

struct DeallocIncounterTree {
    todo: VecDeque<*mut IncounterNode>,
}

unsafe impl Send for DeallocIncounterTree {}

const WALK_PROCESS: i32 = 0;
const WALK_REPEAT: i32 = 1;

impl NodeBody for DeallocIncounterTree {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            WALK_PROCESS => {
                deallocate_incounter_partial(&mut self.todo, pool::communication_delay());
                nd.jump_to(WALK_REPEAT);
            }
            WALK_REPEAT => {
                if !self.todo.is_empty() {
                    nd.jump_to(WALK_PROCESS);
                }
            }
            _ => unreachable!("bad teardown block"),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, _nd: NodeRef) -> Option<NodeRef> {
        let handed = self.todo.pop_front()?;
        let mut todo = VecDeque::new();
        todo.push_back(handed);
        let sibling = Node::new(DeallocIncounterTree { todo });
        prepare_node_with(sibling, ready_word(), OUT_NOOP_WORD);
        Some(sibling)
    }
}

/// Freezes up to `budget` out-set nodes, notifying every leaf passed over.
fn notify_outset_partial(todo: &mut VecDeque<*mut OutsetNode>, budget: usize) {
    let mut k = 0;
    while k < budget {
        let Some(current) = todo.pop_back() else { break };
        unsafe {
            for slot in (*current).children.iter() {
                let mut word;
                loop {
                    word = slot.load(Ordering::Acquire);
                    if slot
                        .compare_exchange(
                            word,
                            make_finished(word),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                match decode(word) {
                    SlotState::Leaf(target) => decrement_incounter(core::ptr::null_mut(), target),
                    SlotState::Interior(p) => todo.push_back(p),
                    _ => {}
                }
            }
        }
        k += 1;
    }
}

/// Finish protocol of a dyntree out-set: freeze every slot, notify every
/// leaf, then free the tree; both phases continue as DAG tasks when they
/// outgrow one block.
pub(crate) unsafe fn notify_outset(out: *mut Outset) {
    let root = unsafe {
        match &(*out).kind {
            OutsetKind::Dyntree(d) => d.root,
            OutsetKind::Simple(_) => unreachable!("notify walk on a list out-set"),
        }
    };
    let mut todo = VecDeque::new();
    todo.push_back(root);
    notify_outset_partial(&mut todo, teardown_budget());
    if !todo.is_empty() {
        let n = Node::new(NotifyOutsetPar {
            out: OutsetPtr(out),
            todo,
        });
        prepare_node_with(n, ready_word(), OUT_NOOP_WORD);
        add_node(n);
    } else {
        unsafe { outset_walk_done(out) };
    }
}

struct OutsetPtr(*mut Outset);

unsafe impl Send for OutsetPtr {}

/// Phase-one walker: drains the freeze-and-notify queue in parallel, then
/// lets the parent task release the out-set.
struct NotifyOutsetRec {
    join: NodeRef,
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for NotifyOutsetRec {}

impl NodeBody for NotifyOutsetRec {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            WALK_PROCESS => {
                notify_outset_partial(&mut self.todo, pool::communication_delay());
                nd.jump_to(WALK_REPEAT);
            }
            WALK_REPEAT => {
                if !self.todo.is_empty() {
                    nd.jump_to(WALK_PROCESS);
                }
            }
            _ => unreachable!("bad teardown block"),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, _nd: NodeRef) -> Option<NodeRef> {
        let handed = self.todo.pop_front()?;
        let mut todo = VecDeque::new();
        todo.push_back(handed);
        let sibling = Node::new(NotifyOutsetRec {
            join: self.join,
            todo,
        });
        prepare_node_with(sibling, ready_word(), outset_unary_word());
        add_edge(sibling, self.join);
        Some(sibling)
    }
}

struct NotifyOutsetPar {
    out: OutsetPtr,
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for NotifyOutsetPar {}

const PAR_ENTRY: i32 = 0;
const PAR_EXIT: i32 = 1;

impl NodeBody for NotifyOutsetPar {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            PAR_ENTRY => {
                let todo = core::mem::take(&mut self.todo);
                nd.finish(Node::new(NotifyOutsetRec { join: nd, todo }), PAR_EXIT);
            }
            PAR_EXIT => unsafe { outset_walk_done(self.out.0) },
            _ => unreachable!("bad teardown block"),
        }
    }
}

/// Frees up to `budget` frozen out-set nodes.
fn deallocate_outset_partial(todo: &mut VecDeque<*mut OutsetNode>, budget: usize) {
    let mut k = 0;
    while k < budget {
        let Some(current) = todo.pop_back() else { break };
        unsafe {
            for slot in (*current).children.iter() {
                match decode(slot.load(Ordering::Acquire)) {
                    SlotState::FinishedEmpty | SlotState::FinishedLeaf(_) => {}
                    SlotState::FinishedInterior(p) => todo.push_back(p),
                    _ => unreachable!("out-set torn down before its finish"),
                }
            }
            drop(Box::from_raw(current));
        }
        k += 1;
    }
}

/// Frees a frozen out-set tree, continuing as a DAG task when the walk
/// outgrows one block.
pub(crate) fn deallocate_outset_tree(root: *mut OutsetNode) {
    let mut todo = VecDeque::new();
    todo.push_back(root);
    deallocate_outset_partial(&mut todo, teardown_budget());
    if !todo.is_empty() {
        let n = Node::new(DeallocOutsetTree { todo });
        prepare_node_with(n, ready_word(), OUT_NOOP_WORD);
        add_node(n);
    }
}

struct DeallocOutsetTree {
    todo: VecDeque<*mut OutsetNode>,
}

unsafe impl Send for DeallocOutsetTree {}

impl NodeBody for DeallocOutsetTree {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            WALK_PROCESS => {
                deallocate_outset_partial(&mut self.todo, pool::communication_delay());
                nd.jump_to(WALK_REPEAT);
            }
            WALK_REPEAT => {
                if !self.todo.is_empty() {
                    nd.jump_to(WALK_PROCESS);
                }
            }
            _ => unreachable!("bad teardown block"),
        }
    }

    fn size(&self) -> usize {
        self.todo.len()
    }

    fn split(&mut self, _nd: NodeRef) -> Option<NodeRef> {
        let handed = self.todo.pop_front()?;
        let mut todo = VecDeque::new();
        todo.push_back(handed);
        let sibling = Node::new(DeallocOutsetTree { todo });
        prepare_node_with(sibling, ready_word(), OUT_NOOP_WORD);
        Some(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{outset_finished, Outset, OutsetKind, IN_FETCH_ADD};
    use crate::tagged::TAG_BITS;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct Inert;

    impl NodeBody for Inert {
        fn run(&mut self, _nd: NodeRef) {}
    }

    const BASE: usize = 1 << 20;

    fn inert_target() -> NodeRef {
        let n = Node::new(Inert);
        unsafe {
            (*n.0)
                .hdr
                .in_word
                .store((BASE << TAG_BITS) | IN_FETCH_ADD, Ordering::Release)
        };
        n
    }

    fn decrements_received(n: NodeRef) -> usize {
        let count = unsafe { (*n.0).hdr.in_word.load(Ordering::Acquire) } >> TAG_BITS;
        BASE - count
    }

    unsafe fn free_node(n: NodeRef) {
        drop(Box::from_raw(n.0));
    }

    #[test]
    fn incounter_sequential_balance() {
        let inc = DyntreeIncounter::new(2);
        for _ in 0..100 {
            inc.increment();
        }
        assert!(!inc.is_activated());
        let mut activations = 0;
        for _ in 0..100 {
            if inc.decrement() == Activation::Activated {
                activations += 1;
            }
        }
        assert_eq!(activations, 1);
        assert!(inc.is_activated());
    }

    #[test]
    fn incounter_conservation_under_contention() {
        const THREADS: usize = 8;
        const OPS: usize = 5_000;

        for branching in [2usize, 4] {
            let inc = Arc::new(DyntreeIncounter::new(branching));
            let activations = Arc::new(AtomicUsize::new(0));
            let start = Arc::new(Barrier::new(THREADS));

            // A baseline edge keeps the counter nonzero while threads churn,
            // so no decrement below may activate.
            inc.increment();

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let inc = inc.clone();
                    let activations = activations.clone();
                    let start = start.clone();
                    thread::spawn(move || {
                        start.wait();
                        for _ in 0..OPS {
                            inc.increment();
                            if inc.decrement() == Activation::Activated {
                                activations.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(activations.load(Ordering::Relaxed), 0);
            assert!(!inc.is_activated());
            assert_eq!(inc.decrement(), Activation::Activated);
            assert!(inc.is_activated());
        }
    }

    #[test]
    fn outset_insert_after_finish_fails() {
        let out = Box::into_raw(Box::new(Outset::new(
            false,
            OutsetKind::Dyntree(DyntreeOutset::new(2)),
        )));
        let a = inert_target();
        let b = inert_target();
        unsafe {
            match &(*out).kind {
                OutsetKind::Dyntree(d) => assert!(d.insert(a.0)),
                _ => unreachable!(),
            }
            outset_finished(out);
            match &(*out).kind {
                OutsetKind::Dyntree(d) => assert!(!d.insert(b.0)),
                _ => unreachable!(),
            }
        }
        assert_eq!(decrements_received(a), 1);
        assert_eq!(decrements_received(b), 0);
        unsafe {
            free_node(a);
            free_node(b);
            drop(Box::from_raw(out));
        }
    }

    #[test]
    fn outset_notifies_each_success_exactly_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let out = Box::into_raw(Box::new(Outset::new(
            false,
            OutsetKind::Dyntree(DyntreeOutset::new(2)),
        )));
        let shared = unsafe { &*out };
        let start = Arc::new(Barrier::new(THREADS + 1));
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let start = start.clone();
                let successes = successes.clone();
                let tree = match &shared.kind {
                    OutsetKind::Dyntree(d) => d as *const DyntreeOutset as usize,
                    _ => unreachable!(),
                };
                thread::spawn(move || {
                    let tree = unsafe { &*(tree as *const DyntreeOutset) };
                    let targets: Vec<NodeRef> =
                        (0..PER_THREAD).map(|_| inert_target()).collect();
                    start.wait();
                    let mut ok = 0usize;
                    for &t in &targets {
                        if tree.insert(t.0) {
                            ok += 1;
                        }
                    }
                    successes.fetch_add(ok, Ordering::Relaxed);
                    targets
                })
            })
            .collect();

        start.wait();
        unsafe { outset_finished(out) };

        let mut all_targets = Vec::new();
        for h in handles {
            all_targets.extend(h.join().unwrap());
        }

        let mut notified = 0usize;
        for &t in &all_targets {
            let d = decrements_received(t);
            assert!(d <= 1, "successor notified twice");
            notified += d;
        }
        assert_eq!(notified, successes.load(Ordering::Relaxed));

        let late = inert_target();
        unsafe {
            match &(*out).kind {
                OutsetKind::Dyntree(d) => assert!(!d.insert(late.0)),
                _ => unreachable!(),
            }
            free_node(late);
        }
        for t in all_targets {
            unsafe { free_node(t) };
        }
        unsafe { drop(Box::from_raw(out)) };
    }
}

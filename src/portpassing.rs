//! Port-passing variant (bottom-up)
//!
//! Instead of a global successor lookup at enabling time, every task carries
//! ports: for each live in-counter in its environment an in-port into that
//! counter's tree, and symmetrically out-ports into the out-sets it may
//! insert into. Forking a task splits each shared port in two, one branch
//! per side, so a finishing task departs exactly the port it holds and the
//! decrement walks one parent chain.
//!
//! The in-counter is a tree of ports with a per-node one-shot gate: the
//! first departing sibling stops the climb, the second continues upward, and
//! the depart that reaches a null parent reports activation. The out-set is
//! a binary port tree frozen slot by slot on finish.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};
use std::collections::{HashMap, VecDeque};

use foldhash::fast::FixedState;

use crate::config::Config;
use crate::node::Header;
use crate::pool::{self, Kind};
use crate::strategy::{Activation, IN_FETCH_ADD, IN_OBJ, IN_READY, IN_UNARY, OUT_NOOP, OUT_OBJ};
use crate::tagged::{pack, ptr_of, tag_of, Tagged, TaggedAtomic, TAG_BITS};

/// Out-strategy tag for the single-successor case: the word points back at
/// the finishing node itself, whose in-ports are departed.
const OUT_PP_UNARY: usize = 2;

/// Tag marking a frozen out-port slot.
const FROZEN: usize = 1;

/// Which of the parent's ports a forked child observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortMode {
    /// Every port of the parent.
    All,
    /// Only ports the child was already seeded with.
    Intersection,
    /// Only ports the child was not seeded with.
    Difference,
}

/// One port of an in-counter tree.
pub(crate) struct InPort {
    parent: *mut InPort,
    removed_children: AtomicI32,
}

impl InPort {
    fn alloc(parent: *mut InPort) -> *mut InPort {
        Box::into_raw(Box::new(InPort {
            parent,
            removed_children: AtomicI32::new(0),
        }))
    }
}

/// One port of an out-set tree.
pub(crate) struct OutPort {
    target: *mut PNode,
    port: *mut InPort,
    children: [TaggedAtomic<OutPort>; 2],
}

impl OutPort {
    fn alloc(target: *mut PNode, port: *mut InPort) -> *mut OutPort {
        Box::into_raw(Box::new(OutPort {
            target,
            port,
            children: [TaggedAtomic::null(), TaggedAtomic::null()],
        }))
    }
}

/// Port-tree in-counter: activation is reached by the depart that walks to a
/// null parent.
pub(crate) struct PIncounter {
    n: *mut PNode,
}

impl PIncounter {
    fn alloc(n: *mut PNode) -> *mut PIncounter {
        Box::into_raw(Box::new(PIncounter { n }))
    }

    /// Splits `port` into two sibling branches, one for each side of a fork.
    /// A null port grows a fresh root port instead.
    fn increment(&self, port: *mut InPort) -> (*mut InPort, *mut InPort) {
        if port.is_null() {
            (InPort::alloc(ptr::null_mut()), ptr::null_mut())
        } else {
            (InPort::alloc(port), InPort::alloc(port))
        }
    }

    fn increment_root(&self) -> *mut InPort {
        self.increment(ptr::null_mut()).0
    }

    /// Departs `port`, climbing parents past every pair whose sibling has
    /// already departed. The one-shot gate on each node keeps double
    /// activation out.
    unsafe fn decrement(&self, port: *mut InPort) -> Activation {
        assert!(!port.is_null(), "depart without a port");
        let mut current = port;
        let mut next = unsafe { (*current).parent };
        while !next.is_null() {
            unsafe { drop(Box::from_raw(current)) };
            loop {
                let gate = unsafe { &(*next).removed_children };
                if gate.load(Ordering::Acquire) != 0 {
                    break;
                }
                if gate
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Activation::NotActivated;
                }
            }
            current = next;
            next = unsafe { (*current).parent };
        }
        unsafe { drop(Box::from_raw(current)) };
        Activation::Activated
    }
}

/// Port-tree out-set with a frozen tag per slot.
pub(crate) struct POutset {
    root: *mut OutPort,
    n: Cell<*mut PNode>,
    auto_dealloc: Cell<bool>,
    release: core::sync::atomic::AtomicU8,
}

unsafe impl Send for POutset {}
unsafe impl Sync for POutset {}

const RELEASE_LIVE: u8 = 0;
const RELEASE_NOTIFIED: u8 = 1;
const RELEASE_REQUESTED: u8 = 2;

impl POutset {
    fn alloc(n: *mut PNode) -> *mut POutset {
        Box::into_raw(Box::new(POutset {
            root: OutPort::alloc(ptr::null_mut(), ptr::null_mut()),
            n: Cell::new(n),
            auto_dealloc: Cell::new(true),
            release: core::sync::atomic::AtomicU8::new(RELEASE_LIVE),
        }))
    }

    fn set_node(&self, n: *mut PNode) {
        assert!(self.n.get().is_null());
        assert!(!n.is_null());
        self.n.set(n);
    }

    /// Walks the first non-null child chain down to a port with no children.
    fn find_leaf(&self) -> *mut OutPort {
        let mut current = self.root;
        loop {
            let mut next = ptr::null_mut();
            for i in 0..2 {
                let child = unsafe { (*current).children[i].load(Ordering::Acquire) };
                if !child.is_null() {
                    next = child.ptr();
                    break;
                }
            }
            if next.is_null() {
                return current;
            }
            current = next;
        }
    }

    fn is_finished(&self) -> bool {
        unsafe { (*self.root).children[0].load(Ordering::Acquire).tag() == FROZEN }
    }

    /// Installs a successor record below `outport`. Fails exactly when the
    /// freeze walk claimed the slot first.
    fn insert(
        &self,
        outport: *mut OutPort,
        target: *mut PNode,
        inport: *mut InPort,
    ) -> Option<*mut OutPort> {
        if self.is_finished() {
            return None;
        }
        let next = OutPort::alloc(target, inport);
        let installed = unsafe {
            (*outport).children[0]
                .compare_exchange(
                    Tagged::null(),
                    Tagged::new(next, 0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        };
        if !installed {
            unsafe { drop(Box::from_raw(next)) };
            return None;
        }
        Some(next)
    }

    /// Installs two fresh children below `port`, one per side of a fork.
    /// Fails when the freeze walk got to the slots first; a child already
    /// installed stays in the tree and is reclaimed with it.
    fn fork2(&self, port: *mut OutPort) -> Option<(*mut OutPort, *mut OutPort)> {
        assert!(!port.is_null(), "fork of a missing out-port");
        let mut branches = [ptr::null_mut(); 2];
        for i in (0..2).rev() {
            let branch = OutPort::alloc(ptr::null_mut(), ptr::null_mut());
            let installed = unsafe {
                (*port).children[i]
                    .compare_exchange(
                        Tagged::null(),
                        Tagged::new(branch, 0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            };
            if !installed {
                unsafe { drop(Box::from_raw(branch)) };
                return None;
            }
            branches[i] = branch;
        }
        Some((branches[0], branches[1]))
    }
}

impl Drop for POutset {
    fn drop(&mut self) {
        deallocate_port_tree(self.root);
    }
}

type InPortMap = HashMap<usize, *mut InPort, FixedState>;
type OutPortMap = HashMap<usize, *mut OutPort, FixedState>;

/// The body of a port-passing node.
pub trait PNodeBody: Send {
    /// Executes the current block.
    fn run(&mut self, nd: PNodeRef);

    /// Amount of divisible work carried.
    fn size(&self) -> usize {
        0
    }

    /// Peels off a sibling; the pool hands it to `add_node`.
    fn split(&mut self, nd: PNodeRef) -> Option<PNodeRef> {
        let _ = nd;
        None
    }
}

/// A port-passing DAG node: header words, port maps and the boxed body.
pub struct PNode {
    pub(crate) hdr: Header,
    inport_mode: Cell<PortMode>,
    outport_mode: Cell<PortMode>,
    inports: UnsafeCell<InPortMap>,
    outports: UnsafeCell<OutPortMap>,
    body: UnsafeCell<Box<dyn PNodeBody>>,
}

unsafe impl Send for PNode {}
unsafe impl Sync for PNode {}

impl PNode {
    /// Allocates a node around `body` and returns its handle.
    pub fn new(body: impl PNodeBody + 'static) -> PNodeRef {
        PNodeRef(Box::into_raw(Box::new(PNode {
            hdr: Header::new(),
            inport_mode: Cell::new(PortMode::All),
            outport_mode: Cell::new(PortMode::All),
            inports: UnsafeCell::new(HashMap::default()),
            outports: UnsafeCell::new(HashMap::default()),
            body: UnsafeCell::new(Box::new(body)),
        })))
    }
}

/// Handle to a port-passing node.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PNodeRef(pub(crate) *mut PNode);

unsafe impl Send for PNodeRef {}

/// Handle to a port-passing future's out-set.
#[derive(Clone, Copy)]
pub struct PFuture(pub(crate) *mut POutset);

unsafe impl Send for PFuture {}
unsafe impl Sync for PFuture {}

fn pp_unary_word(n: PNodeRef) -> usize {
    pack(n.0, OUT_PP_UNARY)
}

fn incounter_word(n: PNodeRef) -> usize {
    pack(PIncounter::alloc(n.0), IN_OBJ)
}

fn prepare_node_with(n: PNodeRef, in_word: usize, out_word: usize) {
    unsafe {
        (*n.0).hdr.in_word.store(in_word, Ordering::Release);
        (*n.0).hdr.out_word.store(out_word, Ordering::Release);
    }
}

/// Default preparation: fresh port-tree in-counter and out-set.
fn prepare_node(n: PNodeRef) {
    prepare_node_with(n, incounter_word(n), pack(POutset::alloc(n.0), OUT_OBJ));
}

fn capture_outset() -> usize {
    let running = pool::running_node() as *mut PNode;
    assert!(!running.is_null(), "no node is being run on this worker");
    unsafe { (*running).hdr.out_word.swap(OUT_NOOP, Ordering::AcqRel) }
}

fn join_with(n: PNodeRef, in_word: usize) {
    prepare_node_with(n, in_word, capture_outset());
}

fn continue_with(n: PNodeRef) {
    join_with(n, IN_READY);
    add_node(n);
}

unsafe fn schedule_pnode(n: *mut PNode) {
    if unsafe { (*n).hdr.request_run() } {
        pool::push_run(n as usize);
    }
}

/// Hands a node to the pool. An owned in-counter is released first: the
/// node has not installed a port in it yet, so it counts nothing.
fn add_node(n: PNodeRef) {
    unsafe {
        let w = (*n.0).hdr.in_word.load(Ordering::Acquire);
        match tag_of(w) {
            IN_READY | IN_UNARY | IN_FETCH_ADD => {}
            IN_OBJ => drop(Box::from_raw(ptr_of::<PIncounter>(w))),
            _ => unreachable!("corrupt in-strategy tag"),
        }
        schedule_pnode(n.0);
    }
}

fn insert_inport(n: PNodeRef, in_word: usize, port: *mut InPort) {
    unsafe { (*(*n.0).inports.get()).insert(in_word, port) };
}

fn insert_outport(n: PNodeRef, out: *mut POutset, port: *mut OutPort) {
    assert!(!port.is_null());
    unsafe { (*(*n.0).outports.get()).insert(out as usize, port) };
}

fn find_outport(n: PNodeRef, out: *mut POutset) -> *mut OutPort {
    unsafe {
        *(*(*n.0).outports.get())
            .get(&(out as usize))
            .expect("force without an out-port for the future")
    }
}

/// Departs `port` on `target`'s in-counter; the depart that reaches the
/// root schedules the target.
pub(crate) unsafe fn decrement_incounter_with(
    target: *mut PNode,
    in_word: usize,
    port: *mut InPort,
) {
    match tag_of(in_word) {
        IN_UNARY => unsafe { schedule_pnode(target) },
        IN_FETCH_ADD => {
            let old = unsafe {
                (*target)
                    .hdr
                    .in_word
                    .fetch_sub(1 << TAG_BITS, Ordering::AcqRel)
            };
            if old >> TAG_BITS == 1 {
                unsafe { schedule_pnode(target) };
            }
        }
        IN_OBJ => {
            let inc = unsafe { &*ptr_of::<PIncounter>(in_word) };
            if unsafe { inc.decrement(port) } == Activation::Activated {
                unsafe { start(target) };
            }
        }
        _ => unreachable!("edge removed from a ready node"),
    }
}

/// Activation: releases the owned in-counter, marks the node ready and
/// schedules it.
unsafe fn start(target: *mut PNode) {
    let w = unsafe { (*target).hdr.in_word.swap(IN_READY, Ordering::AcqRel) };
    if tag_of(w) == IN_OBJ {
        let obj = ptr_of::<PIncounter>(w);
        if !obj.is_null() {
            unsafe { drop(Box::from_raw(obj)) };
        }
    }
    unsafe { schedule_pnode(target) };
}

/// Departs every in-port the finishing node holds, each exactly once.
unsafe fn decrement_inports(n: *mut PNode) {
    let ports = unsafe { &mut *(*n).inports.get() };
    for (in_word, port) in ports.drain() {
        let owner = unsafe { (*ptr_of::<PIncounter>(in_word)).n };
        unsafe { decrement_incounter_with(owner, in_word, port) };
    }
}

fn retained<K: Copy + Eq + std::hash::Hash, V: Copy>(
    source: &HashMap<K, V, FixedState>,
    keep_present: bool,
    other: &HashMap<K, V, FixedState>,
) -> HashMap<K, V, FixedState> {
    source
        .iter()
        .filter(|(k, _)| other.contains_key(k) == keep_present)
        .map(|(k, v)| (*k, *v))
        .collect()
}

fn select_ports<K: Copy + Eq + std::hash::Hash, V: Copy>(
    mode: PortMode,
    parent: &HashMap<K, V, FixedState>,
    child: &mut HashMap<K, V, FixedState>,
) {
    match mode {
        PortMode::All => {
            *child = parent.clone();
        }
        PortMode::Intersection => {
            *child = retained(parent, true, child);
        }
        PortMode::Difference => {
            *child = retained(parent, false, child);
        }
    }
}

/// Forks every in-port present on both sides, handing one branch to each.
unsafe fn fork_in_ports(parent: &mut InPortMap, child: &mut InPortMap) {
    let common: Vec<usize> = parent
        .keys()
        .filter(|k| child.contains_key(*k))
        .copied()
        .collect();
    for in_word in common {
        let port = parent[&in_word];
        let (left, right) = unsafe { (*ptr_of::<PIncounter>(in_word)).increment(port) };
        parent.insert(in_word, left);
        child.insert(in_word, right);
    }
}

/// Forks every out-port present on both sides; ports whose out-set already
/// froze are dropped from both maps.
unsafe fn fork_out_ports(parent: &mut OutPortMap, child: &mut OutPortMap) {
    let common: Vec<usize> = parent
        .keys()
        .filter(|k| child.contains_key(*k))
        .copied()
        .collect();
    for out_word in common {
        let port = parent[&out_word];
        let out = unsafe { &*(out_word as *mut POutset) };
        match out.fork2(port) {
            Some((left, right)) => {
                parent.insert(out_word, left);
                child.insert(out_word, right);
            }
            None => {
                parent.remove(&out_word);
                child.remove(&out_word);
            }
        }
    }
}

/// Propagates the parent's ports to a freshly forked child under the
/// child's port modes.
unsafe fn propagate_ports_for(parent: PNodeRef, child: PNodeRef) {
    unsafe {
        let in_mode = (*child.0).inport_mode.get();
        let out_mode = (*child.0).outport_mode.get();
        let parent_in = &mut *(*parent.0).inports.get();
        let child_in = &mut *(*child.0).inports.get();
        select_ports(in_mode, parent_in, child_in);
        fork_in_ports(parent_in, child_in);
        let parent_out = &mut *(*parent.0).outports.get();
        let child_out = &mut *(*child.0).outports.get();
        select_ports(out_mode, parent_out, child_out);
        fork_out_ports(parent_out, child_out);
    }
}

impl PNodeRef {
    /// The block id the body is being resumed at.
    #[inline]
    pub fn block(self) -> i32 {
        unsafe { (*self.0).hdr.block() }
    }

    /// Restricts which of the parent's in-ports this node inherits on fork.
    pub fn set_inport_mode(self, mode: PortMode) {
        unsafe { (*self.0).inport_mode.set(mode) };
    }

    /// Restricts which of the parent's out-ports this node inherits on fork.
    pub fn set_outport_mode(self, mode: PortMode) {
        unsafe { (*self.0).outport_mode.set(mode) };
    }

    fn prepare_for_transfer(self, block: i32) {
        pool::reuse_calling_thread();
        unsafe { (*self.0).hdr.set_continuation(block) };
    }

    /// Suspends and immediately reschedules this node at `block`.
    pub fn jump_to(self, block: i32) {
        self.prepare_for_transfer(block);
        continue_with(self);
    }

    /// Runs `producer` concurrently with this node's continuation; the
    /// producer's completion enables `consumer`.
    pub fn spawn(self, producer: PNodeRef, consumer: PNodeRef, block: i32) {
        prepare_node_with(producer, IN_READY, pp_unary_word(producer));
        let consumer_in = unsafe { (*consumer.0).hdr.in_word.load(Ordering::Acquire) };
        insert_inport(producer, consumer_in, ptr::null_mut());
        unsafe { propagate_ports_for(self, producer) };
        self.jump_to(block);
        add_node(producer);
    }

    /// Runs `producer` and resumes this node at `block` only after the
    /// producer has finished.
    pub fn finish(self, producer: PNodeRef, block: i32) {
        prepare_node_with(producer, IN_READY, pp_unary_word(producer));
        let consumer = self;
        join_with(consumer, incounter_word(consumer));
        unsafe { propagate_ports_for(consumer, producer) };
        let consumer_in = unsafe { (*consumer.0).hdr.in_word.load(Ordering::Acquire) };
        let consumer_inport =
            unsafe { (*ptr_of::<PIncounter>(consumer_in)).increment_root() };
        insert_inport(producer, consumer_in, consumer_inport);
        consumer.prepare_for_transfer(block);
        add_node(producer);
    }

    /// Runs `producer` concurrently; its completion is observable through
    /// the returned handle.
    pub fn future(self, producer: PNodeRef, block: i32) -> PFuture {
        let out = POutset::alloc(ptr::null_mut());
        unsafe { (*out).auto_dealloc.set(false) };
        prepare_node_with(producer, IN_READY, pack(out, OUT_OBJ));
        unsafe { (*out).set_node(producer.0) };
        unsafe { propagate_ports_for(self, producer) };
        // Listen on the future: the creator keeps a port at the current
        // leaf, forked down to every descendant that may force it.
        let leaf = unsafe { (*out).find_leaf() };
        insert_outport(self, out, leaf);
        self.jump_to(block);
        add_node(producer);
        PFuture(out)
    }

    /// Suspends this node until the future behind `f` has finished; if it
    /// already has, the node is rescheduled immediately.
    pub fn force(self, f: PFuture, block: i32) {
        let consumer = self;
        consumer.prepare_for_transfer(block);
        join_with(consumer, IN_UNARY);
        let out = unsafe { &*f.0 };
        let inserted = if out.is_finished() {
            None
        } else {
            let source_outport = find_outport(consumer, f.0);
            out.insert(source_outport, consumer.0, ptr::null_mut())
        };
        match inserted {
            Some(producer_outport) => {
                insert_outport(consumer, f.0, producer_outport);
            }
            None => add_node(consumer),
        }
        unsafe { (*(*consumer.0).outports.get()).remove(&(f.0 as usize)) };
    }

    /// Applies `body` to every index in `[lo, hi)`, in blocks of the
    /// configured communication delay, resuming this node at `block` once
    /// the whole range is done.
    pub fn parallel_for<F>(self, lo: i64, hi: i64, body: F, block: i32)
    where
        F: Fn(i64) + Clone + Send + 'static,
    {
        let consumer = self;
        let producer = PNode::new(PLazyParallelFor {
            lo,
            hi,
            join: consumer,
            body,
        });
        prepare_node_with(producer, IN_READY, pp_unary_word(producer));
        join_with(consumer, incounter_word(consumer));
        unsafe { propagate_ports_for(consumer, producer) };
        let consumer_in = unsafe { (*consumer.0).hdr.in_word.load(Ordering::Acquire) };
        let consumer_inport =
            unsafe { (*ptr_of::<PIncounter>(consumer_in)).increment_root() };
        insert_inport(producer, consumer_in, consumer_inport);
        consumer.prepare_for_transfer(block);
        add_node(producer);
    }

    /// Prepares a hand-made sibling (from a custom `split`) and hands it
    /// this node's ports.
    pub fn split_with(self, sibling: PNodeRef) {
        prepare_node(sibling);
        unsafe { propagate_ports_for(self, sibling) };
    }

    /// Runs `target` to completion before resuming this node at `block`.
    pub fn call(self, target: PNodeRef, block: i32) {
        self.finish(target, block);
    }

    /// Suspends at `block` under an external event source.
    pub fn detach(self, block: i32) {
        self.prepare_for_transfer(block);
        join_with(self, IN_READY);
    }

    /// Releases the out-set of a future, dropping this node's port into it.
    /// The structure is freed here when the finish walk has already
    /// completed, and by the walk otherwise.
    pub fn deallocate_future(self, f: PFuture) {
        unsafe {
            assert!(
                !(*f.0).auto_dealloc.get(),
                "only future out-sets are deallocated explicitly"
            );
            (*(*self.0).outports.get()).remove(&(f.0 as usize));
            match (*f.0).release.compare_exchange(
                RELEASE_LIVE,
                RELEASE_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(RELEASE_NOTIFIED) => drop(Box::from_raw(f.0)),
                Err(_) => panic!("future deallocated twice"),
            }
        }
    }
}

/// Notifies and releases the out-strategy of a node that ran its last
/// block, then frees the node.
unsafe fn finished(n: *mut PNode) {
    let w = unsafe { (*n).hdr.out_word.load(Ordering::Acquire) };
    match tag_of(w) {
        OUT_NOOP => {}
        OUT_PP_UNARY => {
            let owner = ptr_of::<PNode>(w);
            if !owner.is_null() {
                unsafe { decrement_inports(owner) };
            }
        }
        OUT_OBJ => {
            let out = ptr_of::<POutset>(w);
            if !out.is_null() {
                unsafe { outset_finished(out) };
            }
        }
        _ => unreachable!("corrupt out-strategy tag"),
    }
    unsafe { drop(Box::from_raw(n)) };
}

/// Finish protocol of a port-tree out-set: depart the owner's in-ports,
/// then freeze and notify the tree.
unsafe fn outset_finished(out: *mut POutset) {
    let owner = unsafe { (*out).n.get() };
    if !owner.is_null() {
        unsafe { decrement_inports(owner) };
    }
    unsafe { notify_port_tree(out) };
}

fn teardown_budget() -> usize {
    if pool::is_worker() {
        pool::communication_delay()
    } else {
        usize::MAX
    }
}

/// Freezes up to `budget` out-ports, departing the in-port of every target
/// passed over.
fn notify_port_tree_partial(todo: &mut VecDeque<*mut OutPort>, budget: usize) {
    let mut k = 0;
    while k < budget {
        let Some(current) = todo.pop_back() else { break };
        unsafe {
            let target = (*current).target;
            if !target.is_null() {
                let in_word = (*target).hdr.in_word.load(Ordering::Acquire);
                decrement_incounter_with(target, in_word, (*current).port);
            }
            for i in 0..2 {
                let slot = &(*current).children[i];
                let mut child;
                loop {
                    child = slot.load(Ordering::Acquire);
                    if slot
                        .compare_exchange(
                            child,
                            child.with_tag(FROZEN),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                if !child.is_null() {
                    todo.push_back(child.ptr());
                }
            }
        }
        k += 1;
    }
}

unsafe fn notify_port_tree(out: *mut POutset) {
    let mut todo = VecDeque::new();
    todo.push_back(unsafe { (*out).root });
    notify_port_tree_partial(&mut todo, teardown_budget());
    if !todo.is_empty() {
        let n = PNode::new(NotifyPortTreePar {
            out: POutsetPtr(out),
            todo,
        });
        prepare_node_with(n, IN_READY, OUT_NOOP);
        add_node(n);
    } else {
        unsafe { poutset_walk_done(out) };
    }
}

/// Walk-completion half of the release rendezvous.
unsafe fn poutset_walk_done(out: *mut POutset) {
    unsafe {
        if (*out).auto_dealloc.get() {
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

struct POutsetPtr(*mut POutset);

unsafe impl Send for POutsetPtr {}

const WALK_PROCESS: i32 = 0;
const WALK_REPEAT: i32 = 1;

struct NotifyPortTreeRec {
    join: PNodeRef,
    todo: VecDeque<*mut OutPort>,
}

unsafe impl Send for NotifyPortTreeRec {}

impl PNodeBody for NotifyPortTreeRec {
    fn run(&mut self, nd: PNodeRef) {
        match nd.block() {
            WALK_PROCESS => {
                notify_port_tree_partial(&mut self.todo, pool::communication_delay());
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

    fn split(&mut self, nd: PNodeRef) -> Option<PNodeRef> {
        let handed = self.todo.pop_front()?;
        let mut todo = VecDeque::new();
        todo.push_back(handed);
        let sibling = PNode::new(NotifyPortTreeRec {
            join: self.join,
            todo,
        });
        prepare_node(sibling);
        let consumer_in = unsafe { (*self.join.0).hdr.in_word.load(Ordering::Acquire) };
        insert_inport(sibling, consumer_in, ptr::null_mut());
        unsafe { propagate_ports_for(nd, sibling) };
        Some(sibling)
    }
}

const PAR_ENTRY: i32 = 0;
const PAR_EXIT: i32 = 1;

struct NotifyPortTreePar {
    out: POutsetPtr,
    todo: VecDeque<*mut OutPort>,
}

unsafe impl Send for NotifyPortTreePar {}

impl PNodeBody for NotifyPortTreePar {
    fn run(&mut self, nd: PNodeRef) {
        match nd.block() {
            PAR_ENTRY => {
                let todo = core::mem::take(&mut self.todo);
                nd.finish(PNode::new(NotifyPortTreeRec { join: nd, todo }), PAR_EXIT);
            }
            PAR_EXIT => unsafe { poutset_walk_done(self.out.0) },
            _ => unreachable!("bad teardown block"),
        }
    }
}

/// Frees up to `budget` frozen out-ports.
fn deallocate_port_tree_partial(todo: &mut VecDeque<*mut OutPort>, budget: usize) {
    let mut k = 0;
    while k < budget {
        let Some(current) = todo.pop_back() else { break };
        unsafe {
            for i in 0..2 {
                let child = (*current).children[i].load(Ordering::Acquire).ptr();
                if !child.is_null() {
                    todo.push_back(child);
                }
            }
            drop(Box::from_raw(current));
        }
        k += 1;
    }
}

/// Frees an out-port tree, continuing as a DAG task when the walk outgrows
/// one block.
fn deallocate_port_tree(root: *mut OutPort) {
    let mut todo = VecDeque::new();
    todo.push_back(root);
    deallocate_port_tree_partial(&mut todo, teardown_budget());
    if !todo.is_empty() {
        let n = PNode::new(DeallocPortTree { todo });
        prepare_node_with(n, IN_READY, OUT_NOOP);
        add_node(n);
    }
}

struct DeallocPortTree {
    todo: VecDeque<*mut OutPort>,
}

unsafe impl Send for DeallocPortTree {}

impl PNodeBody for DeallocPortTree {
    fn run(&mut self, nd: PNodeRef) {
        match nd.block() {
            WALK_PROCESS => {
                deallocate_port_tree_partial(&mut self.todo, pool::communication_delay());
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

    fn split(&mut self, _nd: PNodeRef) -> Option<PNodeRef> {
        let handed = self.todo.pop_front()?;
        let mut todo = VecDeque::new();
        todo.push_back(handed);
        let sibling = PNode::new(DeallocPortTree { todo });
        prepare_node_with(sibling, IN_READY, OUT_NOOP);
        Some(sibling)
    }
}

/// Lazy parallel-for producer, port-passing flavour: bisection splits seed
/// the sibling's port membership before propagation.
struct PLazyParallelFor<F> {
    lo: i64,
    hi: i64,
    join: PNodeRef,
    body: F,
}

const FOR_PROCESS: i32 = 0;
const FOR_REPEAT: i32 = 1;

impl<F> PNodeBody for PLazyParallelFor<F>
where
    F: Fn(i64) + Clone + Send + 'static,
{
    fn run(&mut self, nd: PNodeRef) {
        match nd.block() {
            FOR_PROCESS => {
                let stop = self.hi.min(self.lo + pool::communication_delay() as i64);
                for i in self.lo..stop {
                    (self.body)(i);
                }
                self.lo = stop;
                nd.jump_to(FOR_REPEAT);
            }
            FOR_REPEAT => {
                if self.lo < self.hi {
                    nd.jump_to(FOR_PROCESS);
                }
            }
            _ => unreachable!("bad parallel-for block"),
        }
    }

    fn size(&self) -> usize {
        (self.hi - self.lo).max(0) as usize
    }

    fn split(&mut self, nd: PNodeRef) -> Option<PNodeRef> {
        let mid = (self.lo + self.hi) / 2;
        if mid == self.lo || mid == self.hi {
            return None;
        }
        let sibling = PNode::new(PLazyParallelFor {
            lo: mid,
            hi: self.hi,
            join: self.join,
            body: self.body.clone(),
        });
        self.hi = mid;
        prepare_node(sibling);
        let consumer_in = unsafe { (*self.join.0).hdr.in_word.load(Ordering::Acquire) };
        insert_inport(sibling, consumer_in, ptr::null_mut());
        unsafe { propagate_ports_for(nd, sibling) };
        Some(sibling)
    }
}

/// Runs one block of a node and handles its completion.
unsafe fn execute(node: *mut PNode) {
    pool::begin_node(node as usize);
    unsafe {
        (*node).hdr.begin_run();
        (*(*node).body.get()).run(PNodeRef(node));
    }
    if pool::reused() {
        if unsafe { (*node).hdr.end_run() } {
            pool::push_run(node as usize);
        }
    } else {
        unsafe { finished(node) };
    }
}

pub(crate) struct PortPassingKind;

impl Kind for PortPassingKind {
    unsafe fn execute(node: usize) {
        unsafe { execute(node as *mut PNode) };
    }

    unsafe fn size(node: usize) -> usize {
        unsafe { (*(*(node as *mut PNode)).body.get()).size() }
    }

    unsafe fn split(node: usize) {
        let node = node as *mut PNode;
        let sibling = unsafe { (*(*node).body.get()).split(PNodeRef(node)) };
        if let Some(sibling) = sibling {
            add_node(sibling);
        }
    }
}

/// Builds a root node around `body` and drives the DAG it unfolds to
/// completion under the port-passing discipline.
pub fn launch(cfg: Config, body: impl PNodeBody + 'static) {
    pool::run::<PortPassingKind>(cfg, move || {
        let root = PNode::new(body);
        prepare_node_with(root, IN_READY, pack(POutset::alloc(root.0), OUT_OBJ));
        add_node(root);
    });
}

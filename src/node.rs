//! DAG nodes and combinators (top-down variant)
//!
//! A node is a unit of schedulable work with labelled resumption points: the
//! body is a state machine over small integer block ids, and every
//! suspension happens at a block boundary. The combinators build the graph
//! as it runs: they allocate producer nodes, wire edges through the strategy
//! words and transfer control.
//!
//! Publication of a node to the pool goes through a three-state machine
//! (idle / running / pending) so that a successor enabled while its node is
//! still inside `run` is re-enqueued by the owning worker at the block
//! boundary instead of racing into a second concurrent run.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};

use crate::config::Config;
use crate::pool::{self, Kind, Retain};
use crate::strategy::{
    add_edge, add_edge_with, add_node, allocate_future, continue_with, finished,
    incounter_new_word, join_with, outset_new_word, outset_unary_word, prepare_node_with,
    ready_word, unary_in_word, FutureHandle,
};
use crate::tagged::pack;

pub(crate) const UNINITIALIZED_BLOCK: i32 = -1;
pub(crate) const ENTRY_BLOCK: i32 = 0;

const SCHED_IDLE: u8 = 0;
const SCHED_RUNNING: u8 = 1;
const SCHED_PENDING: u8 = 2;

/// Header state shared by both node families.
pub(crate) struct Header {
    current_block: AtomicI32,
    continuation_block: AtomicI32,
    pub(crate) in_word: AtomicUsize,
    pub(crate) out_word: AtomicUsize,
    sched: AtomicU8,
}

impl Header {
    pub(crate) fn new() -> Self {
        Self {
            current_block: AtomicI32::new(UNINITIALIZED_BLOCK),
            continuation_block: AtomicI32::new(ENTRY_BLOCK),
            in_word: AtomicUsize::new(crate::strategy::IN_READY),
            out_word: AtomicUsize::new(crate::strategy::OUT_NOOP_WORD),
            sched: AtomicU8::new(SCHED_IDLE),
        }
    }

    #[inline]
    pub(crate) fn block(&self) -> i32 {
        self.current_block.load(Ordering::Relaxed)
    }

    pub(crate) fn set_continuation(&self, block: i32) {
        self.continuation_block.store(block, Ordering::Relaxed);
    }

    /// Moves the continuation into the current block at the start of a run.
    pub(crate) fn begin_run(&self) {
        let block = self
            .continuation_block
            .swap(UNINITIALIZED_BLOCK, Ordering::Relaxed);
        assert_ne!(block, UNINITIALIZED_BLOCK, "node resumed without a continuation");
        self.current_block.store(block, Ordering::Relaxed);
        self.sched.store(SCHED_RUNNING, Ordering::Release);
    }

    /// Requests a run. Returns true when the caller must enqueue the node
    /// itself; false when the node is mid-run and its worker republishes it
    /// at the block boundary.
    pub(crate) unsafe fn request_run(&self) -> bool {
        match self.sched.compare_exchange(
            SCHED_RUNNING,
            SCHED_PENDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(state) => {
                assert_eq!(state, SCHED_IDLE, "node scheduled twice");
                true
            }
        }
    }

    /// Ends a run of a reused node. Returns true when a request arrived
    /// mid-run and the node must be enqueued again.
    pub(crate) fn end_run(&self) -> bool {
        self.sched.swap(SCHED_IDLE, Ordering::AcqRel) == SCHED_PENDING
    }
}

/// The body of a node: one `run` per block, with an optional split protocol
/// for divisible work.
pub trait NodeBody: Send {
    /// Executes the current block. Reads the block id via [`NodeRef::block`]
    /// and must not touch the node after a suspending combinator returns.
    fn run(&mut self, nd: NodeRef);

    /// Amount of divisible work carried; nodes reporting at least two may be
    /// asked to split.
    fn size(&self) -> usize {
        0
    }

    /// Peels off a sibling node carrying part of the work. The sibling must
    /// be prepared and edged; the pool enqueues it.
    fn split(&mut self, nd: NodeRef) -> Option<NodeRef> {
        let _ = nd;
        None
    }
}

/// A heap-allocated DAG node: header words plus the boxed body.
pub struct Node {
    pub(crate) hdr: Header,
    pub(crate) body: UnsafeCell<Box<dyn NodeBody>>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    /// Allocates a node around `body` and returns its handle.
    pub fn new(body: impl NodeBody + 'static) -> NodeRef {
        NodeRef(Box::into_raw(Box::new(Node {
            hdr: Header::new(),
            body: UnsafeCell::new(Box::new(body)),
        })))
    }
}

/// Handle to a node.
///
/// Handles are plain words; validity follows the graph discipline: a node
/// stays alive until its final block has run and its out-strategy has been
/// notified.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(pub(crate) *mut Node);

unsafe impl Send for NodeRef {}

impl NodeRef {
    /// The block id the body is being resumed at.
    #[inline]
    pub fn block(self) -> i32 {
        unsafe { (*self.0).hdr.block() }
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
    pub fn spawn(self, producer: NodeRef, consumer: NodeRef, block: i32) {
        prepare_node_with(producer, ready_word(), outset_unary_word());
        add_edge(producer, consumer);
        self.jump_to(block);
        add_node(producer);
    }

    /// Runs `producer` and resumes this node at `block` only after the
    /// producer has finished.
    pub fn finish(self, producer: NodeRef, block: i32) {
        prepare_node_with(producer, ready_word(), outset_unary_word());
        self.prepare_for_transfer(block);
        join_with(self, incounter_new_word(self));
        add_edge(producer, self);
        add_node(producer);
    }

    /// Runs `producer` concurrently; its completion is observable through
    /// the returned handle.
    pub fn future(self, producer: NodeRef, block: i32) -> FutureHandle {
        let out = allocate_future();
        prepare_node_with(producer, ready_word(), pack(out.0, crate::strategy::OUT_OBJ));
        self.jump_to(block);
        add_node(producer);
        out
    }

    /// Suspends this node until the future behind `out` has finished; if it
    /// already has, the node is rescheduled immediately.
    pub fn force(self, out: FutureHandle, block: i32) {
        self.prepare_for_transfer(block);
        join_with(self, unary_in_word());
        unsafe {
            add_edge_with(
                core::ptr::null_mut(),
                pack(out.0, crate::strategy::OUT_OBJ),
                self.0,
                unary_in_word(),
            )
        };
    }

    /// Applies `body` to every index in `[lo, hi)`, in blocks of the
    /// configured communication delay, resuming this node at `block` once
    /// the whole range is done.
    pub fn parallel_for<F>(self, lo: i64, hi: i64, body: F, block: i32)
    where
        F: Fn(i64) + Clone + Send + 'static,
    {
        let producer = Node::new(LazyParallelFor {
            lo,
            hi,
            join: self,
            body,
        });
        prepare_node_with(producer, ready_word(), outset_unary_word());
        self.prepare_for_transfer(block);
        join_with(self, incounter_new_word(self));
        add_edge(producer, self);
        add_node(producer);
    }

    /// Runs `target` to completion before resuming this node at `block`.
    pub fn call(self, target: NodeRef, block: i32) {
        self.finish(target, block);
    }

    /// Suspends at `block` under an external event source; a [`Retain`]
    /// holder schedules the node when the event fires.
    pub fn detach(self, block: i32) {
        self.prepare_for_transfer(block);
        join_with(self, ready_word());
    }
}

impl Retain {
    /// Wakes a detached node from outside the pool.
    pub fn schedule(&self, nd: NodeRef) {
        unsafe {
            if (*nd.0).hdr.request_run() {
                self.push_external(nd.0 as usize);
            }
        }
    }
}

/// Acquires a guard that keeps the pool alive until an external event source
/// is done scheduling nodes. Must be called on a worker.
pub fn retain() -> Retain {
    Retain::new(pool::shared_handle())
}

/// Runs one block of a node and handles its completion.
pub(crate) unsafe fn execute(node: *mut Node) {
    pool::begin_node(node as usize);
    unsafe {
        (*node).hdr.begin_run();
        (*(*node).body.get()).run(NodeRef(node));
    }
    if pool::reused() {
        if unsafe { (*node).hdr.end_run() } {
            pool::push_run(node as usize);
        }
    } else {
        unsafe { finished(node) };
    }
}

pub(crate) struct DirectKind;

impl Kind for DirectKind {
    unsafe fn execute(node: usize) {
        unsafe { execute(node as *mut Node) };
    }

    unsafe fn size(node: usize) -> usize {
        unsafe { (*(*(node as *mut Node)).body.get()).size() }
    }

    unsafe fn split(node: usize) {
        let node = node as *mut Node;
        let sibling = unsafe { (*(*node).body.get()).split(NodeRef(node)) };
        if let Some(sibling) = sibling {
            add_node(sibling);
        }
    }
}

/// Builds a root node around `body` and drives the DAG it unfolds to
/// completion on a work-stealing pool configured by `cfg`.
pub fn launch(cfg: Config, body: impl NodeBody + 'static) {
    pool::run::<DirectKind>(cfg, move || {
        let root = Node::new(body);
        prepare_node_with(root, ready_word(), outset_new_word());
        add_node(root);
    });
}

/// Lazy parallel-for producer: processes the range one communication-delay
/// block at a time and bisects on demand, edging the sibling to the same
/// join node.
struct LazyParallelFor<F> {
    lo: i64,
    hi: i64,
    join: NodeRef,
    body: F,
}

const FOR_PROCESS: i32 = 0;
const FOR_REPEAT: i32 = 1;

impl<F> NodeBody for LazyParallelFor<F>
where
    F: Fn(i64) + Clone + Send + 'static,
{
    fn run(&mut self, nd: NodeRef) {
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

    fn split(&mut self, _nd: NodeRef) -> Option<NodeRef> {
        let mid = (self.lo + self.hi) / 2;
        if mid == self.lo || mid == self.hi {
            return None;
        }
        let sibling = Node::new(LazyParallelFor {
            lo: mid,
            hi: self.hi,
            join: self.join,
            body: self.body.clone(),
        });
        self.hi = mid;
        prepare_node_with(sibling, ready_word(), outset_unary_word());
        add_edge(sibling, self.join);
        Some(sibling)
    }
}

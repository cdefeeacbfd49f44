//! Work-stealing pool glue
//!
//! The edge engine consumes a small work-stealing pool: per-worker LIFO
//! deques with stealers, a global injector for off-pool wakeups, and a
//! thread-local worker context carrying the engine configuration, the reuse
//! flag and the node currently being run. Termination is an atomic count of
//! scheduled-but-unfinished runs; [`Retain`] guards keep the pool alive
//! across externally driven wakeups.

use core::cell::{Cell, RefCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use crate::config::{Config, EdgeAlgorithm};

// Cache line sizes per architecture: x86_64 64B, aarch64 128B (M-series /
// Neoverse), s390x 256B.

#[cfg(target_arch = "s390x")]
#[repr(align(256))]
pub(crate) struct CacheAligned<T> {
    pub data: T,
}

#[cfg(target_arch = "aarch64")]
#[repr(align(128))]
pub(crate) struct CacheAligned<T> {
    pub data: T,
}

#[cfg(not(any(target_arch = "s390x", target_arch = "aarch64")))]
#[repr(align(64))]
pub(crate) struct CacheAligned<T> {
    pub data: T,
}

impl<T> CacheAligned<T> {
    pub(crate) fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// How one DAG-node family plugs into the pool.
///
/// Pointers travel through the deques as raw words; the kind knows how to
/// run, measure and split them.
pub(crate) trait Kind: 'static {
    /// Runs one block of the node and handles its completion.
    unsafe fn execute(node: usize);
    /// Amount of divisible work the node is carrying.
    unsafe fn size(node: usize) -> usize;
    /// Splits off a sibling carrying half of the work and schedules it.
    unsafe fn split(node: usize);
}

pub(crate) struct Shared {
    injector: Injector<usize>,
    pending: CacheAligned<AtomicUsize>,
}

impl Shared {
    fn new() -> Self {
        Self {
            injector: Injector::new(),
            pending: CacheAligned::new(AtomicUsize::new(0)),
        }
    }
}

pub(crate) struct WorkerCtx {
    pub(crate) shared: Arc<Shared>,
    pub(crate) cfg: Arc<Config>,
    queue: Worker<usize>,
    stealers: Arc<Vec<Stealer<usize>>>,
    index: usize,
    pub(crate) reuse: Cell<bool>,
    pub(crate) running: Cell<usize>,
}

std::thread_local! {
    static CTX: RefCell<Option<Rc<WorkerCtx>>> = RefCell::new(None);
}

fn install(ctx: WorkerCtx) {
    CTX.with(|c| {
        let prev = c.borrow_mut().replace(Rc::new(ctx));
        assert!(prev.is_none(), "worker context installed twice");
    });
}

fn clear() {
    CTX.with(|c| {
        c.borrow_mut().take();
    });
}

fn current() -> Rc<WorkerCtx> {
    CTX.with(|c| {
        c.borrow()
            .as_ref()
            .cloned()
            .expect("engine operation outside a worker thread")
    })
}

/// True when the calling thread is a pool worker.
pub(crate) fn is_worker() -> bool {
    CTX.with(|c| c.borrow().is_some())
}

/// The configured cooperative block size.
pub(crate) fn communication_delay() -> usize {
    current().cfg.communication_delay
}

/// The configured edge algorithm.
pub(crate) fn edge_algorithm() -> EdgeAlgorithm {
    current().cfg.edge_algorithm
}

/// The configured dynamic-tree branching factor.
pub(crate) fn dyntree_branching_factor() -> usize {
    current().cfg.dyntree_branching_factor
}

/// The configured SNZI shape.
pub(crate) fn snzi_shape() -> (usize, usize) {
    let ctx = current();
    (ctx.cfg.snzi_branching_factor, ctx.cfg.snzi_levels)
}

/// Marks the node being run as reused: it will be re-prepared before the
/// body returns and must not be finished by the worker loop.
pub(crate) fn reuse_calling_thread() {
    current().reuse.set(true);
}

/// Records the node about to run and clears the reuse flag.
pub(crate) fn begin_node(node: usize) {
    let ctx = current();
    ctx.running.set(node);
    ctx.reuse.set(false);
}

/// Whether the node that just ran re-prepared itself.
pub(crate) fn reused() -> bool {
    current().reuse.get()
}

/// The node currently being run on this worker.
pub(crate) fn running_node() -> usize {
    current().running.get()
}

/// Enqueues a run of `node`, locally on a worker, via the injector
/// elsewhere.
pub(crate) fn push_run(node: usize) {
    CTX.with(|c| match c.borrow().as_ref() {
        Some(ctx) => {
            ctx.shared.pending.fetch_add(1, Ordering::Release);
            ctx.queue.push(node);
        }
        None => panic!("scheduling outside a worker requires a Retain handle"),
    });
}

/// Clones the shared pool handle of the current worker.
pub(crate) fn shared_handle() -> Arc<Shared> {
    current().shared.clone()
}

/// Keeps the pool alive while an external event source holds a node.
///
/// The pool terminates when no scheduled run and no retain guard remains, so
/// a detached node waiting on a timer must be covered by one of these.
pub struct Retain {
    shared: Arc<Shared>,
}

impl Retain {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        shared.pending.fetch_add(1, Ordering::Release);
        Self { shared }
    }

    pub(crate) fn push_external(&self, node: usize) {
        self.shared.pending.fetch_add(1, Ordering::Release);
        self.shared.injector.push(node);
    }
}

impl Drop for Retain {
    fn drop(&mut self) {
        self.shared.pending.fetch_sub(1, Ordering::Release);
    }
}

fn find_task(ctx: &WorkerCtx) -> Option<usize> {
    if let Some(n) = ctx.queue.pop() {
        return Some(n);
    }
    loop {
        match ctx.shared.injector.steal_batch_and_pop(&ctx.queue) {
            Steal::Success(n) => return Some(n),
            Steal::Empty => break,
            Steal::Retry => {
                std::hint::spin_loop();
                continue;
            }
        }
    }
    for (i, stealer) in ctx.stealers.iter().enumerate() {
        if i == ctx.index {
            continue;
        }
        loop {
            match stealer.steal_batch_and_pop(&ctx.queue) {
                Steal::Success(n) => return Some(n),
                Steal::Empty => break,
                Steal::Retry => {
                    std::hint::spin_loop();
                    continue;
                }
            }
        }
    }
    None
}

fn worker_loop<K: Kind>() {
    let ctx = current();
    let mut backoff = Backoff::new();
    loop {
        match find_task(&ctx) {
            Some(n) => {
                unsafe {
                    // Lazy splitting: when the local queue has nothing left
                    // for thieves, peel half of a divisible node off before
                    // running it.
                    if ctx.queue.is_empty() && K::size(n) >= 2 {
                        K::split(n);
                    }
                    K::execute(n);
                }
                ctx.shared.pending.fetch_sub(1, Ordering::Release);
                backoff = Backoff::new();
            }
            None => {
                if ctx.shared.pending.load(Ordering::Acquire) == 0 {
                    break;
                }
                backoff.snooze();
            }
        }
    }
}

/// Runs a DAG to completion.
///
/// Spawns `nb_workers - 1` helper threads, turns the calling thread into
/// worker 0, runs `init` on it (which builds and schedules the root node)
/// and drains the pool until every scheduled run and retain guard is gone.
pub(crate) fn run<K: Kind>(cfg: Config, init: impl FnOnce()) {
    cfg.validate().expect("invalid engine configuration");
    let cfg = Arc::new(cfg);
    let shared = Arc::new(Shared::new());
    let nb_workers = cfg.nb_workers;

    let mut queues: Vec<Worker<usize>> = (0..nb_workers).map(|_| Worker::new_lifo()).collect();
    let stealers: Arc<Vec<Stealer<usize>>> =
        Arc::new(queues.iter().map(|q| q.stealer()).collect());

    log::debug!("launching pool with {} workers", nb_workers);

    let own_queue = queues.remove(0);
    install(WorkerCtx {
        shared: shared.clone(),
        cfg: cfg.clone(),
        queue: own_queue,
        stealers: stealers.clone(),
        index: 0,
        reuse: Cell::new(false),
        running: Cell::new(0),
    });
    // The root is scheduled before any helper starts, so no helper can see
    // an empty pool and leave early.
    init();

    let handles: Vec<_> = queues
        .into_iter()
        .enumerate()
        .map(|(i, queue)| {
            let shared = shared.clone();
            let cfg = cfg.clone();
            let stealers = stealers.clone();
            thread::Builder::new()
                .name(format!("trellis-worker-{}", i + 1))
                .spawn(move || {
                    install(WorkerCtx {
                        shared,
                        cfg,
                        queue,
                        stealers,
                        index: i + 1,
                        reuse: Cell::new(false),
                        running: Cell::new(0),
                    });
                    worker_loop::<K>();
                    clear();
                })
                .expect("failed to spawn worker thread")
        })
        .collect();

    worker_loop::<K>();
    clear();

    for h in handles {
        h.join().expect("worker thread panicked");
    }
    debug_assert_eq!(shared.pending.load(Ordering::Acquire), 0);
    log::debug!("pool drained");
}

//! Stress tests for the in-counter family
//!
//! These push the three implementations with balanced increment/decrement
//! traffic and check the conservation properties: the structure reports
//! activation exactly once, and only when the cumulative count is zero.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use trellis::{Activation, DyntreeIncounter, SnziTree};

const RUN_MS: u64 = 200;

#[test]
fn fetch_add_counter_balances() {
    const NUM_THREADS: usize = 8;

    let counter = Arc::new(AtomicI64::new(1));
    let stop = Arc::new(AtomicBool::new(false));
    let ops = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    let start = Instant::now();
    for _ in 0..NUM_THREADS {
        let counter = counter.clone();
        let stop = stop.clone();
        let ops = ops.clone();
        handles.push(thread::spawn(move || {
            let mut local = 0usize;
            while !stop.load(Ordering::Relaxed) {
                counter.fetch_add(1, Ordering::AcqRel);
                let old = counter.fetch_sub(1, Ordering::AcqRel);
                assert!(old >= 1);
                local += 2;
            }
            ops.fetch_add(local, Ordering::Relaxed);
        }));
    }

    thread::sleep(Duration::from_millis(RUN_MS));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    let total = ops.load(Ordering::Relaxed);
    assert!(total > 0);
    assert_eq!(counter.fetch_sub(1, Ordering::AcqRel), 1);

    println!("fetch-add counter:");
    println!("  {} operations in {:?}", total, elapsed);
    println!(
        "  Throughput: {:.0} ops/sec",
        total as f64 / elapsed.as_secs_f64()
    );
}

fn snzi_stress(branching: usize, levels: usize, num_threads: usize) {
    let tree = Arc::new(SnziTree::new(branching, levels));
    let stop = Arc::new(AtomicBool::new(false));
    let ops = Arc::new(AtomicUsize::new(0));
    let zero_reports = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    // Baseline surplus: no depart below may observe zero.
    tree.leaf_for(usize::MAX).arrive();

    let start = Instant::now();
    for tid in 0..num_threads {
        let tree = tree.clone();
        let stop = stop.clone();
        let ops = ops.clone();
        let zero_reports = zero_reports.clone();
        handles.push(thread::spawn(move || {
            let mut local = 0usize;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let key = tid.wrapping_mul(1 << 20).wrapping_add(i);
                tree.leaf_for(key).arrive();
                if tree.leaf_for(key).depart() {
                    zero_reports.fetch_add(1, Ordering::Relaxed);
                }
                local += 2;
                i += 1;
            }
            ops.fetch_add(local, Ordering::Relaxed);
        }));
    }

    thread::sleep(Duration::from_millis(RUN_MS));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    let total = ops.load(Ordering::Relaxed);
    assert!(total > 0);
    assert_eq!(zero_reports.load(Ordering::Relaxed), 0);
    assert!(tree.is_nonzero());
    assert!(tree.leaf_for(usize::MAX).depart());
    assert!(!tree.is_nonzero());

    println!("snzi({}, {}) with {} threads:", branching, levels, num_threads);
    println!("  {} operations in {:?}", total, elapsed);
    println!(
        "  Throughput: {:.0} ops/sec",
        total as f64 / elapsed.as_secs_f64()
    );
}

#[test]
fn snzi_binary_three_levels() {
    snzi_stress(2, 3, 8);
}

#[test]
fn snzi_wide_shallow() {
    snzi_stress(8, 2, 8);
}

#[test]
fn snzi_oversubscribed() {
    // More threads than cores: preempted half-transitions must not wedge
    // arrivals or leak a spurious zero report.
    let num_cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    snzi_stress(2, 4, num_cores * 4);
}

fn dyntree_stress(branching: usize, num_threads: usize) {
    let inc = Arc::new(DyntreeIncounter::new(branching));
    let stop = Arc::new(AtomicBool::new(false));
    let ops = Arc::new(AtomicUsize::new(0));
    let activations = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Barrier::new(num_threads));
    let mut handles = vec![];

    inc.increment();

    let start = Instant::now();
    for _ in 0..num_threads {
        let inc = inc.clone();
        let stop = stop.clone();
        let ops = ops.clone();
        let activations = activations.clone();
        let gate = gate.clone();
        handles.push(thread::spawn(move || {
            gate.wait();
            let mut local = 0usize;
            while !stop.load(Ordering::Relaxed) {
                inc.increment();
                if inc.decrement() == Activation::Activated {
                    activations.fetch_add(1, Ordering::Relaxed);
                }
                local += 2;
            }
            ops.fetch_add(local, Ordering::Relaxed);
        }));
    }

    thread::sleep(Duration::from_millis(RUN_MS));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    let total = ops.load(Ordering::Relaxed);
    assert!(total > 0);
    assert_eq!(activations.load(Ordering::Relaxed), 0);
    assert!(!inc.is_activated());
    assert_eq!(inc.decrement(), Activation::Activated);
    assert!(inc.is_activated());

    println!("dyntree({}) with {} threads:", branching, num_threads);
    println!("  {} operations in {:?}", total, elapsed);
    println!(
        "  Throughput: {:.0} ops/sec",
        total as f64 / elapsed.as_secs_f64()
    );
}

#[test]
fn dyntree_binary() {
    dyntree_stress(2, 8);
}

#[test]
fn dyntree_quad() {
    dyntree_stress(4, 8);
}

//! In-counter microbenchmarks: fetch-add word vs SNZI tree vs dyntree

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use trellis::{Activation, DyntreeIncounter, SnziTree};

const OPS_PER_THREAD: usize = 10_000;

fn run_simple(num_threads: usize) {
    let counter = Arc::new(AtomicI64::new(1));
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..OPS_PER_THREAD {
                    counter.fetch_add(1, Ordering::AcqRel);
                    counter.fetch_sub(1, Ordering::AcqRel);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.fetch_sub(1, Ordering::AcqRel), 1);
}

fn run_snzi(branching: usize, levels: usize, num_threads: usize) {
    let tree = Arc::new(SnziTree::new(branching, levels));
    tree.leaf_for(usize::MAX).arrive();
    let handles: Vec<_> = (0..num_threads)
        .map(|tid| {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let key = tid * OPS_PER_THREAD + i;
                    tree.leaf_for(key).arrive();
                    tree.leaf_for(key).depart();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(tree.leaf_for(usize::MAX).depart());
}

fn run_dyntree(branching: usize, num_threads: usize) {
    let inc = Arc::new(DyntreeIncounter::new(branching));
    inc.increment();
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let inc = inc.clone();
            thread::spawn(move || {
                for _ in 0..OPS_PER_THREAD {
                    inc.increment();
                    inc.decrement();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(inc.decrement(), Activation::Activated);
}

fn bench_incounter(c: &mut Criterion) {
    let mut group = c.benchmark_group("incounter");

    for threads in [1usize, 2, 4, 8].iter() {
        let total_ops = (2 * OPS_PER_THREAD * threads) as u64;
        group.throughput(Throughput::Elements(total_ops));

        group.bench_with_input(
            BenchmarkId::new("fetch_add", threads),
            threads,
            |b, &num_threads| b.iter(|| run_simple(num_threads)),
        );
        group.bench_with_input(
            BenchmarkId::new("snzi_2_3", threads),
            threads,
            |b, &num_threads| b.iter(|| run_snzi(2, 3, num_threads)),
        );
        group.bench_with_input(
            BenchmarkId::new("snzi_4_2", threads),
            threads,
            |b, &num_threads| b.iter(|| run_snzi(4, 2, num_threads)),
        );
        group.bench_with_input(
            BenchmarkId::new("dyntree_2", threads),
            threads,
            |b, &num_threads| b.iter(|| run_dyntree(2, num_threads)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_incounter);
criterion_main!(benches);

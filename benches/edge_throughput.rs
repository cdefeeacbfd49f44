//! Edge-wiring throughput: one future, many concurrent forces
//!
//! Builds a DAG per iteration in which a pool of readers all force the same
//! future, so insertions race the finish walk across every edge algorithm.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use trellis::{launch, Config, EdgeAlgorithm, FutureHandle, Node, NodeBody, NodeRef};

struct Producer {
    cell: Arc<AtomicU64>,
}

impl NodeBody for Producer {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            0 => self.cell.store(1, Ordering::Release),
            _ => unreachable!(),
        }
    }
}

struct Reader {
    f: FutureHandle,
    hits: Arc<AtomicUsize>,
}

impl NodeBody for Reader {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            0 => nd.force(self.f, 1),
            1 => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            _ => unreachable!(),
        }
    }
}

struct Spawner {
    f: FutureHandle,
    hits: Arc<AtomicUsize>,
    n: usize,
    spawned: usize,
    join: NodeRef,
}

impl NodeBody for Spawner {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            0 => {
                if self.spawned < self.n {
                    self.spawned += 1;
                    let reader = Node::new(Reader {
                        f: self.f,
                        hits: self.hits.clone(),
                    });
                    nd.spawn(reader, self.join, 1);
                }
            }
            1 => nd.jump_to(0),
            _ => unreachable!(),
        }
    }
}

struct Root {
    n: usize,
    f: Option<FutureHandle>,
    cell: Arc<AtomicU64>,
    hits: Arc<AtomicUsize>,
}

impl NodeBody for Root {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            0 => {
                let producer = Node::new(Producer {
                    cell: self.cell.clone(),
                });
                self.f = Some(nd.future(producer, 1));
            }
            1 => {
                let spawner = Node::new(Spawner {
                    f: self.f.unwrap(),
                    hits: self.hits.clone(),
                    n: self.n,
                    spawned: 0,
                    join: nd,
                });
                nd.finish(spawner, 2);
            }
            2 => {
                self.f.unwrap().deallocate();
                assert_eq!(self.hits.load(Ordering::Relaxed), self.n);
            }
            _ => unreachable!(),
        }
    }
}

fn run_fan_in(alg: EdgeAlgorithm, readers: usize) {
    let cell = Arc::new(AtomicU64::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    launch(
        Config::with_algorithm(alg),
        Root {
            n: readers,
            f: None,
            cell,
            hits,
        },
    );
}

fn bench_edge_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("edge_throughput");
    group.sample_size(20);

    for readers in [64usize, 512].iter() {
        group.throughput(Throughput::Elements(*readers as u64));

        group.bench_with_input(
            BenchmarkId::new("simple", readers),
            readers,
            |b, &readers| b.iter(|| run_fan_in(EdgeAlgorithm::Simple, readers)),
        );
        group.bench_with_input(
            BenchmarkId::new("distributed", readers),
            readers,
            |b, &readers| b.iter(|| run_fan_in(EdgeAlgorithm::Distributed, readers)),
        );
        group.bench_with_input(
            BenchmarkId::new("dyntree", readers),
            readers,
            |b, &readers| b.iter(|| run_fan_in(EdgeAlgorithm::Dyntree, readers)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_edge_throughput);
criterion_main!(benches);

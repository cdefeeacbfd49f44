//! Parallel-for over a large range
//!
//! Every index of `[0, n)` must be visited exactly once regardless of how
//! the lazy producer is split between workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use trellis::{launch, Config, EdgeAlgorithm, NodeBody, NodeRef};

struct FillTest {
    n: i64,
    array: Arc<Vec<AtomicU64>>,
}

const ENTRY: i32 = 0;
const EXIT: i32 = 1;

impl NodeBody for FillTest {
    fn run(&mut self, nd: NodeRef) {
        match nd.block() {
            ENTRY => {
                let array = self.array.clone();
                // Store i + 1 so an unvisited slot stays observably zero.
                nd.parallel_for(
                    0,
                    self.n,
                    move |i| array[i as usize].store(i as u64 + 1, Ordering::Relaxed),
                    EXIT,
                );
            }
            EXIT => {
                for i in 0..self.n {
                    assert_eq!(
                        self.array[i as usize].load(Ordering::Relaxed),
                        i as u64 + 1,
                        "index {} missed or corrupted",
                        i
                    );
                }
            }
            _ => unreachable!(),
        }
    }
}

fn run_fill(alg: EdgeAlgorithm, n: i64) {
    let array = Arc::new((0..n).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
    launch(
        Config::with_algorithm(alg),
        FillTest {
            n,
            array: array.clone(),
        },
    );
    for i in 0..n {
        assert_eq!(array[i as usize].load(Ordering::Relaxed), i as u64 + 1);
    }
}

#[test]
fn fill_one_million_simple() {
    run_fill(EdgeAlgorithm::Simple, 1_000_000);
}

#[test]
fn fill_one_million_distributed() {
    run_fill(EdgeAlgorithm::Distributed, 1_000_000);
}

#[test]
fn fill_one_million_dyntree() {
    run_fill(EdgeAlgorithm::Dyntree, 1_000_000);
}

#[test]
fn fill_below_one_block() {
    run_fill(EdgeAlgorithm::Dyntree, 5);
}

#[test]
fn empty_range_completes() {
    run_fill(EdgeAlgorithm::Dyntree, 0);
}

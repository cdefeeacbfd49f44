//! Trellis: scalable dependency edges for dynamic task DAGs
//!
//! Trellis maintains the dependency edges of a task DAG that is built while
//! it runs on a work-stealing pool. Behind every node sit two concurrent
//! structures: an in-counter tracking unresolved incoming edges, and an
//! out-set recording outgoing edges so that finishing the source notifies
//! each successor exactly once. Both are non-blocking and scalable; three
//! interchangeable families live behind one tagged-word interface:
//!
//! - **simple**: a fetch-add counter word and a Treiber-stack out-set;
//! - **distributed**: an SNZI-tree in-counter whose unary edges depart a
//!   leaf directly;
//! - **dyntree**: randomised k-ary trees for both structures, dismantled by
//!   parallel DAG tasks rather than on the hot path.
//!
//! Graphs are written as state-machine bodies over labelled blocks, wired by
//! the combinators on [`NodeRef`]: `spawn`, `finish`, `future`/`force`,
//! `parallel_for`, `call`, `detach`. The [`portpassing`] module carries an
//! alternative bottom-up discipline in which forked tasks inherit ports into
//! their predecessors' structures, so enabling needs no global lookup.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis::{launch, Config, NodeBody, NodeRef};
//!
//! struct Fill;
//!
//! impl NodeBody for Fill {
//!     fn run(&mut self, nd: NodeRef) {
//!         match nd.block() {
//!             0 => nd.parallel_for(0, 1_000, |i| work(i), 1),
//!             1 => println!("done"),
//!             _ => unreachable!(),
//!         }
//!     }
//! }
//!
//! launch(Config::default(), Fill);
//! ```

pub mod config;
pub mod dyntree;
mod node;
mod pool;
pub mod portpassing;
mod rng;
pub mod snzi;
mod strategy;
pub mod tagged;

pub use config::{Config, ConfigError, EdgeAlgorithm};
pub use dyntree::{DyntreeIncounter, DyntreeOutset};
pub use node::{launch, retain, Node, NodeBody, NodeRef};
pub use pool::Retain;
pub use snzi::SnziTree;
pub use strategy::{add_edge, add_node, prepare_node, Activation, FutureHandle, SimpleOutset};

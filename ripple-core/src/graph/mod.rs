//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between state nodes and computed nodes, and the scheduler that settles
//! them after writes.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are either state (written directly) or computed (derived from
//!   declared inputs by a recompute function)
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! When a state node changes, every node downstream of it is marked dirty.
//! The scheduler then settles the dirty nodes in topological order, consulting
//! the memo cache to skip recomputation whose inputs did not change.
//!
//! # Design Decisions
//!
//! 1. The graph is a centralized arena rather than per-node linked lists:
//!    - Topological ordering of a whole batch is a single pass
//!    - Cycle detection is a reachability query before an edge is inserted
//!
//! 2. Node ids grow with creation order, which doubles as the tie-break
//!    between nodes with no ordering constraint.
//!
//! 3. Both forward (inputs) and reverse (dependents) edges are kept so the
//!    graph can be walked in either direction.

mod dag;
mod node;
mod scheduler;

pub(crate) use dag::Graph;
pub(crate) use node::ComputeFn;
pub use node::{Equality, NodeId, NodeKind, NodeOptions, NodeStatus};
pub(crate) use scheduler::Scheduler;
pub use scheduler::Phase;
pub(crate) use scheduler::{flush, pull};

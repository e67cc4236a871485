//! Ripple Core
//!
//! This crate provides a synchronous reactive recomputation engine: the part
//! of a UI runtime that decides which derived values to recompute after state
//! changes, and in what order.
//! It implements:
//!
//! - State and computed nodes in an acyclic dependency graph
//! - Batched writes settled by a single topological flush
//! - Memoization that skips recomputation when inputs are unchanged
//! - Subscriptions notified once per flush with settled values
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Nodes, dependency edges, and the update scheduler
//! - `reactive`: The `Store` facade, memo cache, and subscriptions
//! - `config`: Store configuration
//! - `error`: The error taxonomy
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ripple_core::{NodeOptions, Store};
//!
//! let store: Store<i64> = Store::new();
//!
//! // Create state
//! let count = store.create_state_with(1, NodeOptions::new().by_value());
//!
//! // Create a derived value
//! let doubled = store.create_computed(&[count], |inputs| *inputs[0] * 2).unwrap();
//!
//! // Observe it
//! let _sub = store
//!     .subscribe(doubled, |value: &Arc<i64>| println!("doubled: {value}"))
//!     .unwrap();
//!
//! // Update the state; the subscriber prints "doubled: 10"
//! store.write(count, 5).unwrap();
//! assert_eq!(*store.read(doubled).unwrap(), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::StoreConfig;
pub use error::{BoxError, ReactiveError, RecomputeFailure, RecomputePanic, Result};
pub use graph::{Equality, NodeId, NodeKind, NodeOptions, NodeStatus, Phase};
pub use reactive::{MemoStats, Store, Subscription, SubscriptionId, WeakStore};

//! Reactive Facade
//!
//! This module implements the public surface of the engine: the [`Store`],
//! its memo cache, and subscriptions.
//!
//! # Concepts
//!
//! ## State nodes
//!
//! A state node is a container for a value that changes only when it is
//! written. Writing an equal value (by the node's equality mode) is a no-op.
//!
//! ## Computed nodes
//!
//! A computed node derives its value from declared inputs. It is recomputed
//! when an input changed, and skipped when the memo cache shows its inputs are
//! the same as last time.
//!
//! ## Subscriptions
//!
//! A subscription runs a callback after a flush in which its node's value
//! changed. Callbacks only ever see settled values.
//!
//! # Implementation Notes
//!
//! Inputs are declared when a node is registered rather than discovered by
//! tracking reads. Declared edges make cycle detection an insertion-time check
//! and give the recompute function its inputs as plain values.

pub(crate) mod context;
pub(crate) mod memo;
pub(crate) mod store;
mod subscription;

pub use memo::MemoStats;
pub use store::{Store, WeakStore};
pub use subscription::{Subscription, SubscriptionId};

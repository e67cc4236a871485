//! Error types for the reactive engine.
//!
//! Every fallible operation on a [`Store`](crate::Store) returns a
//! [`ReactiveError`]. Failures inside user recompute functions are captured as
//! a [`RecomputeFailure`] and stored on the node, so that every later read of
//! that node (or of anything downstream of it) reports the same cause.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::NodeId;

/// Boxed error returned by fallible recompute functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Errors reported by the reactive engine.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// Adding the edge `input -> dependent` would close a cycle.
    #[error("edge {input} -> {dependent} would create a cycle")]
    Cycle { input: NodeId, dependent: NodeId },

    /// `write` was called on a computed node.
    #[error("node {0} is not a state node and cannot be written")]
    NotStateNode(NodeId),

    /// An input was added to or removed from a state node.
    #[error("node {0} is not a computed node and has no inputs")]
    NotComputedNode(NodeId),

    /// The node has been disposed.
    #[error("node {0} has been disposed")]
    Disposed(NodeId),

    /// The id was never issued by this store.
    #[error("node {0} does not belong to this store")]
    UnknownNode(NodeId),

    /// The node is being recomputed and was targeted from its own recompute path.
    #[error("node {0} is currently being recomputed")]
    ReentrantWrite(NodeId),

    /// The node (or one of its ancestors) failed to recompute.
    #[error("node {node} is errored: {failure}")]
    Recompute {
        node: NodeId,
        #[source]
        failure: RecomputeFailure,
    },

    /// The node has not produced a value yet and could not be settled.
    #[error("node {0} has no settled value")]
    Unsettled(NodeId),

    /// Writes made during a flush kept re-dirtying settled nodes.
    #[error("flush did not settle after {passes} passes")]
    FlushLimitExceeded { passes: usize },

    /// The store configuration could not be parsed.
    #[error("invalid store configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// A captured failure of a recompute function.
///
/// Cloning is cheap; the cause is shared. The failure remembers the node whose
/// function actually failed, which differs from the node being read when the
/// failure was propagated to a dependent.
#[derive(Clone, Error)]
#[error("recompute function of {origin} failed: {cause}")]
pub struct RecomputeFailure {
    origin: NodeId,
    #[source]
    cause: Arc<dyn StdError + Send + Sync + 'static>,
}

impl RecomputeFailure {
    pub(crate) fn new(origin: NodeId, cause: BoxError) -> Self {
        Self {
            origin,
            cause: Arc::from(cause),
        }
    }

    pub(crate) fn from_panic(origin: NodeId, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(origin, Box::new(RecomputePanic(message)))
    }

    /// The node whose recompute function failed.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// The error returned (or panic raised) by the recompute function.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }
}

impl fmt::Debug for RecomputeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomputeFailure")
            .field("origin", &self.origin)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

/// A panic caught while running a recompute function.
#[derive(Debug, Error)]
#[error("recompute function panicked: {0}")]
pub struct RecomputePanic(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_keeps_origin_and_cause() {
        let failure = RecomputeFailure::new(NodeId::from(7), "boom".into());
        assert_eq!(failure.origin(), NodeId::from(7));
        assert_eq!(failure.cause().to_string(), "boom");
        assert!(failure.to_string().contains("boom"));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let failure = RecomputeFailure::from_panic(NodeId::from(1), Box::new("bad input"));
        assert_eq!(
            failure.cause().to_string(),
            "recompute function panicked: bad input"
        );

        let failure = RecomputeFailure::from_panic(NodeId::from(1), Box::new(String::from("owned")));
        assert!(failure.cause().to_string().ends_with("owned"));
    }

    #[test]
    fn recompute_error_exposes_source() {
        let err = ReactiveError::Recompute {
            node: NodeId::from(3),
            failure: RecomputeFailure::new(NodeId::from(2), "bad".into()),
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("recompute function of #2 failed: bad"));
    }
}

//! Recompute Context
//!
//! The recompute context tracks which nodes are currently running their
//! recompute function. This lets the store reject operations that would
//! recurse into a node from its own recompute path.
//!
//! # Implementation
//!
//! Each store keeps its own stack. When the scheduler invokes a recompute
//! function it pushes a frame; the frame is popped when the returned guard is
//! dropped, so the stack stays balanced even if the function panics.
//!
//! Frames nest: a recompute function that reads another dirty node pulls it,
//! which pushes a second frame on top of the first.

use std::cell::RefCell;

use tracing::trace;

use crate::graph::NodeId;
use crate::reactive::store::Core;

/// Stack of nodes whose recompute function is running.
#[derive(Debug, Default)]
pub(crate) struct RecomputeStack {
    frames: Vec<NodeId>,
}

impl RecomputeStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node_id: NodeId) {
        self.frames.push(node_id);
    }

    fn pop(&mut self) -> Option<NodeId> {
        self.frames.pop()
    }

    /// Whether `node_id` is anywhere on the stack.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.frames.contains(&node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.frames.iter().copied()
    }

    /// The innermost running node, if any.
    #[cfg(test)]
    pub fn current(&self) -> Option<NodeId> {
        self.frames.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Guard that pops its frame when dropped.
pub(crate) struct RecomputeFrame<'a, V> {
    core: &'a RefCell<Core<V>>,
    node_id: NodeId,
}

impl<'a, V> RecomputeFrame<'a, V> {
    /// Push `node_id` onto the store's stack.
    ///
    /// The caller must not hold a borrow of `core`.
    pub fn enter(core: &'a RefCell<Core<V>>, node_id: NodeId) -> Self {
        let mut state = core.borrow_mut();
        state.stack.push(node_id);
        trace!(node = %node_id, depth = state.stack.depth(), "recompute started");
        drop(state);
        Self { core, node_id }
    }
}

impl<V> Drop for RecomputeFrame<'_, V> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            // An unwinding recompute leaves its node for the next flush
            if std::thread::panicking() {
                if let Some(node) = core.graph.get_mut(self.node_id) {
                    node.mark_dirty();
                }
            }

            let popped = core.stack.pop();

            // Frames are strictly nested
            debug_assert_eq!(
                popped,
                Some(self.node_id),
                "RecomputeFrame mismatch: expected {:?}, got {:?}",
                self.node_id,
                popped
            );
        }
    }
}

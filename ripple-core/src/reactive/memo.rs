//! Memo Cache
//!
//! The memo cache remembers, per computed node, the input values used in its
//! last successful recompute and the value that recompute produced.
//!
//! # How Memoization Works
//!
//! 1. A write marks everything downstream of a state node dirty.
//!
//! 2. Before invoking a dirty node's recompute function, the scheduler asks
//!    the cache whether the node's current inputs differ from the recorded
//!    ones.
//!
//! 3. If nothing differs, the node is marked clean and keeps its value; the
//!    recompute function is not called.
//!
//! 4. Otherwise the function runs and its result is recorded.
//!
//! Each input is compared with the equality mode of the node it comes from.
//! Because a recompute that produces an equal value keeps the previous
//! allocation, a chain of `Reference` nodes still cuts off as soon as one
//! node's output stops changing.
//!
//! The cache is pure bookkeeping. It never triggers a recompute itself.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::graph::{Equality, NodeId};

/// Input values recorded for one recompute.
pub(crate) type InputValues<V> = SmallVec<[Arc<V>; 4]>;

/// What a node last computed, and from what.
#[derive(Debug)]
pub(crate) struct MemoEntry<V> {
    /// Input values in declaration order.
    inputs: InputValues<V>,

    /// The value produced from them.
    value: Arc<V>,
}

#[cfg(test)]
impl<V> MemoEntry<V> {
    pub fn inputs(&self) -> &[Arc<V>] {
        &self.inputs
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }
}

/// Counters describing how often the cache saved a recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoStats {
    /// Dirty nodes whose recompute was skipped.
    pub hits: u64,

    /// Dirty nodes whose recompute function ran.
    pub misses: u64,
}

/// Per-node cache of the last recompute.
pub(crate) struct MemoCache<V> {
    entries: HashMap<NodeId, MemoEntry<V>>,
    stats: MemoStats,
}

impl<V: PartialEq> MemoCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stats: MemoStats::default(),
        }
    }

    /// Whether `node_id` must run its recompute function for `current`.
    ///
    /// `current` pairs each input value with the equality mode of the node it
    /// came from. Returns true when no entry exists, the input count changed,
    /// or any input differs.
    pub fn should_recompute(&mut self, node_id: NodeId, current: &[(Arc<V>, Equality)]) -> bool {
        let changed = match self.entries.get(&node_id) {
            None => true,
            Some(entry) => {
                entry.inputs.len() != current.len()
                    || entry
                        .inputs
                        .iter()
                        .zip(current)
                        .any(|(recorded, (value, equality))| !equality.equals(recorded, value))
            }
        };

        if changed {
            self.stats.misses += 1;
        } else {
            self.stats.hits += 1;
        }
        changed
    }

    /// Overwrite the entry for `node_id`.
    pub fn record(&mut self, node_id: NodeId, inputs: InputValues<V>, value: Arc<V>) {
        self.entries.insert(node_id, MemoEntry { inputs, value });
    }

    /// Drop the entry for `node_id`.
    pub fn forget(&mut self, node_id: NodeId) {
        self.entries.remove(&node_id);
    }

    #[cfg(test)]
    pub fn get(&self, node_id: NodeId) -> Option<&MemoEntry<V>> {
        self.entries.get(&node_id)
    }

    pub fn stats(&self) -> MemoStats {
        self.stats
    }
}

impl<V: PartialEq> Default for MemoCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

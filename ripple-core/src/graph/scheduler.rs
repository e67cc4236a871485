//! Update Scheduler
//!
//! The scheduler decides when and in which order dirty nodes are settled.
//! It ensures that inputs are always settled before their dependents.
//!
//! # Phases
//!
//! `Idle -> Batching -> Flushing -> Idle`. Writes made while batching only
//! collect dirty nodes; the outermost batch hands them to a flush. A write
//! outside any batch is an implicit one-write batch.
//!
//! # Algorithm
//!
//! 1. A write marks every node downstream of the state node dirty and adds it
//!    to the pending set, remembering each node's value at that moment (its
//!    baseline)
//! 2. A flush pass orders the pending nodes topologically, inputs first, with
//!    ascending creation order as the tie-break
//! 3. Each node is settled in order:
//!    - If an input is errored, the node becomes errored without running
//!    - If the memo cache says the inputs are unchanged, the node is marked
//!      clean and keeps its value
//!    - Otherwise its recompute function runs
//! 4. Writes made by recompute functions are merged into the running pass.
//!    A node already settled in this pass is carried into the next one
//! 5. Once nothing is pending, subscribers of nodes whose value differs from
//!    their baseline are notified. Writes made by subscribers flush at once,
//!    but their notifications join the running notification loop
//!
//! Reads of a dirty node outside a flush settle just its dirty ancestors
//! (a lazy pull), using the same ordering.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::dag::Graph;
use super::node::{Equality, NodeId, NodeKind, NodeStatus};
use crate::error::{ReactiveError, RecomputeFailure, Result};
use crate::reactive::context::RecomputeFrame;
use crate::reactive::memo::InputValues;
use crate::reactive::store::Core;
use crate::reactive::SubscriptionId;

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No batch is open and no flush is running.
    Idle,

    /// Writes are being collected.
    Batching,

    /// Dirty nodes are being settled.
    Flushing,
}

/// Batch bookkeeping for one store.
pub(crate) struct Scheduler<V> {
    phase: Phase,

    /// Open `batch` scopes, including ones opened during a flush.
    depth: usize,

    /// Dirty computed nodes waiting for a flush.
    pending: BTreeSet<NodeId>,

    /// Value of each invalidated node when it was first invalidated in this
    /// batch, in invalidation order.
    baselines: IndexMap<NodeId, Option<Arc<V>>>,

    /// Bumped on every invalidation so a running pass can notice merges.
    generation: u64,

    /// Subscribers are being called. Flushes started from a callback leave
    /// their baselines for the running notification loop.
    notifying: bool,
}

impl<V> Scheduler<V> {
    /// Create a new idle scheduler.
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            depth: 0,
            pending: BTreeSet::new(),
            baselines: IndexMap::new(),
            generation: 0,
            notifying: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_batching(&self) -> bool {
        self.depth > 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Open a batch scope. Inside a flush the scope joins the flush.
    pub fn enter_batch(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Batching;
        }
        self.depth += 1;
    }

    /// Close a batch scope. Returns true when the outermost batch closed and
    /// the caller should flush.
    pub fn exit_batch(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 && self.phase == Phase::Batching {
            self.phase = Phase::Idle;
            return true;
        }
        false
    }

    /// Move to `Flushing`. Returns false if not idle.
    pub fn begin_flush(&mut self) -> bool {
        if self.phase != Phase::Idle {
            return false;
        }
        self.phase = Phase::Flushing;
        true
    }

    pub fn end_flush(&mut self) {
        self.phase = Phase::Idle;
        self.depth = 0;
    }

    /// Start calling subscribers. Returns false if that is already happening.
    pub fn begin_notify(&mut self) -> bool {
        !std::mem::replace(&mut self.notifying, true)
    }

    pub fn end_notify(&mut self) {
        self.notifying = false;
    }

    /// Remember `value` as the baseline of `node_id` unless one exists.
    pub fn record_baseline(&mut self, node_id: NodeId, value: Option<Arc<V>>) {
        self.baselines.entry(node_id).or_insert(value);
    }

    /// Mark everything downstream of `root` dirty and queue it.
    ///
    /// Returns the number of nodes that were clean (or errored) before.
    pub fn invalidate(&mut self, graph: &mut Graph<V>, root: NodeId, include_root: bool) -> usize {
        let mut dirtied = 0;
        for node_id in graph.downstream(root, include_root) {
            let Some(node) = graph.get_mut(node_id) else {
                continue;
            };
            if node.kind() != NodeKind::Computed || node.status().is_disposed() {
                continue;
            }
            self.baselines
                .entry(node_id)
                .or_insert_with(|| node.value().cloned());
            if node.mark_dirty() {
                dirtied += 1;
            }
            self.pending.insert(node_id);
        }
        self.generation += 1;
        dirtied
    }

    pub fn take_pending(&mut self) -> BTreeSet<NodeId> {
        std::mem::take(&mut self.pending)
    }

    pub fn requeue(&mut self, nodes: impl IntoIterator<Item = NodeId>) {
        self.pending.extend(nodes);
    }

    pub fn take_baselines(&mut self) -> IndexMap<NodeId, Option<Arc<V>>> {
        std::mem::take(&mut self.baselines)
    }

    /// Take a node out of the pending set, keeping its baseline.
    pub fn forget_pending(&mut self, node_id: NodeId) {
        self.pending.remove(&node_id);
    }

    /// Drop all batch state about a disposed node.
    pub fn forget(&mut self, node_id: NodeId) {
        self.pending.remove(&node_id);
        self.baselines.shift_remove(&node_id);
    }
}

impl<V> Default for Scheduler<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the scheduler to `Idle` when a flush ends, even by unwinding.
struct FlushGuard<'a, V> {
    core: &'a RefCell<Core<V>>,
}

impl<V> Drop for FlushGuard<'_, V> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.scheduler.end_flush();
        }
    }
}

/// Clears the notifying flag, even if a callback unwinds.
struct NotifyGuard<'a, V> {
    core: &'a RefCell<Core<V>>,
}

impl<V> Drop for NotifyGuard<'_, V> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.scheduler.end_notify();
        }
    }
}

/// Settle every pending node, then notify subscribers.
///
/// Does nothing unless the scheduler is idle: a flush requested while
/// batching or flushing is picked up by the running one.
pub(crate) fn flush<V>(core: &RefCell<Core<V>>) -> Result<()>
where
    V: PartialEq + Send + Sync + 'static,
{
    let max_passes = {
        let mut state = core.borrow_mut();
        if !state.scheduler.begin_flush() {
            return Ok(());
        }
        state.config.max_flush_passes
    };
    let guard = FlushGuard { core };

    let mut passes = 0;
    loop {
        let roots = core.borrow_mut().scheduler.take_pending();
        if roots.is_empty() {
            break;
        }
        if passes == max_passes {
            core.borrow_mut().scheduler.requeue(roots);
            warn!(passes, "flush aborted after reaching the pass limit");
            return Err(ReactiveError::FlushLimitExceeded { passes });
        }
        passes += 1;
        debug!(pass = passes, pending = roots.len(), "flush pass started");
        run_pass(core, roots);
    }

    drop(guard);
    debug!(passes, "flush finished");
    notify(core)
}

/// One topological pass over `roots` plus whatever gets merged into it.
fn run_pass<V>(core: &RefCell<Core<V>>, roots: BTreeSet<NodeId>)
where
    V: PartialEq + Send + Sync + 'static,
{
    let mut pool = roots;
    let mut settled: HashSet<NodeId> = HashSet::new();
    let mut deferred: BTreeSet<NodeId> = BTreeSet::new();
    let mut order: VecDeque<NodeId> = VecDeque::new();
    let mut seen_generation = None;

    loop {
        {
            let mut state = core.borrow_mut();
            let generation = state.scheduler.generation();
            if seen_generation != Some(generation) {
                for node_id in state.scheduler.take_pending() {
                    if settled.contains(&node_id) {
                        deferred.insert(node_id);
                    } else {
                        pool.insert(node_id);
                    }
                }
                order = state.graph.schedule(pool.iter().copied(), &settled).into();
                seen_generation = Some(generation);
            }
        }

        let Some(node_id) = order.pop_front() else {
            break;
        };
        settle(core, node_id);
        settled.insert(node_id);
        pool.remove(&node_id);
    }

    // Blocked or re-dirtied nodes wait for the next pass
    let mut state = core.borrow_mut();
    let leftovers: Vec<NodeId> = pool
        .into_iter()
        .chain(deferred)
        .filter(|node_id| state.graph.is_dirty(*node_id))
        .collect();
    if !leftovers.is_empty() {
        trace!(count = leftovers.len(), "nodes carried to the next pass");
    }
    state.scheduler.requeue(leftovers);
}

/// Settle the dirty ancestors of `node_id`, then the node itself.
pub(crate) fn pull<V>(core: &RefCell<Core<V>>, node_id: NodeId) -> Result<()>
where
    V: PartialEq + Send + Sync + 'static,
{
    let max_passes = core.borrow().config.max_flush_passes;
    for _ in 0..max_passes {
        let order = core.borrow().graph.schedule([node_id], &HashSet::new());
        if order.is_empty() {
            return Ok(());
        }
        trace!(node = %node_id, count = order.len(), "pulling dirty ancestors");
        for id in order {
            settle(core, id);
        }
    }

    if core.borrow().graph.is_dirty(node_id) {
        return Err(ReactiveError::FlushLimitExceeded { passes: max_passes });
    }
    Ok(())
}

/// Bring one dirty node up to date.
///
/// No borrow of `core` is held while the recompute function runs, so the
/// function may use the store freely.
fn settle<V>(core: &RefCell<Core<V>>, node_id: NodeId)
where
    V: PartialEq + Send + Sync + 'static,
{
    let (compute, inputs, catch_panics) = {
        let mut state = core.borrow_mut();
        let state = &mut *state;
        if state.stack.contains(node_id) {
            return;
        }
        let Some(node) = state.graph.get(node_id) else {
            return;
        };
        if !node.status().is_dirty() {
            return;
        }
        let Some(compute) = node.compute() else {
            if let Some(node) = state.graph.get_mut(node_id) {
                node.mark_clean();
            }
            return;
        };

        let mut current: SmallVec<[(Arc<V>, Equality); 4]> = SmallVec::new();
        let mut upstream_failure = None;
        for &input in node.inputs() {
            let Some(input_node) = state.graph.get(input) else {
                return;
            };
            match (input_node.status(), input_node.value()) {
                (NodeStatus::Errored(failure), _) => {
                    upstream_failure = Some(failure.clone());
                    break;
                }
                (NodeStatus::Clean, Some(value)) => {
                    current.push((value.clone(), input_node.equality()));
                }
                // An unsettled input; leave the node dirty
                _ => return,
            }
        }

        if let Some(failure) = upstream_failure {
            trace!(node = %node_id, origin = %failure.origin(), "propagating upstream failure");
            if let Some(node) = state.graph.get_mut(node_id) {
                node.mark_errored(failure);
            }
            return;
        }

        if !state.memo.should_recompute(node_id, &current) {
            trace!(node = %node_id, "inputs unchanged, keeping memoized value");
            if let Some(node) = state.graph.get_mut(node_id) {
                node.mark_clean();
            }
            return;
        }

        // Provisionally clean; a write from inside the function re-dirties it
        if let Some(node) = state.graph.get_mut(node_id) {
            node.mark_clean();
        }
        let inputs: InputValues<V> = current.into_iter().map(|(value, _)| value).collect();
        (compute, inputs, state.config.catch_panics)
    };

    let outcome = {
        let _frame = RecomputeFrame::enter(core, node_id);
        if catch_panics {
            match panic::catch_unwind(AssertUnwindSafe(|| compute(inputs.as_slice()))) {
                Ok(result) => result.map_err(|err| RecomputeFailure::new(node_id, err)),
                Err(payload) => Err(RecomputeFailure::from_panic(node_id, payload)),
            }
        } else {
            compute(inputs.as_slice()).map_err(|err| RecomputeFailure::new(node_id, err))
        }
    };

    let mut state = core.borrow_mut();
    let state = &mut *state;
    let Some(node) = state.graph.get_mut(node_id) else {
        return;
    };
    if node.status().is_disposed() {
        return;
    }
    let redirtied = node.status().is_dirty();

    match outcome {
        Ok(value) => {
            let value = Arc::new(value);
            // Keep the old allocation for an equal result so downstream
            // reference comparisons see no change
            let value = match node.value() {
                Some(previous) if node.equality().equals(previous, &value) => previous.clone(),
                _ => value,
            };
            node.set_value(value.clone());
            if !redirtied {
                node.mark_clean();
            }
            trace!(node = %node_id, label = node.label().unwrap_or_default(), "recomputed");
            state.memo.record(node_id, inputs, value);
        }
        Err(failure) => {
            warn!(node = %node_id, error = %failure, "recompute function failed");
            if !redirtied {
                node.mark_errored(failure);
            }
        }
    }
}

/// Nodes with subscribers whose value differs from their baseline.
fn changed_nodes<V: PartialEq>(core: &mut Core<V>) -> Vec<NodeId> {
    let baselines = core.scheduler.take_baselines();
    let mut changed = Vec::new();
    for (node_id, before) in baselines {
        if !core.subscriptions.has(node_id) {
            continue;
        }
        let Some(node) = core.graph.get(node_id) else {
            continue;
        };
        if !node.status().is_clean() {
            continue;
        }
        let Some(after) = node.value() else {
            continue;
        };
        let differs = match &before {
            Some(before) => !node.equality().equals(before, after),
            None => true,
        };
        if differs {
            changed.push(node_id);
        }
    }
    changed
}

/// Invoke subscribers whose node changed since its baseline.
///
/// Callbacks may write to the store. The flush such a write starts leaves its
/// baselines here, and they are handled in a further round. Every callback
/// gets its node's value at the moment it is called and is skipped when that
/// value is the one it was last given, so no callback ever receives a value
/// older than one it has already seen.
fn notify<V>(core: &RefCell<Core<V>>) -> Result<()>
where
    V: PartialEq + Send + Sync + 'static,
{
    let max_rounds = {
        let mut state = core.borrow_mut();
        if !state.scheduler.begin_notify() {
            return Ok(());
        }
        state.config.max_flush_passes
    };
    let _guard = NotifyGuard { core };

    let mut delivered: HashMap<SubscriptionId, Arc<V>> = HashMap::new();
    let mut rounds = 0;
    loop {
        let changed = changed_nodes(&mut core.borrow_mut());
        if changed.is_empty() {
            break;
        }
        if rounds == max_rounds {
            warn!(rounds, "subscriber writes did not settle");
            return Err(ReactiveError::FlushLimitExceeded { passes: rounds });
        }
        rounds += 1;
        debug!(round = rounds, nodes = changed.len(), "notifying subscribers");

        for node_id in changed {
            let ids = core.borrow().subscriptions.ids(node_id);
            for id in ids {
                let call = {
                    let state = core.borrow();
                    let Some(callback) = state.subscriptions.get(node_id, id) else {
                        continue;
                    };
                    let Some(node) = state.graph.get(node_id) else {
                        continue;
                    };
                    if !node.status().is_clean() {
                        continue;
                    }
                    let Some(value) = node.value() else {
                        continue;
                    };
                    if let Some(last) = delivered.get(&id) {
                        if node.equality().equals(last, value) {
                            continue;
                        }
                    }
                    (callback, value.clone())
                };

                let (callback, value) = call;
                delivered.insert(id, value.clone());
                callback(&value);
            }
        }
    }
    Ok(())
}

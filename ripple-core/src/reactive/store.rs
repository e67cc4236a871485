//! Reactive Store
//!
//! The store is the public facade that ties the graph, the scheduler, the
//! memo cache, and subscriptions together.
//!
//! # How It Works
//!
//! 1. `create_state` and `create_computed` register nodes in the graph.
//!
//! 2. `write` stores a new value and marks everything downstream dirty.
//!    Outside a batch the write flushes before returning; inside one the
//!    dirty nodes wait for the outermost batch to end.
//!
//! 3. A flush settles dirty nodes in topological order and then calls the
//!    subscribers of nodes whose value changed.
//!
//! 4. `read` of a dirty node settles just what that node needs.
//!
//! # Thread Safety
//!
//! A store is `Send + Sync`. Its state sits behind a reentrant mutex, so one
//! thread at a time drives it, and that thread may call back into the store
//! from recompute functions and subscriber callbacks. No interior borrow is
//! held while user code runs.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

use super::context::RecomputeStack;
use super::memo::{MemoCache, MemoStats};
use super::subscription::{Subscription, Subscriptions};
use crate::config::StoreConfig;
use crate::error::{BoxError, ReactiveError, RecomputeFailure, Result};
use crate::graph::{
    self, ComputeFn, Graph, NodeId, NodeKind, NodeOptions, NodeStatus, Phase, Scheduler,
};

/// Everything a store owns.
pub(crate) struct Core<V> {
    pub(crate) graph: Graph<V>,
    pub(crate) scheduler: Scheduler<V>,
    pub(crate) memo: MemoCache<V>,
    pub(crate) subscriptions: Subscriptions<V>,
    pub(crate) stack: RecomputeStack,
    pub(crate) config: StoreConfig,
}

impl<V: PartialEq> Core<V> {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            graph: Graph::new(),
            scheduler: Scheduler::new(),
            memo: MemoCache::new(),
            subscriptions: Subscriptions::new(),
            stack: RecomputeStack::new(),
            config,
        }
    }
}

pub(crate) type Shared<V> = ReentrantMutex<RefCell<Core<V>>>;

/// Closes a batch scope if the batch body unwinds.
struct BatchScope<'a, V> {
    core: &'a RefCell<Core<V>>,
    armed: bool,
}

impl<V> Drop for BatchScope<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut core) = self.core.try_borrow_mut() {
                core.scheduler.exit_batch();
            }
        }
    }
}

/// Run `f` inside a batch scope and flush if it was the outermost one.
fn batched<V, R>(core: &RefCell<Core<V>>, f: impl FnOnce() -> R) -> Result<R>
where
    V: PartialEq + Send + Sync + 'static,
{
    core.borrow_mut().scheduler.enter_batch();
    let mut scope = BatchScope { core, armed: true };
    let output = f();
    scope.armed = false;

    let outermost = core.borrow_mut().scheduler.exit_batch();
    if outermost {
        graph::flush(core)?;
    }
    Ok(output)
}

/// A reactive store: an independent graph of state and computed nodes.
///
/// Cloning a store yields another handle to the same graph.
///
/// # Example
///
/// ```rust
/// use ripple_core::Store;
///
/// let store = Store::new();
/// let count = store.create_state(1);
/// let doubled = store.create_computed(&[count], |inputs| *inputs[0] * 2).unwrap();
///
/// assert_eq!(*store.read(doubled).unwrap(), 2);
/// store.write(count, 5).unwrap();
/// assert_eq!(*store.read(doubled).unwrap(), 10);
/// ```
pub struct Store<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Store<V>
where
    V: PartialEq + Send + Sync + 'static,
{
    /// Create a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(mut config: StoreConfig) -> Self {
        config.max_flush_passes = config.max_flush_passes.max(1);
        Self {
            shared: Arc::new(ReentrantMutex::new(RefCell::new(Core::new(config)))),
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.shared.lock().borrow().config.clone()
    }

    /// A handle that does not keep the store alive. Recompute functions and
    /// callbacks should capture this instead of a `Store`.
    pub fn downgrade(&self) -> WeakStore<V> {
        WeakStore {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a state node holding `initial`.
    pub fn create_state(&self, initial: V) -> NodeId {
        self.create_state_with(initial, NodeOptions::default())
    }

    pub fn create_state_with(&self, initial: V, options: NodeOptions) -> NodeId {
        let guard = self.shared.lock();
        let mut core = guard.borrow_mut();
        let equality = options.equality.unwrap_or(core.config.default_equality);
        let node_id = core
            .graph
            .add_state_node(Arc::new(initial), equality, options.label);
        trace!(node = %node_id, ?equality, "state node created");
        node_id
    }

    /// Register a computed node. `f` receives the values of `inputs`, in
    /// order, and runs the first time the node is read.
    pub fn create_computed<F>(&self, inputs: &[NodeId], f: F) -> Result<NodeId>
    where
        F: Fn(&[Arc<V>]) -> V + Send + Sync + 'static,
    {
        self.create_computed_with(inputs, NodeOptions::default(), move |values| {
            Ok::<V, BoxError>(f(values))
        })
    }

    /// Register a computed node whose recompute function can fail.
    pub fn try_create_computed<F, E>(&self, inputs: &[NodeId], f: F) -> Result<NodeId>
    where
        F: Fn(&[Arc<V>]) -> std::result::Result<V, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.create_computed_with(inputs, NodeOptions::default(), f)
    }

    pub fn create_computed_with<F, E>(
        &self,
        inputs: &[NodeId],
        options: NodeOptions,
        f: F,
    ) -> Result<NodeId>
    where
        F: Fn(&[Arc<V>]) -> std::result::Result<V, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let compute: ComputeFn<V> = Arc::new(
            move |values: &[Arc<V>]| -> std::result::Result<V, BoxError> {
                f(values).map_err(Into::into)
            },
        );

        let guard = self.shared.lock();
        let mut core = guard.borrow_mut();
        let equality = options.equality.unwrap_or(core.config.default_equality);
        let node_id = core.graph.add_node(inputs, compute, equality, options.label)?;
        trace!(node = %node_id, inputs = inputs.len(), ?equality, "computed node created");
        Ok(node_id)
    }

    /// Read a node's value, settling it first if it is dirty.
    pub fn read(&self, node_id: NodeId) -> Result<Arc<V>> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;

        let dirty = {
            let state = core.borrow();
            let node = state.graph.node(node_id)?;
            if let Some(busy) = state
                .stack
                .iter()
                .find(|&busy| state.graph.reaches(busy, node_id))
            {
                return Err(ReactiveError::ReentrantWrite(busy));
            }
            node.status().is_dirty()
        };

        if dirty {
            batched(core, || graph::pull(core, node_id))??;
        }

        let state = core.borrow();
        let node = state.graph.node(node_id)?;
        let value = match (node.status(), node.value()) {
            (NodeStatus::Errored(failure), _) => Err(ReactiveError::Recompute {
                node: node_id,
                failure: failure.clone(),
            }),
            (_, Some(value)) => Ok(value.clone()),
            (_, None) => Err(ReactiveError::Unsettled(node_id)),
        };
        value
    }

    /// Write a state node. Flushes before returning unless a batch is open.
    pub fn write(&self, node_id: NodeId, value: V) -> Result<()> {
        self.write_shared(node_id, Arc::new(value))
    }

    /// Write an existing allocation. With `Equality::Reference`, writing back
    /// the `Arc` returned by `read` is a no-op.
    pub fn write_shared(&self, node_id: NodeId, value: Arc<V>) -> Result<()> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;
        {
            let mut state = core.borrow_mut();
            let state = &mut *state;
            if state.stack.contains(node_id) {
                return Err(ReactiveError::ReentrantWrite(node_id));
            }
            let node = state.graph.node_mut(node_id)?;
            if node.kind() != NodeKind::State {
                return Err(ReactiveError::NotStateNode(node_id));
            }

            let previous = node.value().cloned();
            if let Some(previous) = &previous {
                if node.equality().equals(previous, &value) {
                    trace!(node = %node_id, "write skipped, value unchanged");
                    return Ok(());
                }
            }
            node.set_value(value);

            state.scheduler.record_baseline(node_id, previous);
            let dirtied = state.scheduler.invalidate(&mut state.graph, node_id, false);
            trace!(node = %node_id, dirtied, "state node written");
        }
        graph::flush(core)
    }

    /// Write `f(current)` to a state node.
    pub fn update(&self, node_id: NodeId, f: impl FnOnce(&V) -> V) -> Result<()> {
        let current = self.read(node_id)?;
        self.write(node_id, f(&current))
    }

    /// Run `f` with flushing suspended, then flush once.
    ///
    /// Nested batches are flattened; only the outermost one flushes. A batch
    /// opened from a recompute function joins the running flush.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;
        batched(core, f)
    }

    /// Call `callback` after every flush in which the node's value changed.
    ///
    /// The node is settled first, so the first call reports a real change.
    pub fn subscribe<F>(&self, node_id: NodeId, callback: F) -> Result<Subscription<V>>
    where
        F: Fn(&Arc<V>) + Send + Sync + 'static,
    {
        match self.read(node_id) {
            Ok(_) | Err(ReactiveError::Recompute { .. }) => {}
            Err(err) => return Err(err),
        }

        let guard = self.shared.lock();
        let id = guard
            .borrow_mut()
            .subscriptions
            .add(node_id, Arc::new(callback));
        trace!(node = %node_id, subscription = ?id, "subscribed");
        Ok(Subscription::new(id, node_id, Arc::downgrade(&self.shared)))
    }

    /// Dispose a node.
    ///
    /// Former dependents lose it as an input and become errored without
    /// running, with a `Disposed` cause naming this node. They recompute once
    /// rewired with `add_input`/`remove_input` or after a write upstream.
    pub fn dispose(&self, node_id: NodeId) -> Result<()> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;
        {
            let mut state = core.borrow_mut();
            let state = &mut *state;
            if state.stack.contains(node_id) {
                return Err(ReactiveError::ReentrantWrite(node_id));
            }
            state.graph.node(node_id)?;

            state.scheduler.invalidate(&mut state.graph, node_id, false);
            let dependents = state.graph.dispose(node_id)?;
            for &dependent in &dependents {
                let failure = RecomputeFailure::new(
                    dependent,
                    Box::new(ReactiveError::Disposed(node_id)),
                );
                if let Some(node) = state.graph.get_mut(dependent) {
                    node.mark_errored(failure);
                }
                state.scheduler.forget_pending(dependent);
            }
            state.memo.forget(node_id);
            state.scheduler.forget(node_id);
            let subscriptions = state.subscriptions.remove_node(node_id);
            debug!(
                node = %node_id,
                dependents = dependents.len(),
                subscriptions,
                "node disposed"
            );
        }
        graph::flush(core)
    }

    /// Append `input` to the inputs of the computed node `dependent`.
    pub fn add_input(&self, dependent: NodeId, input: NodeId) -> Result<()> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;
        {
            let mut state = core.borrow_mut();
            let state = &mut *state;
            if state.stack.contains(dependent) {
                return Err(ReactiveError::ReentrantWrite(dependent));
            }
            state.graph.add_edge(input, dependent)?;
            state.scheduler.invalidate(&mut state.graph, dependent, true);
        }
        graph::flush(core)
    }

    /// Remove every occurrence of `input` from the inputs of `dependent`.
    pub fn remove_input(&self, dependent: NodeId, input: NodeId) -> Result<()> {
        let guard = self.shared.lock();
        let core: &RefCell<Core<V>> = &guard;
        {
            let mut state = core.borrow_mut();
            let state = &mut *state;
            if state.stack.contains(dependent) {
                return Err(ReactiveError::ReentrantWrite(dependent));
            }
            if !state.graph.remove_edge(input, dependent)? {
                return Ok(());
            }
            state.scheduler.invalidate(&mut state.graph, dependent, true);
        }
        graph::flush(core)
    }

    /// Current status of a node. Disposed nodes report `NodeStatus::Disposed`.
    pub fn status(&self, node_id: NodeId) -> Result<NodeStatus> {
        let guard = self.shared.lock();
        let state = guard.borrow();
        state
            .graph
            .get(node_id)
            .map(|node| node.status().clone())
            .ok_or(ReactiveError::UnknownNode(node_id))
    }

    pub fn kind(&self, node_id: NodeId) -> Result<NodeKind> {
        let guard = self.shared.lock();
        let state = guard.borrow();
        Ok(state.graph.node(node_id)?.kind())
    }

    pub fn label(&self, node_id: NodeId) -> Result<Option<String>> {
        let guard = self.shared.lock();
        let state = guard.borrow();
        Ok(state.graph.node(node_id)?.label().map(str::to_owned))
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().borrow().scheduler.phase()
    }

    /// Whether a `batch` scope is open.
    pub fn is_batching(&self) -> bool {
        self.shared.lock().borrow().scheduler.is_batching()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.shared.lock().borrow().graph.node_count()
    }

    pub fn subscriber_count(&self, node_id: NodeId) -> usize {
        self.shared.lock().borrow().subscriptions.count(node_id)
    }

    pub fn memo_stats(&self) -> MemoStats {
        self.shared.lock().borrow().memo.stats()
    }
}

impl<V> Default for Store<V>
where
    V: PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for Store<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.lock();
        let result = match guard.try_borrow() {
            Ok(state) => f
                .debug_struct("Store")
                .field("nodes", &state.graph.node_count())
                .field("phase", &state.scheduler.phase())
                .field("pending", &state.scheduler.pending_len())
                .finish(),
            Err(_) => f.debug_struct("Store").finish_non_exhaustive(),
        };
        result
    }
}

/// A non-owning store handle.
pub struct WeakStore<V> {
    shared: Weak<Shared<V>>,
}

impl<V> WeakStore<V> {
    /// The store, if it is still alive.
    pub fn upgrade(&self) -> Option<Store<V>> {
        self.shared.upgrade().map(|shared| Store { shared })
    }
}

impl<V> Clone for WeakStore<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Equality;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn value_store() -> Store<i32> {
        Store::with_config(StoreConfig::default().with_default_equality(Equality::Value))
    }

    #[test]
    fn store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store<i32>>();
        assert_send_sync::<WeakStore<String>>();
    }

    #[test]
    fn computed_is_lazy_until_read() {
        let store = value_store();
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();

        let s = store.create_state(2);
        let c = store
            .create_computed(&[s], move |inputs| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                *inputs[0] + 1
            })
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(store.status(c).unwrap().is_dirty());

        assert_eq!(*store.read(c).unwrap(), 3);
        assert_eq!(*store.read(c).unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_rejects_computed_nodes() {
        let store = value_store();
        let s = store.create_state(1);
        let c = store.create_computed(&[s], |inputs| *inputs[0]).unwrap();

        assert!(matches!(store.write(c, 3), Err(ReactiveError::NotStateNode(id)) if id == c));
        assert_eq!(store.kind(c).unwrap(), NodeKind::Computed);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let store = value_store();
        let other = value_store();
        let foreign = other.create_state(1);
        other.create_state(2);
        let missing = other.create_state(3);

        store.create_state(0);
        assert!(matches!(store.read(missing), Err(ReactiveError::UnknownNode(_))));
        assert!(store.read(foreign).is_ok());
    }

    #[test]
    fn reference_equality_uses_allocations() {
        let store: Store<String> = Store::new();
        let s = store.create_state(String::from("a"));
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let c = store
            .create_computed(&[s], move |inputs| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                inputs[0].to_uppercase()
            })
            .unwrap();
        store.read(c).unwrap();

        // Writing back the same allocation is a no-op
        let current = store.read(s).unwrap();
        store.write_shared(s, current).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // An equal but distinct value counts as a change
        store.write(s, String::from("a")).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_applies_function() {
        let store = value_store();
        let s = store.create_state(10);
        store.update(s, |v| v + 5).unwrap();
        assert_eq!(*store.read(s).unwrap(), 15);
    }

    #[test]
    fn labels_and_counts() {
        let store = value_store();
        let s = store.create_state_with(1, NodeOptions::new().label("count"));
        let c = store.create_computed(&[s], |inputs| *inputs[0]).unwrap();

        assert_eq!(store.label(s).unwrap().as_deref(), Some("count"));
        assert_eq!(store.label(c).unwrap(), None);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.phase(), Phase::Idle);
        assert!(!store.is_batching());
    }

    #[test]
    fn weak_store_does_not_keep_store_alive() {
        let store = value_store();
        let weak = store.downgrade();
        assert!(weak.upgrade().is_some());
        drop(store);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn read_without_value_reports_unsettled() {
        let store = value_store();
        let s = store.create_state(1);
        let c = store.create_computed(&[s], |inputs| *inputs[0]).unwrap();

        // Never computed, yet not dirty
        if let Some(node) = store.shared.lock().borrow_mut().graph.get_mut(c) {
            node.mark_clean();
        };

        assert!(matches!(store.read(c), Err(ReactiveError::Unsettled(id)) if id == c));
    }

    #[test]
    fn zero_pass_limit_is_raised_to_one() {
        let mut config = StoreConfig::default();
        config.max_flush_passes = 0;
        let store: Store<i32> = Store::with_config(config);
        assert_eq!(store.config().max_flush_passes, 1);

        let s = store.create_state(1);
        let c = store.create_computed(&[s], |inputs| *inputs[0] + 1).unwrap();
        store.write(s, 2).unwrap();
        assert_eq!(*store.read(c).unwrap(), 3);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let store = value_store();
        let s = store.create_state(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let sub = store
            .subscribe(s, move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(store.subscriber_count(s), 1);

        store.write(s, 1).unwrap();
        drop(sub);
        assert_eq!(store.subscriber_count(s), 0);
        store.write(s, 2).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let store = value_store();
        let s = store.create_state(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        store
            .subscribe(s, move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
            .detach();

        store.write(s, 1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(s), 1);
    }
}

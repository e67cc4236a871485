//! Subscription types for the reactive system.
//!
//! A subscription attaches a callback to one node. After a flush settles, the
//! callback runs once if that node's value changed during the flush.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;

use crate::graph::NodeId;
use crate::reactive::store::Shared;

/// Unique identifier for a subscription within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked with a node's settled value.
pub(crate) type Callback<V> = Arc<dyn Fn(&Arc<V>) + Send + Sync>;

/// Registry of subscriptions, grouped by node.
pub(crate) struct Subscriptions<V> {
    next_id: u64,
    by_node: HashMap<NodeId, IndexMap<SubscriptionId, Callback<V>>>,
}

impl<V> Subscriptions<V> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            by_node: HashMap::new(),
        }
    }

    /// Register `callback` for `node_id`.
    pub fn add(&mut self, node_id: NodeId, callback: Callback<V>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.by_node.entry(node_id).or_default().insert(id, callback);
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn remove(&mut self, node_id: NodeId, id: SubscriptionId) -> bool {
        let Some(callbacks) = self.by_node.get_mut(&node_id) else {
            return false;
        };
        let removed = callbacks.shift_remove(&id).is_some();
        if callbacks.is_empty() {
            self.by_node.remove(&node_id);
        }
        removed
    }

    /// Remove every subscription on `node_id`.
    pub fn remove_node(&mut self, node_id: NodeId) -> usize {
        self.by_node
            .remove(&node_id)
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    /// Subscription ids for `node_id` in registration order.
    pub fn ids(&self, node_id: NodeId) -> Vec<SubscriptionId> {
        self.by_node
            .get(&node_id)
            .map(|callbacks| callbacks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The callback of a subscription that is still registered.
    pub fn get(&self, node_id: NodeId, id: SubscriptionId) -> Option<Callback<V>> {
        self.by_node.get(&node_id)?.get(&id).cloned()
    }

    pub fn has(&self, node_id: NodeId) -> bool {
        self.by_node.contains_key(&node_id)
    }

    pub fn count(&self, node_id: NodeId) -> usize {
        self.by_node.get(&node_id).map(IndexMap::len).unwrap_or(0)
    }
}

impl<V> Default for Subscriptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered subscription.
///
/// Dropping this handle unsubscribes. Call [`Subscription::detach`] to keep
/// the callback registered for as long as the node lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<V> {
    id: SubscriptionId,
    node_id: NodeId,
    store: Weak<Shared<V>>,
    active: bool,
}

impl<V> Subscription<V> {
    pub(crate) fn new(id: SubscriptionId, node_id: NodeId, store: Weak<Shared<V>>) -> Self {
        Self {
            id,
            node_id,
            store,
            active: true,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The node this subscription watches.
    pub fn node(&self) -> NodeId {
        self.node_id
    }

    /// Remove the subscription now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the subscription registered without holding the handle.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        let Some(shared) = self.store.upgrade() else {
            return;
        };
        let guard = shared.lock();
        if let Ok(mut core) = guard.try_borrow_mut() {
            core.subscriptions.remove(self.node_id, self.id);
        };
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<V> fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("node", &self.node_id)
            .field("active", &self.active)
            .finish()
    }
}

//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{BoxError, RecomputeFailure};

/// Unique identifier for a node in the dependency graph.
///
/// Ids are allocated per store in creation order, so comparing two ids
/// compares their creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A state node. Roots of the graph; their value changes only by writes.
    State,

    /// A computed node. Derives its value from its declared inputs.
    Computed,
}

/// How two values of a node are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equality {
    /// Same allocation (`Arc::ptr_eq`).
    #[default]
    Reference,

    /// Structurally equal (`PartialEq`).
    Value,
}

impl Equality {
    /// Compare two values under this mode.
    pub fn equals<V: PartialEq + ?Sized>(self, a: &Arc<V>, b: &Arc<V>) -> bool {
        match self {
            Equality::Reference => Arc::ptr_eq(a, b),
            Equality::Value => Arc::ptr_eq(a, b) || **a == **b,
        }
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone)]
pub enum NodeStatus {
    /// The value is settled.
    Clean,

    /// The node needs to recompute before its value can be trusted.
    Dirty,

    /// The node's recompute function (or one of its ancestors') failed.
    /// The value is whatever was last computed successfully.
    Errored(RecomputeFailure),

    /// The node has been disposed. Every operation on it fails.
    Disposed,
}

impl NodeStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, NodeStatus::Clean)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, NodeStatus::Dirty)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, NodeStatus::Errored(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, NodeStatus::Disposed)
    }
}

/// Per-node registration options.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub(crate) equality: Option<Equality>,
    pub(crate) label: Option<String>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the store's default equality mode for this node.
    pub fn equality(mut self, equality: Equality) -> Self {
        self.equality = Some(equality);
        self
    }

    /// Shorthand for `equality(Equality::Value)`.
    pub fn by_value(self) -> Self {
        self.equality(Equality::Value)
    }

    /// Attach a human-readable label, used in log output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A recompute function: input values in declaration order to a new value.
pub(crate) type ComputeFn<V> =
    Arc<dyn Fn(&[Arc<V>]) -> std::result::Result<V, BoxError> + Send + Sync>;

/// Declared inputs of a computed node. Most nodes have only a few.
pub(crate) type Inputs = SmallVec<[NodeId; 4]>;

/// A node in the dependency graph.
pub(crate) struct Node<V> {
    /// Unique identifier for this node.
    id: NodeId,

    /// What kind of node this is.
    kind: NodeKind,

    /// Current lifecycle state.
    status: NodeStatus,

    /// Current value. `None` until a computed node first settles.
    value: Option<Arc<V>>,

    /// Nodes that this node reads from, in the order their values are passed
    /// to the recompute function. May contain duplicates.
    inputs: Inputs,

    /// Nodes that read from this node, in insertion order.
    dependents: IndexSet<NodeId>,

    /// The recompute function. `None` for state nodes.
    compute: Option<ComputeFn<V>>,

    equality: Equality,

    label: Option<String>,
}

impl<V> Node<V> {
    /// Create a new state node holding `value`.
    pub fn state(id: NodeId, value: Arc<V>, equality: Equality, label: Option<String>) -> Self {
        Self {
            id,
            kind: NodeKind::State,
            status: NodeStatus::Clean,
            value: Some(value),
            inputs: Inputs::new(),
            dependents: IndexSet::new(),
            compute: None,
            equality,
            label,
        }
    }

    /// Create a new computed node. It starts dirty and has no value until
    /// it is first settled.
    pub fn computed(
        id: NodeId,
        inputs: Inputs,
        compute: ComputeFn<V>,
        equality: Equality,
        label: Option<String>,
    ) -> Self {
        Self {
            id,
            kind: NodeKind::Computed,
            status: NodeStatus::Dirty,
            value: None,
            inputs,
            dependents: IndexSet::new(),
            compute: Some(compute),
            equality,
            label,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn equality(&self) -> Equality {
        self.equality
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Arc<V>) {
        self.value = Some(value);
    }

    pub fn compute(&self) -> Option<ComputeFn<V>> {
        self.compute.clone()
    }

    pub fn mark_clean(&mut self) {
        if !self.status.is_disposed() {
            self.status = NodeStatus::Clean;
        }
    }

    /// Mark the node as needing recomputation. Overrides an errored state,
    /// never a disposed one. Returns true if the node was not already dirty.
    pub fn mark_dirty(&mut self) -> bool {
        match self.status {
            NodeStatus::Dirty | NodeStatus::Disposed => false,
            _ => {
                self.status = NodeStatus::Dirty;
                true
            }
        }
    }

    pub fn mark_errored(&mut self, failure: RecomputeFailure) {
        if !self.status.is_disposed() {
            self.status = NodeStatus::Errored(failure);
        }
    }

    /// Mark the node disposed and drop its edges, value, and function.
    pub fn mark_disposed(&mut self) {
        self.status = NodeStatus::Disposed;
        self.inputs.clear();
        self.dependents.clear();
        self.compute = None;
        self.value = None;
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn add_input(&mut self, node_id: NodeId) {
        self.inputs.push(node_id);
    }

    /// Remove every occurrence of `node_id` from the inputs.
    pub fn remove_input(&mut self, node_id: NodeId) {
        self.inputs.retain(|id| *id != node_id);
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }
}

impl<V> fmt::Debug for Node<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .field("dependents", &self.dependents)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn doubler() -> ComputeFn<i32> {
        Arc::new(|inputs: &[Arc<i32>]| -> std::result::Result<i32, BoxError> {
            Ok(*inputs[0] * 2)
        })
    }

    #[test]
    fn state_node_starts_clean() {
        let node = Node::state(NodeId::from(0), Arc::new(1), Equality::Value, None);
        assert_eq!(node.kind(), NodeKind::State);
        assert!(node.status().is_clean());
        assert_eq!(node.value().map(|v| **v), Some(1));
    }

    #[test]
    fn computed_node_starts_dirty_without_value() {
        let node = Node::computed(
            NodeId::from(1),
            smallvec![NodeId::from(0)],
            doubler(),
            Equality::Reference,
            Some("double".into()),
        );
        assert_eq!(node.kind(), NodeKind::Computed);
        assert!(node.status().is_dirty());
        assert!(node.value().is_none());
        assert_eq!(node.label(), Some("double"));
    }

    #[test]
    fn input_management_keeps_order_and_duplicates() {
        let a = NodeId::from(0);
        let b = NodeId::from(1);
        let mut node = Node::computed(NodeId::from(2), smallvec![a, b], doubler(), Equality::Value, None);

        node.add_input(a);
        assert_eq!(node.inputs(), &[a, b, a]);

        node.remove_input(a);
        assert_eq!(node.inputs(), &[b]);
    }

    #[test]
    fn status_transitions() {
        let mut node = Node::state(NodeId::from(0), Arc::new(0), Equality::Value, None);

        assert!(node.mark_dirty());
        assert!(!node.mark_dirty());

        node.mark_errored(RecomputeFailure::new(NodeId::from(0), "x".into()));
        assert!(node.status().is_errored());

        // Dirty overrides errored
        assert!(node.mark_dirty());
        node.mark_clean();
        assert!(node.status().is_clean());

        node.mark_disposed();
        assert!(!node.mark_dirty());
        node.mark_clean();
        assert!(node.status().is_disposed());
        assert!(node.value().is_none());
    }

    #[test]
    fn equality_modes() {
        let a = Arc::new(String::from("x"));
        let b = Arc::new(String::from("x"));

        assert!(Equality::Reference.equals(&a, &a.clone()));
        assert!(!Equality::Reference.equals(&a, &b));
        assert!(Equality::Value.equals(&a, &b));
        assert!(!Equality::Value.equals(&a, &Arc::new(String::from("y"))));
    }
}

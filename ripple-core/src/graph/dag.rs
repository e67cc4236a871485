//! Dependency Graph
//!
//! Owns every node of a store and the edges between them. All structural
//! changes go through here so that the graph stays acyclic: an edge is only
//! inserted after checking that the dependent cannot already reach the input.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::node::{ComputeFn, Equality, Inputs, Node, NodeId, NodeKind};
use crate::error::{ReactiveError, Result};

/// The node arena of one store.
pub(crate) struct Graph<V> {
    /// All nodes, including disposed tombstones, indexed by ID.
    nodes: HashMap<NodeId, Node<V>>,

    /// Next id to hand out. Ids grow with creation order.
    next_id: u64,
}

impl<V> Graph<V> {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId::from(self.next_id);
        self.next_id += 1;
        id
    }

    /// Get a node, including disposed ones.
    pub fn get(&self, node_id: NodeId) -> Option<&Node<V>> {
        self.nodes.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node<V>> {
        self.nodes.get_mut(&node_id)
    }

    /// Get a live node.
    pub fn node(&self, node_id: NodeId) -> Result<&Node<V>> {
        match self.nodes.get(&node_id) {
            None => Err(ReactiveError::UnknownNode(node_id)),
            Some(node) if node.status().is_disposed() => Err(ReactiveError::Disposed(node_id)),
            Some(node) => Ok(node),
        }
    }

    /// Get a live node mutably.
    pub fn node_mut(&mut self, node_id: NodeId) -> Result<&mut Node<V>> {
        match self.nodes.get_mut(&node_id) {
            None => Err(ReactiveError::UnknownNode(node_id)),
            Some(node) if node.status().is_disposed() => Err(ReactiveError::Disposed(node_id)),
            Some(node) => Ok(node),
        }
    }

    pub fn is_dirty(&self, node_id: NodeId) -> bool {
        self.nodes
            .get(&node_id)
            .map(|node| node.status().is_dirty())
            .unwrap_or(false)
    }

    /// Number of live (not disposed) nodes.
    pub fn node_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| !node.status().is_disposed())
            .count()
    }

    /// Register a state node.
    pub fn add_state_node(&mut self, value: Arc<V>, equality: Equality, label: Option<String>) -> NodeId {
        let id = self.allocate_id();
        self.nodes.insert(id, Node::state(id, value, equality, label));
        id
    }

    /// Register a computed node reading from `inputs`.
    ///
    /// Every input must be live. The graph is unchanged on failure.
    pub fn add_node(
        &mut self,
        inputs: &[NodeId],
        compute: ComputeFn<V>,
        equality: Equality,
        label: Option<String>,
    ) -> Result<NodeId> {
        for &input in inputs {
            self.node(input)?;
        }

        // A fresh node has no dependents, so this only trips on a reused id.
        let id = NodeId::from(self.next_id);
        if let Some(&input) = inputs.iter().find(|&&input| self.reaches(id, input)) {
            return Err(ReactiveError::Cycle { input, dependent: id });
        }

        let id = self.allocate_id();
        let node = Node::computed(id, Inputs::from_slice(inputs), compute, equality, label);
        self.nodes.insert(id, node);
        for &input in inputs {
            if let Some(input_node) = self.nodes.get_mut(&input) {
                input_node.add_dependent(id);
            }
        }
        Ok(id)
    }

    /// Add a dependency edge: `dependent` gains `input` as its last input.
    pub fn add_edge(&mut self, input: NodeId, dependent: NodeId) -> Result<()> {
        self.node(input)?;
        if self.node(dependent)?.kind() != NodeKind::Computed {
            return Err(ReactiveError::NotComputedNode(dependent));
        }
        if self.reaches(dependent, input) {
            debug!(%input, %dependent, "rejected edge that would close a cycle");
            return Err(ReactiveError::Cycle { input, dependent });
        }

        if let Some(node) = self.nodes.get_mut(&input) {
            node.add_dependent(dependent);
        }
        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.add_input(input);
        }
        Ok(())
    }

    /// Remove every `input -> dependent` edge. Returns false if there was none.
    pub fn remove_edge(&mut self, input: NodeId, dependent: NodeId) -> Result<bool> {
        self.node(input)?;
        let node = self.node_mut(dependent)?;
        if node.kind() != NodeKind::Computed {
            return Err(ReactiveError::NotComputedNode(dependent));
        }
        if !node.inputs().contains(&input) {
            return Ok(false);
        }
        node.remove_input(input);
        if let Some(node) = self.nodes.get_mut(&input) {
            node.remove_dependent(dependent);
        }
        Ok(true)
    }

    /// Whether `to` is reachable from `from` by following dependent edges.
    /// A node reaches itself.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(node_id) = stack.pop() {
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent in node.dependents() {
                    if dependent == to {
                        return true;
                    }
                    stack.push(dependent);
                }
            }
        }
        false
    }

    /// Collect every node downstream of `root` in breadth-first order.
    pub fn downstream(&self, root: NodeId, include_root: bool) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if include_root {
            queue.push_back(root);
        } else if let Some(node) = self.nodes.get(&root) {
            visited.insert(root);
            queue.extend(node.dependents().iter().copied());
        }

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&node_id) {
                result.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }
        result
    }

    /// Unlink and tombstone a node. Returns its former dependents.
    pub fn dispose(&mut self, node_id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.node_mut(node_id)?;
        let inputs: Vec<NodeId> = node.inputs().to_vec();
        let dependents: Vec<NodeId> = node.dependents().iter().copied().collect();
        node.mark_disposed();

        for input in inputs {
            if let Some(node) = self.nodes.get_mut(&input) {
                node.remove_dependent(node_id);
            }
        }
        for &dependent in &dependents {
            if let Some(node) = self.nodes.get_mut(&dependent) {
                node.remove_input(node_id);
            }
        }
        Ok(dependents)
    }

    /// Order the dirty nodes needed to settle `roots`, inputs first.
    ///
    /// The closure includes every dirty ancestor of the roots, except nodes in
    /// `settled`. A node with a dirty input outside the closure is blocked and
    /// left out, together with everything downstream of it. Ties are broken by
    /// ascending id, so the order is deterministic.
    pub fn schedule(
        &self,
        roots: impl IntoIterator<Item = NodeId>,
        settled: &HashSet<NodeId>,
    ) -> Vec<NodeId> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        while let Some(node_id) = stack.pop() {
            if settled.contains(&node_id) || !self.is_dirty(node_id) {
                continue;
            }
            if closure.insert(node_id) {
                if let Some(node) = self.nodes.get(&node_id) {
                    stack.extend(node.inputs().iter().copied());
                }
            }
        }

        // In-degrees count distinct inputs within the closure
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = BinaryHeap::new();
        for &node_id in &closure {
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            let mut distinct: Vec<NodeId> = node.inputs().to_vec();
            distinct.sort_unstable();
            distinct.dedup();

            let blocked = distinct
                .iter()
                .any(|input| self.is_dirty(*input) && !closure.contains(input));
            if blocked {
                continue;
            }
            let degree = distinct.iter().filter(|input| closure.contains(input)).count();
            in_degree.insert(node_id, degree);
            if degree == 0 {
                ready.push(Reverse(node_id));
            }
        }

        // Kahn's algorithm with a min-id ready queue
        let mut result = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(node_id)) = ready.pop() {
            result.push(node_id);
            if let Some(node) = self.nodes.get(&node_id) {
                for dependent in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.push(Reverse(*dependent));
                        }
                    }
                }
            }
        }

        result
    }
}

impl<V> Default for Graph<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;

    fn sum() -> ComputeFn<i32> {
        Arc::new(|inputs: &[Arc<i32>]| -> std::result::Result<i32, BoxError> {
            Ok(inputs.iter().map(|v| **v).sum())
        })
    }

    fn state(graph: &mut Graph<i32>, value: i32) -> NodeId {
        graph.add_state_node(Arc::new(value), Equality::Value, None)
    }

    fn computed(graph: &mut Graph<i32>, inputs: &[NodeId]) -> NodeId {
        graph
            .add_node(inputs, sum(), Equality::Value, None)
            .unwrap()
    }

    #[test]
    fn ids_follow_creation_order() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        let c = computed(&mut graph, &[a, b]);
        assert!(a < b && b < c);
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn add_node_links_both_directions() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let c = computed(&mut graph, &[a, a]);

        assert_eq!(graph.node(c).unwrap().inputs(), &[a, a]);
        assert!(graph.node(a).unwrap().dependents().contains(&c));
        assert_eq!(graph.node(a).unwrap().dependents().len(), 1);
    }

    #[test]
    fn add_node_rejects_missing_inputs() {
        let mut graph: Graph<i32> = Graph::new();
        let err = graph
            .add_node(&[NodeId::from(42)], sum(), Equality::Value, None)
            .unwrap_err();
        assert!(matches!(err, ReactiveError::UnknownNode(_)));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn add_edge_rejects_cycles_and_leaves_graph_unchanged() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        let c = computed(&mut graph, &[b]);
        let d = computed(&mut graph, &[c]);

        let err = graph.add_edge(d, b).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { input, dependent } if input == d && dependent == b));
        assert_eq!(graph.node(b).unwrap().inputs(), &[a]);
        assert!(graph.node(d).unwrap().dependents().is_empty());

        let err = graph.add_edge(b, b).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { .. }));
    }

    #[test]
    fn add_edge_requires_computed_dependent() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        assert!(matches!(graph.add_edge(a, b), Err(ReactiveError::NotComputedNode(id)) if id == b));
    }

    #[test]
    fn remove_edge_drops_all_occurrences() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = state(&mut graph, 2);
        let c = computed(&mut graph, &[a, b, a]);

        assert!(graph.remove_edge(a, c).unwrap());
        assert_eq!(graph.node(c).unwrap().inputs(), &[b]);
        assert!(!graph.node(a).unwrap().dependents().contains(&c));
        assert!(!graph.remove_edge(a, c).unwrap());
    }

    #[test]
    fn downstream_is_breadth_first() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        let c = computed(&mut graph, &[a]);
        let d = computed(&mut graph, &[b, c]);

        assert_eq!(graph.downstream(a, false), vec![b, c, d]);
        assert_eq!(graph.downstream(a, true), vec![a, b, c, d]);
    }

    #[test]
    fn dispose_unlinks_and_tombstones() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        let c = computed(&mut graph, &[b, a]);

        let dependents = graph.dispose(b).unwrap();
        assert_eq!(dependents, vec![c]);
        assert_eq!(graph.node(c).unwrap().inputs(), &[a]);
        assert!(!graph.node(a).unwrap().dependents().contains(&b));
        assert!(matches!(graph.node(b), Err(ReactiveError::Disposed(_))));
        assert!(matches!(graph.dispose(b), Err(ReactiveError::Disposed(_))));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn schedule_orders_diamond_inputs_first() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        let c = computed(&mut graph, &[a]);
        let d = computed(&mut graph, &[c, b]);

        // All computed nodes start dirty; scheduling from the sink pulls ancestors in
        let order = graph.schedule([d], &HashSet::new());
        assert_eq!(order, vec![b, c, d]);
    }

    #[test]
    fn schedule_skips_blocked_nodes() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        let c = computed(&mut graph, &[b]);
        let e = computed(&mut graph, &[a]);

        let settled: HashSet<NodeId> = [b].into_iter().collect();
        let order = graph.schedule([c, e], &settled);
        assert_eq!(order, vec![e]);
    }

    #[test]
    fn schedule_ignores_clean_nodes() {
        let mut graph = Graph::new();
        let a = state(&mut graph, 1);
        let b = computed(&mut graph, &[a]);
        graph.get_mut(b).unwrap().mark_clean();

        assert!(graph.schedule([a, b], &HashSet::new()).is_empty());
    }
}

//! The append-only graph container.

use std::collections::{BTreeSet, HashMap};

use crate::dot::{self, DotEdgeSpec, DotNodeSpec};
use crate::error::GraphError;

/// Implemented by anything stored as a graph node.
pub trait GraphNode {
    /// Key of the node; must be unique within a graph.
    fn key(&self) -> &str;

    /// Visual attributes used by [`Graph::to_dot_graph`].
    fn dot_spec(&self) -> DotNodeSpec;
}

/// Produces the DOT attributes for the edge between two nodes.
pub type EdgeSpecFn<N> = fn(&N, &N) -> DotEdgeSpec;

/// Directed graph keyed by node name, preserving insertion order.
///
/// The container is append-only: nodes are never removed and [`connect`]
/// requires both endpoints to be present, so callers that only ever link a
/// new node to already-registered ones cannot form a cycle.
///
/// [`connect`]: Graph::connect
pub struct Graph<N: GraphNode> {
    nodes: HashMap<String, N>,
    order: Vec<String>,
    edges: Vec<(String, String)>,
    edge_spec_fn: EdgeSpecFn<N>,
}

impl<N: GraphNode> Graph<N> {
    pub fn new(edge_spec_fn: EdgeSpecFn<N>) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            edge_spec_fn,
        }
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn node(&self, key: &str) -> Option<&N> {
        self.nodes.get(key)
    }

    /// Register a node.
    ///
    /// # Errors
    /// [`GraphError::DuplicateNode`] if a node with the same key exists.
    pub fn add_node(&mut self, node: N) -> Result<(), GraphError> {
        let key = node.key().to_string();
        if self.nodes.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        self.order.push(key.clone());
        self.nodes.insert(key, node);
        Ok(())
    }

    /// Add a directed edge between two registered nodes.
    ///
    /// # Errors
    /// [`GraphError::ConnectNotExistingNode`] if either endpoint is absent.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.nodes.contains_key(from) {
            return Err(GraphError::ConnectNotExistingNode(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(GraphError::ConnectNotExistingNode(to.to_string()));
        }
        self.edges.push((from.to_string(), to.to_string()));
        Ok(())
    }

    /// Nodes in dependency order: every edge's producer appears before its
    /// consumer. Ties are broken by insertion order, so the result is
    /// deterministic.
    pub fn topological_sort(&self) -> Vec<&N> {
        // Kahn's algorithm over insertion indices; the ready set is ordered
        // so equal-rank nodes come out in insertion order.
        let index: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, key)| (key.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.order.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.order.len()];
        for (from, to) in &self.edges {
            let (from, to) = (index[from.as_str()], index[to.as_str()]);
            successors[from].push(to);
            in_degree[to] += 1;
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut sorted: Vec<&N> = Vec::with_capacity(self.order.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            sorted.push(&self.nodes[self.order[next].as_str()]);
            for &successor in &successors[next] {
                in_degree[successor] -= 1;
                if in_degree[successor] == 0 {
                    ready.insert(successor);
                }
            }
        }

        debug_assert_eq!(sorted.len(), self.order.len(), "graph contains a cycle");
        sorted
    }

    /// Render the graph in graphviz dot format.
    pub fn to_dot_graph(&self) -> String {
        let nodes: Vec<DotNodeSpec> = self
            .order
            .iter()
            .map(|key| self.nodes[key.as_str()].dot_spec())
            .collect();

        let edges: Vec<DotEdgeSpec> = self
            .edges
            .iter()
            .map(|(from, to)| {
                (self.edge_spec_fn)(&self.nodes[from.as_str()], &self.nodes[to.as_str()])
            })
            .collect();

        dot::render(&nodes, &edges)
    }
}

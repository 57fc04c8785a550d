//! Acyclic directed graph library for dependency scheduling.
//!
//! This crate backs the exmake build engine but carries no build-specific
//! types: vertices are generic payloads, edges are unlabelled precedence
//! arrows. An edge `u -> v` states that `u` cannot be processed until `v`
//! has been.
//!
//! # Features
//!
//! - Cycle rejection at edge-insertion time (the graph can never hold a cycle)
//! - Vertex removal, used to retire completed work
//! - Leaf listing in deterministic (id) order
//! - Reachability queries and sub-graph restriction for target pruning
//! - Optional serde support for vertex payloads
//!
//! # Example
//!
//! ```
//! use exmake_graph::Graph;
//!
//! let mut graph = Graph::new();
//! let obj = graph.add_node("foo.o");
//! let src = graph.add_node("foo.c");
//!
//! // foo.o requires foo.c first.
//! graph.add_edge(obj, src).unwrap();
//!
//! // Only foo.c is ready to process.
//! assert_eq!(graph.leaves(), vec![src]);
//!
//! // Once it completes, foo.o becomes a leaf.
//! graph.remove_node(src).unwrap();
//! assert_eq!(graph.leaves(), vec![obj]);
//! ```

#![deny(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Vertex identifier. Ids are assigned sequentially and never reused within
/// one graph, so a removed vertex's id stays dangling rather than aliasing a
/// new vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Error types for graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Inserting the edge would close a cycle. Reported before any mutation,
    /// so the graph is still acyclic afterwards.
    #[error("edge {from} -> {to} would create a cycle")]
    WouldCycle {
        /// Source vertex of the rejected edge.
        from: NodeId,
        /// Destination vertex of the rejected edge.
        to: NodeId,
    },

    /// Vertex not present in the graph.
    #[error("vertex {0} not found in graph")]
    NodeNotFound(NodeId),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Node<N> {
    data: N,
    /// Vertices this one points at (its prerequisites).
    outgoing: HashSet<NodeId>,
    /// Vertices pointing at this one (its dependents).
    incoming: HashSet<NodeId>,
}

/// Directed graph guaranteed acyclic by construction.
///
/// Stored as an arena of vertices with per-vertex adjacency sets; there is no
/// separate edge table, so removing a vertex is O(degree).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Graph<N> {
    nodes: HashMap<NodeId, Node<N>>,
    edge_count: usize,
    next_id: usize,
}

impl<N> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Graph<N> {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edge_count: 0,
            next_id: 0,
        }
    }

    /// Add a vertex and return its id.
    pub fn add_node(&mut self, data: N) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        let prev = self.nodes.insert(
            id,
            Node {
                data,
                outgoing: HashSet::new(),
                incoming: HashSet::new(),
            },
        );
        debug_assert!(prev.is_none());
        id
    }

    /// Add a precedence edge `from -> to`: `from` requires `to` first.
    ///
    /// Inserting an edge that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NodeNotFound`] if either vertex does not exist
    /// - [`GraphError::WouldCycle`] if the edge would close a cycle; the
    ///   graph is left untouched
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> GraphResult<()> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::NodeNotFound(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(GraphError::NodeNotFound(to));
        }

        // A path to -> ... -> from means from -> to would close a loop.
        if self.can_reach(to, from) {
            return Err(GraphError::WouldCycle { from, to });
        }

        let inserted = match self.nodes.get_mut(&from) {
            Some(node) => node.outgoing.insert(to),
            None => false,
        };
        if inserted {
            if let Some(node) = self.nodes.get_mut(&to) {
                let _ = node.incoming.insert(from);
            }
            self.edge_count += 1;
        }
        Ok(())
    }

    /// Remove a vertex and every edge attached to it.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn remove_node(&mut self, id: NodeId) -> GraphResult<N> {
        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;

        for out in &node.outgoing {
            if let Some(n) = self.nodes.get_mut(out) {
                let _ = n.incoming.remove(&id);
            }
        }
        for inc in &node.incoming {
            if let Some(n) = self.nodes.get_mut(inc) {
                let _ = n.outgoing.remove(&id);
            }
        }
        self.edge_count -= node.outgoing.len() + node.incoming.len();
        Ok(node.data)
    }

    /// Is there a path from `start` to `end`?
    fn can_reach(&self, start: NodeId, end: NodeId) -> bool {
        if start == end {
            return true;
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if current == end {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for &next in &node.outgoing {
                    if !visited.contains(&next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        false
    }

    /// Get a reference to a vertex's payload.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn node(&self, id: NodeId) -> GraphResult<&N> {
        self.nodes
            .get(&id)
            .map(|node| &node.data)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Get a mutable reference to a vertex's payload.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut N> {
        self.nodes
            .get_mut(&id)
            .map(|node| &mut node.data)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Does the graph contain this vertex?
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All vertex ids, ascending.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of vertices.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// True when the graph holds no vertices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Vertices `id` points at (its prerequisites), ascending.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn out_neighbors(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        let node = self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))?;
        let mut out: Vec<NodeId> = node.outgoing.iter().copied().collect();
        out.sort();
        Ok(out)
    }

    /// Vertices pointing at `id` (its dependents), ascending.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn in_neighbors(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        let node = self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))?;
        let mut inc: Vec<NodeId> = node.incoming.iter().copied().collect();
        inc.sort();
        Ok(inc)
    }

    /// Vertices with no outgoing edges, ascending. These have no outstanding
    /// prerequisites and are ready to process.
    #[must_use]
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.outgoing.is_empty())
            .map(|(&id, _)| id)
            .collect();
        out.sort();
        out
    }

    /// Every vertex reachable from `start` by following outgoing edges,
    /// including `start` itself.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn reachable_from(&self, start: NodeId) -> GraphResult<HashSet<NodeId>> {
        if !self.nodes.contains_key(&start) {
            return Err(GraphError::NodeNotFound(start));
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for &next in &node.outgoing {
                    if !visited.contains(&next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        Ok(visited)
    }
}

impl<N: Clone> Graph<N> {
    /// Copy of the graph restricted to `keep`; edges with an endpoint outside
    /// the set are dropped. Vertex ids are preserved.
    #[must_use]
    pub fn restricted_to(&self, keep: &HashSet<NodeId>) -> Graph<N> {
        let nodes = self
            .nodes
            .iter()
            .filter(|(id, _)| keep.contains(id))
            .map(|(&id, node)| {
                (
                    id,
                    Node {
                        data: node.data.clone(),
                        outgoing: node.outgoing.intersection(keep).copied().collect(),
                        incoming: node.incoming.intersection(keep).copied().collect(),
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        let edge_count = nodes.values().map(|n| n.outgoing.len()).sum();
        Graph {
            nodes,
            edge_count,
            next_id: self.next_id,
        }
    }

    /// The sub-graph reachable from `start` (see [`Graph::reachable_from`]).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if the vertex does not exist.
    pub fn pruned(&self, start: NodeId) -> GraphResult<Graph<N>> {
        let keep = self.reachable_from(start)?;
        Ok(self.restricted_to(&keep))
    }
}

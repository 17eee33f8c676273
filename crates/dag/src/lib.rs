//! `dag` crate — append-only directed graph container keyed by node name.
//!
//! The engine stores its step definitions and step instances in a [`Graph`].
//! The container is deliberately minimal: nodes are never removed and
//! [`Graph::connect`] requires both endpoints to be registered already, so a
//! caller that only links new nodes to existing ones cannot form a cycle.

pub mod dot;
pub mod error;
pub mod graph;

pub use dot::{DotEdgeSpec, DotNodeSpec};
pub use error::GraphError;
pub use graph::{EdgeSpecFn, Graph, GraphNode};

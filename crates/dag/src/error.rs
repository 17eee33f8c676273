//! Graph-level error type.

use thiserror::Error;

/// Errors returned by the graph primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node with the same key is already registered.
    #[error("node with key '{0}' already exists in this graph")]
    DuplicateNode(String),

    /// An edge endpoint references a key that was never added.
    #[error("cannot connect node '{0}', it is not added in this graph yet")]
    ConnectNotExistingNode(String),
}

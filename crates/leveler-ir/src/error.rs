//! Error types for the leveler IR.

use std::path::PathBuf;

use crate::graph::NodeId;

/// Errors that can occur when constructing, executing or loading a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A node id is out of bounds for the graph arena.
    #[error("node {id:?} out of bounds (graph size: {size})")]
    BadNode { id: NodeId, size: usize },

    /// Two nodes share a name.
    #[error("duplicate node name '{0}'")]
    DuplicateName(String),

    /// A node was expected to hold a convolution.
    #[error("node '{name}' is a {found}, expected Conv2d")]
    NotAConv { name: String, found: &'static str },

    /// The same node was requested more than once for mutable access.
    #[error("overlapping mutable access to nodes {0:?}")]
    Overlap(Vec<NodeId>),

    /// The graph contains a cycle.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// A layer's parameters disagree with each other.
    #[error("invalid parameters for '{node}': {detail}")]
    InvalidParameters { node: String, detail: String },

    /// Tensor shapes are incompatible for an operation.
    #[error("shape mismatch at '{node}': {detail}")]
    ShapeMismatch { node: String, detail: String },

    /// The graph cannot be executed with a single input tensor.
    #[error("graph has {inputs} input(s) and {outputs} output(s), expected exactly one of each")]
    UnsupportedSignature { inputs: usize, outputs: usize },

    /// Failed to read or write a model file.
    #[error("failed to access model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A model file could not be (de)serialized.
    #[error("invalid model file {path}: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

//! Leveler intermediate representation.
//!
//! An arena-based computation graph for convolutional networks, carrying
//! layer parameters as `ndarray` tensors, plus a reference executor used
//! for tracing and calibration.

mod error;
pub mod exec;
pub mod graph;
mod io;
mod layer;

pub use error::IrError;
pub use graph::{ComputeGraph, Node, NodeId};
pub use layer::{Activation, BatchNorm2d, Conv2d, LayerKind, Op, Pool2d};

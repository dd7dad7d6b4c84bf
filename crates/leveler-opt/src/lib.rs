//! Data-free quantization passes for leveler graphs.
//!
//! Provides cross-layer equalization (CLE), which rescales adjacent
//! convolutions so their per-channel weight ranges match, and high-bias
//! absorption (HBA), which moves large post-equalization biases into the
//! next layer. [`cross_layer_equalize`] runs the full pipeline.

mod absorb;
mod bn_fold;
mod dce;
mod driver;
pub mod equalize;
mod error;
pub mod groups;
pub mod restore;
mod rewrite;

pub use absorb::{absorb_pair, absorbable_bias, high_bias_absorb, high_bias_absorb_with_restorer};
pub use bn_fold::{BatchNormTable, BnAffine, find_conv_bn_pairs, fold_batch_norms};
pub use dce::DeadNodeElimination;
pub use driver::{CleConfig, CrossLayerEqualizer, Device, cross_layer_equalize};
pub use equalize::{DEFAULT_THRESHOLD, cross_layer_equalize_once, equalize_group};
pub use error::CleError;
pub use groups::{GroupMember, GroupShape, LayerGroup, find_layer_groups};
pub use restore::{BnRestorer, CalibrationError, CalibrationRestorer};
pub use rewrite::{GraphRewriter, Rewriter, trace};

use std::fmt::Debug;

use leveler_ir::ComputeGraph;

/// A transformation applied to a graph in place.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a graph. Returns `true` if anything was modified.
    fn run(&self, graph: &mut ComputeGraph) -> bool;
}

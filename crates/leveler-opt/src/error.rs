//! Error types for the equalization passes.

use std::path::PathBuf;

use leveler_ir::IrError;

use crate::restore::CalibrationError;

/// Errors that abort a cross-layer equalization run.
///
/// Conditions that only affect a single group or layer pair are logged
/// and skipped instead of being reported here.
#[derive(Debug, thiserror::Error)]
pub enum CleError {
    #[error(transparent)]
    Ir(#[from] IrError),

    /// A three-layer group is not normal -> depthwise -> normal.
    #[error("group {names:?} is not conv -> depthwise conv -> conv")]
    MalformedGroup { names: Vec<String> },

    /// Adjacent layers of a group disagree on the channel count.
    #[error(
        "channel mismatch: '{producer}' produces {produced} channels, '{consumer}' expects {expected}"
    )]
    ChannelMismatch {
        producer: String,
        consumer: String,
        produced: usize,
        expected: usize,
    },

    /// The scratch directory for generated artifacts could not be created.
    #[error("failed to create work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

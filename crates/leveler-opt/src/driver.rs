//! End-to-end equalization driver.
//!
//! Rewrite the model into a private copy, fold batch-norms, run a fixed
//! number of equalization passes and finish with high-bias absorption.

use std::fmt;
use std::path::PathBuf;

use leveler_ir::ComputeGraph;
use ndarray::Array4;

use crate::absorb::{high_bias_absorb, high_bias_absorb_with_restorer};
use crate::bn_fold::fold_batch_norms;
use crate::equalize::{DEFAULT_THRESHOLD, cross_layer_equalize_once};
use crate::error::CleError;
use crate::groups::find_layer_groups;
use crate::restore::BnRestorer;
use crate::rewrite::{GraphRewriter, Rewriter};

/// Compute device the model is evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Reference CPU executor.
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Options for a cross-layer equalization run.
#[derive(Clone, Debug, PartialEq)]
pub struct CleConfig {
    /// Upper bound on `s1 / s2` in three-layer groups.
    pub threshold: f64,
    /// Number of equalization passes.
    pub cle_iters: usize,
    /// Run high-bias absorption after equalization.
    pub hba: bool,
    /// Directory for the rewritten model artifact.
    pub work_dir: PathBuf,
}

impl Default for CleConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            cle_iters: 2,
            hba: true,
            work_dir: PathBuf::from("out"),
        }
    }
}

/// Configurable equalization pipeline.
#[derive(Debug)]
pub struct CrossLayerEqualizer {
    config: CleConfig,
    rewriter: Box<dyn Rewriter>,
    restorer: Option<Box<dyn BnRestorer>>,
    restore_convs: Option<Vec<String>>,
}

impl CrossLayerEqualizer {
    pub fn new(config: CleConfig) -> Self {
        let rewriter = Box::new(GraphRewriter::new(&config.work_dir));
        Self {
            config,
            rewriter,
            restorer: None,
            restore_convs: None,
        }
    }

    pub fn config(&self) -> &CleConfig {
        &self.config
    }

    /// Replace the default [`GraphRewriter`].
    pub fn with_rewriter(mut self, rewriter: impl Rewriter + 'static) -> Self {
        self.rewriter = Box::new(rewriter);
        self
    }

    /// Statistics source for absorption when the model has no batch-norm.
    ///
    /// `convs` selects the convolutions to measure; `None` measures all.
    pub fn with_restorer(
        mut self,
        restorer: impl BnRestorer + 'static,
        convs: Option<Vec<String>>,
    ) -> Self {
        self.restorer = Some(Box::new(restorer));
        self.restore_convs = convs;
        self
    }

    /// Run the full pipeline and return the equalized model.
    ///
    /// `graph` is not modified.
    pub fn run(
        &self,
        graph: &ComputeGraph,
        example_input: &Array4<f32>,
        device: Device,
    ) -> Result<ComputeGraph, CleError> {
        log::debug!("equalizing '{}' on {device}", graph.name);
        let mut model = self.rewriter.rewrite(graph, example_input)?;
        let mut bn_table = fold_batch_norms(&mut model)?;
        if !bn_table.is_empty() {
            log::info!("folded {} batch-norm layer(s)", bn_table.len());
        }

        log::info!("start cross layer equalization, weight and bias ranges after each pass:");
        let mut groups = Vec::new();
        for iter in 0..self.config.cle_iters {
            groups = cross_layer_equalize_once(&mut model, &mut bn_table, self.config.threshold)?;
            log::debug!("pass {}: {} group(s)", iter + 1, groups.len());
        }

        if self.config.hba {
            if self.config.cle_iters == 0 {
                groups = find_layer_groups(&model)?;
            }
            log::info!("start high bias absorption, bias ranges after absorption:");
            model = if !bn_table.is_empty() {
                high_bias_absorb(&model, &groups, &bn_table)?
            } else if let Some(restorer) = &self.restorer {
                high_bias_absorb_with_restorer(
                    &model,
                    &groups,
                    restorer.as_ref(),
                    self.restore_convs.as_deref(),
                )?
            } else {
                log::warn!(
                    "high bias absorption can not run without batch-norm statistics: \
                     1. if the model has batch-norm layers, keep them unfolded in the input; \
                     2. otherwise provide calibration data to restore them"
                );
                model
            };
        }

        bn_table.clear();
        Ok(model)
    }
}

/// Equalize `graph` with the default rewriter and no restorer.
pub fn cross_layer_equalize(
    graph: &ComputeGraph,
    example_input: &Array4<f32>,
    device: Device,
    config: &CleConfig,
) -> Result<ComputeGraph, CleError> {
    CrossLayerEqualizer::new(config.clone()).run(graph, example_input, device)
}

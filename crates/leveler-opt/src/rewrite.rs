//! Graph tracing and rewriting.
//!
//! Equalization works on a private copy of the model: the input graph is
//! traced with an example input, cleaned of dead nodes, written to the
//! work directory and loaded back.

use std::fmt::Debug;
use std::path::PathBuf;

use leveler_ir::{ComputeGraph, NodeId, exec};
use ndarray::Array4;

use crate::Pass;
use crate::dce::DeadNodeElimination;
use crate::error::CleError;

/// Execute the graph once on `example_input` and return its forward
/// node order.
pub fn trace(graph: &ComputeGraph, example_input: &Array4<f32>) -> Result<Vec<NodeId>, CleError> {
    let order = graph.topological_order()?;
    exec::forward_all(graph, example_input)?;
    Ok(order)
}

/// Produces the working copy that equalization modifies.
pub trait Rewriter: Debug {
    fn rewrite(
        &self,
        graph: &ComputeGraph,
        example_input: &Array4<f32>,
    ) -> Result<ComputeGraph, CleError>;
}

/// Rewriter that round-trips the traced graph through a JSON artifact
/// in `work_dir`.
#[derive(Clone, Debug)]
pub struct GraphRewriter {
    work_dir: PathBuf,
}

impl GraphRewriter {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// `<work_dir>/<name>_cle_rewrite.json`, with the graph name lowercased.
    pub fn artifact_path(&self, graph: &ComputeGraph) -> PathBuf {
        let name = match graph.name.to_lowercase() {
            n if n.is_empty() => "model".to_string(),
            n => n,
        };
        self.work_dir.join(format!("{name}_cle_rewrite.json"))
    }
}

impl Rewriter for GraphRewriter {
    fn rewrite(
        &self,
        graph: &ComputeGraph,
        example_input: &Array4<f32>,
    ) -> Result<ComputeGraph, CleError> {
        let order = trace(graph, example_input)?;
        log::debug!("traced '{}' ({} nodes)", graph.name, order.len());

        let mut traced = graph.clone();
        let dce = DeadNodeElimination;
        if dce.run(&mut traced) {
            log::info!(
                "{}: {} -> {} nodes",
                dce.name(),
                graph.node_count(),
                traced.node_count()
            );
        }

        std::fs::create_dir_all(&self.work_dir).map_err(|e| CleError::WorkDir {
            path: self.work_dir.clone(),
            source: e,
        })?;
        let path = self.artifact_path(graph);
        traced.save_json(&path)?;
        log::info!("rewritten graph written to {}", path.display());

        Ok(ComputeGraph::load_json(&path)?)
    }
}

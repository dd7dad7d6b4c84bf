//! Dead node elimination pass.
//!
//! Removes nodes whose values cannot reach any graph output.

use leveler_ir::ComputeGraph;

use crate::Pass;

/// Removes nodes that no graph output depends on.
#[derive(Debug)]
pub struct DeadNodeElimination;

impl Pass for DeadNodeElimination {
    fn name(&self) -> &str {
        "dead-node-elimination"
    }

    fn run(&self, graph: &mut ComputeGraph) -> bool {
        // Without declared outputs every node is considered live.
        if graph.outputs.is_empty() {
            return false;
        }

        let mut live = vec![false; graph.node_count()];
        let mut worklist: Vec<_> = graph.outputs.clone();
        while let Some(id) = worklist.pop() {
            if live[id.index()] {
                continue;
            }
            live[id.index()] = true;
            worklist.extend(graph.nodes()[id.index()].inputs.iter().copied());
        }

        let removed = graph.retain(&live);
        if removed > 0 {
            log::debug!("{}: removed {removed} node(s)", self.name());
        }
        removed > 0
    }
}

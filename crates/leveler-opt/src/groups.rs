//! Layer-group discovery.
//!
//! Segments the graph into chains of convolutions that can be equalized
//! jointly. Only strictly sequential runs qualify: a chain may pass
//! through positive-homogeneous activations, and it ends at any branch
//! point, at a graph output or at any other operation.
//!
//! Supported group shapes:
//! - **conv -> conv**: any supported conv followed by a normal conv
//! - **depthwise conv -> conv**
//! - **conv -> depthwise conv -> conv**
//!
//! Runs longer than a group are covered by overlapping groups that share
//! their boundary layer.

use std::fmt;

use leveler_ir::{ComputeGraph, IrError, LayerKind, NodeId};

/// One convolution of a [`LayerGroup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMember {
    pub name: String,
    pub node: NodeId,
    pub kind: LayerKind,
}

/// The chain shapes that can be equalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupShape {
    ConvConv,
    DepthwiseConv,
    ConvDepthwiseConv,
}

impl fmt::Display for GroupShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConvConv => "conv-conv",
            Self::DepthwiseConv => "dwconv-conv",
            Self::ConvDepthwiseConv => "conv-dwconv-conv",
        })
    }
}

/// A chain of two or three adjacent convolutions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerGroup {
    pub members: Vec<GroupMember>,
}

impl LayerGroup {
    /// Build a group from node ids, e.g. to drive absorption by hand.
    pub fn from_nodes(graph: &ComputeGraph, ids: &[NodeId]) -> Result<Self, IrError> {
        let members = ids
            .iter()
            .map(|&id| {
                let node = graph.node(id)?;
                Ok(GroupMember {
                    name: node.name.clone(),
                    node: id,
                    kind: node.kind(),
                })
            })
            .collect::<Result<_, IrError>>()?;
        Ok(Self { members })
    }

    /// The chain shape, or `None` if the members form no supported shape.
    pub fn shape(&self) -> Option<GroupShape> {
        shape_of(&self.members)
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }
}

impl fmt::Display for LayerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}

fn shape_of(members: &[GroupMember]) -> Option<GroupShape> {
    use LayerKind::{DepthwiseConv, NormalConv};

    let kinds: Vec<LayerKind> = members.iter().map(|m| m.kind).collect();
    match kinds.as_slice() {
        [NormalConv, NormalConv] => Some(GroupShape::ConvConv),
        [DepthwiseConv, NormalConv] => Some(GroupShape::DepthwiseConv),
        [NormalConv, DepthwiseConv, NormalConv] => Some(GroupShape::ConvDepthwiseConv),
        _ => None,
    }
}

/// Whether `acc` can still be extended into, or already is, a supported
/// shape.
fn is_open(acc: &[GroupMember]) -> bool {
    use LayerKind::{DepthwiseConv, NormalConv};

    let kinds: Vec<LayerKind> = acc.iter().map(|m| m.kind).collect();
    matches!(kinds.as_slice(), [] | [_] | [NormalConv, DepthwiseConv]) || shape_of(acc).is_some()
}

/// Record `acc` if it forms a supported shape not already recorded.
fn flush(acc: &[GroupMember], groups: &mut Vec<LayerGroup>) {
    if shape_of(acc).is_none() || groups.iter().any(|g| g.members == acc) {
        return;
    }
    log::debug!("found layer group {:?}", acc.iter().map(|m| &m.name).collect::<Vec<_>>());
    groups.push(LayerGroup {
        members: acc.to_vec(),
    });
}

/// Discover every equalizable layer group in the graph.
///
/// Depth-first walk with an explicit stack. Each stack entry carries its
/// own copy of the branch accumulator; the visited flags are shared by
/// the whole walk so that every node is processed exactly once.
pub fn find_layer_groups(graph: &ComputeGraph) -> Result<Vec<LayerGroup>, IrError> {
    let order = graph.topological_order()?;
    let succ = graph.successor_lists();
    let mut is_output = vec![false; graph.node_count()];
    for &out in &graph.outputs {
        graph.node(out)?;
        is_output[out.index()] = true;
    }
    let mut visited = vec![false; graph.node_count()];
    let mut groups: Vec<LayerGroup> = Vec::new();

    for start in order {
        let mut stack: Vec<(NodeId, Vec<GroupMember>)> = vec![(start, Vec::new())];

        while let Some((id, mut acc)) = stack.pop() {
            if visited[id.index()] {
                // The chain that led here ends at a node processed earlier.
                flush(&acc, &mut groups);
                continue;
            }

            // A completed chain is recorded and restarted from its last
            // layer so that longer runs overlap by one convolution.
            if shape_of(&acc).is_some() {
                flush(&acc, &mut groups);
                acc.drain(..acc.len() - 1);
            }

            visited[id.index()] = true;
            let node = graph.node(id)?;
            let kind = node.kind();
            if kind.is_conv() {
                acc.push(GroupMember {
                    name: node.name.clone(),
                    node: id,
                    kind,
                });
                // A dead prefix such as `[dw, dw]` restarts from its last
                // convolution.
                if !is_open(&acc) {
                    acc.drain(..acc.len() - 1);
                }
            }

            let next = &succ[id.index()];
            // A graph output is read outside the graph, like an extra
            // successor.
            let fan_out = next.len() + usize::from(is_output[id.index()]);
            let passes_through = kind.is_conv() || kind == LayerKind::ScaleInvariantActivation;
            if fan_out > 1 || !passes_through {
                flush(&acc, &mut groups);
                acc.clear();
            } else if next.is_empty() {
                flush(&acc, &mut groups);
            }

            // Reverse push keeps the first successor on top of the stack.
            for (i, &s) in next.iter().enumerate().rev() {
                let branch = if i == 0 {
                    std::mem::take(&mut acc)
                } else {
                    acc.clone()
                };
                stack.push((s, branch));
            }
        }
    }

    Ok(groups)
}

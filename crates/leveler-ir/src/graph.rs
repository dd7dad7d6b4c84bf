//! Graph-level representation of a convolutional network.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Edges are
//! stored on the consumer side as an ordered input list; successor lists
//! are derived on demand.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::layer::{Conv2d, LayerKind, Op};

/// A unique identifier for a node in the computation graph.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Zero-based arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node in the computation graph.
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// Unique qualified name, e.g. `features.3.conv`.
    pub name: String,
    /// The operation this node performs, including its parameters.
    pub op: Op,
    /// Producer nodes (ordered).
    pub inputs: Vec<NodeId>,
    #[serde(skip)]
    kind: LayerKind,
}

impl Node {
    /// Classification computed when the node entered the graph.
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// The convolution held by this node, if any.
    pub fn conv(&self) -> Option<&Conv2d> {
        match &self.op {
            Op::Conv2d(conv) => Some(conv),
            _ => None,
        }
    }
}

/// A directed acyclic computation graph with its parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphDef")]
pub struct ComputeGraph {
    /// Model name, used to name generated artifacts.
    pub name: String,
    nodes: Vec<Node>,
    /// Graph-level outputs.
    pub outputs: Vec<NodeId>,
}

impl ComputeGraph {
    /// Create a new empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a node to the graph and return its id.
    ///
    /// Every input must already be part of the graph, which keeps the
    /// arena in a valid topological order by construction.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: Vec<NodeId>,
    ) -> Result<NodeId, IrError> {
        let name = name.into();
        for &input in &inputs {
            self.check(input)?;
        }
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(IrError::DuplicateName(name));
        }
        check_params(&name, &op)?;

        let id = NodeId(self.nodes.len() as u32);
        let kind = LayerKind::classify(&op);
        self.nodes.push(Node {
            id,
            name,
            op,
            inputs,
            kind,
        });
        Ok(id)
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, IrError> {
        self.check(id)?;
        Ok(&self.nodes[id.index()])
    }

    /// Look up a node by name.
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Replace a node's operation, reclassifying it.
    pub fn replace_op(&mut self, id: NodeId, op: Op) -> Result<Op, IrError> {
        self.check(id)?;
        check_params(&self.nodes[id.index()].name, &op)?;
        let node = &mut self.nodes[id.index()];
        node.kind = LayerKind::classify(&op);
        Ok(std::mem::replace(&mut node.op, op))
    }

    pub fn conv(&self, id: NodeId) -> Result<&Conv2d, IrError> {
        let node = self.node(id)?;
        node.conv().ok_or_else(|| IrError::NotAConv {
            name: node.name.clone(),
            found: node.op.type_name(),
        })
    }

    /// Mutable access to a convolution's parameters.
    ///
    /// Group counts are not meant to change through this handle; the
    /// node's [`LayerKind`] is not recomputed.
    pub fn conv_mut(&mut self, id: NodeId) -> Result<&mut Conv2d, IrError> {
        let [conv] = self.convs_mut([id])?;
        Ok(conv)
    }

    /// Simultaneous mutable access to several distinct convolutions.
    pub fn convs_mut<const N: usize>(
        &mut self,
        ids: [NodeId; N],
    ) -> Result<[&mut Conv2d; N], IrError> {
        for id in ids {
            self.conv(id)?;
        }
        let nodes = self
            .nodes
            .get_disjoint_mut(ids.map(NodeId::index))
            .map_err(|_| IrError::Overlap(ids.to_vec()))?;
        Ok(nodes.map(|node| match &mut node.op {
            Op::Conv2d(conv) => conv,
            _ => unreachable!("node kinds checked above"),
        }))
    }

    /// Nodes with no inputs.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Nodes holding [`Op::Input`].
    pub fn input_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.op == Op::Input)
            .map(|n| n.id)
            .collect()
    }

    /// Successor lists for every node, indexed by [`NodeId::index`].
    ///
    /// Successors are ordered by arena position; a consumer reading the
    /// same producer twice is listed once.
    pub fn successor_lists(&self) -> Vec<Vec<NodeId>> {
        let mut succ: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &input in &node.inputs {
                let list = &mut succ[input.index()];
                if list.last() != Some(&node.id) {
                    list.push(node.id);
                }
            }
        }
        succ
    }

    /// Find all nodes that consume the output of `id`.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.inputs.contains(&id))
            .map(|n| n.id)
            .collect();
        out.dedup();
        out
    }

    /// Returns node ids in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let succ = self.successor_lists();
        for node in &self.nodes {
            let mut seen = BTreeSet::new();
            for &input in &node.inputs {
                if seen.insert(input) {
                    in_degree[node.id.index()] += 1;
                }
            }
        }

        let mut ready: BTreeSet<NodeId> = self
            .nodes
            .iter()
            .filter(|node| in_degree[node.id.index()] == 0)
            .map(|node| node.id)
            .collect();
        let mut result = Vec::with_capacity(n);

        while let Some(id) = ready.pop_first() {
            result.push(id);
            for &next in &succ[id.index()] {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.insert(next);
                }
            }
        }

        if result.len() != n {
            return Err(IrError::Cycle {
                visited: result.len(),
                total: n,
            });
        }
        Ok(result)
    }

    /// Keep only the nodes whose `keep` flag is set, renumbering ids.
    ///
    /// Inputs and outputs referring to dropped nodes are removed. Returns
    /// the number of dropped nodes.
    pub fn retain(&mut self, keep: &[bool]) -> usize {
        let before = self.nodes.len();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        let mut next = 0u32;
        for node in &self.nodes {
            if keep.get(node.id.index()).copied().unwrap_or(false) {
                remap.insert(node.id, NodeId(next));
                next += 1;
            }
        }

        self.nodes.retain(|n| remap.contains_key(&n.id));
        for node in &mut self.nodes {
            node.id = remap[&node.id];
            node.inputs = node
                .inputs
                .iter()
                .filter_map(|i| remap.get(i).copied())
                .collect();
        }
        self.outputs = self
            .outputs
            .iter()
            .filter_map(|o| remap.get(o).copied())
            .collect();
        before - self.nodes.len()
    }

    fn check(&self, id: NodeId) -> Result<(), IrError> {
        if id.index() >= self.nodes.len() {
            return Err(IrError::BadNode {
                id,
                size: self.nodes.len(),
            });
        }
        Ok(())
    }
}

/// Per-channel parameter vectors must match the channel count.
fn check_params(name: &str, op: &Op) -> Result<(), IrError> {
    let invalid = |detail: String| IrError::InvalidParameters {
        node: name.to_string(),
        detail,
    };
    match op {
        Op::Conv2d(conv) => {
            if let Some(bias) = &conv.bias {
                if bias.len() != conv.out_channels() {
                    return Err(invalid(format!(
                        "bias has {} elements for {} output channels",
                        bias.len(),
                        conv.out_channels()
                    )));
                }
            }
        }
        Op::BatchNorm2d(bn) => {
            let n = bn.num_features();
            let lens = [bn.bias.len(), bn.running_mean.len(), bn.running_var.len()];
            if lens.iter().any(|&len| len != n) {
                return Err(invalid(format!(
                    "expected {n} features, got bias/mean/var of {lens:?}"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Serialized form of a node; ids are implied by position.
#[derive(Deserialize)]
struct NodeDef {
    name: String,
    op: Op,
    #[serde(default)]
    inputs: Vec<NodeId>,
}

#[derive(Deserialize)]
struct GraphDef {
    #[serde(default)]
    name: String,
    nodes: Vec<NodeDef>,
    #[serde(default)]
    outputs: Vec<NodeId>,
}

impl TryFrom<GraphDef> for ComputeGraph {
    type Error = IrError;

    fn try_from(def: GraphDef) -> Result<Self, Self::Error> {
        let mut graph = ComputeGraph::new(def.name);
        for node in def.nodes {
            graph.add_node(node.name, node.op, node.inputs)?;
        }
        for &out in &def.outputs {
            graph.check(out)?;
        }
        graph.outputs = def.outputs;
        Ok(graph)
    }
}

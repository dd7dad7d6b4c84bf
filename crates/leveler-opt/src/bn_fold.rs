//! Batch-norm folding and the fused batch-norm side-table.
//!
//! Folding rewrites `Conv2d -> BatchNorm2d` into a single convolution and
//! replaces the batch-norm node with an identity activation. The affine
//! parameters of every folded batch-norm are kept in a [`BatchNormTable`]
//! keyed by convolution name, so that equalization can co-scale them and
//! bias absorption can read them as activation statistics.

use std::collections::BTreeMap;

use leveler_ir::{Activation, BatchNorm2d, ComputeGraph, NodeId, Op};
use ndarray::{Array1, Axis, Zip};

use crate::error::CleError;

/// Per-channel affine parameters of a batch-norm layer.
///
/// For a folded batch-norm, `bias` is the mean and `|weight|` the standard
/// deviation of the convolution's (pre-activation) output.
#[derive(Clone, Debug, PartialEq)]
pub struct BnAffine {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
}

impl BnAffine {
    /// Divide both parameters channel-wise by `scale`.
    pub fn rescale(&mut self, scale: &Array1<f64>) {
        Zip::from(&mut self.weight)
            .and(&mut self.bias)
            .and(scale)
            .for_each(|w, b, &s| {
                *w = (*w as f64 / s) as f32;
                *b = (*b as f64 / s) as f32;
            });
    }
}

impl From<&BatchNorm2d> for BnAffine {
    fn from(bn: &BatchNorm2d) -> Self {
        Self {
            weight: bn.weight.clone(),
            bias: bn.bias.clone(),
        }
    }
}

/// Side-table associating convolutions with the batch-norm they absorbed.
///
/// Owned by the caller for the duration of one equalization run. At most
/// one entry exists per convolution.
#[derive(Clone, Debug, Default)]
pub struct BatchNormTable {
    entries: BTreeMap<String, BnAffine>,
}

impl BatchNormTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach batch-norm parameters to `conv`.
    ///
    /// Returns `false` and keeps the existing entry if `conv` already
    /// carries one.
    pub fn attach(&mut self, conv: &str, affine: BnAffine) -> bool {
        if self.entries.contains_key(conv) {
            log::warn!(
                "conv '{conv}' already has a fused batch-norm attached, \
                 high bias absorption can not use the new one"
            );
            return false;
        }
        self.entries.insert(conv.to_string(), affine);
        true
    }

    pub fn get(&self, conv: &str) -> Option<&BnAffine> {
        self.entries.get(conv)
    }

    /// Divide the entry of `conv`, if any, by `scale`.
    pub fn rescale(&mut self, conv: &str, scale: &Array1<f64>) {
        if let Some(affine) = self.entries.get_mut(conv) {
            affine.rescale(scale);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every attachment.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Find `(conv, batch_norm)` pairs that can be folded.
///
/// The batch-norm must be the convolution's only consumer, and the
/// convolution must not itself be a graph output.
pub fn find_conv_bn_pairs(graph: &ComputeGraph) -> Vec<(NodeId, NodeId)> {
    let succ = graph.successor_lists();
    graph
        .nodes()
        .iter()
        .filter_map(|node| {
            let Op::BatchNorm2d(bn) = &node.op else {
                return None;
            };
            let &[producer] = node.inputs.as_slice() else {
                return None;
            };
            let conv = graph.nodes()[producer.index()].conv()?;
            if succ[producer.index()] != [node.id]
                || graph.outputs.contains(&producer)
                || conv.out_channels() != bn.num_features()
            {
                return None;
            }
            Some((producer, node.id))
        })
        .collect()
}

/// Fold every foldable batch-norm into its preceding convolution.
///
/// The batch-norm node becomes an identity activation, and its affine
/// parameters are attached to the convolution in the returned table.
pub fn fold_batch_norms(graph: &mut ComputeGraph) -> Result<BatchNormTable, CleError> {
    let mut table = BatchNormTable::new();

    for (conv_id, bn_id) in find_conv_bn_pairs(graph) {
        let bn = match &graph.node(bn_id)?.op {
            Op::BatchNorm2d(bn) => bn.clone(),
            _ => continue,
        };
        let conv_name = graph.node(conv_id)?.name.clone();

        let scale: Array1<f32> = Zip::from(&bn.weight)
            .and(&bn.running_var)
            .map_collect(|&gamma, &var| gamma / (var + bn.eps).sqrt());

        let conv = graph.conv_mut(conv_id)?;
        for (mut kernel, &k) in conv.weight.axis_iter_mut(Axis(0)).zip(&scale) {
            kernel.mapv_inplace(|v| v * k);
        }
        let bias = conv
            .bias
            .take()
            .unwrap_or_else(|| Array1::zeros(bn.num_features()));
        let folded = Zip::from(&bias)
            .and(&bn.running_mean)
            .and(&scale)
            .and(&bn.bias)
            .map_collect(|&b, &mean, &k, &beta| (b - mean) * k + beta);
        conv.bias = Some(folded);

        graph.replace_op(bn_id, Op::Activation(Activation::Identity))?;
        log::debug!("folded batch-norm into '{conv_name}'");
        table.attach(&conv_name, BnAffine::from(&bn));
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use leveler_ir::{Conv2d, exec};
    use ndarray::{Array4, array};

    fn conv_bn_net(with_bias: bool) -> ComputeGraph {
        let mut g = ComputeGraph::new("net");
        let x = g.add_node("x", Op::Input, vec![]).unwrap();
        let weight = Array4::from_shape_fn((2, 2, 3, 3), |(o, i, h, w)| {
            (o as f32 - i as f32) * 0.5 + (h * 3 + w) as f32 * 0.1
        });
        let bias = with_bias.then(|| array![0.5, -0.25]);
        let c = g
            .add_node(
                "conv",
                Op::Conv2d(Conv2d::new(weight, bias).with_geometry(1, 1)),
                vec![x],
            )
            .unwrap();
        let bn = g
            .add_node(
                "bn",
                Op::BatchNorm2d(BatchNorm2d {
                    weight: array![1.5, -0.5],
                    bias: array![0.2, 3.0],
                    running_mean: array![0.1, -1.0],
                    running_var: array![2.0, 0.5],
                    eps: 1e-5,
                }),
                vec![c],
            )
            .unwrap();
        let r = g
            .add_node("relu", Op::Activation(Activation::Relu), vec![bn])
            .unwrap();
        g.outputs = vec![r];
        g
    }

    #[test]
    fn fold_preserves_output() {
        for with_bias in [true, false] {
            let mut g = conv_bn_net(with_bias);
            let input = Array4::from_shape_fn((1, 2, 5, 5), |(_, c, h, w)| {
                (c as f32 + 1.0) * ((h * 5 + w) as f32 * 0.13).sin()
            });
            let before = exec::forward(&g, &input).unwrap();

            let table = fold_batch_norms(&mut g).unwrap();
            let after = exec::forward(&g, &input).unwrap();

            assert_eq!(table.len(), 1);
            assert_eq!(table.get("conv").unwrap().weight, array![1.5, -0.5]);
            assert_eq!(table.get("conv").unwrap().bias, array![0.2, 3.0]);
            assert_eq!(
                g.find("bn").unwrap().op,
                Op::Activation(Activation::Identity)
            );
            for (a, b) in before.iter().zip(after.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn shared_conv_output_is_not_folded() {
        let mut g = conv_bn_net(true);
        let conv = g.find("conv").unwrap().id;
        let extra = g
            .add_node("side", Op::Activation(Activation::Relu), vec![conv])
            .unwrap();
        g.outputs.push(extra);
        assert!(find_conv_bn_pairs(&g).is_empty());
        assert!(fold_batch_norms(&mut g).unwrap().is_empty());
    }

    #[test]
    fn double_attach_keeps_first() {
        let mut table = BatchNormTable::new();
        let first = BnAffine {
            weight: array![1.0],
            bias: array![2.0],
        };
        let second = BnAffine {
            weight: array![9.0],
            bias: array![9.0],
        };
        assert!(table.attach("conv", first.clone()));
        assert!(!table.attach("conv", second));
        assert_eq!(table.get("conv"), Some(&first));
    }

    #[test]
    fn rescale_divides() {
        let mut table = BatchNormTable::new();
        table.attach(
            "conv",
            BnAffine {
                weight: array![2.0, -4.0],
                bias: array![1.0, 8.0],
            },
        );
        table.rescale("conv", &array![2.0, 4.0]);
        table.rescale("missing", &array![2.0, 4.0]);
        let affine = table.get("conv").unwrap();
        assert_eq!(affine.weight, array![1.0, -1.0]);
        assert_eq!(affine.bias, array![0.5, 2.0]);
        table.clear();
        assert!(table.is_empty());
    }
}

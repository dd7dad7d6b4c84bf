//! Reference CPU executor.
//!
//! Straightforward NCHW f32 evaluation of a [`ComputeGraph`], used to
//! trace example inputs, collect calibration statistics and check that
//! graph transformations preserve the network function.

use ndarray::{Array4, Axis, Zip, concatenate, s};

use crate::error::IrError;
use crate::graph::{ComputeGraph, Node};
use crate::layer::{BatchNorm2d, Conv2d, Op, Pool2d};

/// Run the graph on a single input and return its single output.
pub fn forward(graph: &ComputeGraph, input: &Array4<f32>) -> Result<Array4<f32>, IrError> {
    let inputs = graph.input_ids();
    if inputs.len() != 1 || graph.outputs.len() != 1 {
        return Err(IrError::UnsupportedSignature {
            inputs: inputs.len(),
            outputs: graph.outputs.len(),
        });
    }
    let mut values = forward_all(graph, input)?;
    let out = graph.outputs[0];
    values[out.index()]
        .take()
        .ok_or_else(|| IrError::BadNode {
            id: out,
            size: graph.node_count(),
        })
}

/// Run the graph and return every node's activation, indexed by
/// [`NodeId::index`](crate::graph::NodeId::index).
///
/// Every [`Op::Input`] node receives `input`.
pub fn forward_all(
    graph: &ComputeGraph,
    input: &Array4<f32>,
) -> Result<Vec<Option<Array4<f32>>>, IrError> {
    let order = graph.topological_order()?;
    let mut values: Vec<Option<Array4<f32>>> = vec![None; graph.node_count()];

    for id in order {
        let node = graph.node(id)?;
        let args: Vec<&Array4<f32>> = node
            .inputs
            .iter()
            .map(|i| {
                values[i.index()].as_ref().ok_or_else(|| IrError::ShapeMismatch {
                    node: node.name.clone(),
                    detail: format!("input {i:?} was not computed"),
                })
            })
            .collect::<Result<_, _>>()?;
        let out = eval(node, &args, input)?;
        values[id.index()] = Some(out);
    }
    Ok(values)
}

fn eval(node: &Node, args: &[&Array4<f32>], input: &Array4<f32>) -> Result<Array4<f32>, IrError> {
    let unary = || {
        args.first().copied().ok_or_else(|| IrError::ShapeMismatch {
            node: node.name.clone(),
            detail: "missing input".into(),
        })
    };

    match &node.op {
        Op::Input => Ok(input.clone()),
        Op::Conv2d(conv) => conv2d(&node.name, conv, unary()?),
        Op::BatchNorm2d(bn) => batch_norm(&node.name, bn, unary()?),
        Op::Activation(act) => {
            let mut out = unary()?.clone();
            for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
                plane.mapv_inplace(|v| act.apply(v, c));
            }
            Ok(out)
        }
        Op::Add => {
            let mut out = unary()?.clone();
            for other in &args[1..] {
                if other.shape() != out.shape() {
                    return Err(IrError::ShapeMismatch {
                        node: node.name.clone(),
                        detail: format!("add {:?} + {:?}", out.shape(), other.shape()),
                    });
                }
                out += *other;
            }
            Ok(out)
        }
        Op::Concat => {
            let views: Vec<_> = args.iter().map(|a| a.view()).collect();
            concatenate(Axis(1), &views).map_err(|e| IrError::ShapeMismatch {
                node: node.name.clone(),
                detail: e.to_string(),
            })
        }
        Op::MaxPool2d(pool) => Ok(pool2d(pool, unary()?, |w| {
            w.iter().copied().fold(f32::NEG_INFINITY, f32::max)
        })),
        Op::AvgPool2d(pool) => Ok(pool2d(pool, unary()?, |w| {
            w.iter().sum::<f32>() / w.len() as f32
        })),
    }
}

/// Grouped 2D convolution with zero padding.
pub fn conv2d(name: &str, conv: &Conv2d, x: &Array4<f32>) -> Result<Array4<f32>, IrError> {
    let (n, c_in, h, w) = x.dim();
    let (c_out, c_per_group, kh, kw) = conv.weight.dim();
    let groups = conv.groups.max(1);
    let stride = conv.stride.max(1);
    let pad = conv.padding;

    if c_in != c_per_group * groups || c_out % groups != 0 {
        return Err(IrError::ShapeMismatch {
            node: name.to_string(),
            detail: format!(
                "input has {c_in} channels, weight {:?} with {groups} groups",
                conv.weight.shape()
            ),
        });
    }
    if h + 2 * pad < kh || w + 2 * pad < kw {
        return Err(IrError::ShapeMismatch {
            node: name.to_string(),
            detail: format!("kernel {kh}x{kw} larger than padded input {h}x{w}"),
        });
    }

    let out_h = (h + 2 * pad - kh) / stride + 1;
    let out_w = (w + 2 * pad - kw) / stride + 1;
    let out_per_group = c_out / groups;

    let mut padded = Array4::<f32>::zeros((n, c_in, h + 2 * pad, w + 2 * pad));
    padded
        .slice_mut(s![.., .., pad..pad + h, pad..pad + w])
        .assign(x);

    let mut out = Array4::<f32>::zeros((n, c_out, out_h, out_w));
    for b in 0..n {
        for oc in 0..c_out {
            let g = oc / out_per_group;
            let kernel = conv.weight.index_axis(Axis(0), oc);
            let bias = conv.bias.as_ref().map_or(0.0, |bias| bias[oc]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let (y0, x0) = (oy * stride, ox * stride);
                    let window = padded.slice(s![
                        b,
                        g * c_per_group..(g + 1) * c_per_group,
                        y0..y0 + kh,
                        x0..x0 + kw
                    ]);
                    let acc = Zip::from(&window)
                        .and(&kernel)
                        .fold(0.0f32, |acc, &v, &k| acc + v * k);
                    out[[b, oc, oy, ox]] = acc + bias;
                }
            }
        }
    }
    Ok(out)
}

fn batch_norm(name: &str, bn: &BatchNorm2d, x: &Array4<f32>) -> Result<Array4<f32>, IrError> {
    if x.shape()[1] != bn.num_features() {
        return Err(IrError::ShapeMismatch {
            node: name.to_string(),
            detail: format!(
                "input has {} channels, batch norm has {}",
                x.shape()[1],
                bn.num_features()
            ),
        });
    }
    let mut out = x.clone();
    for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let scale = bn.weight[c] / (bn.running_var[c] + bn.eps).sqrt();
        let shift = bn.bias[c] - bn.running_mean[c] * scale;
        plane.mapv_inplace(|v| v * scale + shift);
    }
    Ok(out)
}

fn pool2d(
    pool: &Pool2d,
    x: &Array4<f32>,
    reduce: impl Fn(ndarray::ArrayView2<f32>) -> f32,
) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let k = pool.kernel.clamp(1, h.min(w).max(1));
    let stride = pool.stride.max(1);
    let out_h = (h - k) / stride + 1;
    let out_w = (w - k) / stride + 1;

    let mut out = Array4::<f32>::zeros((n, c, out_h, out_w));
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let (y0, x0) = (oy * stride, ox * stride);
                    out[[b, ch, oy, ox]] = reduce(x.slice(s![b, ch, y0..y0 + k, x0..x0 + k]));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ComputeGraph;
    use crate::layer::Activation;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn conv_single_channel() {
        // 3x3 input, 2x2 all-ones kernel, bias 1.
        let x = Array4::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f32).collect()).unwrap();
        let conv = Conv2d::new(Array4::ones((1, 1, 2, 2)), Some(array![1.0]));
        let y = conv2d("c", &conv, &x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y[[0, 0, 0, 0]], 1.0 + 2.0 + 4.0 + 5.0 + 1.0);
        assert_eq!(y[[0, 0, 1, 1]], 5.0 + 6.0 + 8.0 + 9.0 + 1.0);
    }

    #[test]
    fn conv_padding_and_stride() {
        let x = Array4::ones((1, 1, 4, 4));
        let conv = Conv2d::new(Array4::ones((1, 1, 3, 3)), None).with_geometry(2, 1);
        let y = conv2d("c", &conv, &x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // Top-left window overlaps the padding on two sides.
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn depthwise_conv_keeps_channels_apart() {
        let mut x = Array4::zeros((1, 2, 1, 1));
        x[[0, 0, 0, 0]] = 3.0;
        x[[0, 1, 0, 0]] = 5.0;
        let mut weight = Array4::zeros((2, 1, 1, 1));
        weight[[0, 0, 0, 0]] = 2.0;
        weight[[1, 0, 0, 0]] = -1.0;
        let conv = Conv2d::new(weight, None).with_groups(2);
        let y = conv2d("dw", &conv, &x).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 6.0);
        assert_eq!(y[[0, 1, 0, 0]], -5.0);
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let x = Array4::ones((1, 3, 4, 4));
        let conv = Conv2d::new(Array4::ones((2, 2, 1, 1)), None);
        assert!(matches!(
            conv2d("c", &conv, &x),
            Err(IrError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn batch_norm_inference() {
        let bn = BatchNorm2d {
            weight: array![2.0],
            bias: array![1.0],
            running_mean: array![3.0],
            running_var: array![4.0],
            eps: 0.0,
        };
        let x = Array4::from_elem((1, 1, 1, 1), 5.0);
        let y = batch_norm("bn", &bn, &x).unwrap();
        // (5 - 3) / 2 * 2 + 1
        assert_abs_diff_eq!(y[[0, 0, 0, 0]], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn forward_through_graph() {
        let mut g = ComputeGraph::new("net");
        let x = g.add_node("x", Op::Input, vec![]).unwrap();
        let c = g
            .add_node(
                "conv",
                Op::Conv2d(Conv2d::new(
                    Array4::from_elem((2, 1, 1, 1), -1.0),
                    Some(Array1::from_vec(vec![0.0, 10.0])),
                )),
                vec![x],
            )
            .unwrap();
        let r = g
            .add_node("relu", Op::Activation(Activation::Relu), vec![c])
            .unwrap();
        let p = g
            .add_node(
                "pool",
                Op::AvgPool2d(Pool2d {
                    kernel: 2,
                    stride: 2,
                }),
                vec![r],
            )
            .unwrap();
        g.outputs = vec![p];

        let input = Array4::from_elem((1, 1, 2, 2), 4.0);
        let y = forward(&g, &input).unwrap();
        assert_eq!(y.shape(), &[1, 2, 1, 1]);
        assert_eq!(y[[0, 0, 0, 0]], 0.0);
        assert_eq!(y[[0, 1, 0, 0]], 6.0);
    }

    #[test]
    fn forward_requires_single_output() {
        let mut g = ComputeGraph::new("net");
        g.add_node("x", Op::Input, vec![]).unwrap();
        let input = Array4::zeros((1, 1, 1, 1));
        assert!(matches!(
            forward(&g, &input),
            Err(IrError::UnsupportedSignature { outputs: 0, .. })
        ));
    }
}

//! Cross-layer equalization.
//!
//! Rescales the output channels of one convolution and the matching input
//! channels of the next so that both see comparable per-channel weight
//! ranges (Nagel et al., "Data-Free Quantization Through Weight
//! Equalization and Bias Correction", 2019). With a positive-homogeneous
//! activation between the layers the composed function is unchanged.
//!
//! Ranges and scale factors are computed in f64.

use leveler_ir::{ComputeGraph, Op};
use ndarray::{Array1, Array4, Axis, Zip};

use crate::bn_fold::BatchNormTable;
use crate::error::CleError;
use crate::groups::{GroupShape, LayerGroup, find_layer_groups};

/// Default stability threshold for three-layer scaling.
pub const DEFAULT_THRESHOLD: f64 = 1000.0;

/// Maximum absolute weight per channel along `axis`.
///
/// `Axis(0)` gives output-channel ranges, `Axis(1)` input-channel ranges.
pub fn channel_ranges(weight: &Array4<f32>, axis: Axis) -> Array1<f64> {
    weight
        .axis_iter(axis)
        .map(|lane| lane.fold(0.0f32, |m, &v| m.max(v.abs())) as f64)
        .collect()
}

/// `s = r1 / sqrt(r1 * r2)` per channel.
///
/// Channels where either range is zero keep a scale of 1.
pub fn pair_scales(r1: &Array1<f64>, r2: &Array1<f64>) -> Array1<f64> {
    Zip::from(r1).and(r2).map_collect(|&a, &b| {
        if a > 0.0 && b > 0.0 {
            a / (a * b).sqrt()
        } else {
            1.0
        }
    })
}

/// Geometric-mean scales for conv -> depthwise conv -> conv.
///
/// `s1 = r1 / cbrt(r1 r2 r3)` and `s2 = cbrt(r1 r2 r3) / r3`. Channels
/// where `s1 / s2` exceeds `threshold`, or any range is zero, are reset
/// to `s1 = s2 = 1`.
pub fn triple_scales(
    r1: &Array1<f64>,
    r2: &Array1<f64>,
    r3: &Array1<f64>,
    threshold: f64,
) -> (Array1<f64>, Array1<f64>) {
    let mut s1 = Array1::ones(r1.len());
    let mut s2 = Array1::ones(r1.len());

    Zip::from(&mut s1)
        .and(&mut s2)
        .and(r1)
        .and(r2)
        .and(r3)
        .for_each(|s1, s2, &a, &b, &c| {
            if a <= 0.0 || b <= 0.0 || c <= 0.0 {
                return;
            }
            let g = (a * c * b).cbrt();
            let (t1, t2) = (a / g, g / c);
            if t1 / t2 > threshold {
                log::debug!("scale ratio {:.1} above threshold, channel left unscaled", t1 / t2);
                return;
            }
            *s1 = t1;
            *s2 = t2;
        });

    (s1, s2)
}

fn divide_channels(weight: &mut Array4<f32>, axis: Axis, scale: &Array1<f64>) {
    for (mut lane, &s) in weight.axis_iter_mut(axis).zip(scale) {
        lane.mapv_inplace(|v| (v as f64 / s) as f32);
    }
}

fn multiply_channels(weight: &mut Array4<f32>, axis: Axis, scale: &Array1<f64>) {
    for (mut lane, &s) in weight.axis_iter_mut(axis).zip(scale) {
        lane.mapv_inplace(|v| (v as f64 * s) as f32);
    }
}

fn divide_bias(bias: Option<&mut Array1<f32>>, scale: &Array1<f64>) {
    if let Some(bias) = bias {
        Zip::from(bias)
            .and(scale)
            .for_each(|b, &s| *b = (*b as f64 / s) as f32);
    }
}

/// Equalize `conv1 -> conv2` in place and return the scale factors.
///
/// `weight1[c] /= s[c]`, `bias1[c] /= s[c]`, `weight2[:, c] *= s[c]`.
pub fn equalize_pair(
    weight1: &mut Array4<f32>,
    bias1: Option<&mut Array1<f32>>,
    weight2: &mut Array4<f32>,
) -> Array1<f64> {
    let r1 = channel_ranges(weight1, Axis(0));
    let r2 = channel_ranges(weight2, Axis(1));
    let s = pair_scales(&r1, &r2);

    divide_channels(weight1, Axis(0), &s);
    divide_bias(bias1, &s);
    multiply_channels(weight2, Axis(1), &s);
    s
}

/// Equalize `conv1 -> depthwise conv2 -> conv3` in place and return
/// `(s1, s2)`.
pub fn equalize_triple(
    weight1: &mut Array4<f32>,
    bias1: Option<&mut Array1<f32>>,
    weight2: &mut Array4<f32>,
    bias2: Option<&mut Array1<f32>>,
    weight3: &mut Array4<f32>,
    threshold: f64,
) -> (Array1<f64>, Array1<f64>) {
    let r1 = channel_ranges(weight1, Axis(0));
    let r2 = channel_ranges(weight2, Axis(0));
    let r3 = channel_ranges(weight3, Axis(1));
    let (s1, s2) = triple_scales(&r1, &r2, &r3, threshold);

    divide_channels(weight1, Axis(0), &s1);
    divide_bias(bias1, &s1);
    let middle = Zip::from(&s1).and(&s2).map_collect(|&a, &b| a / b);
    multiply_channels(weight2, Axis(0), &middle);
    divide_bias(bias2, &s2);
    multiply_channels(weight3, Axis(1), &s2);
    (s1, s2)
}

fn check_channels(
    graph: &ComputeGraph,
    group: &LayerGroup,
    producer: usize,
    expected: usize,
) -> Result<(), CleError> {
    let conv = graph.conv(group.members[producer].node)?;
    if conv.out_channels() != expected {
        return Err(CleError::ChannelMismatch {
            producer: group.members[producer].name.clone(),
            consumer: group.members[producer + 1].name.clone(),
            produced: conv.out_channels(),
            expected,
        });
    }
    Ok(())
}

/// Equalize one group in place, co-scaling any attached batch-norm.
///
/// Returns `false` if the group was skipped.
pub fn equalize_group(
    graph: &mut ComputeGraph,
    group: &LayerGroup,
    bn_table: &mut BatchNormTable,
    threshold: f64,
) -> Result<bool, CleError> {
    match group.members.as_slice() {
        [a, b] => {
            if !graph.conv(b.node)?.is_normal() {
                log::warn!("group {group}: second layer is not a normal conv, skipping");
                return Ok(false);
            }
            check_channels(graph, group, 0, graph.conv(b.node)?.in_channels())?;

            let [conv1, conv2] = graph.convs_mut([a.node, b.node])?;
            let s = equalize_pair(&mut conv1.weight, conv1.bias.as_mut(), &mut conv2.weight);
            bn_table.rescale(&a.name, &s);
        }
        [a, b, c] => {
            let structural = group.shape() == Some(GroupShape::ConvDepthwiseConv)
                && graph.conv(a.node)?.is_normal()
                && graph.conv(b.node)?.is_depthwise()
                && graph.conv(c.node)?.is_normal();
            if !structural {
                return Err(CleError::MalformedGroup {
                    names: group.names().into_iter().map(String::from).collect(),
                });
            }
            check_channels(graph, group, 0, graph.conv(b.node)?.out_channels())?;
            check_channels(graph, group, 1, graph.conv(c.node)?.in_channels())?;

            let [conv1, conv2, conv3] = graph.convs_mut([a.node, b.node, c.node])?;
            let (s1, s2) = equalize_triple(
                &mut conv1.weight,
                conv1.bias.as_mut(),
                &mut conv2.weight,
                conv2.bias.as_mut(),
                &mut conv3.weight,
                threshold,
            );
            bn_table.rescale(&a.name, &s1);
            bn_table.rescale(&b.name, &s2);
        }
        members => {
            log::warn!(
                "group of {} layers is not supported, skipping {group}",
                members.len()
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Max |weight| and max bias of every convolution, keyed by parameter name.
fn parameter_ranges(graph: &ComputeGraph) -> Vec<(String, f32)> {
    let mut out = Vec::new();
    for node in graph.nodes() {
        let Op::Conv2d(conv) = &node.op else {
            continue;
        };
        let w = conv.weight.fold(0.0f32, |m, &v| m.max(v.abs()));
        out.push((format!("{}.weight", node.name), w));
        if let Some(bias) = &conv.bias {
            let b = bias.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            out.push((format!("{}.bias", node.name), b));
        }
    }
    out
}

/// Run one equalization pass over the whole graph.
///
/// Groups are rediscovered from the current graph state. Returns the
/// groups that were found.
pub fn cross_layer_equalize_once(
    graph: &mut ComputeGraph,
    bn_table: &mut BatchNormTable,
    threshold: f64,
) -> Result<Vec<LayerGroup>, CleError> {
    let before = parameter_ranges(graph);
    let groups = find_layer_groups(graph)?;

    for group in &groups {
        match group.shape() {
            Some(shape) => log::info!("{shape} group {group}"),
            None => log::info!("unclassified group {group}"),
        }
        equalize_group(graph, group, bn_table, threshold)?;
    }

    for ((name, old), (_, new)) in before.iter().zip(parameter_ranges(graph)) {
        if *old != new {
            log::info!("{name}: {old:.5} -> {new:.5}");
        }
    }
    Ok(groups)
}

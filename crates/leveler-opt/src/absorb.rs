//! High-bias absorption.
//!
//! Equalization can leave a producer with large per-channel biases. When
//! batch-norm statistics show that a channel's pre-activation value stays
//! above some `c >= 0`, the following ReLU-like activation acts as the
//! identity on that channel, so `c` can be moved out of the producer's bias
//! and into the consumer's bias through the consumer's weights.
//!
//! Corrections are computed from the equalized `working` graph and written
//! into a separate `origin` snapshot, which becomes the result.

use leveler_ir::{ComputeGraph, Conv2d};
use ndarray::{Array1, Array2, Axis, Zip};

use crate::bn_fold::{BatchNormTable, BnAffine};
use crate::error::CleError;
use crate::groups::{GroupMember, LayerGroup};
use crate::restore::{BnRestorer, conv_names};

/// Number of standard deviations below the mean considered safe.
const SIGMAS: f32 = 3.0;

/// `max(0, mean - 3 * std)` per channel.
pub fn absorbable_bias(stats: &BnAffine) -> Array1<f32> {
    Zip::from(&stats.bias)
        .and(&stats.weight)
        .map_collect(|&mean, &std| (mean - SIGMAS * std.abs()).max(0.0))
}

/// Consumer weights summed over the kernel window, `[out, in/groups]`.
fn reduced_weight(conv: &Conv2d) -> Array2<f32> {
    conv.weight.sum_axis(Axis(3)).sum_axis(Axis(2))
}

/// Absorb the producer's high bias into the consumer.
///
/// Returns `false` if the pair was skipped because a bias or the
/// producer's statistics are missing.
pub fn absorb_pair(
    working: &ComputeGraph,
    origin: &mut ComputeGraph,
    producer: &GroupMember,
    consumer: &GroupMember,
    stats: &BatchNormTable,
) -> Result<bool, CleError> {
    let pre = working.conv(producer.node)?;
    let cur = working.conv(consumer.node)?;
    let (Some(_), Some(cur_bias)) = (&pre.bias, &cur.bias) else {
        log::debug!(
            "'{}' -> '{}' lacks a bias, skipping absorption",
            producer.name,
            consumer.name
        );
        return Ok(false);
    };
    let Some(bn) = stats.get(&producer.name) else {
        log::info!(
            "'{}' has no batch-norm statistics, skipping absorption into '{}'",
            producer.name,
            consumer.name
        );
        return Ok(false);
    };

    let c = absorbable_bias(bn);
    let consumer_channels = if cur.is_depthwise() {
        cur.out_channels()
    } else {
        cur.in_channels()
    };
    if c.len() != pre.out_channels() || c.len() != consumer_channels {
        return Err(CleError::ChannelMismatch {
            producer: producer.name.clone(),
            consumer: consumer.name.clone(),
            produced: c.len(),
            expected: consumer_channels,
        });
    }

    let reduced = reduced_weight(cur);
    let correction: Array1<f32> = if cur.is_depthwise() {
        &reduced.column(0) * &c
    } else {
        reduced.dot(&c)
    };

    let origin_pre = origin_conv(origin, &producer.name)?;
    if let Some(bias) = origin_pre.bias.as_mut() {
        let before = max_of(bias);
        *bias -= &c;
        let after = max_of(bias);
        if before != after {
            log::info!("{}.bias: {before:.5} -> {after:.5}", producer.name);
        }
    }
    let origin_cur = origin_conv(origin, &consumer.name)?;
    origin_cur.bias = Some(cur_bias + &correction);
    Ok(true)
}

fn max_of(values: &Array1<f32>) -> f32 {
    values.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
}

fn origin_conv<'a>(origin: &'a mut ComputeGraph, name: &str) -> Result<&'a mut Conv2d, CleError> {
    let id = origin
        .find(name)
        .ok_or_else(|| leveler_ir::IrError::NotAConv {
            name: name.to_string(),
            found: "missing node",
        })?
        .id;
    Ok(origin.conv_mut(id)?)
}

/// Absorb high biases along every group of the equalized graph.
///
/// Returns the updated snapshot; `working` itself is left untouched.
pub fn high_bias_absorb(
    working: &ComputeGraph,
    groups: &[LayerGroup],
    stats: &BatchNormTable,
) -> Result<ComputeGraph, CleError> {
    let mut origin = working.clone();
    let mut absorbed = 0usize;

    for group in groups {
        if !(2..=3).contains(&group.members.len()) {
            log::warn!(
                "group of {} layers is not supported, skipping {group}",
                group.members.len()
            );
            continue;
        }
        for pair in group.members.windows(2) {
            if absorb_pair(working, &mut origin, &pair[0], &pair[1], stats)? {
                absorbed += 1;
            }
        }
    }

    log::info!("high bias absorption updated {absorbed} layer pair(s)");
    Ok(origin)
}

/// Absorb high biases using statistics recovered by `restorer`.
///
/// `convs` limits which convolutions are measured; by default every
/// convolution in the graph is.
pub fn high_bias_absorb_with_restorer(
    working: &ComputeGraph,
    groups: &[LayerGroup],
    restorer: &dyn BnRestorer,
    convs: Option<&[String]>,
) -> Result<ComputeGraph, CleError> {
    let names = match convs {
        Some(names) => names.to_vec(),
        None => conv_names(working),
    };
    let stats = restorer.restore(working, &names)?;
    high_bias_absorb(working, groups, &stats)
}

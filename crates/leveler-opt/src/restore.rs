//! Batch-norm restoration from calibration data.
//!
//! High-bias absorption needs a mean and standard deviation estimate of
//! each producer's pre-activation output. Models trained with batch-norm
//! carry them in the folded batch-norm; for other models they can be
//! measured by running the network over a few calibration inputs.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use leveler_ir::{ComputeGraph, IrError, Op, exec};
use ndarray::{Array1, Array4, Axis};

use crate::bn_fold::{BatchNormTable, BnAffine};
use crate::error::CleError;

/// Variance floor added before taking the square root.
const VAR_EPS: f64 = 1e-5;

/// Errors that can occur while loading calibration data.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Failed to read a calibration data file.
    #[error("failed to read calibration data {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A calibration file does not hold exactly one f32 tensor of the
    /// requested shape.
    #[error("calibration file {path} is {bytes} bytes, shape {shape:?} needs {expected}")]
    SampleShape {
        path: PathBuf,
        bytes: usize,
        shape: [usize; 4],
        expected: usize,
    },
    /// No calibration samples found in the directory.
    #[error("no .bin calibration files found in {0}")]
    NoSamples(PathBuf),
    /// The restorer was built without samples.
    #[error("no calibration samples to collect statistics from")]
    Empty,
}

/// Recovers batch-norm statistics for a set of convolutions.
pub trait BnRestorer: Debug {
    /// Estimate per-channel `(mean, std)` of each named convolution's
    /// output, returned as `BnAffine { bias: mean, weight: std }`.
    fn restore(&self, graph: &ComputeGraph, convs: &[String]) -> Result<BatchNormTable, CleError>;
}

/// Measures convolution output statistics over calibration inputs.
#[derive(Clone, Debug)]
pub struct CalibrationRestorer {
    samples: Vec<Array4<f32>>,
}

impl CalibrationRestorer {
    pub fn new(samples: Vec<Array4<f32>>) -> Self {
        Self { samples }
    }

    /// Load calibration inputs from a directory of `.bin` files.
    ///
    /// Each file holds one tensor of `shape` as raw little-endian f32
    /// values. Files are taken in name order.
    pub fn load_from_dir(dir: &Path, shape: [usize; 4]) -> Result<Self, CalibrationError> {
        let mut files = std::fs::read_dir(dir)
            .map_err(io_error(dir))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error(dir))?;
        files.retain(|path| path.extension().is_some_and(|ext| ext == "bin"));
        files.sort();
        if files.is_empty() {
            return Err(CalibrationError::NoSamples(dir.to_path_buf()));
        }

        let samples = files
            .iter()
            .map(|path| {
                let data = std::fs::read(path).map_err(io_error(path))?;
                read_sample(path, &data, shape)
            })
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("loaded {} calibration sample(s) from {}", samples.len(), dir.display());
        Ok(Self { samples })
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CalibrationError {
    let path = path.to_path_buf();
    move |source| CalibrationError::Io { path, source }
}

fn read_sample(path: &Path, data: &[u8], shape: [usize; 4]) -> Result<Array4<f32>, CalibrationError> {
    let expected = shape.iter().product::<usize>() * size_of::<f32>();
    let mismatch = || CalibrationError::SampleShape {
        path: path.to_path_buf(),
        bytes: data.len(),
        shape,
        expected,
    };
    if data.len() != expected {
        return Err(mismatch());
    }
    let values = data
        .chunks_exact(size_of::<f32>())
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array4::from_shape_vec(shape, values).map_err(|_| mismatch())
}

/// Running per-channel first and second moments.
struct Moments {
    sum: Array1<f64>,
    sum_sq: Array1<f64>,
    count: usize,
}

impl Moments {
    fn new(channels: usize) -> Self {
        Self {
            sum: Array1::zeros(channels),
            sum_sq: Array1::zeros(channels),
            count: 0,
        }
    }

    fn add(&mut self, activation: &Array4<f32>) {
        for (c, plane) in activation.axis_iter(Axis(1)).enumerate() {
            for &v in plane.iter() {
                let v = v as f64;
                self.sum[c] += v;
                self.sum_sq[c] += v * v;
            }
        }
        self.count += activation.len() / activation.shape()[1].max(1);
    }

    fn finish(&self) -> BnAffine {
        let n = self.count.max(1) as f64;
        let mean = self.sum.mapv(|s| s / n);
        let std = ndarray::Zip::from(&self.sum_sq)
            .and(&mean)
            .map_collect(|&sq, &m| ((sq / n - m * m).max(0.0) + VAR_EPS).sqrt());
        BnAffine {
            weight: std.mapv(|v| v as f32),
            bias: mean.mapv(|v| v as f32),
        }
    }
}

impl BnRestorer for CalibrationRestorer {
    fn restore(&self, graph: &ComputeGraph, convs: &[String]) -> Result<BatchNormTable, CleError> {
        if self.samples.is_empty() {
            return Err(CalibrationError::Empty.into());
        }

        let mut targets = Vec::with_capacity(convs.len());
        for name in convs {
            let node = graph.find(name).ok_or_else(|| IrError::NotAConv {
                name: name.clone(),
                found: "missing node",
            })?;
            let conv = graph.conv(node.id)?;
            targets.push((node.id, Moments::new(conv.out_channels())));
        }

        for sample in &self.samples {
            let values = exec::forward_all(graph, sample)?;
            for (id, moments) in &mut targets {
                if let Some(activation) = &values[id.index()] {
                    moments.add(activation);
                }
            }
        }

        let mut table = BatchNormTable::new();
        for ((_, moments), name) in targets.iter().zip(convs) {
            table.attach(name, moments.finish());
        }
        log::info!(
            "restored batch-norm statistics for {} conv(s) from {} sample(s)",
            table.len(),
            self.samples.len()
        );
        Ok(table)
    }
}

/// Names of every convolution in the graph, in arena order.
pub fn conv_names(graph: &ComputeGraph) -> Vec<String> {
    graph
        .nodes()
        .iter()
        .filter(|n| matches!(n.op, Op::Conv2d(_)))
        .map(|n| n.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use leveler_ir::Conv2d;
    use ndarray::array;

    fn scale_net() -> ComputeGraph {
        // 1x1 conv: channel 0 = 2x + 1, channel 1 = -x.
        let mut g = ComputeGraph::new("net");
        let x = g.add_node("x", Op::Input, vec![]).unwrap();
        let weight = Array4::from_shape_vec((2, 1, 1, 1), vec![2.0, -1.0]).unwrap();
        let c = g
            .add_node(
                "conv",
                Op::Conv2d(Conv2d::new(weight, Some(array![1.0, 0.0]))),
                vec![x],
            )
            .unwrap();
        g.outputs = vec![c];
        g
    }

    #[test]
    fn restores_mean_and_std() {
        let g = scale_net();
        // Inputs 1, 2, 3, 4 over two samples.
        let samples = vec![
            Array4::from_shape_vec((1, 1, 1, 2), vec![1.0, 2.0]).unwrap(),
            Array4::from_shape_vec((1, 1, 1, 2), vec![3.0, 4.0]).unwrap(),
        ];
        let table = CalibrationRestorer::new(samples)
            .restore(&g, &conv_names(&g))
            .unwrap();
        let stats = table.get("conv").unwrap();

        // Channel 0 sees 3, 5, 7, 9; channel 1 sees -1, -2, -3, -4.
        assert_relative_eq!(stats.bias[0], 6.0, max_relative = 1e-6);
        assert_relative_eq!(stats.bias[1], -2.5, max_relative = 1e-6);
        assert_relative_eq!(stats.weight[0], (5.0f32 + 1e-5).sqrt(), max_relative = 1e-5);
        assert_relative_eq!(stats.weight[1], (1.25f32 + 1e-5).sqrt(), max_relative = 1e-5);
    }

    #[test]
    fn unknown_conv_is_an_error() {
        let g = scale_net();
        let restorer = CalibrationRestorer::new(vec![Array4::zeros((1, 1, 1, 1))]);
        let err = restorer.restore(&g, &["nope".to_string()]).unwrap_err();
        assert!(matches!(err, CleError::Ir(IrError::NotAConv { .. })));
    }

    #[test]
    fn no_samples_is_an_error() {
        let g = scale_net();
        let err = CalibrationRestorer::new(Vec::new())
            .restore(&g, &conv_names(&g))
            .unwrap_err();
        assert!(matches!(err, CleError::Calibration(CalibrationError::Empty)));
    }

    #[test]
    fn load_from_dir_sorted_and_shaped() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, values: &[f32]| {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            std::fs::write(dir.path().join(name), bytes).unwrap();
        };
        write("b.bin", &[3.0, 4.0]);
        write("a.bin", &[1.0, 2.0]);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let restorer = CalibrationRestorer::load_from_dir(dir.path(), [1, 1, 1, 2]).unwrap();
        assert_eq!(restorer.samples.len(), 2);
        assert_eq!(restorer.samples[0][[0, 0, 0, 0]], 1.0);
        assert_eq!(restorer.samples[1][[0, 0, 0, 1]], 4.0);
    }

    #[test]
    fn load_from_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CalibrationRestorer::load_from_dir(dir.path(), [1, 1, 1, 1]),
            Err(CalibrationError::NoSamples(_))
        ));

        assert!(matches!(
            CalibrationRestorer::load_from_dir(&dir.path().join("missing"), [1, 1, 1, 1]),
            Err(CalibrationError::Io { .. })
        ));

        for bytes in [6, 8] {
            std::fs::write(dir.path().join("odd.bin"), vec![0u8; bytes]).unwrap();
            let err = CalibrationRestorer::load_from_dir(dir.path(), [1, 1, 1, 1]).unwrap_err();
            assert!(matches!(
                err,
                CalibrationError::SampleShape { expected: 4, .. }
            ));
        }
    }
}

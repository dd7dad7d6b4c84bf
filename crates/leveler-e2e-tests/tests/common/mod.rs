use leveler_ir::{Activation, BatchNorm2d, ComputeGraph, Conv2d, NodeId, Op, Pool2d};
use ndarray::{Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Builds sequential test networks with seeded random parameters.
pub struct NetBuilder {
    graph: ComputeGraph,
    rng: StdRng,
    last: NodeId,
    channels: usize,
}

#[allow(dead_code)]
impl NetBuilder {
    pub fn new(name: &str, in_channels: usize, seed: u64) -> Self {
        let mut graph = ComputeGraph::new(name);
        let last = graph.add_node("x", Op::Input, vec![]).expect("add input");
        Self {
            graph,
            rng: StdRng::seed_from_u64(seed),
            last,
            channels: in_channels,
        }
    }

    pub fn last(&self) -> NodeId {
        self.last
    }

    fn push(&mut self, name: &str, op: Op, inputs: Vec<NodeId>) -> NodeId {
        self.last = self
            .graph
            .add_node(name, op, inputs)
            .unwrap_or_else(|e| panic!("failed to add '{name}': {e}"));
        self.last
    }

    /// Normal conv with `same` padding and weights in `[-amp, amp)`.
    pub fn conv(mut self, name: &str, out: usize, kernel: usize, amp: f32) -> Self {
        let weight = random(&mut self.rng, (out, self.channels, kernel, kernel), amp);
        let bias = random_vec(&mut self.rng, out, 1.0);
        let conv = Conv2d::new(weight, Some(bias)).with_geometry(1, kernel / 2);
        self.channels = out;
        let input = self.last;
        self.push(name, Op::Conv2d(conv), vec![input]);
        self
    }

    pub fn depthwise(mut self, name: &str, kernel: usize, amp: f32) -> Self {
        let c = self.channels;
        let weight = random(&mut self.rng, (c, 1, kernel, kernel), amp);
        let bias = random_vec(&mut self.rng, c, 1.0);
        let conv = Conv2d::new(weight, Some(bias))
            .with_groups(c)
            .with_geometry(1, kernel / 2);
        let input = self.last;
        self.push(name, Op::Conv2d(conv), vec![input]);
        self
    }

    pub fn bn(mut self, name: &str) -> Self {
        let c = self.channels;
        let bn = BatchNorm2d {
            weight: Array1::from_shape_fn(c, |_| self.rng.gen_range(0.5..2.0)),
            bias: Array1::from_shape_fn(c, |_| self.rng.gen_range(-1.0..4.0)),
            running_mean: random_vec(&mut self.rng, c, 0.5),
            running_var: Array1::from_shape_fn(c, |_| self.rng.gen_range(0.5..2.0)),
            eps: 1e-5,
        };
        let input = self.last;
        self.push(name, Op::BatchNorm2d(bn), vec![input]);
        self
    }

    pub fn act(mut self, name: &str, act: Activation) -> Self {
        let input = self.last;
        self.push(name, Op::Activation(act), vec![input]);
        self
    }

    pub fn relu(self, name: &str) -> Self {
        self.act(name, Activation::Relu)
    }

    pub fn avg_pool(mut self, name: &str, kernel: usize) -> Self {
        let input = self.last;
        self.push(
            name,
            Op::AvgPool2d(Pool2d {
                kernel,
                stride: kernel,
            }),
            vec![input],
        );
        self
    }

    /// `last + skip`; `skip` must carry the same channel count.
    pub fn residual(mut self, name: &str, skip: NodeId) -> Self {
        let input = self.last;
        self.push(name, Op::Add, vec![input, skip]);
        self
    }

    pub fn finish(mut self) -> ComputeGraph {
        self.graph.outputs = vec![self.last];
        self.graph
    }
}

pub fn random(rng: &mut StdRng, shape: (usize, usize, usize, usize), amp: f32) -> Array4<f32> {
    Array4::from_shape_fn(shape, |_| rng.gen_range(-amp..amp))
}

pub fn random_vec(rng: &mut StdRng, n: usize, amp: f32) -> Array1<f32> {
    Array1::from_shape_fn(n, |_| rng.gen_range(-amp..amp))
}

#[allow(dead_code)]
pub fn random_input(seed: u64, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    random(&mut StdRng::seed_from_u64(seed), shape, 1.0)
}

/// Element-wise comparison with an absolute and relative tolerance.
#[allow(dead_code)]
pub fn assert_close(expected: &Array4<f32>, actual: &Array4<f32>, tol: f32) {
    assert_eq!(expected.shape(), actual.shape(), "shape mismatch");
    for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        assert!(
            approx::relative_eq!(e, a, epsilon = tol, max_relative = tol),
            "element {i}: expected {e}, got {a} (tolerance {tol})"
        );
    }
}

/// Per-channel max |w| along `axis` of the named convolution.
#[allow(dead_code)]
pub fn ranges(graph: &ComputeGraph, conv: &str, axis: usize) -> Vec<f32> {
    let conv = graph
        .find(conv)
        .and_then(|n| n.conv())
        .unwrap_or_else(|| panic!("no conv named '{conv}'"));
    conv.weight
        .axis_iter(Axis(axis))
        .map(|lane| lane.fold(0.0f32, |m, &v| m.max(v.abs())))
        .collect()
}

/// Largest bias value of the named convolution.
#[allow(dead_code)]
pub fn max_bias(graph: &ComputeGraph, conv: &str) -> f32 {
    graph
        .find(conv)
        .and_then(|n| n.conv())
        .and_then(|c| c.bias.as_ref())
        .map(|b| b.fold(f32::NEG_INFINITY, |m, &v| m.max(v)))
        .unwrap_or_else(|| panic!("conv '{conv}' has no bias"))
}

//! Surrogate gradient models.
//!
//! The attacks in this crate do not know the adversary's real recognition
//! model, so they ascend the loss surface of a stand-in: a small
//! randomly-initialized CNN built fresh for every run. Randomized surrogates
//! transfer surprisingly well for low-budget perturbations, and rebuilding
//! per run means repeated cloaking of the same photo never converges on one
//! model's quirks.
//!
//! Three architecture tiers trade gradient fidelity for compute, selected by
//! input size and used as fallback steps when a compute path faults. The
//! whole network is plain `ndarray` loops; after the initial downsampling
//! stage the spatial extent is small enough that this is not the bottleneck.

use ndarray::{Array1, Array2, Array3, Array4};

use crate::{
    num::softmax,
    tensor::{Tensor, TensorTracker},
    Result,
};

/// Number of output classes of the surrogate head. The value is arbitrary;
/// it only needs enough classes for the argmax to be unstable under
/// perturbation.
const NUM_CLASSES: usize = 16;

/// Surrogate architecture tiers, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Full-fidelity gradients, for images under 1 MP.
    Full,
    /// Mid-range, for 1-4 MP images.
    Medium,
    /// Heavily downsampled, for anything larger (and as the last fallback).
    Coarse,
}

impl ModelTier {
    /// Picks the tier appropriate for an image of `pixels` total pixels.
    pub fn for_pixel_count(pixels: u64) -> Self {
        if pixels > 4_000_000 {
            ModelTier::Coarse
        } else if pixels >= 1_000_000 {
            ModelTier::Medium
        } else {
            ModelTier::Full
        }
    }

    /// The next coarser tier, or `None` when already at the bottom.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ModelTier::Full => Some(ModelTier::Medium),
            ModelTier::Medium => Some(ModelTier::Coarse),
            ModelTier::Coarse => None,
        }
    }

    fn params(self) -> TierParams {
        match self {
            ModelTier::Full => TierParams {
                downsample: 4,
                conv1_channels: 8,
                conv2_channels: 16,
            },
            ModelTier::Medium => TierParams {
                downsample: 8,
                conv1_channels: 6,
                conv2_channels: 12,
            },
            ModelTier::Coarse => TierParams {
                downsample: 16,
                conv1_channels: 4,
                conv2_channels: 8,
            },
        }
    }
}

struct TierParams {
    downsample: usize,
    conv1_channels: usize,
    conv2_channels: usize,
}

/// Something that can compute a loss gradient with respect to an input image
/// tensor. The seam where surrogates (or test fakes) plug into the attacks.
pub trait GradientSource {
    fn tier(&self) -> ModelTier;

    /// Gradient of the surrogate's loss at `input`, same shape as `input`.
    ///
    /// Ascending this gradient moves the input away from whatever the
    /// surrogate currently believes about it.
    fn input_gradient(&self, input: &Tensor, tracker: &TensorTracker) -> Result<Tensor>;
}

/// Builds a [`GradientSource`] for a tier. Lets tests substitute faulty or
/// deterministic models for the real surrogate.
pub trait ModelFactory: Send {
    fn build(&self, tier: ModelTier, seed: u64) -> Result<Box<dyn GradientSource>>;
}

/// The default factory, producing [`SurrogateModel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrogateFactory;

impl ModelFactory for SurrogateFactory {
    fn build(&self, tier: ModelTier, seed: u64) -> Result<Box<dyn GradientSource>> {
        Ok(Box::new(SurrogateModel::new(tier, seed)))
    }
}

struct Conv {
    /// `(out, in, 3, 3)`.
    weight: Array4<f32>,
    bias: Array1<f32>,
}

/// A fixed-weight CNN: average-pool downsampling, two conv/ReLU/pool blocks,
/// global average pooling, and a dense classification head.
///
/// Weights are never trained. Only the gradient with respect to the *input*
/// is ever computed, which keeps the backward pass small.
pub struct SurrogateModel {
    tier: ModelTier,
    downsample: usize,
    conv1: Conv,
    conv2: Conv,
    dense_weight: Array2<f32>,
    dense_bias: Array1<f32>,
}

impl SurrogateModel {
    /// Builds a model with weights drawn deterministically from `seed`.
    pub fn new(tier: ModelTier, seed: u64) -> Self {
        let params = tier.params();
        let mut rng = fastrand::Rng::with_seed(seed);

        let uniform = |fan_in: usize| {
            let limit = (1.0 / fan_in as f32).sqrt();
            move |rng: &mut fastrand::Rng| (rng.f32() * 2.0 - 1.0) * limit
        };

        let conv = |rng: &mut fastrand::Rng, out: usize, inp: usize| {
            let sample = uniform(inp * 9);
            Conv {
                weight: Array4::from_shape_simple_fn((out, inp, 3, 3), || sample(rng)),
                bias: Array1::from_shape_simple_fn(out, || sample(rng)),
            }
        };

        let conv1 = conv(&mut rng, params.conv1_channels, 3);
        let conv2 = conv(&mut rng, params.conv2_channels, params.conv1_channels);
        let sample = uniform(params.conv2_channels);
        let dense_weight = Array2::from_shape_simple_fn((NUM_CLASSES, params.conv2_channels), || {
            sample(&mut rng)
        });
        let dense_bias = Array1::from_shape_simple_fn(NUM_CLASSES, || sample(&mut rng));

        Self {
            tier,
            downsample: params.downsample,
            conv1,
            conv2,
            dense_weight,
            dense_bias,
        }
    }

    /// Downsampling factor, reduced as needed so tiny inputs keep at least
    /// 8x8 of spatial extent through the conv stack.
    fn effective_downsample(&self, h: usize, w: usize) -> usize {
        let mut d = self.downsample;
        while d > 1 && (h / d < 8 || w / d < 8) {
            d /= 2;
        }
        d
    }

    fn forward(&self, input: &Array3<f32>) -> Activations {
        let (_, h, w) = input.dim();
        let d = self.effective_downsample(h, w);

        let down = avg_pool(input, d);
        let pre1 = conv_forward(&down, &self.conv1);
        let pool1 = avg_pool(&relu(&pre1), 2);
        let pre2 = conv_forward(&pool1, &self.conv2);
        let pool2 = avg_pool(&relu(&pre2), 2);
        let features = global_avg_pool(&pool2);
        let logits = self.dense_weight.dot(&features) + &self.dense_bias;

        Activations {
            downsample: d,
            pre1,
            pre2,
            pool2_dim: pool2.dim(),
            logits,
        }
    }

    /// Classifies the input and returns raw logits. Exposed for tests and
    /// diagnostics; attacks only use [`GradientSource::input_gradient`].
    pub fn logits(&self, input: &Tensor) -> Array1<f32> {
        self.forward(input.view()).logits
    }
}

struct Activations {
    downsample: usize,
    pre1: Array3<f32>,
    pre2: Array3<f32>,
    pool2_dim: (usize, usize, usize),
    logits: Array1<f32>,
}

impl GradientSource for SurrogateModel {
    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn input_gradient(&self, input: &Tensor, tracker: &TensorTracker) -> Result<Tensor> {
        let acts = self.forward(input.view());

        // Cross-entropy against the model's own argmax. Its gradient at the
        // logits is `softmax(logits) - onehot(argmax)`, which is zero only
        // if the prediction is already perfectly confident.
        let target = acts
            .logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut grad_logits = acts.logits.to_vec();
        softmax(&mut grad_logits);
        grad_logits[target] -= 1.0;
        let grad_logits = Array1::from_vec(grad_logits);

        let grad_features = self.dense_weight.t().dot(&grad_logits);

        // Undo global average pooling: every spatial position of a channel
        // contributed equally.
        let (c2, ph, pw) = acts.pool2_dim;
        let spatial = (ph * pw) as f32;
        let mut grad_pool2 = Array3::zeros(acts.pool2_dim);
        for c in 0..c2 {
            let g = grad_features[c] / spatial;
            grad_pool2.index_axis_mut(ndarray::Axis(0), c).fill(g);
        }

        let grad_relu2 = relu_backward(&avg_unpool(&grad_pool2, 2, acts.pre2.dim()), &acts.pre2);
        let grad_pool1 = conv_backward_input(&grad_relu2, &self.conv2);
        let grad_relu1 = relu_backward(&avg_unpool(&grad_pool1, 2, acts.pre1.dim()), &acts.pre1);
        let grad_down = conv_backward_input(&grad_relu1, &self.conv1);

        let (_, h, w) = input.view().dim();
        let grad_input = avg_unpool(&grad_down, acts.downsample, (3, h, w));

        let mut out = Tensor::zeros_like(input, tracker)?;
        out.view_mut().assign(&grad_input);

        // Entirely flat gradients would stall the attack loop; the features
        // of the untouched regions make this observable in the logs.
        if grad_input.iter().all(|g| *g == 0.0) {
            log::debug!("surrogate produced an all-zero gradient");
        }

        Ok(out)
    }
}

fn relu(x: &Array3<f32>) -> Array3<f32> {
    x.mapv(|v| v.max(0.0))
}

fn relu_backward(grad: &Array3<f32>, pre_activation: &Array3<f32>) -> Array3<f32> {
    let mut out = grad.clone();
    ndarray::Zip::from(&mut out)
        .and(pre_activation)
        .for_each(|g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
    out
}

/// 3x3 convolution with unit stride and zero padding of 1.
fn conv_forward(input: &Array3<f32>, conv: &Conv) -> Array3<f32> {
    let (ci, h, w) = input.dim();
    let co = conv.weight.dim().0;
    let mut out = Array3::zeros((co, h, w));
    for o in 0..co {
        for y in 0..h {
            for x in 0..w {
                let mut acc = conv.bias[o];
                for i in 0..ci {
                    for ky in 0..3 {
                        for kx in 0..3 {
                            let sy = y as isize + ky as isize - 1;
                            let sx = x as isize + kx as isize - 1;
                            if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                                continue;
                            }
                            acc += conv.weight[(o, i, ky, kx)]
                                * input[(i, sy as usize, sx as usize)];
                        }
                    }
                }
                out[(o, y, x)] = acc;
            }
        }
    }
    out
}

/// Gradient of [`conv_forward`] with respect to its input (the transposed
/// convolution). Weight gradients are never needed; the weights are frozen.
fn conv_backward_input(grad_out: &Array3<f32>, conv: &Conv) -> Array3<f32> {
    let (co, h, w) = grad_out.dim();
    let ci = conv.weight.dim().1;
    let mut out = Array3::zeros((ci, h, w));
    for o in 0..co {
        for y in 0..h {
            for x in 0..w {
                let g = grad_out[(o, y, x)];
                if g == 0.0 {
                    continue;
                }
                for i in 0..ci {
                    for ky in 0..3 {
                        for kx in 0..3 {
                            let sy = y as isize + ky as isize - 1;
                            let sx = x as isize + kx as isize - 1;
                            if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                                continue;
                            }
                            out[(i, sy as usize, sx as usize)] += conv.weight[(o, i, ky, kx)] * g;
                        }
                    }
                }
            }
        }
    }
    out
}

/// Averages each channel over its full spatial extent.
fn global_avg_pool(input: &Array3<f32>) -> Array1<f32> {
    let (c, h, w) = input.dim();
    let n = (h * w).max(1) as f32;
    Array1::from_iter(
        (0..c).map(|ch| input.index_axis(ndarray::Axis(0), ch).sum() / n),
    )
}

/// Non-overlapping average pooling by `factor`. Trailing rows/columns that
/// do not fill a complete cell are dropped.
fn avg_pool(input: &Array3<f32>, factor: usize) -> Array3<f32> {
    if factor == 1 {
        return input.clone();
    }
    let (c, h, w) = input.dim();
    let (oh, ow) = (h / factor, w / factor);
    let norm = (factor * factor) as f32;
    let mut out = Array3::zeros((c, oh, ow));
    for ch in 0..c {
        for y in 0..oh {
            for x in 0..ow {
                let mut acc = 0.0;
                for dy in 0..factor {
                    for dx in 0..factor {
                        acc += input[(ch, y * factor + dy, x * factor + dx)];
                    }
                }
                out[(ch, y, x)] = acc / norm;
            }
        }
    }
    out
}

/// Gradient of [`avg_pool`]: spreads each cell's gradient evenly over the
/// pixels that were averaged. Dropped trailing pixels receive zero.
fn avg_unpool(grad: &Array3<f32>, factor: usize, input_dim: (usize, usize, usize)) -> Array3<f32> {
    if factor == 1 {
        return grad.clone();
    }
    let (c, gh, gw) = grad.dim();
    let norm = (factor * factor) as f32;
    let mut out = Array3::zeros(input_dim);
    for ch in 0..c {
        for y in 0..gh {
            for x in 0..gw {
                let g = grad[(ch, y, x)] / norm;
                for dy in 0..factor {
                    for dx in 0..factor {
                        out[(ch, y * factor + dy, x * factor + dx)] = g;
                    }
                }
            }
        }
    }
    out
}

// THEORY:
// Single-scale structural similarity, computed exactly the way the optimizer needs it:
// on 4-D `(batch, channel, height, width)` tensors, with a separable Gaussian window
// applied as a non-padded ("valid") local average, independently per channel.
//
// For every window position the engine derives the local means (mu1, mu2), the local
// variances (sigma1^2, sigma2^2) and the covariance (sigma12) of the two inputs, and then
// combines a luminance term and a contrast-structure term:
//
//   cs   = (2 sigma12 + C2) / (sigma1^2 + sigma2^2 + C2)
//   ssim = (2 mu1 mu2 + C1) / (mu1^2 + mu2^2 + C1) * cs
//
// The optimizer descends on this value, so the module also owns the analytic gradient
// with respect to the first input. Because the Gaussian filter is linear, the gradient is
// the filter's adjoint applied to three per-position coefficient maps (one each for the
// mean, the second moment, and the cross moment of X).

use crate::core_modules::gaussian_window::GaussianKernel;
use crate::error::{AttackError, Result};
use ndarray::{Array1, Array4, ArrayView4, Axis, Slice};

pub const K1: f32 = 0.01;
pub const K2: f32 = 0.03;

/// Anything that can score how similar two clips look and say how to change the first
/// one to move that score. Implemented by both SSIM flavours.
pub trait StructuralSimilarity {
    /// Batch-averaged similarity of `x` to `y`.
    fn score(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<f32>;

    /// Batch-averaged similarity together with its gradient with respect to `x`.
    fn score_with_gradient(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<(f32, Array4<f32>)>;
}

/// Result of an SSIM comparison, either collapsed to one number or kept per batch item.
#[derive(Debug, Clone, PartialEq)]
pub enum SsimValue {
    Scalar(f32),
    PerItem(Array1<f32>),
}

impl SsimValue {
    /// Collapses the value to a scalar, averaging over the batch if needed.
    pub fn mean(&self) -> f32 {
        match self {
            SsimValue::Scalar(v) => *v,
            SsimValue::PerItem(items) => items.mean().unwrap_or(f32::NAN),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SsimOutput {
    pub value: SsimValue,
    /// Present only when the comparison was asked for the full result.
    pub contrast_structure: Option<SsimValue>,
}

/// Every map produced by one forward pass, kept so the backward pass can reuse them.
pub(crate) struct SsimMaps {
    mu1: Array4<f32>,
    mu2: Array4<f32>,
    luminance: Array4<f32>,
    luminance_num: Array4<f32>,
    luminance_den: Array4<f32>,
    cs_num: Array4<f32>,
    cs_den: Array4<f32>,
    pub(crate) ssim_map: Array4<f32>,
    pub(crate) cs_map: Array4<f32>,
}

/// Single-scale SSIM with a Gaussian window that is built once and reused.
#[derive(Debug, Clone)]
pub struct SsimMetric {
    kernel: GaussianKernel,
    data_range: f32,
}

impl SsimMetric {
    pub fn new(win_size: usize, win_sigma: f32, data_range: f32) -> Result<Self> {
        Self::with_kernel(GaussianKernel::build(win_size, win_sigma)?, data_range)
    }

    pub fn with_kernel(kernel: GaussianKernel, data_range: f32) -> Result<Self> {
        if !data_range.is_finite() || data_range <= 0.0 {
            return Err(AttackError::InvalidParameter(format!(
                "data range must be positive, got {data_range}"
            )));
        }
        Ok(Self { kernel, data_range })
    }

    pub fn kernel(&self) -> &GaussianKernel {
        &self.kernel
    }

    pub fn data_range(&self) -> f32 {
        self.data_range
    }

    /// Compares `x` against `y`.
    ///
    /// With `reduce` the SSIM map is averaged over every position; otherwise one value is
    /// kept per batch item (averaged over channel and spatial axes). `full` also returns
    /// the contrast-structure term, which the multi-scale metric consumes.
    pub fn compute(&self, x: ArrayView4<f32>, y: ArrayView4<f32>, reduce: bool, full: bool) -> Result<SsimOutput> {
        self.check_inputs(x, y)?;
        let maps = self.maps(x, y);
        let ssim = per_item_mean(&maps.ssim_map);
        let cs = per_item_mean(&maps.cs_map);

        let collapse = |items: Array1<f32>| {
            if reduce {
                SsimValue::Scalar(items.mean().unwrap_or(f32::NAN))
            } else {
                SsimValue::PerItem(items)
            }
        };

        Ok(SsimOutput {
            value: collapse(ssim),
            contrast_structure: full.then(|| collapse(cs)),
        })
    }

    pub(crate) fn check_inputs(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<()> {
        if x.shape() != y.shape() {
            return Err(AttackError::ShapeMismatch(format!(
                "inputs must have identical dimensions, got {:?} and {:?}",
                x.shape(),
                y.shape()
            )));
        }
        if x.is_empty() {
            return Err(AttackError::InvalidParameter("inputs must not be empty".into()));
        }
        let (_, _, height, width) = x.dim();
        let size = self.kernel.size();
        if height < size || width < size {
            return Err(AttackError::InvalidParameter(format!(
                "{height}x{width} input is smaller than the {size}-wide window"
            )));
        }
        Ok(())
    }

    /// Forward pass. Inputs must already be validated.
    pub(crate) fn maps(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> SsimMaps {
        let c1 = (K1 * self.data_range).powi(2);
        let c2 = (K2 * self.data_range).powi(2);

        let mu1 = self.filter(x);
        let mu2 = self.filter(y);
        let mu1_sq = mu1.mapv(|v| v * v);
        let mu2_sq = mu2.mapv(|v| v * v);
        let mu1_mu2 = &mu1 * &mu2;

        let sigma1_sq = self.filter((&x * &x).view()) - &mu1_sq;
        let sigma2_sq = self.filter((&y * &y).view()) - &mu2_sq;
        let sigma12 = self.filter((&x * &y).view()) - &mu1_mu2;

        let cs_num = sigma12 * 2.0 + c2;
        let cs_den = sigma1_sq + &sigma2_sq + c2;
        let cs_map = &cs_num / &cs_den;

        let luminance_num = mu1_mu2 * 2.0 + c1;
        let luminance_den = mu1_sq + &mu2_sq + c1;
        let luminance = &luminance_num / &luminance_den;
        let ssim_map = &luminance * &cs_map;

        SsimMaps {
            mu1,
            mu2,
            luminance,
            luminance_num,
            luminance_den,
            cs_num,
            cs_den,
            ssim_map,
            cs_map,
        }
    }

    /// Backward pass. `grad_ssim[b]` and `grad_cs[b]` are the upstream gradients on the
    /// per-item means of the SSIM and contrast-structure maps; the result is the gradient
    /// with respect to `x`.
    pub(crate) fn backward(
        &self,
        x: ArrayView4<f32>,
        y: ArrayView4<f32>,
        maps: &SsimMaps,
        grad_ssim: &Array1<f32>,
        grad_cs: &Array1<f32>,
    ) -> Array4<f32> {
        let (_, channels, out_h, out_w) = maps.ssim_map.dim();
        let per_item = (channels * out_h * out_w) as f32;
        let upstream_ssim = broadcast_items(maps.ssim_map.raw_dim(), grad_ssim, per_item);
        let upstream_cs = broadcast_items(maps.ssim_map.raw_dim(), grad_cs, per_item);

        // d luminance / d mu1 with mu2 fixed.
        let dl_dmu1 = (&maps.mu2 * &maps.luminance_den - &maps.luminance_num * &maps.mu1) * 2.0
            / (&maps.luminance_den * &maps.luminance_den);

        // Everything flowing into the contrast-structure term.
        let through_cs = &upstream_ssim * &maps.luminance + &upstream_cs;
        let d_sigma1_sq = -(&through_cs * &maps.cs_num) / (&maps.cs_den * &maps.cs_den);
        let d_sigma12 = through_cs * 2.0 / &maps.cs_den;

        // sigma1^2 = E[x^2] - mu1^2 and sigma12 = E[xy] - mu1 mu2, so mu1 also feeds both.
        let d_mu1 = upstream_ssim * &maps.cs_map * dl_dmu1 - &maps.mu1 * &d_sigma1_sq * 2.0 - &maps.mu2 * &d_sigma12;

        let (_, _, height, width) = x.dim();
        let from_mean = self.filter_adjoint(d_mu1.view(), height, width);
        let from_second_moment = self.filter_adjoint(d_sigma1_sq.view(), height, width);
        let from_cross_moment = self.filter_adjoint(d_sigma12.view(), height, width);

        from_mean + &(&x * &from_second_moment * 2.0) + &(&y * &from_cross_moment)
    }

    /// Separable valid Gaussian filter: rows first, then columns.
    fn filter(&self, input: ArrayView4<f32>) -> Array4<f32> {
        let weights = self.kernel.weights();
        let rows = correlate_valid(input, weights, Axis(2));
        correlate_valid(rows.view(), weights, Axis(3))
    }

    fn filter_adjoint(&self, grad: ArrayView4<f32>, height: usize, width: usize) -> Array4<f32> {
        let weights = self.kernel.weights();
        let cols = correlate_valid_adjoint(grad, weights, Axis(3), width);
        correlate_valid_adjoint(cols.view(), weights, Axis(2), height)
    }
}

impl StructuralSimilarity for SsimMetric {
    fn score(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<f32> {
        Ok(self.compute(x, y, true, false)?.value.mean())
    }

    fn score_with_gradient(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<(f32, Array4<f32>)> {
        self.check_inputs(x, y)?;
        let maps = self.maps(x, y);
        let per_item = per_item_mean(&maps.ssim_map);
        let batch = per_item.len();
        let score = per_item.mean().unwrap_or(f32::NAN);

        let grad_ssim = Array1::from_elem(batch, 1.0 / batch as f32);
        let grad_cs = Array1::zeros(batch);
        let grad = self.backward(x, y, &maps, &grad_ssim, &grad_cs);
        Ok((score, grad))
    }
}

/// `out[i] = sum_k kernel[k] * input[i + k]` along `axis`, no padding.
fn correlate_valid(input: ArrayView4<f32>, kernel: &[f32], axis: Axis) -> Array4<f32> {
    let out_len = input.len_of(axis) + 1 - kernel.len();
    let mut shape = input.raw_dim();
    shape[axis.index()] = out_len;

    let mut out = Array4::zeros(shape);
    for (tap, &weight) in kernel.iter().enumerate() {
        out.scaled_add(weight, &input.slice_axis(axis, Slice::from(tap..tap + out_len)));
    }
    out
}

/// Adjoint of `correlate_valid`: scatters each output gradient back over its window.
fn correlate_valid_adjoint(grad: ArrayView4<f32>, kernel: &[f32], axis: Axis, in_len: usize) -> Array4<f32> {
    let out_len = grad.len_of(axis);
    let mut shape = grad.raw_dim();
    shape[axis.index()] = in_len;

    let mut out = Array4::zeros(shape);
    for (tap, &weight) in kernel.iter().enumerate() {
        out.slice_axis_mut(axis, Slice::from(tap..tap + out_len))
            .scaled_add(weight, &grad);
    }
    out
}

/// Mean over channel and spatial axes, one value per batch item.
pub(crate) fn per_item_mean(map: &Array4<f32>) -> Array1<f32> {
    let batch = map.len_of(Axis(0)).max(1);
    let per_item = (map.len() / batch) as f32;
    map.outer_iter().map(|item| item.sum() / per_item).collect()
}

fn broadcast_items(dim: ndarray::Ix4, per_item_grad: &Array1<f32>, count: f32) -> Array4<f32> {
    let mut out = Array4::zeros(dim);
    for (mut item, &g) in out.outer_iter_mut().zip(per_item_grad.iter()) {
        item.fill(g / count);
    }
    out
}

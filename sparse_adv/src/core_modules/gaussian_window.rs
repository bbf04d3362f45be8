// THEORY:
// The Gaussian window is the weighting function behind every local statistic the SSIM
// engine computes. A 2D Gaussian is separable, so a single normalized 1D kernel is
// enough: it is run once along the rows and once along the columns.
//
// The kernel is built once per metric instance and then shared by every channel and
// every call, which is why `GaussianKernel` is a small immutable value type.

use crate::error::{AttackError, Result};

/// A normalized, symmetric 1D Gaussian kernel of odd length.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    weights: Vec<f32>,
    sigma: f32,
}

impl GaussianKernel {
    /// Builds a kernel with weights `exp(-(i - size/2)^2 / (2 sigma^2))`, normalized to sum 1.
    pub fn build(size: usize, sigma: f32) -> Result<Self> {
        if size == 0 || size % 2 == 0 {
            return Err(AttackError::InvalidWindowSize(size));
        }
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(AttackError::InvalidParameter(format!(
                "window sigma must be positive, got {sigma}"
            )));
        }

        let center = (size / 2) as f32;
        let denom = 2.0 * sigma * sigma;
        let mut weights: Vec<f32> = (0..size)
            .map(|i| {
                let offset = i as f32 - center;
                (-(offset * offset) / denom).exp()
            })
            .collect();

        let total: f32 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= total);

        Ok(Self { weights, sigma })
    }

    pub fn size(&self) -> usize {
        self.weights.len()
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

// THEORY:
// The temporal indicator decides *when* a clip may be touched. It is a fixed binary
// sequence with one entry per frame; only frames marked `true` receive the perturbation.
// Restricting the attack to a sparse cluster of frames keeps the perceptual footprint
// small and concentrates the optimizer's budget.
//
// Composition is one select-and-clip over the whole clip:
//
//   composed[t] = indicator[t] ? clip(original[t] + perturbation[t], bounds) : original[t]
//
// Masked frames are copied verbatim, whatever the perturbation holds at that position.
// The same rule, differentiated, gives the gate that decides which perturbation entries
// receive gradient.

use crate::error::{AttackError, Result};
use ndarray::{Array4, ArrayView4, Zip};

/// Perturbable positions of the default 40-frame pattern: three short bursts.
pub const DEFAULT_POSITIONS: [usize; 9] = [11, 12, 13, 19, 20, 21, 22, 32, 33];

/// Valid per-channel value range of a composed clip.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueBounds {
    pub lower: Vec<f32>,
    pub upper: Vec<f32>,
}

impl ValueBounds {
    pub fn new(lower: Vec<f32>, upper: Vec<f32>) -> Result<Self> {
        if lower.len() != upper.len() || lower.is_empty() {
            return Err(AttackError::InvalidParameter(format!(
                "bounds need one lower and one upper value per channel, got {} and {}",
                lower.len(),
                upper.len()
            )));
        }
        if lower.iter().zip(&upper).any(|(lo, hi)| lo > hi) {
            return Err(AttackError::InvalidParameter("lower bound exceeds upper bound".into()));
        }
        Ok(Self { lower, upper })
    }

    /// The same range on every channel.
    pub fn uniform(channels: usize, lower: f32, upper: f32) -> Result<Self> {
        Self::new(vec![lower; channels], vec![upper; channels])
    }

    /// Range of mean-centred values: `[rescale.0 - mean[c], rescale.1 - mean[c]]`.
    pub fn centered(mean: &[f32], rescale: (f32, f32)) -> Result<Self> {
        Self::new(
            mean.iter().map(|m| rescale.0 - m).collect(),
            mean.iter().map(|m| rescale.1 - m).collect(),
        )
    }

    pub fn channels(&self) -> usize {
        self.lower.len()
    }
}

/// Fixed, immutable mask of which frames may be perturbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalIndicator {
    mask: Vec<bool>,
}

impl TemporalIndicator {
    pub fn new(mask: Vec<bool>) -> Self {
        Self { mask }
    }

    /// Builds a mask of length `seq_len` with `positions` switched on.
    pub fn from_positions(seq_len: usize, positions: &[usize]) -> Result<Self> {
        let mut mask = vec![false; seq_len];
        for &p in positions {
            let slot = mask.get_mut(p).ok_or_else(|| {
                AttackError::InvalidParameter(format!("indicator position {p} is outside a {seq_len}-frame clip"))
            })?;
            *slot = true;
        }
        Ok(Self { mask })
    }

    /// The stock pattern: 9 of 40 frames in three bursts (11-13, 19-22, 32-33).
    pub fn default_sparse() -> Self {
        let mut mask = vec![false; 40];
        for p in DEFAULT_POSITIONS {
            mask[p] = true;
        }
        Self { mask }
    }

    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn is_perturbable(&self, position: usize) -> bool {
        self.mask.get(position).copied().unwrap_or(false)
    }

    pub fn perturbable_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter().enumerate().filter(|(_, on)| **on).map(|(i, _)| i)
    }

    pub fn active_count(&self) -> usize {
        self.mask.iter().filter(|on| **on).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.mask
    }

    /// Checks that `clip` (frames, channels, height, width) fits this mask and `bounds`.
    pub fn check_clip(&self, clip: ArrayView4<f32>, bounds: &ValueBounds) -> Result<()> {
        let (frames, channels, _, _) = clip.dim();
        if frames != self.len() {
            return Err(AttackError::ShapeMismatch(format!(
                "indicator covers {} frames but the clip has {frames}",
                self.len()
            )));
        }
        if channels != bounds.channels() {
            return Err(AttackError::ShapeMismatch(format!(
                "bounds cover {} channels but the clip has {channels}",
                bounds.channels()
            )));
        }
        Ok(())
    }

    /// Builds the composed clip from `original` and `perturbation`.
    pub fn compose(
        &self,
        original: ArrayView4<f32>,
        perturbation: ArrayView4<f32>,
        bounds: &ValueBounds,
    ) -> Result<Array4<f32>> {
        self.check_clip(original, bounds)?;
        if original.shape() != perturbation.shape() {
            return Err(AttackError::ShapeMismatch(format!(
                "perturbation {:?} does not match clip {:?}",
                perturbation.shape(),
                original.shape()
            )));
        }

        let (mask, lower, upper) = self.selectors(bounds);
        let dim = original.dim();
        let mut composed = original.to_owned();
        Zip::from(&mut composed)
            .and(perturbation)
            .and(broadcast_to(&mask, dim)?)
            .and(broadcast_to(&lower, dim)?)
            .and(broadcast_to(&upper, dim)?)
            .for_each(|value, &d, &on, &lo, &hi| {
                if on {
                    *value = (*value + d).clamp(lo, hi);
                }
            });
        Ok(composed)
    }

    /// d composed / d perturbation: 1 where the frame is perturbable and the unclipped sum
    /// is inside the bounds, 0 elsewhere. Shapes are assumed already checked by `compose`.
    pub fn composition_gate(
        &self,
        original: ArrayView4<f32>,
        perturbation: ArrayView4<f32>,
        bounds: &ValueBounds,
    ) -> Result<Array4<f32>> {
        let (mask, lower, upper) = self.selectors(bounds);
        let dim = original.dim();
        let mut gate = Array4::zeros(dim);
        Zip::from(&mut gate)
            .and(original)
            .and(perturbation)
            .and(broadcast_to(&mask, dim)?)
            .and(broadcast_to(&lower, dim)?)
            .and(broadcast_to(&upper, dim)?)
            .for_each(|g, &x, &d, &on, &lo, &hi| {
                *g = if on && (lo..=hi).contains(&(x + d)) { 1.0 } else { 0.0 };
            });
        Ok(gate)
    }

    /// The mask as `(frames, 1, 1, 1)` and the bounds as `(1, channels, 1, 1)`.
    fn selectors(&self, bounds: &ValueBounds) -> (Array4<bool>, Array4<f32>, Array4<f32>) {
        let mask = Array4::from_shape_fn((self.len(), 1, 1, 1), |(t, ..)| self.mask[t]);
        let per_channel = |values: &[f32]| Array4::from_shape_fn((1, values.len(), 1, 1), |(_, c, ..)| values[c]);
        (mask, per_channel(&bounds.lower), per_channel(&bounds.upper))
    }
}

fn broadcast_to<A>(part: &Array4<A>, dim: (usize, usize, usize, usize)) -> Result<ArrayView4<'_, A>> {
    part.broadcast(dim).ok_or_else(|| {
        AttackError::ShapeMismatch(format!("cannot broadcast {:?} over a {dim:?} clip", part.shape()))
    })
}

impl Default for TemporalIndicator {
    fn default() -> Self {
        Self::default_sparse()
    }
}

// THEORY:
// Multi-scale SSIM evaluates structural similarity on a pyramid of progressively
// halved resolutions and combines the levels geometrically. Fine levels contribute
// only their contrast-structure term; the coarsest level contributes its full SSIM
// value (luminance included):
//
//   ms_ssim = prod_{l < L-1} cs_l ^ w_l  *  ssim_{L-1} ^ w_{L-1}
//
// Between levels both inputs are 2x2 average-pooled with stride 2. Odd dimensions are
// zero-padded by one on each side of that dimension and the divisor stays 4, so the
// pyramid never fails on odd sizes. The only way to run out of pixels is to ask for
// more levels than the input can support for the chosen window, which is checked up
// front.

use crate::core_modules::gaussian_window::GaussianKernel;
use crate::core_modules::ssim::{SsimMaps, SsimMetric, StructuralSimilarity, per_item_mean};
use crate::error::{AttackError, Result};
use ndarray::{Array1, Array4, ArrayView4, s};

pub const DEFAULT_WEIGHTS: [f32; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];

/// Multi-scale SSIM with per-level weights. Shares one Gaussian window across levels.
#[derive(Debug, Clone)]
pub struct MsSsimMetric {
    ssim: SsimMetric,
    weights: Vec<f32>,
}

/// One pyramid level kept for the backward pass.
struct Level {
    x: Array4<f32>,
    y: Array4<f32>,
    maps: SsimMaps,
    ssim: Array1<f32>,
    cs: Array1<f32>,
}

impl MsSsimMetric {
    pub fn new(win_size: usize, win_sigma: f32, data_range: f32, weights: Vec<f32>) -> Result<Self> {
        Self::with_kernel(GaussianKernel::build(win_size, win_sigma)?, data_range, weights)
    }

    pub fn with_kernel(kernel: GaussianKernel, data_range: f32, weights: Vec<f32>) -> Result<Self> {
        if weights.is_empty() {
            return Err(AttackError::InvalidParameter("MS-SSIM needs at least one level weight".into()));
        }
        Ok(Self {
            ssim: SsimMetric::with_kernel(kernel, data_range)?,
            weights,
        })
    }

    pub fn levels(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Per-batch-item MS-SSIM.
    pub fn compute_per_item(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<Array1<f32>> {
        let levels = self.pyramid(x, y)?;
        let (values, _) = self.combine(&levels);
        Ok(values)
    }

    /// MS-SSIM averaged over the batch.
    pub fn compute(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<f32> {
        Ok(self.compute_per_item(x, y)?.mean().unwrap_or(f32::NAN))
    }

    fn check_pyramid(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<()> {
        self.ssim.check_inputs(x, y)?;
        let (_, _, mut height, mut width) = x.dim();
        let size = self.ssim.kernel().size();
        for level in 0..self.levels() {
            if height < size || width < size {
                return Err(AttackError::InvalidParameter(format!(
                    "level {level} of the pyramid is {height}x{width}, smaller than the {size}-wide window"
                )));
            }
            height = pooled_len(height);
            width = pooled_len(width);
        }
        Ok(())
    }

    fn pyramid(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<Vec<Level>> {
        self.check_pyramid(x, y)?;
        let mut levels = Vec::with_capacity(self.levels());
        let mut current = (x.to_owned(), y.to_owned());

        for level in 0..self.levels() {
            let maps = self.ssim.maps(current.0.view(), current.1.view());
            let ssim = per_item_mean(&maps.ssim_map);
            let cs = per_item_mean(&maps.cs_map);

            let next = if level + 1 < self.levels() {
                Some((avg_pool(current.0.view()), avg_pool(current.1.view())))
            } else {
                None
            };

            levels.push(Level {
                x: current.0,
                y: current.1,
                maps,
                ssim,
                cs,
            });

            match next {
                Some(pooled) => current = pooled,
                None => break,
            }
        }
        Ok(levels)
    }

    /// Per-item values plus, per level, the factor base each item contributed.
    fn combine(&self, levels: &[Level]) -> (Array1<f32>, Vec<Array1<f32>>) {
        let last = levels.len() - 1;
        let bases: Vec<Array1<f32>> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| if i == last { level.ssim.clone() } else { level.cs.clone() })
            .collect();

        let batch = bases[0].len();
        let values = Array1::from_shape_fn(batch, |b| {
            bases
                .iter()
                .zip(&self.weights)
                .map(|(base, &w)| base[b].powf(w))
                .product::<f32>()
        });
        (values, bases)
    }
}

impl StructuralSimilarity for MsSsimMetric {
    fn score(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<f32> {
        self.compute(x, y)
    }

    fn score_with_gradient(&self, x: ArrayView4<f32>, y: ArrayView4<f32>) -> Result<(f32, Array4<f32>)> {
        let levels = self.pyramid(x, y)?;
        let (values, bases) = self.combine(&levels);
        let batch = values.len();
        let score = values.mean().unwrap_or(f32::NAN);
        let last = levels.len() - 1;

        // d score / d base_l for every item: w_l * base_l^(w_l - 1) * prod of the other factors.
        let factor_grad = |level: usize| -> Array1<f32> {
            Array1::from_shape_fn(batch, |b| {
                let others: f32 = bases
                    .iter()
                    .zip(&self.weights)
                    .enumerate()
                    .filter(|(i, _)| *i != level)
                    .map(|(_, (base, &w))| base[b].powf(w))
                    .product();
                let w = self.weights[level];
                w * bases[level][b].powf(w - 1.0) * others / batch as f32
            })
        };

        let zeros = Array1::zeros(batch);
        let mut grad: Option<Array4<f32>> = None;
        for (index, level) in levels.iter().enumerate().rev() {
            let upstream = factor_grad(index);
            let (grad_ssim, grad_cs) = if index == last {
                (&upstream, &zeros)
            } else {
                (&zeros, &upstream)
            };
            let mut local = self
                .ssim
                .backward(level.x.view(), level.y.view(), &level.maps, grad_ssim, grad_cs);

            if let Some(coarser) = grad.take() {
                let (_, _, height, width) = level.x.dim();
                local = local + &avg_pool_adjoint(coarser.view(), height, width);
            }
            grad = Some(local);
        }

        match grad {
            Some(grad) => Ok((score, grad)),
            None => Err(AttackError::InvalidParameter("MS-SSIM pyramid is empty".into())),
        }
    }
}

fn pooled_len(len: usize) -> usize {
    (len + len % 2) / 2
}

/// 2x2 average pool, stride 2, zero padding of `dim % 2` on both sides, divisor 4.
fn avg_pool(input: ArrayView4<f32>) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let (pad_h, pad_w) = (height % 2, width % 2);
    let (out_h, out_w) = (pooled_len(height), pooled_len(width));

    let mut padded = Array4::zeros((batch, channels, height + 2 * pad_h, width + 2 * pad_w));
    padded
        .slice_mut(s![.., .., pad_h..pad_h + height, pad_w..pad_w + width])
        .assign(&input);

    let mut out = Array4::zeros((batch, channels, out_h, out_w));
    for dy in 0..2 {
        for dx in 0..2 {
            out.scaled_add(
                0.25,
                &padded.slice(s![.., .., dy..dy + 2 * out_h - 1;2, dx..dx + 2 * out_w - 1;2]),
            );
        }
    }
    out
}

/// Adjoint of `avg_pool` back onto a `height x width` input.
fn avg_pool_adjoint(grad: ArrayView4<f32>, height: usize, width: usize) -> Array4<f32> {
    let (batch, channels, out_h, out_w) = grad.dim();
    let (pad_h, pad_w) = (height % 2, width % 2);

    let mut padded = Array4::zeros((batch, channels, height + 2 * pad_h, width + 2 * pad_w));
    for dy in 0..2 {
        for dx in 0..2 {
            padded
                .slice_mut(s![.., .., dy..dy + 2 * out_h - 1;2, dx..dx + 2 * out_w - 1;2])
                .scaled_add(0.25, &grad);
        }
    }
    padded
        .slice(s![.., .., pad_h..pad_h + height, pad_w..pad_w + width])
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(batch: usize, channels: usize, h: usize, w: usize, seed: f32) -> Array4<f32> {
        Array4::from_shape_fn((batch, channels, h, w), |(b, c, i, j)| {
            let phase = seed + b as f32 * 0.37 + c as f32 * 1.1;
            let v = (i as f32 * 0.9 + phase).sin() * (j as f32 * 0.45 - phase).cos();
            0.5 + 0.4 * v + 0.05 * ((i * 7 + j * 13) % 5) as f32
        })
    }

    /// Mostly `x` with some of another texture mixed in, so contrast-structure stays positive.
    fn blend(x: &Array4<f32>, seed: f32) -> Array4<f32> {
        let (b, c, h, w) = x.dim();
        x * 0.8 + &(textured(b, c, h, w, seed) * 0.2)
    }

    #[test]
    fn single_level_matches_single_scale_ssim() {
        let x = textured(2, 3, 20, 23, 0.0);
        let y = textured(2, 3, 20, 23, 0.8);
        let ms = MsSsimMetric::new(7, 1.5, 1.0, vec![1.0]).unwrap();
        let single = SsimMetric::new(7, 1.5, 1.0).unwrap();

        let a = ms.compute(x.view(), y.view()).unwrap();
        let b = single.score(x.view(), y.view()).unwrap();
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }

    #[test]
    fn identical_inputs_score_one() {
        let x = textured(1, 3, 49, 51, 0.3);
        let ms = MsSsimMetric::new(3, 1.5, 1.0, DEFAULT_WEIGHTS.to_vec()).unwrap();
        let s = ms.compute(x.view(), x.view()).unwrap();
        assert!((s - 1.0).abs() < 1e-4, "{s}");
    }

    #[test]
    fn odd_sizes_survive_every_level() {
        let ms = MsSsimMetric::new(3, 1.5, 1.0, DEFAULT_WEIGHTS.to_vec()).unwrap();
        for &(h, w) in &[(49usize, 51usize), (51, 49), (47, 63), (48, 49)] {
            let x = textured(1, 2, h, w, 0.1);
            let y = blend(&x, 0.9);
            let s = ms.compute(x.view(), y.view()).unwrap();
            assert!(s.is_finite(), "{h}x{w} produced {s}");
        }
    }

    #[test]
    fn pooling_pads_odd_edges_with_zeros() {
        let input = Array4::from_elem((1, 1, 3, 3), 4.0f32);
        let pooled = avg_pool(input.view());
        assert_eq!(pooled.dim(), (1, 1, 2, 2));
        // Corner windows see one real pixel and three padded zeros.
        assert_eq!(pooled[[0, 0, 0, 0]], 1.0);
        assert_eq!(pooled[[0, 0, 1, 1]], 4.0);
    }

    #[test]
    fn pooling_adjoint_is_the_transpose() {
        // <pool(a), b> == <a, pool^T(b)> for arbitrary a and b.
        let a = textured(1, 1, 7, 6, 0.2);
        let b = textured(1, 1, 4, 3, 1.7);
        let lhs = (&avg_pool(a.view()) * &b).sum();
        let rhs = (&a * &avg_pool_adjoint(b.view(), 7, 6)).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
    }

    #[test]
    fn too_many_levels_for_the_input_is_rejected() {
        let ms = MsSsimMetric::new(11, 1.5, 1.0, DEFAULT_WEIGHTS.to_vec()).unwrap();
        let x = textured(1, 1, 64, 64, 0.0);
        assert!(matches!(ms.compute(x.view(), x.view()), Err(AttackError::InvalidParameter(_))));
    }

    #[test]
    fn empty_weights_are_rejected() {
        assert!(MsSsimMetric::new(3, 1.5, 1.0, vec![]).is_err());
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let ms = MsSsimMetric::new(3, 1.0, 1.0, vec![0.3, 0.7]).unwrap();
        let x = textured(1, 1, 9, 8, 0.4);
        let y = blend(&x, 2.1);
        let (_, grad) = ms.score_with_gradient(x.view(), y.view()).unwrap();

        let score = |a: &Array4<f32>| ms.compute(a.view(), y.view()).unwrap() as f64;
        let step = 0.01f32;
        for &idx in &[(0, 0, 0, 0), (0, 0, 4, 4), (0, 0, 8, 7), (0, 0, 3, 6)] {
            let mut plus = x.clone();
            plus[idx] += step;
            let mut minus = x.clone();
            minus[idx] -= step;
            let numeric = (score(&plus) - score(&minus)) / (2.0 * step as f64);
            let analytic = grad[idx] as f64;
            assert!(
                (numeric - analytic).abs() <= 2e-4 + 0.05 * analytic.abs(),
                "{idx:?}: numeric {numeric} analytic {analytic}"
            );
        }
    }
}

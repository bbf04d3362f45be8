// THEORY:
// The attack treats the video classifier as a frozen, differentiable black box. The
// `Classifier` trait is the whole contract: a forward pass that yields class
// probabilities, and a backward pass that turns an upstream gradient on those
// probabilities into a gradient on the input clip. The attack never sees or updates
// the model's parameters; it only borrows the classifier immutably.
//
// Supported models form a closed set (`ModelKind`). Each kind carries the data layout it
// expects (`DataSpec`) and is resolved once into a boxed `Classifier`, so the attack loop
// never branches on model names.

use crate::error::{AttackError, Result};
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView4};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// What the classifier says about one clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Per-class probability distribution.
    pub probabilities: Array1<f32>,
    /// Index of the most probable class.
    pub label: usize,
    /// Raw pre-softmax activations, kept for diagnostics.
    pub activations: Array1<f32>,
}

impl Prediction {
    pub fn from_probabilities(probabilities: Array1<f32>, activations: Array1<f32>) -> Self {
        let label = argmax(probabilities.view());
        Self {
            probabilities,
            label,
            activations,
        }
    }

    pub fn probability_of(&self, class: usize) -> f32 {
        self.probabilities.get(class).copied().unwrap_or(0.0)
    }
}

/// A frozen, differentiable video classifier.
pub trait Classifier {
    fn num_classes(&self) -> usize;

    /// Number of frozen parameters. The attack never updates them.
    fn parameter_count(&self) -> usize;

    /// Classifies a `(frames, channels, height, width)` clip.
    fn forward(&self, clip: ArrayView4<f32>) -> Result<Prediction>;

    /// Gradient of `output_grad · probabilities(clip)` with respect to `clip`.
    fn backward(&self, clip: ArrayView4<f32>, output_grad: ArrayView1<f32>) -> Result<Array4<f32>>;
}

/// Input layout a model was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    /// Shorter side after the first resize, before cropping.
    pub scale_size: u32,
    /// Square side fed to the network.
    pub crop_size: u32,
    pub channels: usize,
    /// Per-channel mean subtracted from raw pixels.
    pub mean: Vec<f32>,
    /// Valid raw pixel range.
    pub rescale: (f32, f32),
}

impl DataSpec {
    pub fn pixel_span(&self) -> f32 {
        self.rescale.1 - self.rescale.0
    }
}

/// The closed set of supported classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    GoogleNet,
    Inception2,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::GoogleNet, ModelKind::Inception2];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::GoogleNet => "GoogleNet",
            ModelKind::Inception2 => "Inception2",
        }
    }

    pub fn data_spec(&self) -> DataSpec {
        match self {
            ModelKind::GoogleNet => DataSpec {
                scale_size: 256,
                crop_size: 224,
                channels: 3,
                mean: vec![104.0, 117.0, 124.0],
                rescale: (0.0, 255.0),
            },
            ModelKind::Inception2 => DataSpec {
                scale_size: 256,
                crop_size: 224,
                channels: 3,
                mean: vec![128.0, 128.0, 128.0],
                rescale: (0.0, 255.0),
            },
        }
    }

    /// Resolves this kind into a classifier head loaded from a JSON weights file.
    pub fn load(&self, weights_path: &Path, seq_len: usize) -> Result<Box<dyn Classifier>> {
        let file = std::fs::File::open(weights_path)?;
        let weights: HeadWeights = serde_json::from_reader(std::io::BufReader::new(file))?;
        let head = PooledLinearClassifier::new(weights, seq_len, self.data_spec().channels)?;
        tracing::info!(
            model = self.name(),
            classes = head.num_classes(),
            parameters = head.parameter_count(),
            "loaded frozen classifier"
        );
        Ok(Box::new(head))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                AttackError::Configuration(format!(
                    "unsupported model '{s}', expected one of: GoogleNet, Inception2"
                ))
            })
    }
}

fn default_input_scale() -> f32 {
    1.0 / 255.0
}

/// On-disk form of a pooled linear head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadWeights {
    #[serde(default)]
    pub classes: Vec<String>,
    /// `num_classes` rows of `frames * channels` weights.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default = "default_input_scale")]
    pub input_scale: f32,
}

/// Frozen linear softmax head over per-(frame, channel) spatial means.
#[derive(Debug, Clone)]
pub struct PooledLinearClassifier {
    weights: Array2<f32>,
    bias: Array1<f32>,
    input_scale: f32,
    frames: usize,
    channels: usize,
}

impl PooledLinearClassifier {
    pub fn new(head: HeadWeights, frames: usize, channels: usize) -> Result<Self> {
        let features = frames * channels;
        let classes = head.weights.len();
        if classes == 0 || head.bias.len() != classes {
            return Err(AttackError::Configuration(format!(
                "classifier head has {classes} weight rows but {} biases",
                head.bias.len()
            )));
        }
        if let Some(row) = head.weights.iter().find(|row| row.len() != features) {
            return Err(AttackError::Configuration(format!(
                "classifier head rows must hold {features} weights ({frames} frames x {channels} channels), found {}",
                row.len()
            )));
        }

        let flat: Vec<f32> = head.weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((classes, features), flat)
            .map_err(|e| AttackError::Configuration(e.to_string()))?;

        Ok(Self {
            weights,
            bias: Array1::from(head.bias),
            input_scale: head.input_scale,
            frames,
            channels,
        })
    }

    fn check_clip(&self, clip: ArrayView4<f32>) -> Result<()> {
        let (frames, channels, height, width) = clip.dim();
        if frames != self.frames || channels != self.channels || height * width == 0 {
            return Err(AttackError::ShapeMismatch(format!(
                "classifier expects {} frames of {} channels, got {:?}",
                self.frames,
                self.channels,
                clip.shape()
            )));
        }
        Ok(())
    }

    fn features(&self, clip: ArrayView4<f32>) -> Array1<f32> {
        let (_, _, height, width) = clip.dim();
        let scale = self.input_scale / (height * width) as f32;
        clip.outer_iter()
            .flat_map(|frame| {
                frame
                    .outer_iter()
                    .map(|plane| plane.sum() * scale)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Classifier for PooledLinearClassifier {
    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn forward(&self, clip: ArrayView4<f32>) -> Result<Prediction> {
        self.check_clip(clip)?;
        let logits = self.weights.dot(&self.features(clip)) + &self.bias;
        Ok(Prediction::from_probabilities(softmax(logits.view()), logits))
    }

    fn backward(&self, clip: ArrayView4<f32>, output_grad: ArrayView1<f32>) -> Result<Array4<f32>> {
        self.check_clip(clip)?;
        if output_grad.len() != self.num_classes() {
            return Err(AttackError::ShapeMismatch(format!(
                "output gradient has {} entries for {} classes",
                output_grad.len(),
                self.num_classes()
            )));
        }

        let logits = self.weights.dot(&self.features(clip)) + &self.bias;
        let grad_logits = softmax_backward(softmax(logits.view()).view(), output_grad);
        let grad_features = self.weights.t().dot(&grad_logits);

        let (_, _, height, width) = clip.dim();
        let scale = self.input_scale / (height * width) as f32;
        let mut grad = Array4::zeros(clip.raw_dim());
        for (t, mut frame) in grad.outer_iter_mut().enumerate() {
            for (c, mut plane) in frame.outer_iter_mut().enumerate() {
                plane.fill(grad_features[t * self.channels + c] * scale);
            }
        }
        Ok(grad)
    }
}

pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

/// Vector-Jacobian product of softmax: `p * (g - <g, p>)`.
pub fn softmax_backward(probabilities: ArrayView1<f32>, grad: ArrayView1<f32>) -> Array1<f32> {
    let dot = probabilities.dot(&grad);
    &probabilities * &(grad.mapv(|g| g - dot))
}

pub fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// One-hot encoding of `class` over `num_classes` entries.
pub fn one_hot(class: usize, num_classes: usize) -> Array1<f32> {
    let mut encoded = Array1::zeros(num_classes);
    if let Some(slot) = encoded.get_mut(class) {
        *slot = 1.0;
    }
    encoded
}

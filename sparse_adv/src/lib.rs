// THEORY:
// This file is the main entry point for the `sparse_adv` library crate. It exposes the
// `AttackPipeline` and its configuration as the high-level interface, and keeps the
// building blocks (`core_modules`) public for callers that want to drive a single clip
// or plug in their own classifier.
//
// The attack: a frozen video classifier, a clip of frames, and a sparse set of frames
// that may be perturbed. An Adam optimizer searches for a perturbation on those frames
// that changes the classifier's decision while an SSIM (or MS-SSIM) term keeps the
// result close to the original.

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use crate::core_modules::classifier::{Classifier, DataSpec, ModelKind, Prediction};
pub use crate::core_modules::dataset::{load_targets, VideoDataset, VideoSample};
pub use crate::core_modules::temporal_indicator::{TemporalIndicator, ValueBounds};
pub use crate::error::{AttackError, Result};
pub use crate::pipeline::{
    AttackConfig, AttackGoal, AttackOutcome, AttackPipeline, PerceptualMetric, PerceptualTerm, RunSummary,
    Termination, VideoResult,
};

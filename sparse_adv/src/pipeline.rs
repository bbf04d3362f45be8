// THEORY:
// The `pipeline` module is the top-level API of the attack. It wires the collaborators
// together once (frozen classifier, perceptual metric, temporal indicator, value bounds)
// and then walks a dataset strictly one video at a time:
//
//   load frames -> resample -> decode -> pick the goal -> fresh optimizer run -> tally -> hand off
//
// Broken videos (too short, unreadable, unknown class or target) are skipped with a
// warning and listed in the summary. Configuration problems surface from `new` before any
// video is touched.

use crate::core_modules::classifier::{Classifier, DataSpec};
use crate::core_modules::dataset::{load_clip, rescale_list, VideoDataset, VideoSample};
use crate::core_modules::ms_ssim::{MsSsimMetric, DEFAULT_WEIGHTS};
use crate::core_modules::ssim::{SsimMetric, StructuralSimilarity};
use crate::core_modules::temporal_indicator::{TemporalIndicator, ValueBounds, DEFAULT_POSITIONS};
use crate::error::{AttackError, Result};
use ndarray::ArrayView4;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::optimizer::{AttackGoal, AttackOutcome, Checkpoint, PerturbationOptimizer, Termination};

/// Which structural similarity index enters the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerceptualMetric {
    Ssim,
    MsSsim,
}

impl FromStr for PerceptualMetric {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ssim" => Ok(PerceptualMetric::Ssim),
            "ms-ssim" | "msssim" => Ok(PerceptualMetric::MsSsim),
            other => Err(AttackError::Configuration(format!(
                "unknown perceptual metric '{other}', expected ssim or ms-ssim"
            ))),
        }
    }
}

impl fmt::Display for PerceptualMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerceptualMetric::Ssim => f.write_str("ssim"),
            PerceptualMetric::MsSsim => f.write_str("ms-ssim"),
        }
    }
}

/// How the similarity score is turned into a loss term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerceptualTerm {
    /// `+ w2 * SSIM`, the literal form.
    Similarity,
    /// `+ w2 * (1 - SSIM)`.
    Dissimilarity,
}

/// Tunables of one attack run.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    pub max_iter: usize,
    /// Checkpoint period. Must divide `max_iter`.
    pub save_freq: usize,
    /// Unscaled learning rate, expressed for a 0..255 pixel range.
    pub learning_rate: f32,
    pub weight_loss2: f32,
    pub seq_len: usize,
    /// Perturbable frame positions inside a `seq_len` clip.
    pub indicator_positions: Vec<usize>,
    pub win_size: usize,
    pub win_sigma: f32,
    pub data_range: f32,
    pub metric: PerceptualMetric,
    pub perceptual_term: PerceptualTerm,
    pub ms_ssim_weights: Vec<f32>,
    /// Improvement below which the run counts as converged.
    pub tolerance: f64,
    pub initial_perturbation: f32,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            save_freq: 100,
            learning_rate: 0.001 * 255.0,
            weight_loss2: 1.0,
            seq_len: 40,
            indicator_positions: DEFAULT_POSITIONS.to_vec(),
            win_size: 11,
            win_sigma: 10.0,
            data_range: 255.0,
            metric: PerceptualMetric::Ssim,
            perceptual_term: PerceptualTerm::Similarity,
            ms_ssim_weights: DEFAULT_WEIGHTS.to_vec(),
            tolerance: 1e-5,
            initial_perturbation: 0.01,
        }
    }
}

impl AttackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(AttackError::Configuration("max_iter must be at least 1".into()));
        }
        if self.save_freq == 0 || self.max_iter % self.save_freq != 0 {
            return Err(AttackError::Configuration(format!(
                "save_freq ({}) must divide max_iter ({})",
                self.save_freq, self.max_iter
            )));
        }
        if self.win_size % 2 == 0 {
            return Err(AttackError::InvalidWindowSize(self.win_size));
        }
        if self.seq_len == 0 {
            return Err(AttackError::Configuration("seq_len must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(AttackError::Configuration(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_loss2.is_finite() && self.weight_loss2 >= 0.0) {
            return Err(AttackError::Configuration(format!(
                "weight_loss2 must be non-negative, got {}",
                self.weight_loss2
            )));
        }
        if self.tolerance.is_nan() || self.tolerance < 0.0 {
            return Err(AttackError::Configuration("tolerance must be non-negative".into()));
        }
        if self.metric == PerceptualMetric::MsSsim && self.ms_ssim_weights.is_empty() {
            return Err(AttackError::Configuration("MS-SSIM needs at least one weight".into()));
        }
        Ok(())
    }

    /// Learning rate for a model whose pixels span `spec.rescale`.
    pub fn scaled_learning_rate(&self, spec: &DataSpec) -> f32 {
        self.learning_rate / 255.0 * spec.pixel_span()
    }

    pub fn build_metric(&self) -> Result<Box<dyn StructuralSimilarity>> {
        Ok(match self.metric {
            PerceptualMetric::Ssim => Box::new(SsimMetric::new(self.win_size, self.win_sigma, self.data_range)?),
            PerceptualMetric::MsSsim => Box::new(MsSsimMetric::new(
                self.win_size,
                self.win_sigma,
                self.data_range,
                self.ms_ssim_weights.clone(),
            )?),
        })
    }

    pub fn build_indicator(&self) -> Result<TemporalIndicator> {
        TemporalIndicator::from_positions(self.seq_len, &self.indicator_positions)
    }
}

/// A finished video, ready to be written out.
#[derive(Debug, Clone)]
pub struct VideoResult {
    pub sample: VideoSample,
    /// The resampled frame paths the clip was built from.
    pub frames: Vec<PathBuf>,
    pub label: usize,
    pub outcome: AttackOutcome,
}

/// Serializable digest of one video.
#[derive(Debug, Clone, Serialize)]
pub struct VideoReport {
    pub video: String,
    pub class_name: String,
    pub label: usize,
    pub goal: AttackGoal,
    pub termination: Termination,
    pub iterations: usize,
    pub best_iteration: Option<usize>,
    pub min_loss: f64,
    pub clean_label: usize,
    pub final_label: usize,
    pub succeeded: bool,
    pub frame_magnitude: Vec<f32>,
    pub checkpoints: Vec<Checkpoint>,
}

impl VideoReport {
    pub fn from_result(result: &VideoResult) -> Self {
        let outcome = &result.outcome;
        Self {
            video: result.sample.name.clone(),
            class_name: result.sample.class_name.clone(),
            label: result.label,
            goal: outcome.goal,
            termination: outcome.termination,
            iterations: outcome.iterations,
            best_iteration: outcome.best_iteration,
            min_loss: outcome.min_loss,
            clean_label: outcome.initial_prediction.label,
            final_label: outcome.final_prediction.label,
            succeeded: outcome.succeeded(),
            frame_magnitude: outcome.frame_magnitude.clone(),
            checkpoints: outcome.checkpoints.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedVideo {
    pub video: String,
    pub reason: String,
}

/// Tallies over a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total_videos: usize,
    pub attacked: usize,
    pub skipped: usize,
    /// Videos whose clean prediction matched the true label.
    pub correct_clean: usize,
    /// Attacked videos whose final prediction still matched the true label.
    pub correct_adversarial: usize,
    pub videos: Vec<VideoReport>,
    pub failed: Vec<FailedVideo>,
}

impl RunSummary {
    pub fn record(&mut self, result: &VideoResult) {
        let outcome = &result.outcome;
        self.total_videos += 1;
        if outcome.initial_prediction.label == result.label {
            self.correct_clean += 1;
        }
        if outcome.was_skipped() {
            self.skipped += 1;
        } else {
            self.attacked += 1;
            if outcome.final_prediction.label == result.label {
                self.correct_adversarial += 1;
            }
        }
        self.videos.push(VideoReport::from_result(result));
    }

    pub fn record_failure(&mut self, sample: &VideoSample, error: &AttackError) {
        self.total_videos += 1;
        self.failed.push(FailedVideo {
            video: sample.name.clone(),
            reason: error.to_string(),
        });
    }
}

/// The main entry point: one classifier, one configuration, any number of videos.
pub struct AttackPipeline {
    classifier: Box<dyn Classifier>,
    metric: Box<dyn StructuralSimilarity>,
    indicator: TemporalIndicator,
    bounds: ValueBounds,
    spec: DataSpec,
    config: AttackConfig,
    crop: bool,
    targets: Option<HashMap<String, usize>>,
}

impl AttackPipeline {
    pub fn new(classifier: Box<dyn Classifier>, spec: DataSpec, config: AttackConfig) -> Result<Self> {
        config.validate()?;
        let metric = config.build_metric()?;
        let indicator = config.build_indicator()?;
        let bounds = ValueBounds::centered(&spec.mean, spec.rescale)?;
        if bounds.channels() != spec.channels {
            return Err(AttackError::Configuration(format!(
                "data layout has {} channels but {} mean values",
                spec.channels,
                bounds.channels()
            )));
        }
        info!(
            metric = %config.metric,
            max_iter = config.max_iter,
            learning_rate = config.scaled_learning_rate(&spec),
            perturbable_frames = indicator.active_count(),
            seq_len = indicator.len(),
            "attack pipeline ready"
        );
        Ok(Self {
            classifier,
            metric,
            indicator,
            bounds,
            spec,
            config,
            crop: true,
            targets: None,
        })
    }

    /// Switches every video to a targeted attack, looked up by video name.
    pub fn with_targets(mut self, targets: HashMap<String, usize>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Centre-crop after the first resize (the default) or resize straight to the crop size.
    pub fn with_crop(mut self, crop: bool) -> Self {
        self.crop = crop;
        self
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn data_spec(&self) -> &DataSpec {
        &self.spec
    }

    pub fn indicator(&self) -> &TemporalIndicator {
        &self.indicator
    }

    /// Runs a fresh optimization on an already decoded clip.
    pub fn attack_clip(&self, clip: ArrayView4<f32>, goal: AttackGoal) -> Result<AttackOutcome> {
        let optimizer = PerturbationOptimizer::new(
            self.classifier.as_ref(),
            self.metric.as_ref(),
            &self.indicator,
            &self.bounds,
            &self.config,
            self.config.scaled_learning_rate(&self.spec),
        )?;
        optimizer.run(clip, goal)
    }

    fn goal_for(&self, sample: &VideoSample, label: usize) -> Result<AttackGoal> {
        match &self.targets {
            None => Ok(AttackGoal::Untargeted { true_label: label }),
            Some(targets) => targets
                .get(&sample.name)
                .map(|&target| AttackGoal::Targeted { target })
                .ok_or_else(|| AttackError::Data(format!("no target listed for video '{}'", sample.name))),
        }
    }

    /// Loads and attacks one video of `dataset`.
    pub fn attack_sample(&self, dataset: &VideoDataset, sample: &VideoSample) -> Result<VideoResult> {
        let label = dataset.class_index(&sample.class_name)?;
        let frames = rescale_list(&dataset.frames_for_sample(sample)?, self.config.seq_len)?;
        let clip = load_clip(&frames, &self.spec, self.crop)?;
        let goal = self.goal_for(sample, label)?;
        info!(video = %sample.name, class = %sample.class_name, label, ?goal, "attacking video");
        let outcome = self.attack_clip(clip.view(), goal)?;
        Ok(VideoResult {
            sample: sample.clone(),
            frames,
            label,
            outcome,
        })
    }

    /// Attacks one video and tallies it in `summary`. A recoverable failure is recorded and
    /// yields `None`; anything else is returned as an error.
    pub fn attack_and_record(
        &self,
        dataset: &VideoDataset,
        sample: &VideoSample,
        summary: &mut RunSummary,
    ) -> Result<Option<VideoResult>> {
        match self.attack_sample(dataset, sample) {
            Ok(result) => {
                summary.record(&result);
                Ok(Some(result))
            }
            Err(e) if e.is_recoverable() => {
                warn!(video = %sample.name, error = %e, "skipping video");
                summary.record_failure(sample, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Attacks every video in order, handing each finished one to `on_video`.
    pub fn run<F>(&self, dataset: &VideoDataset, mut on_video: F) -> Result<RunSummary>
    where
        F: FnMut(&VideoResult) -> Result<()>,
    {
        let mut summary = RunSummary::default();
        for sample in dataset.samples() {
            if let Some(result) = self.attack_and_record(dataset, sample, &mut summary)? {
                on_video(&result)?;
            }
        }
        info!(
            videos = summary.total_videos,
            attacked = summary.attacked,
            correct_clean = summary.correct_clean,
            correct_adversarial = summary.correct_adversarial,
            "run finished"
        );
        Ok(summary)
    }
}

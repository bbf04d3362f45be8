// THEORY:
// The `PerturbationOptimizer` is the heart of the attack. For one video it searches for an
// additive perturbation that, once composed through the temporal indicator, pushes the
// frozen classifier away from the true label (or towards a chosen target) while keeping
// the composed clip structurally similar to the original.
//
// Every run owns a fresh `OptimizationContext`: the perturbation, the Adam moments and the
// loss bookkeeping are created when the run starts and dropped when it ends. Nothing is
// shared between videos except the immutably borrowed classifier and metric.
//
// Each run is a small state machine:
//
//   Init -> Iterating -> { Converged | MaxIterReached | Diverged } -> Done
//   Init -> Skipped -> Done
//
// The gradient of the total loss with respect to the perturbation is assembled by hand:
//
//   dL/dcomposed = classifier.backward(e_class * dL1/dp) + w2 * dPerceptual/dcomposed
//   dL/dperturbation = dL/dcomposed * gate
//
// where `gate` is the composition's Jacobian mask. Masked frames therefore never receive
// gradient and Adam never moves them.

use crate::core_modules::adam::AdamState;
use crate::core_modules::classifier::{one_hot, Classifier, Prediction};
use crate::core_modules::ssim::StructuralSimilarity;
use crate::core_modules::temporal_indicator::{TemporalIndicator, ValueBounds};
use crate::error::{AttackError, Result};
use crate::pipeline::{AttackConfig, PerceptualTerm};
use ndarray::{Array4, ArrayView4};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Added inside the logarithm of the classification loss.
pub const LOSS_EPSILON: f64 = 1e-6;

/// What the attack is trying to achieve on one video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttackGoal {
    /// Drive the prediction away from the true label.
    Untargeted { true_label: usize },
    /// Drive the prediction onto a chosen class.
    Targeted { target: usize },
}

impl AttackGoal {
    /// The class whose probability enters the loss.
    pub fn class(&self) -> usize {
        match *self {
            AttackGoal::Untargeted { true_label } => true_label,
            AttackGoal::Targeted { target } => target,
        }
    }

    /// Whether `label` already meets the goal.
    pub fn is_satisfied_by(&self, label: usize) -> bool {
        match *self {
            AttackGoal::Untargeted { true_label } => label != true_label,
            AttackGoal::Targeted { target } => label == target,
        }
    }

    fn classification_loss(&self, probability: f32) -> f64 {
        let p = probability as f64;
        match self {
            AttackGoal::Untargeted { .. } => -(1.0 - p + LOSS_EPSILON).ln(),
            AttackGoal::Targeted { .. } => -(p + LOSS_EPSILON).ln(),
        }
    }

    /// d classification_loss / d probability.
    fn classification_slope(&self, probability: f32) -> f64 {
        let p = probability as f64;
        match self {
            AttackGoal::Untargeted { .. } => 1.0 / (1.0 - p + LOSS_EPSILON),
            AttackGoal::Targeted { .. } => -1.0 / (p + LOSS_EPSILON),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// The clean clip already met the goal; no iteration was run.
    Skipped,
    /// An improvement smaller than the tolerance was observed.
    Converged,
    /// The iteration budget ran out.
    MaxIterReached,
    /// The total loss stopped being finite.
    Diverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Iterating,
    Finished(Termination),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossBreakdown {
    pub total: f64,
    pub classification: f64,
    pub perceptual: f64,
}

/// Snapshot taken every `save_freq` iterations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub iteration: usize,
    pub loss: f64,
    pub frame_magnitude: Vec<f32>,
}

/// Everything a finished run hands back to its caller.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    pub goal: AttackGoal,
    pub termination: Termination,
    /// Number of Adam steps taken.
    pub iterations: usize,
    pub best_iteration: Option<usize>,
    pub min_loss: f64,
    pub initial_loss: LossBreakdown,
    pub final_loss: LossBreakdown,
    pub initial_prediction: Prediction,
    pub final_prediction: Prediction,
    pub perturbation: Array4<f32>,
    pub composed: Array4<f32>,
    /// Mean absolute perturbation per frame.
    pub frame_magnitude: Vec<f32>,
    pub checkpoints: Vec<Checkpoint>,
}

impl AttackOutcome {
    pub fn was_skipped(&self) -> bool {
        self.termination == Termination::Skipped
    }

    /// Whether the final prediction meets the goal.
    pub fn succeeded(&self) -> bool {
        self.goal.is_satisfied_by(self.final_prediction.label)
    }
}

/// One evaluation of the loss at the current perturbation.
struct Evaluation {
    composed: Array4<f32>,
    prediction: Prediction,
    loss: LossBreakdown,
    gradient: Array4<f32>,
}

/// Per-video mutable state. Created by `PerturbationOptimizer::run` and never reused.
struct OptimizationContext<'c> {
    original: ArrayView4<'c, f32>,
    goal: AttackGoal,
    perturbation: Array4<f32>,
    adam: AdamState,
    phase: Phase,
    min_loss: f64,
    best_iteration: Option<usize>,
    iterations: usize,
    checkpoints: Vec<Checkpoint>,
}

impl<'c> OptimizationContext<'c> {
    fn new(original: ArrayView4<'c, f32>, goal: AttackGoal, initial_value: f32, learning_rate: f32) -> Self {
        let perturbation = Array4::from_elem(original.raw_dim(), initial_value);
        let adam = AdamState::new(learning_rate, original.raw_dim());
        Self {
            original,
            goal,
            perturbation,
            adam,
            phase: Phase::Init,
            min_loss: f64::INFINITY,
            best_iteration: None,
            iterations: 0,
            checkpoints: Vec::new(),
        }
    }
}

/// Mean absolute value of each frame of `perturbation`.
pub fn frame_magnitude(perturbation: ArrayView4<f32>) -> Vec<f32> {
    perturbation
        .outer_iter()
        .map(|frame| frame.mapv(f32::abs).mean().unwrap_or(0.0))
        .collect()
}

/// Runs the attack on one clip at a time. Cheap to build; holds borrows only.
pub struct PerturbationOptimizer<'a> {
    classifier: &'a dyn Classifier,
    metric: &'a dyn StructuralSimilarity,
    indicator: &'a TemporalIndicator,
    bounds: &'a ValueBounds,
    config: &'a AttackConfig,
    learning_rate: f32,
}

impl<'a> PerturbationOptimizer<'a> {
    /// `learning_rate` is the already scaled step size for the model's pixel range.
    pub fn new(
        classifier: &'a dyn Classifier,
        metric: &'a dyn StructuralSimilarity,
        indicator: &'a TemporalIndicator,
        bounds: &'a ValueBounds,
        config: &'a AttackConfig,
        learning_rate: f32,
    ) -> Result<Self> {
        config.validate()?;
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(AttackError::InvalidParameter(format!(
                "learning rate must be positive and finite, got {learning_rate}"
            )));
        }
        if indicator.len() != config.seq_len {
            return Err(AttackError::Configuration(format!(
                "indicator covers {} frames but seq_len is {}",
                indicator.len(),
                config.seq_len
            )));
        }
        Ok(Self {
            classifier,
            metric,
            indicator,
            bounds,
            config,
            learning_rate,
        })
    }

    /// Attacks `clip` (frames, channels, height, width; mean-centred values) towards `goal`.
    pub fn run(&self, clip: ArrayView4<f32>, goal: AttackGoal) -> Result<AttackOutcome> {
        self.indicator.check_clip(clip, self.bounds)?;
        if goal.class() >= self.classifier.num_classes() {
            return Err(AttackError::InvalidParameter(format!(
                "class {} is outside a {}-class classifier",
                goal.class(),
                self.classifier.num_classes()
            )));
        }

        let mut context = OptimizationContext::new(clip, goal, self.config.initial_perturbation, self.learning_rate);
        let initial = self.evaluate(&context)?;
        let initial_loss = initial.loss;
        let initial_prediction = initial.prediction.clone();
        info!(
            label = initial_prediction.label,
            class = goal.class(),
            loss = initial_loss.total,
            "initial evaluation"
        );

        if goal.is_satisfied_by(initial_prediction.label) {
            debug!(label = initial_prediction.label, "clean prediction already meets the goal");
            context.phase = Phase::Finished(Termination::Skipped);
            return Ok(self.finish(context, initial, initial_loss, initial_prediction));
        }

        context.phase = Phase::Iterating;
        context.min_loss = initial_loss.total;
        let mut current = initial;

        for cur_iter in 0..self.config.max_iter {
            context.adam.step(&mut context.perturbation, current.gradient.view());
            let next = self.evaluate(&context)?;
            context.iterations = cur_iter + 1;
            let loss = next.loss.total;
            debug!(
                iteration = cur_iter,
                loss,
                classification = next.loss.classification,
                perceptual = next.loss.perceptual,
                label = next.prediction.label,
                "step"
            );

            if !loss.is_finite() {
                warn!(iteration = cur_iter, "loss is no longer finite, stopping");
                context.phase = Phase::Finished(Termination::Diverged);
                current = next;
                break;
            }

            let mut converged = false;
            if loss < context.min_loss {
                if (loss - context.min_loss).abs() < self.config.tolerance {
                    converged = true;
                }
                context.min_loss = loss;
                context.best_iteration = Some(cur_iter);
            }

            if context.iterations % self.config.save_freq == 0 {
                let checkpoint = Checkpoint {
                    iteration: cur_iter,
                    loss,
                    frame_magnitude: frame_magnitude(context.perturbation.view()),
                };
                info!(
                    iteration = cur_iter,
                    loss,
                    label = next.prediction.label,
                    peak_magnitude = checkpoint.frame_magnitude.iter().cloned().fold(0.0f32, f32::max),
                    "checkpoint"
                );
                context.checkpoints.push(checkpoint);
            }

            current = next;
            if converged {
                context.phase = Phase::Finished(Termination::Converged);
                break;
            }
        }

        if context.phase == Phase::Iterating {
            context.phase = Phase::Finished(Termination::MaxIterReached);
        }
        Ok(self.finish(context, current, initial_loss, initial_prediction))
    }

    fn finish(
        &self,
        context: OptimizationContext<'_>,
        last: Evaluation,
        initial_loss: LossBreakdown,
        initial_prediction: Prediction,
    ) -> AttackOutcome {
        let termination = match context.phase {
            Phase::Finished(termination) => termination,
            Phase::Init | Phase::Iterating => Termination::MaxIterReached,
        };
        let min_loss = if termination == Termination::Skipped {
            initial_loss.total
        } else {
            context.min_loss
        };
        info!(
            termination = ?termination,
            iterations = context.iterations,
            best_iteration = ?context.best_iteration,
            initial_label = initial_prediction.label,
            final_label = last.prediction.label,
            "attack finished"
        );
        AttackOutcome {
            goal: context.goal,
            termination,
            iterations: context.iterations,
            best_iteration: context.best_iteration,
            min_loss,
            initial_loss,
            final_loss: last.loss,
            initial_prediction,
            final_prediction: last.prediction,
            frame_magnitude: frame_magnitude(context.perturbation.view()),
            perturbation: context.perturbation,
            composed: last.composed,
            checkpoints: context.checkpoints,
        }
    }

    fn evaluate(&self, context: &OptimizationContext<'_>) -> Result<Evaluation> {
        let original = context.original;
        let perturbation = context.perturbation.view();
        let composed = self.indicator.compose(original, perturbation, self.bounds)?;
        let prediction = self.classifier.forward(composed.view())?;

        let goal = context.goal;
        let probability = prediction.probability_of(goal.class());
        let classification = goal.classification_loss(probability);
        let slope = goal.classification_slope(probability) as f32;
        let upstream = one_hot(goal.class(), self.classifier.num_classes()) * slope;
        let mut gradient = self.classifier.backward(composed.view(), upstream.view())?;

        let weight = self.config.weight_loss2;
        let perceptual = if weight == 0.0 {
            self.perceptual_value(self.metric.score(composed.view(), original)?)
        } else {
            let (similarity, similarity_grad) = self.metric.score_with_gradient(composed.view(), original)?;
            let sign = match self.config.perceptual_term {
                PerceptualTerm::Similarity => 1.0,
                PerceptualTerm::Dissimilarity => -1.0,
            };
            gradient.scaled_add(sign * weight, &similarity_grad);
            self.perceptual_value(similarity)
        };

        gradient *= &self.indicator.composition_gate(original, perturbation, self.bounds)?;

        let loss = LossBreakdown {
            total: classification + weight as f64 * perceptual,
            classification,
            perceptual,
        };
        Ok(Evaluation {
            composed,
            prediction,
            loss,
            gradient,
        })
    }

    fn perceptual_value(&self, similarity: f32) -> f64 {
        match self.config.perceptual_term {
            PerceptualTerm::Similarity => similarity as f64,
            PerceptualTerm::Dissimilarity => 1.0 - similarity as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::softmax;
    use crate::core_modules::ms_ssim::MsSsimMetric;
    use crate::core_modules::ssim::SsimMetric;
    use crate::pipeline::PerceptualMetric;
    use ndarray::{Array1, ArrayView1, Axis};
    use std::cell::Cell;

    /// Replays a fixed schedule of untargeted losses for class 0, one per forward call.
    struct ScheduledClassifier {
        losses: Vec<f64>,
        calls: Cell<usize>,
    }

    impl ScheduledClassifier {
        fn new(losses: Vec<f64>) -> Self {
            Self {
                losses,
                calls: Cell::new(0),
            }
        }
    }

    impl Classifier for ScheduledClassifier {
        fn num_classes(&self) -> usize {
            2
        }

        fn parameter_count(&self) -> usize {
            0
        }

        fn forward(&self, _clip: ArrayView4<f32>) -> Result<Prediction> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            let loss = self.losses[call.min(self.losses.len() - 1)];
            let p = (1.0 + LOSS_EPSILON - (-loss).exp()) as f32;
            let probabilities = Array1::from(vec![p, 1.0 - p]);
            Ok(Prediction::from_probabilities(probabilities.clone(), probabilities))
        }

        fn backward(&self, clip: ArrayView4<f32>, _output_grad: ArrayView1<f32>) -> Result<Array4<f32>> {
            Ok(Array4::zeros(clip.raw_dim()))
        }
    }

    /// Two classes; class 0 fades as the mean of the perturbable frames rises above a threshold.
    struct BrightnessClassifier {
        positions: Vec<usize>,
        threshold: f32,
        slope: f32,
    }

    impl BrightnessClassifier {
        fn region_mean(&self, clip: ArrayView4<f32>) -> f32 {
            let total: f32 = self.positions.iter().map(|&t| clip.index_axis(Axis(0), t).sum()).sum();
            let per_frame = clip.len() / clip.len_of(Axis(0));
            total / (self.positions.len() * per_frame) as f32
        }

        fn logits(&self, clip: ArrayView4<f32>) -> Array1<f32> {
            Array1::from(vec![(self.threshold - self.region_mean(clip)) * self.slope, 0.0])
        }
    }

    impl Classifier for BrightnessClassifier {
        fn num_classes(&self) -> usize {
            2
        }

        fn parameter_count(&self) -> usize {
            2
        }

        fn forward(&self, clip: ArrayView4<f32>) -> Result<Prediction> {
            let logits = self.logits(clip);
            Ok(Prediction::from_probabilities(softmax(logits.view()), logits))
        }

        fn backward(&self, clip: ArrayView4<f32>, output_grad: ArrayView1<f32>) -> Result<Array4<f32>> {
            let p = softmax(self.logits(clip).view());
            let d_logit = (output_grad[0] - output_grad[1]) * p[0] * p[1];
            let per_frame = clip.len() / clip.len_of(Axis(0));
            let d_element = -d_logit * self.slope / (self.positions.len() * per_frame) as f32;
            let mut grad = Array4::zeros(clip.raw_dim());
            for &t in &self.positions {
                grad.index_axis_mut(Axis(0), t).fill(d_element);
            }
            Ok(grad)
        }
    }

    /// Loses every probability to NaN, as a blown-up network would.
    struct NanClassifier;

    impl Classifier for NanClassifier {
        fn num_classes(&self) -> usize {
            2
        }

        fn parameter_count(&self) -> usize {
            0
        }

        fn forward(&self, _clip: ArrayView4<f32>) -> Result<Prediction> {
            let probabilities = Array1::from_elem(2, f32::NAN);
            Ok(Prediction::from_probabilities(probabilities.clone(), probabilities))
        }

        fn backward(&self, clip: ArrayView4<f32>, _output_grad: ArrayView1<f32>) -> Result<Array4<f32>> {
            Ok(Array4::zeros(clip.raw_dim()))
        }
    }

    fn schedule_config(max_iter: usize) -> AttackConfig {
        AttackConfig {
            max_iter,
            save_freq: 1,
            weight_loss2: 0.0,
            seq_len: 2,
            win_size: 3,
            win_sigma: 1.5,
            ..AttackConfig::default()
        }
    }

    fn run_schedule(losses: Vec<f64>, max_iter: usize) -> (AttackOutcome, usize) {
        let classifier = ScheduledClassifier::new(losses);
        let config = schedule_config(max_iter);
        let metric = SsimMetric::new(3, 1.5, 255.0).unwrap();
        let indicator = TemporalIndicator::from_positions(2, &[1]).unwrap();
        let bounds = ValueBounds::uniform(1, -128.0, 127.0).unwrap();
        let clip = Array4::zeros((2, 1, 4, 4));
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 1.0).unwrap();
        let outcome = optimizer.run(clip.view(), AttackGoal::Untargeted { true_label: 0 }).unwrap();
        (outcome, classifier.calls.get())
    }

    #[test]
    fn stops_on_the_first_improvement_below_tolerance() {
        let (outcome, calls) = run_schedule(vec![1.0, 0.9, 0.8, 0.7, 0.7 - 2e-6, 0.6, 0.5], 20);
        assert_eq!(outcome.termination, Termination::Converged);
        assert_eq!(outcome.best_iteration, Some(3));
        assert_eq!(outcome.iterations, 4);
        assert_eq!(calls, 5);
        assert!((outcome.min_loss - (0.7 - 2e-6)).abs() < 1e-4);
        assert_eq!(outcome.checkpoints.len(), 4);
    }

    #[test]
    fn plateau_runs_out_of_budget_and_keeps_the_first_minimum() {
        let (outcome, _) = run_schedule(vec![1.0, 0.9, 0.9, 0.9, 0.95, 0.9, 0.9], 6);
        assert_eq!(outcome.termination, Termination::MaxIterReached);
        assert_eq!(outcome.best_iteration, Some(0));
        assert_eq!(outcome.iterations, 6);
    }

    #[test]
    fn no_improvement_leaves_best_iteration_empty() {
        let (outcome, _) = run_schedule(vec![0.8, 0.9, 1.0], 2);
        assert_eq!(outcome.termination, Termination::MaxIterReached);
        assert_eq!(outcome.best_iteration, None);
        assert_eq!(outcome.min_loss, outcome.initial_loss.total);
    }

    #[test]
    fn clean_misclassification_is_skipped() {
        // p(class 0) = 1 - e^-0.1 < 0.5, so the clean label is already 1.
        let (outcome, calls) = run_schedule(vec![0.1], 10);
        assert_eq!(outcome.termination, Termination::Skipped);
        assert!(outcome.was_skipped());
        assert_eq!(outcome.iterations, 0);
        assert_eq!(calls, 1);
        assert!(outcome.checkpoints.is_empty());
    }

    #[test]
    fn targeted_goal_on_its_target_is_skipped() {
        let classifier = ScheduledClassifier::new(vec![0.1]);
        let config = schedule_config(5);
        let metric = SsimMetric::new(3, 1.5, 255.0).unwrap();
        let indicator = TemporalIndicator::from_positions(2, &[0]).unwrap();
        let bounds = ValueBounds::uniform(1, -128.0, 127.0).unwrap();
        let clip = Array4::zeros((2, 1, 4, 4));
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 1.0).unwrap();

        let outcome = optimizer.run(clip.view(), AttackGoal::Targeted { target: 1 }).unwrap();
        assert!(outcome.was_skipped());
        assert!(outcome.succeeded());

        let outcome = optimizer.run(clip.view(), AttackGoal::Targeted { target: 0 }).unwrap();
        assert!(!outcome.was_skipped());
    }

    #[test]
    fn goal_outside_the_classifier_is_rejected() {
        let classifier = ScheduledClassifier::new(vec![1.0]);
        let config = schedule_config(5);
        let metric = SsimMetric::new(3, 1.5, 255.0).unwrap();
        let indicator = TemporalIndicator::from_positions(2, &[0]).unwrap();
        let bounds = ValueBounds::uniform(1, -128.0, 127.0).unwrap();
        let clip = Array4::zeros((2, 1, 4, 4));
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 1.0).unwrap();
        assert!(matches!(
            optimizer.run(clip.view(), AttackGoal::Untargeted { true_label: 7 }),
            Err(AttackError::InvalidParameter(_))
        ));
    }

    #[test]
    fn uniform_clip_flips_within_budget_and_masked_frames_stay_identical() {
        let indicator = TemporalIndicator::default();
        let classifier = BrightnessClassifier {
            positions: indicator.perturbable_positions().collect(),
            threshold: 140.0,
            slope: 0.5,
        };
        let config = AttackConfig {
            max_iter: 10,
            save_freq: 10,
            weight_loss2: 1.0,
            win_size: 7,
            win_sigma: 1.5,
            ..AttackConfig::default()
        };
        let metric = SsimMetric::new(7, 1.5, 255.0).unwrap();
        let bounds = ValueBounds::uniform(3, 0.0, 255.0).unwrap();
        let clip = Array4::from_elem((40, 3, 12, 12), 128.0f32);
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 4.0).unwrap();

        let outcome = optimizer.run(clip.view(), AttackGoal::Untargeted { true_label: 0 }).unwrap();

        assert_eq!(outcome.initial_prediction.label, 0);
        assert_ne!(outcome.final_prediction.label, outcome.initial_prediction.label);
        assert!(outcome.succeeded());
        assert_eq!(outcome.checkpoints.len(), 1);
        for t in 0..40 {
            let composed = outcome.composed.index_axis(Axis(0), t);
            if indicator.is_perturbable(t) {
                assert!(composed.iter().all(|v| (0.0..=255.0).contains(v)));
                assert!(composed.mean().unwrap() > 128.0);
            } else {
                assert_eq!(composed, clip.index_axis(Axis(0), t));
                assert!((outcome.frame_magnitude[t] - 0.01).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn non_finite_loss_ends_the_run_as_diverged() {
        let classifier = NanClassifier;
        let config = schedule_config(10);
        let metric = SsimMetric::new(3, 1.5, 255.0).unwrap();
        let indicator = TemporalIndicator::from_positions(2, &[1]).unwrap();
        let bounds = ValueBounds::uniform(1, -128.0, 127.0).unwrap();
        let clip = Array4::zeros((2, 1, 4, 4));
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 1.0).unwrap();

        let outcome = optimizer.run(clip.view(), AttackGoal::Untargeted { true_label: 0 }).unwrap();
        assert_eq!(outcome.termination, Termination::Diverged);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.best_iteration, None);
        assert!(outcome.final_loss.total.is_nan());
        assert!(!outcome.was_skipped());
    }

    #[test]
    fn dissimilarity_gradient_matches_finite_differences() {
        let classifier = ScheduledClassifier::new(vec![1.0]);
        let config = AttackConfig {
            weight_loss2: 2.0,
            perceptual_term: PerceptualTerm::Dissimilarity,
            ..schedule_config(5)
        };
        let metric = SsimMetric::new(3, 1.0, 1.0).unwrap();
        let indicator = TemporalIndicator::from_positions(2, &[1]).unwrap();
        let bounds = ValueBounds::uniform(1, -10.0, 10.0).unwrap();
        let clip = Array4::from_shape_fn((2, 1, 9, 8), |(t, _, i, j)| {
            0.5 + 0.4 * (i as f32 * 0.9 + t as f32).sin() * (j as f32 * 0.45).cos()
        });
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 1.0).unwrap();

        let goal = AttackGoal::Untargeted { true_label: 0 };
        let mut context = OptimizationContext::new(clip.view(), goal, 0.0, 1.0);
        context.perturbation = Array4::from_shape_fn(clip.raw_dim(), |(_, _, i, j)| 0.1 * ((i * 3 + j * 5) % 7) as f32 - 0.3);
        let base = context.perturbation.clone();
        let analytic = optimizer.evaluate(&context).unwrap().gradient;

        // Masked frame 0 never receives gradient.
        assert!(analytic.index_axis(Axis(0), 0).iter().all(|g| *g == 0.0));

        let step = 0.01f32;
        for &idx in &[(1, 0, 0, 0), (1, 0, 4, 4), (1, 0, 8, 7), (1, 0, 3, 6)] {
            let mut loss_at = |delta: f32| {
                context.perturbation = base.clone();
                context.perturbation[idx] += delta;
                optimizer.evaluate(&context).unwrap().loss.total
            };
            let numeric = (loss_at(step) - loss_at(-step)) / (2.0 * step as f64);
            let expected = analytic[idx] as f64;
            assert!(
                (numeric - expected).abs() <= 4e-4 + 0.05 * expected.abs(),
                "{idx:?}: numeric {numeric} analytic {expected}"
            );
        }

        // The similarity term pulls the other way.
        let similarity_config = AttackConfig {
            perceptual_term: PerceptualTerm::Similarity,
            ..config.clone()
        };
        let similarity = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &similarity_config, 1.0).unwrap();
        context.perturbation = base;
        let opposite = similarity.evaluate(&context).unwrap().gradient;
        for (a, b) in analytic.iter().zip(opposite.iter()) {
            assert!((a + b).abs() <= 1e-6 + 1e-4 * a.abs(), "{a} vs {b}");
        }
    }

    #[test]
    fn ms_ssim_dissimilarity_run_flips_without_diverging() {
        let indicator = TemporalIndicator::default();
        let classifier = BrightnessClassifier {
            positions: indicator.perturbable_positions().collect(),
            threshold: 140.0,
            slope: 0.5,
        };
        let config = AttackConfig {
            max_iter: 10,
            save_freq: 10,
            weight_loss2: 1.0,
            metric: PerceptualMetric::MsSsim,
            perceptual_term: PerceptualTerm::Dissimilarity,
            ms_ssim_weights: vec![0.3, 0.7],
            win_size: 3,
            win_sigma: 1.5,
            ..AttackConfig::default()
        };
        let metric = MsSsimMetric::new(3, 1.5, 255.0, vec![0.3, 0.7]).unwrap();
        let bounds = ValueBounds::uniform(3, 0.0, 255.0).unwrap();
        // A flat original keeps every contrast-structure factor positive.
        let clip = Array4::from_elem((40, 3, 16, 16), 128.0f32);
        let optimizer = PerturbationOptimizer::new(&classifier, &metric, &indicator, &bounds, &config, 4.0).unwrap();

        let outcome = optimizer.run(clip.view(), AttackGoal::Untargeted { true_label: 0 }).unwrap();

        assert_ne!(outcome.termination, Termination::Diverged);
        assert!(outcome.iterations > 0);
        assert!(outcome.final_loss.total.is_finite());
        assert!(outcome.final_loss.total < outcome.initial_loss.total);
        assert!((0.0..1.0).contains(&outcome.final_loss.perceptual));
        assert!(outcome.succeeded());
        for t in (0..40).filter(|t| !indicator.is_perturbable(*t)) {
            assert_eq!(outcome.composed.index_axis(Axis(0), t), clip.index_axis(Axis(0), t));
        }
    }

    #[test]
    fn frame_magnitude_averages_each_frame() {
        let mut perturbation = Array4::zeros((2, 1, 2, 2));
        perturbation[[1, 0, 0, 0]] = -4.0;
        perturbation[[1, 0, 1, 1]] = 2.0;
        assert_eq!(frame_magnitude(perturbation.view()), vec![0.0, 1.5]);
    }
}

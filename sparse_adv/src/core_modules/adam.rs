// THEORY:
// The descent rule for the perturbation. Adam keeps running first and second moment
// estimates per entry, which makes the step size roughly independent of the raw gradient
// scale; that matters here because the classification gradient is spread over every
// pixel of the perturbable frames and is tiny per entry.
//
// The state belongs to exactly one optimization run. It is created together with the
// perturbation and dropped with it, so no moment estimate ever leaks into the next video.

use ndarray::{Array4, ArrayView4, Zip};

pub const BETA1: f32 = 0.9;
pub const BETA2: f32 = 0.999;
pub const EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct AdamState {
    learning_rate: f32,
    first_moment: Array4<f32>,
    second_moment: Array4<f32>,
    step: i32,
}

impl AdamState {
    pub fn new(learning_rate: f32, shape: ndarray::Ix4) -> Self {
        Self {
            learning_rate,
            first_moment: Array4::zeros(shape),
            second_moment: Array4::zeros(shape),
            step: 0,
        }
    }

    pub fn steps_taken(&self) -> i32 {
        self.step
    }

    /// Applies one bias-corrected Adam update to `params` in place.
    pub fn step(&mut self, params: &mut Array4<f32>, grad: ArrayView4<f32>) {
        self.step += 1;
        let lr_t = self.learning_rate * (1.0 - BETA2.powi(self.step)).sqrt() / (1.0 - BETA1.powi(self.step));

        Zip::from(params)
            .and(&mut self.first_moment)
            .and(&mut self.second_moment)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = BETA1 * *m + (1.0 - BETA1) * g;
                *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + EPSILON);
            });
    }
}

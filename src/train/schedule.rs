// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Learning rate schedule: cosine annealing with warm restarts,
//! the peak decaying at every restart.

use std::f64::consts::PI;

/// Cosine annealing between a decaying peak and a floor,
/// restarting every `period` steps.
#[derive(Clone, Debug, PartialEq)]
pub struct CosineRestarts {
    max_lr: f64,
    min_lr: f64,
    period: usize,
    gamma: f64,
    cycle: i32,
    step_in_cycle: usize,
    lr: f64,
}

impl CosineRestarts {
    /// New schedule, starting at the floor until the first step.
    pub fn new(max_lr: f64, min_lr: f64, period: usize, gamma: f64) -> Self {
        Self {
            max_lr,
            min_lr,
            period: period.max(1),
            gamma,
            cycle: 0,
            step_in_cycle: 0,
            lr: min_lr,
        }
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Advance by one step and return the new learning rate.
    #[allow(clippy::cast_precision_loss)]
    pub fn step(&mut self) -> f64 {
        self.step_in_cycle += 1;
        if self.step_in_cycle >= self.period {
            self.cycle += 1;
            self.step_in_cycle -= self.period;
        }
        let peak = self.max_lr * self.gamma.powi(self.cycle);
        let progress = self.step_in_cycle as f64 / self.period as f64;
        self.lr = self.min_lr + (peak - self.min_lr) * (1.0 + (PI * progress).cos()) / 2.0;
        self.lr
    }
} // impl CosineRestarts

// TESTS #############################################################

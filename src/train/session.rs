// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Training session: epochs of optimization, each followed by an evaluation
//! that may replace the best checkpoint.
//!
//! The session owns everything that lives for a whole run: options,
//! networks, optimizers and their schedules, the random generator,
//! counters and the best metrics record. It moves through the phases
//! `Idle -> RunningEpoch -> Evaluating -> Idle -> ... -> Finished`.

use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::Rng;

use crate::core::batch::{BatchError, Sample};
use crate::core::metrics::{batch_depth_errors, BestMetrics, DepthErrors};
use crate::core::network::{Backward, Optimizer};
use crate::misc::helper::sec_to_hm_str;
use crate::misc::type_aliases::{value, Float, Real};
use crate::train::checkpoint::{self, CheckpointKind};
use crate::train::config::{ConfigError, Options};
use crate::train::error::TrainError;
use crate::train::evaluate::{evaluate, EvalItem, EvalReport};
use crate::train::pipeline::{BatchOutput, Networks, Pipeline};
use crate::train::schedule::CosineRestarts;

/// Steps during which progress is logged every `log_frequency` batches.
const EARLY_PHASE_STEPS: usize = 20_000;
/// Steps between progress logs afterwards.
const LATE_PHASE_PERIOD: usize = 2_000;

/// Phase of a training session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Between epochs.
    Idle,
    /// Optimizing over the batches of an epoch.
    RunningEpoch,
    /// Epoch done, evaluation pending or running.
    Evaluating,
    /// Final checkpoint written.
    Finished,
}

/// Source of training batches.
pub trait TrainData<T: Real> {
    /// Number of batches per epoch.
    fn nb_batches(&self) -> usize;
    /// Batch `index` of epoch `epoch`.
    fn batch(&mut self, epoch: usize, index: usize) -> Result<Vec<Sample<T>>, TrainError>;
}

/// Batches held in memory, the same at every epoch.
impl<T: Real> TrainData<T> for Vec<Vec<Sample<T>>> {
    fn nb_batches(&self) -> usize {
        self.len()
    }
    fn batch(&mut self, _epoch: usize, index: usize) -> Result<Vec<Sample<T>>, TrainError> {
        self.get(index).cloned().ok_or(TrainError::Batch(BatchError::Empty))
    }
}

/// A whole training run.
pub struct TrainingSession<T: Real, R: Rng> {
    options: Options,
    pipeline: Pipeline,
    networks: Networks<T>,
    backward: Box<dyn Backward<T>>,
    depth_optimizer: Box<dyn Optimizer>,
    pose_optimizer: Option<Box<dyn Optimizer>>,
    depth_schedule: CosineRestarts,
    pose_schedule: CosineRestarts,
    rng: R,
    phase: Phase,
    epoch: usize,
    step: usize,
    total_steps: usize,
    best: BestMetrics,
    start: Instant,
}

impl<T: Real, R: Rng> TrainingSession<T, R> {
    /// Check the options against the given networks, restore pretrained
    /// weights and checkpoints if requested, and write `models/opt.json`.
    pub fn new(
        options: Options,
        mut networks: Networks<T>,
        backward: Box<dyn Backward<T>>,
        mut depth_optimizer: Box<dyn Optimizer>,
        mut pose_optimizer: Option<Box<dyn Optimizer>>,
        rng: R,
    ) -> Result<Self, TrainError> {
        options.validate()?;
        if options.use_pose_net() != networks.pose.is_some() {
            return Err(ConfigError::Invalid {
                name: "pose_model_type",
                reason: "a pose network is needed unless training on stereo pairs only"
                    .to_string(),
            }
            .into());
        }
        if let Some(pose) = &networks.pose {
            if pose.model_type() != options.pose_model_type {
                return Err(ConfigError::Invalid {
                    name: "pose_model_type",
                    reason: format!("got a {:?} pose network", pose.model_type()),
                }
                .into());
            }
        }
        if options.predictive_mask != networks.predictive_mask.is_some() {
            return Err(ConfigError::Invalid {
                name: "predictive_mask",
                reason: "the mask decoder must be given exactly when enabled".to_string(),
            }
            .into());
        }
        if networks.pose.is_some() != pose_optimizer.is_some() {
            return Err(ConfigError::Invalid {
                name: "pose_optimizer",
                reason: "a pose optimizer must be given exactly with a pose network".to_string(),
            }
            .into());
        }

        if let Some(path) = &options.pretrained_encoder {
            checkpoint::load_pretrained_encoder(path, &mut networks)?;
        }
        if let Some(folder) = &options.load_weights_folder {
            let pose_opt = match pose_optimizer.as_mut() {
                Some(opt) => {
                    let opt: &mut dyn Optimizer = opt.as_mut();
                    Some(opt)
                }
                None => None,
            };
            checkpoint::load_checkpoint(
                folder,
                &options.models_to_load,
                &mut networks,
                depth_optimizer.as_mut(),
                pose_opt,
            )?;
        }

        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let (depth_schedule, pose_schedule) = {
            let lr = &options.lr;
            (
                CosineRestarts::new(lr[0], lr[1], lr[2] as usize, options.lr_gamma),
                CosineRestarts::new(lr[3], lr[4], lr[5] as usize, options.lr_gamma),
            )
        };
        depth_optimizer.set_learning_rate(depth_schedule.learning_rate());
        if let Some(opt) = pose_optimizer.as_mut() {
            opt.set_learning_rate(pose_schedule.learning_rate());
        }

        info!("training model named: {}", options.model_name);
        info!("models are saved to: {}", options.log_path().display());
        checkpoint::save_options(&options)?;

        Ok(Self {
            pipeline: Pipeline::new(&options),
            options,
            networks,
            backward,
            depth_optimizer,
            pose_optimizer,
            depth_schedule,
            pose_schedule,
            rng,
            phase: Phase::Idle,
            epoch: 0,
            step: 0,
            total_steps: 0,
            best: BestMetrics::default(),
            start: Instant::now(),
        })
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Number of processed batches.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Best metrics so far.
    pub fn best(&self) -> &BestMetrics {
        &self.best
    }

    /// Networks being trained.
    pub fn networks(&self) -> &Networks<T> {
        &self.networks
    }

    fn expect_phase(&self, expected: Phase, action: &'static str) -> Result<(), TrainError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(TrainError::Phase {
                action,
                phase: self.phase,
            })
        }
    }

    /// Run every epoch, each followed by an evaluation, then write the
    /// final checkpoint. Returns the best metrics.
    pub fn train(
        &mut self,
        data: &mut dyn TrainData<T>,
        eval_items: &[EvalItem<T>],
    ) -> Result<BestMetrics, TrainError> {
        self.start = Instant::now();
        self.total_steps = data.nb_batches() * self.options.num_epochs;
        while self.epoch < self.options.num_epochs {
            self.run_epoch(data)?;
            self.evaluate_epoch(eval_items)?;
        }
        self.finish()
    }

    /// Optimize over every batch of one epoch.
    pub fn run_epoch(&mut self, data: &mut dyn TrainData<T>) -> Result<(), TrainError> {
        self.expect_phase(Phase::Idle, "run an epoch")?;
        self.phase = Phase::RunningEpoch;
        info!("training epoch {}", self.epoch);
        self.networks.set_train(true);
        self.depth_optimizer
            .set_learning_rate(self.depth_schedule.step());
        if let Some(opt) = self.pose_optimizer.as_mut() {
            opt.set_learning_rate(self.pose_schedule.step());
        }

        for batch_idx in 0..data.nb_batches() {
            let batch = data.batch(self.epoch, batch_idx)?;
            self.depth_optimizer.zero_grad();
            if let Some(opt) = self.pose_optimizer.as_mut() {
                opt.zero_grad();
            }
            let before = Instant::now();
            let output = self
                .pipeline
                .process_batch(&self.networks, &batch, &mut self.rng)?;
            let loss = output.losses.total;
            if value(loss).is_finite() {
                self.backward.backward(&loss)?;
                self.depth_optimizer.step();
                if let Some(opt) = self.pose_optimizer.as_mut() {
                    opt.step();
                }
            } else {
                warn!(
                    "non finite loss at epoch {} batch {}, skipping the update",
                    self.epoch, batch_idx
                );
            }
            let duration = before.elapsed().as_secs_f64();

            let early_phase =
                batch_idx % self.options.log_frequency == 0 && self.step < EARLY_PHASE_STEPS;
            let late_phase = self.step % LATE_PHASE_PERIOD == 0;
            if early_phase || late_phase {
                self.log_time(batch_idx, batch.len(), duration, value(loss));
                self.log_terms(&batch, &output);
            }
            self.step += 1;
        }
        self.phase = Phase::Evaluating;
        Ok(())
    }

    /// Evaluate the epoch just trained and save the best checkpoint
    /// if the best metrics record improved.
    pub fn evaluate_epoch(&mut self, eval_items: &[EvalItem<T>]) -> Result<EvalReport, TrainError> {
        self.expect_phase(Phase::Evaluating, "evaluate")?;
        self.networks.set_train(false);
        let report = evaluate(
            &self.networks,
            eval_items,
            &self.options.eval_settings(),
            self.options.min_depth,
            self.options.max_depth,
        )?;
        self.networks.set_train(true);
        if let Some(metric) = self.best.update(&report.errors) {
            info!("{} improved, saving best models", metric);
            checkpoint::save_checkpoint(
                &self.options,
                CheckpointKind::Best,
                &self.networks,
                self.depth_optimizer.as_ref(),
                self.pose_optimizer.as_deref(),
            )?;
        }
        self.epoch += 1;
        self.phase = Phase::Idle;
        Ok(report)
    }

    /// Write the final checkpoint and report the best metrics.
    pub fn finish(&mut self) -> Result<BestMetrics, TrainError> {
        self.expect_phase(Phase::Idle, "finish")?;
        checkpoint::save_checkpoint(
            &self.options,
            CheckpointKind::Final,
            &self.networks,
            self.depth_optimizer.as_ref(),
            self.pose_optimizer.as_deref(),
        )?;
        let best = self.best;
        info!(
            "best | abs_rel {:.3} | sq_rel {:.3} | rms {:.3} | log_rms {:.3}",
            best.abs_rel, best.sq_rel, best.rms, best.log_rms
        );
        self.phase = Phase::Finished;
        Ok(best)
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_time(&self, batch_idx: usize, batch_size: usize, duration: f64, loss: f64) {
        let samples_per_sec = batch_size as f64 / duration.max(f64::EPSILON);
        let time_so_far = self.start.elapsed().as_secs_f64();
        let time_left = if self.step > 0 {
            (self.total_steps as f64 / self.step as f64 - 1.0) * time_so_far
        } else {
            0.0
        };
        let pose_lr = self
            .pose_optimizer
            .as_ref()
            .map_or(0.0, |opt| opt.learning_rate());
        info!(
            "epoch {:>3} | lr {:.6} | lr_p {:.6} | batch {:>6} | examples/s: {:5.1} \
             | loss: {:.5} | time elapsed: {} | time left: {}",
            self.epoch,
            self.depth_optimizer.learning_rate(),
            pose_lr,
            batch_idx,
            samples_per_sec,
            loss,
            sec_to_hm_str(time_so_far),
            sec_to_hm_str(time_left)
        );
    }

    /// Log every loss term, and depth metrics when the batch has ground truth.
    #[allow(clippy::cast_possible_truncation)]
    fn log_terms(&self, batch: &[Sample<T>], output: &BatchOutput<T>) {
        for (name, v) in output.losses.named() {
            debug!("{}: {:.5}", name, v);
        }
        let depths: Vec<DMatrix<Float>> = output
            .depth
            .iter()
            .map(|d| d.map(|x| value(x) as Float))
            .collect();
        let pairs: Option<Vec<(&DMatrix<Float>, &DMatrix<Float>)>> = batch
            .iter()
            .zip(&depths)
            .map(|(sample, depth)| sample.depth_gt.as_ref().map(|gt| (gt, depth)))
            .collect();
        if let Some(pairs) = pairs {
            match batch_depth_errors(&pairs) {
                Ok(errors) => {
                    for (name, v) in DepthErrors::NAMES.iter().zip(errors.values().iter()) {
                        debug!("{}: {:.4}", name, v);
                    }
                }
                Err(err) => warn!("no batch depth metrics: {}", err),
            }
        }
    }
} // impl TrainingSession

// TESTS #############################################################

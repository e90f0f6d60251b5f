// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Options of a training run.
//!
//! Options are a flat set of named and typed values, loadable from JSON
//! where every missing field takes its default value.
//! They are checked once by `Options::validate` before anything is built.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ambiguity::AmbiguityWeighting;
use crate::core::batch::FrameId;
use crate::core::boundary::BoundaryTriplet;
use crate::core::metrics::EvalSettings;
use crate::core::pose::{PoseInputMode, PoseModelType};
use crate::core::warp::ImageWarper;
use crate::misc::type_aliases::Float;

/// Precondition violations of the options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Input resolution not compatible with the encoder strides.
    #[error("'{name}' must be a multiple of 32, got {value}")]
    NotMultipleOf32 {
        /// `height` or `width`.
        name: &'static str,
        /// Given value.
        value: usize,
    },
    /// The reference frame is not the first frame id.
    #[error("frame_ids must start with 0, got {0:?}")]
    ReferenceNotFirst(Vec<FrameId>),
    /// Predictive masking while automasking is on.
    #[error("predictive_mask requires disable_automasking")]
    PredictiveMaskWithAutomasking,
    /// The triplet loss scales and window sizes do not pair up.
    #[error("{scales} sgt scales for {kernels} sgt kernel sizes")]
    TripletLengths {
        /// Number of scales.
        scales: usize,
        /// Number of window sizes.
        kernels: usize,
    },
    /// The triplet loss window has no center.
    #[error("sgt kernel sizes must be odd, got {0}")]
    EvenKernel(usize),
    /// Any other invalid value.
    #[error("invalid {name}: {reason}")]
    Invalid {
        /// Option name.
        name: &'static str,
        /// What is wrong.
        reason: String,
    },
    /// Options file could not be read.
    #[error("cannot read options: {0}")]
    Io(#[from] std::io::Error),
    /// Options file is not valid JSON.
    #[error("malformed options: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// All the options of a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    // Paths.
    /// Name of the folder holding the run.
    pub model_name: String,
    /// Parent folder of every run.
    pub log_dir: PathBuf,
    /// Root of the dataset.
    pub data_path: PathBuf,
    /// Training split.
    pub split: String,
    /// Evaluation split, `"eigen"` enabling the Eigen crop.
    pub eval_split: String,

    // Inputs.
    /// Input height, multiple of 32.
    pub height: usize,
    /// Input width, multiple of 32.
    pub width: usize,
    /// Loss scales.
    pub scales: Vec<usize>,
    /// Frame ids, reference first. `"s"` is appended when `use_stereo` is set.
    pub frame_ids: Vec<FrameId>,
    /// Also train from the other camera of stereo pairs.
    pub use_stereo: bool,
    /// Minimum depth.
    pub min_depth: f64,
    /// Maximum depth.
    pub max_depth: f64,

    // Optimization.
    /// Number of samples per batch.
    pub batch_size: usize,
    /// `[depth_max, depth_min, depth_period, pose_max, pose_min, pose_period]`.
    pub lr: [f64; 6],
    /// Weight decay of both optimizers.
    pub weight_decay: f64,
    /// Decay of the peak learning rate at every restart.
    pub lr_gamma: f64,
    /// Number of epochs.
    pub num_epochs: usize,
    /// Seed of the random generator.
    pub random_seed: u64,

    // Losses.
    /// Weight of the smoothness term.
    pub disparity_smoothness: f64,
    /// Warp at the loss scale instead of full resolution.
    pub v1_multiscale: bool,
    /// Average errors over source frames before the minimum.
    pub avg_reprojection: bool,
    /// Disable automasking.
    pub disable_automasking: bool,
    /// Learn a per pixel mask of the reprojection errors.
    pub predictive_mask: bool,
    /// Plain L1 photometric error.
    pub no_ssim: bool,

    // Pose.
    /// Flavor of pose network.
    pub pose_model_type: PoseModelType,
    /// How frames are fed to the pose network.
    pub pose_model_input: PoseInputMode,
    /// Disable the random corruption of pose inputs.
    pub disable_mask: bool,
    /// Probability of zeroing a location of the pose inputs.
    pub mask_ratio: f64,

    // Ambiguity masking.
    /// Disable the ambiguity mask.
    pub disable_ambiguity_mask: bool,
    /// Ambiguity below which pixels are kept.
    pub ambiguity_thresh: f64,
    /// Smooth `exp(-k · ambiguity)` weighting instead of the threshold.
    pub ambiguity_by_negative_exponential: bool,
    /// Coefficient `k` of the smooth weighting.
    pub negative_exponential_coefficient: f64,

    // Boundary triplet loss.
    /// Disable the boundary triplet loss.
    pub disable_triplet_loss: bool,
    /// Weight of the triplet loss.
    pub sgt: f64,
    /// Scales of the triplet loss.
    pub sgt_scales: Vec<usize>,
    /// Window size at every triplet scale.
    pub sgt_kernel_size: Vec<usize>,
    /// Margin of the classic triplet form.
    pub sgt_margin: f64,
    /// Margin of the isolated form.
    pub sgt_isolated_margin: f64,
    /// Mean over negatives instead of the closest one.
    pub disable_hardest_neg: bool,
    /// Classic triplet form instead of the isolated one.
    pub disable_isolated_triplet: bool,

    // Logging and checkpoints.
    /// Batches between progress logs.
    pub log_frequency: usize,
    /// Folder of a checkpoint to start from.
    pub load_weights_folder: Option<PathBuf>,
    /// Modules restored from `load_weights_folder`.
    pub models_to_load: Vec<String>,
    /// Pretrained encoder weights.
    pub pretrained_encoder: Option<PathBuf>,

    // Evaluation.
    /// Disable per image median scaling.
    pub disable_median_scaling: bool,
    /// Factor applied to predicted depths.
    pub pred_depth_scale_factor: Float,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            model_name: "mono_model".to_string(),
            log_dir: PathBuf::from("logs"),
            data_path: PathBuf::from("kitti_data"),
            split: "eigen_zhou".to_string(),
            eval_split: "eigen".to_string(),
            height: 192,
            width: 640,
            scales: vec![0, 1, 2],
            frame_ids: vec![FrameId::Offset(0), FrameId::Offset(-1), FrameId::Offset(1)],
            use_stereo: false,
            min_depth: 0.1,
            max_depth: 100.0,
            batch_size: 16,
            lr: [0.0001, 5e-6, 31.0, 0.0001, 1e-5, 31.0],
            weight_decay: 1e-2,
            lr_gamma: 0.9,
            num_epochs: 50,
            random_seed: 1,
            disparity_smoothness: 1e-3,
            v1_multiscale: false,
            avg_reprojection: false,
            disable_automasking: false,
            predictive_mask: false,
            no_ssim: false,
            pose_model_type: PoseModelType::SeparateResnet,
            pose_model_input: PoseInputMode::Pairs,
            disable_mask: true,
            mask_ratio: 0.1,
            disable_ambiguity_mask: false,
            ambiguity_thresh: 0.3,
            ambiguity_by_negative_exponential: false,
            negative_exponential_coefficient: 3.0,
            disable_triplet_loss: false,
            sgt: 0.1,
            sgt_scales: vec![3, 2, 1],
            sgt_kernel_size: vec![5, 5, 5],
            sgt_margin: 0.3,
            sgt_isolated_margin: 0.65,
            disable_hardest_neg: false,
            disable_isolated_triplet: false,
            log_frequency: 250,
            load_weights_folder: None,
            models_to_load: ["encoder", "depth", "pose_encoder", "pose"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pretrained_encoder: None,
            disable_median_scaling: false,
            pred_depth_scale_factor: 1.0,
        }
    }
}

impl Options {
    /// Load options from a JSON file and validate them.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let options: Self = serde_json::from_reader(reader)?;
        options.validate()?;
        Ok(options)
    }

    /// Check every precondition of a training run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &(name, value) in &[("height", self.height), ("width", self.width)] {
            if value == 0 || value % 32 != 0 {
                return Err(ConfigError::NotMultipleOf32 { name, value });
            }
        }
        if self.frame_ids.first() != Some(&FrameId::REFERENCE) {
            return Err(ConfigError::ReferenceNotFirst(self.frame_ids.clone()));
        }
        let mut sorted = self.frame_ids.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.frame_ids.len() {
            return Err(invalid("frame_ids", "duplicated frame id"));
        }
        if self.all_frame_ids().len() < 2 {
            return Err(invalid("frame_ids", "at least one source frame is needed"));
        }
        if self.use_stereo && self.frame_ids.contains(&FrameId::Stereo) {
            return Err(invalid("frame_ids", "\"s\" is added by use_stereo"));
        }
        if self.predictive_mask && !self.disable_automasking {
            return Err(ConfigError::PredictiveMaskWithAutomasking);
        }
        if self.scales.is_empty() {
            return Err(invalid("scales", "at least one scale is needed"));
        }
        if !(self.min_depth > 0.0 && self.min_depth < self.max_depth) {
            return Err(invalid("min_depth", "expected 0 < min_depth < max_depth"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.log_frequency == 0 {
            return Err(invalid("log_frequency", "must be positive"));
        }
        if self.lr[2] < 1.0 || self.lr[5] < 1.0 {
            return Err(invalid("lr", "restart periods must be at least one epoch"));
        }
        if !(0.0..=1.0).contains(&self.mask_ratio) {
            return Err(invalid("mask_ratio", "must lie in [0, 1]"));
        }
        if self.sgt_scales.len() != self.sgt_kernel_size.len() {
            return Err(ConfigError::TripletLengths {
                scales: self.sgt_scales.len(),
                kernels: self.sgt_kernel_size.len(),
            });
        }
        if let Some(&k) = self.sgt_kernel_size.iter().find(|&&k| k % 2 == 0) {
            return Err(ConfigError::EvenKernel(k));
        }
        Ok(())
    }

    /// Every frame id, with the stereo frame appended when used.
    pub fn all_frame_ids(&self) -> Vec<FrameId> {
        let mut ids = self.frame_ids.clone();
        if self.use_stereo {
            ids.push(FrameId::Stereo);
        }
        ids
    }

    /// False for stereo only training, where no pose has to be predicted.
    pub fn use_pose_net(&self) -> bool {
        !(self.use_stereo && self.frame_ids == [FrameId::REFERENCE])
    }

    /// Number of pyramid levels every sample must provide.
    pub fn num_pyramid_levels(&self) -> usize {
        self.scales.iter().max().map_or(1, |&s| s + 1)
    }

    /// Folder of this run.
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.model_name)
    }

    /// Folder of the saved models of this run.
    pub fn models_dir(&self) -> PathBuf {
        self.log_path().join("models")
    }

    /// Warping stage parameters.
    pub fn warper(&self) -> ImageWarper {
        ImageWarper {
            v1_multiscale: self.v1_multiscale,
            posecnn_correction: self.pose_model_type == PoseModelType::Posecnn,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }

    /// Probability of the pose input corruption, if enabled.
    pub fn pose_mask_ratio(&self) -> Option<f64> {
        if self.disable_mask {
            None
        } else {
            Some(self.mask_ratio)
        }
    }

    /// Ambiguity weighting, if enabled.
    pub fn ambiguity_weighting(&self) -> Option<AmbiguityWeighting> {
        if self.disable_ambiguity_mask {
            None
        } else if self.ambiguity_by_negative_exponential {
            Some(AmbiguityWeighting::NegativeExponential(
                self.negative_exponential_coefficient,
            ))
        } else {
            Some(AmbiguityWeighting::Threshold(self.ambiguity_thresh))
        }
    }

    /// Boundary triplet loss, if enabled.
    pub fn boundary_triplet(&self) -> Option<BoundaryTriplet> {
        if self.disable_triplet_loss {
            return None;
        }
        Some(BoundaryTriplet {
            scales: self
                .sgt_scales
                .iter()
                .copied()
                .zip(self.sgt_kernel_size.iter().copied())
                .collect(),
            margin: self.sgt_margin,
            isolated_margin: self.sgt_isolated_margin,
            hardest_negative: !self.disable_hardest_neg,
            isolated: !self.disable_isolated_triplet,
        })
    }

    /// How predictions are compared to the ground truth at evaluation.
    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            eigen_crop: self.eval_split == "eigen",
            median_scaling: !self.disable_median_scaling,
            pred_depth_scale_factor: self.pred_depth_scale_factor,
        }
    }
} // impl Options

// TESTS #############################################################

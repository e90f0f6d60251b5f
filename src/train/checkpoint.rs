// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Saving and restoring networks and optimizer states.
//!
//! A run folder holds `models/opt.json` and two checkpoint folders,
//! `models/best` and `models/checkpoint` (the final one). Each of them
//! holds one JSON record per module plus `adam.json` and `adam_pose.json`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::network::{Optimizer, StateDict};
use crate::misc::type_aliases::Real;
use crate::train::config::Options;
use crate::train::error::TrainError;
use crate::train::pipeline::Networks;

/// File stem of the depth optimizer state.
pub const DEPTH_OPTIMIZER: &str = "adam";
/// File stem of the pose optimizer state.
pub const POSE_OPTIMIZER: &str = "adam_pose";

/// Saved parameters of one module.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Named flat tensors.
    pub tensors: StateDict,
    /// Input height, recorded for the encoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
    /// Input width, recorded for the encoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    /// Stereo training flag, recorded for the encoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_stereo: Option<bool>,
    /// Number of epochs, recorded in the final checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<usize>,
}

/// Which checkpoint folder to write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Best evaluation so far, overwritten at every improvement.
    Best,
    /// Written once at the end of training.
    Final,
}

impl CheckpointKind {
    /// Name of the folder.
    pub fn folder_name(self) -> &'static str {
        match self {
            CheckpointKind::Best => "best",
            CheckpointKind::Final => "checkpoint",
        }
    }
}

fn write_json<S: Serialize>(path: &Path, value: &S) -> Result<(), TrainError> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, value)?;
    Ok(())
}

fn read_json<D: for<'de> Deserialize<'de>>(path: &Path) -> Result<D, TrainError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn record_path(folder: &Path, name: &str) -> PathBuf {
    folder.join(format!("{}.json", name))
}

/// Write the options of a run to `models/opt.json`.
pub fn save_options(options: &Options) -> Result<PathBuf, TrainError> {
    let dir = options.models_dir();
    fs::create_dir_all(&dir)?;
    let path = dir.join("opt.json");
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, options)?;
    Ok(path)
}

/// Write every module and both optimizer states.
pub fn save_checkpoint<T: Real>(
    options: &Options,
    kind: CheckpointKind,
    networks: &Networks<T>,
    depth_optimizer: &dyn Optimizer,
    pose_optimizer: Option<&dyn Optimizer>,
) -> Result<PathBuf, TrainError> {
    let folder = options.models_dir().join(kind.folder_name());
    fs::create_dir_all(&folder)?;
    let epoch = match kind {
        CheckpointKind::Final => Some(options.num_epochs),
        CheckpointKind::Best => None,
    };
    for (name, tensors) in networks.depth_state_dicts() {
        let mut record = ModuleRecord {
            tensors,
            ..ModuleRecord::default()
        };
        if name == "encoder" {
            record.height = Some(options.height);
            record.width = Some(options.width);
            record.use_stereo = Some(options.use_stereo);
            record.epoch = epoch;
        }
        write_json(&record_path(&folder, name), &record)?;
    }
    for (name, tensors) in networks.pose_state_dicts() {
        let record = ModuleRecord {
            tensors,
            epoch,
            ..ModuleRecord::default()
        };
        write_json(&record_path(&folder, name), &record)?;
    }
    write_json(
        &record_path(&folder, DEPTH_OPTIMIZER),
        &depth_optimizer.state_dict(),
    )?;
    if let Some(pose_optimizer) = pose_optimizer {
        write_json(
            &record_path(&folder, POSE_OPTIMIZER),
            &pose_optimizer.state_dict(),
        )?;
    }
    info!("saved {} models to {}", kind.folder_name(), folder.display());
    Ok(folder)
}

/// Restore the modules listed in `models_to_load` from a checkpoint folder,
/// then the optimizer states when present.
///
/// Only tensors present both in the files and in the live modules are
/// restored. A missing optimizer state keeps the fresh one, with a warning.
pub fn load_checkpoint<T: Real>(
    folder: &Path,
    models_to_load: &[String],
    networks: &mut Networks<T>,
    depth_optimizer: &mut dyn Optimizer,
    pose_optimizer: Option<&mut dyn Optimizer>,
) -> Result<(), TrainError> {
    if !folder.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("cannot find folder {}", folder.display()),
        )
        .into());
    }
    info!("loading model from folder {}", folder.display());
    for name in models_to_load {
        let record: ModuleRecord = read_json(&record_path(folder, name))?;
        match networks.restore(name, &record.tensors)? {
            Some(restored) => info!("loaded {} tensors of {}", restored, name),
            None => warn!("no module {} to load weights into", name),
        }
    }
    load_optimizer(folder, DEPTH_OPTIMIZER, depth_optimizer)?;
    if let Some(pose_optimizer) = pose_optimizer {
        load_optimizer(folder, POSE_OPTIMIZER, pose_optimizer)?;
    }
    Ok(())
}

fn load_optimizer(
    folder: &Path,
    name: &str,
    optimizer: &mut dyn Optimizer,
) -> Result<(), TrainError> {
    let path = record_path(folder, name);
    if path.is_file() {
        let state: StateDict = read_json(&path)?;
        optimizer.load_state_dict(&state)?;
        info!("loaded {} state", name);
    } else {
        warn!("cannot find {} state, so it is freshly initialized", name);
    }
    Ok(())
}

/// Restore pretrained encoder weights, skipping normalization layers.
pub fn load_pretrained_encoder<T: Real>(
    path: &Path,
    networks: &mut Networks<T>,
) -> Result<usize, TrainError> {
    let record: ModuleRecord = read_json(path)?;
    let tensors: StateDict = record
        .tensors
        .into_iter()
        .filter(|(key, _)| !key.starts_with("norm"))
        .collect();
    let restored = networks.restore("encoder", &tensors)?.unwrap_or(0);
    info!("loaded {} pretrained encoder tensors", restored);
    Ok(restored)
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::image::Image;
    use crate::core::network::{
        DepthDecoder, DepthOutput, Encoder, Features, Module, NetworkError, PoseCnn,
        PoseParameters,
    };
    use crate::core::pose::PoseNetwork;

    /// Module holding its parameters in a state dict.
    struct Params(StateDict);

    impl Module for Params {
        fn set_train(&mut self, _train: bool) {}
        fn state_dict(&self) -> StateDict {
            self.0.clone()
        }
        fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NetworkError> {
            self.0 = state.clone();
            Ok(())
        }
    }

    impl Encoder<f32> for Params {
        fn forward(&self, image: &Image<f32>) -> Result<Features<f32>, NetworkError> {
            Ok(vec![image.clone()])
        }
    }

    impl DepthDecoder<f32> for Params {
        fn forward(&self, _features: &Features<f32>) -> Result<DepthOutput<f32>, NetworkError> {
            Ok(DepthOutput {
                disp: Vec::new(),
                features: Vec::new(),
            })
        }
    }

    impl PoseCnn<f32> for Params {
        fn forward(&self, _stacked: &Image<f32>) -> Result<Vec<PoseParameters<f32>>, NetworkError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Adam {
        lr: f64,
        state: StateDict,
    }

    impl Optimizer for Adam {
        fn zero_grad(&mut self) {}
        fn step(&mut self) {}
        fn learning_rate(&self) -> f64 {
            self.lr
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }
        fn state_dict(&self) -> StateDict {
            self.state.clone()
        }
        fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NetworkError> {
            self.state = state.clone();
            Ok(())
        }
    }

    fn dict(entries: &[(&str, f32)]) -> StateDict {
        entries
            .iter()
            .map(|&(k, v)| (k.to_string(), vec![v]))
            .collect()
    }

    fn networks(v: f32) -> Networks<f32> {
        Networks {
            encoder: Box::new(Params(dict(&[("conv", v), ("norm.weight", v)]))),
            depth: Box::new(Params(dict(&[("dec", v)]))),
            predictive_mask: None,
            pose: Some(PoseNetwork::Posecnn(Box::new(Params(dict(&[("pose", v)]))))),
        }
    }

    fn options(dir: &Path) -> Options {
        Options {
            log_dir: dir.to_path_buf(),
            model_name: "run".to_string(),
            ..Options::default()
        }
    }

    #[test]
    fn final_checkpoint_layout() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let adam = Adam {
            lr: 1e-4,
            state: dict(&[("step", 3.0)]),
        };
        let folder = save_checkpoint(
            &options,
            CheckpointKind::Final,
            &networks(1.0),
            &adam,
            Some(&adam),
        )
        .unwrap();
        assert_eq!(options.models_dir().join("checkpoint"), folder);
        for name in &["encoder", "depth", "pose", "adam", "adam_pose"] {
            assert!(record_path(&folder, name).is_file(), "missing {}", name);
        }
        let encoder: ModuleRecord = read_json(&record_path(&folder, "encoder")).unwrap();
        assert_eq!(Some(192), encoder.height);
        assert_eq!(Some(640), encoder.width);
        assert_eq!(Some(false), encoder.use_stereo);
        assert_eq!(Some(50), encoder.epoch);
        let depth: ModuleRecord = read_json(&record_path(&folder, "depth")).unwrap();
        assert_eq!(None, depth.height);
    }

    #[test]
    fn restore_round_trip_and_missing_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let adam = Adam::default();
        let folder =
            save_checkpoint(&options, CheckpointKind::Best, &networks(2.0), &adam, None).unwrap();

        let mut nets = networks(0.0);
        let mut depth_opt = Adam {
            lr: 0.5,
            state: dict(&[("fresh", 1.0)]),
        };
        let mut pose_opt = Adam::default();
        let names: Vec<String> = ["encoder", "depth", "pose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        load_checkpoint(&folder, &names, &mut nets, &mut depth_opt, Some(&mut pose_opt)).unwrap();
        assert_eq!(vec![2.0], nets.encoder.state_dict()["conv"]);
        assert_eq!(vec![2.0], nets.depth.state_dict()["dec"]);
        assert_eq!(vec![2.0], nets.pose_state_dicts()["pose"]["pose"]);
        // adam.json was saved empty, adam_pose.json not at all.
        assert!(depth_opt.state.is_empty());
        assert!(pose_opt.state.is_empty());
    }

    #[test]
    fn missing_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut nets = networks(0.0);
        let mut adam = Adam::default();
        let result = load_checkpoint(&dir.path().join("nope"), &[], &mut nets, &mut adam, None);
        assert!(matches!(result, Err(TrainError::Io(_))));
    }

    #[test]
    fn pretrained_encoder_skips_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrained.json");
        let record = ModuleRecord {
            tensors: dict(&[("conv", 5.0), ("norm.weight", 5.0), ("head", 5.0)]),
            ..ModuleRecord::default()
        };
        write_json(&path, &record).unwrap();
        let mut nets = networks(0.0);
        assert_eq!(1, load_pretrained_encoder(&path, &mut nets).unwrap());
        let encoder = nets.encoder.state_dict();
        assert_eq!(vec![5.0], encoder["conv"]);
        assert_eq!(vec![0.0], encoder["norm.weight"]);
        assert!(!encoder.contains_key("head"));
    }

    #[test]
    fn options_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let path = save_options(&options).unwrap();
        let back: Options = read_json(&path).unwrap();
        assert_eq!(options, back);
    }
}

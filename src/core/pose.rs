// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Relative pose between the reference frame and every source frame.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::batch::{BatchError, FrameId, Sample};
use crate::core::image::Image;
use crate::core::network::{
    restore_overlapping, Encoder, Features, Module, NetworkError, PoseCnn, PoseDecoder,
    PoseParameters, StateDict,
};
use crate::math::se3;
use crate::misc::type_aliases::{Mat4, Real};

/// Flavor of pose network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseModelType {
    /// Dedicated encoder on channel stacked frames, then a pose decoder.
    SeparateResnet,
    /// Pose decoder on the features of the depth encoder.
    Shared,
    /// One network on channel stacked frames.
    Posecnn,
}

/// How frames are fed to the pose network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseInputMode {
    /// One call per source frame, on the temporally ordered pair.
    Pairs,
    /// One call on all frames, predicting every transform at once.
    All,
}

/// Pose network, in one of its flavors.
pub enum PoseNetwork<T: Real> {
    /// Separate encoder and decoder.
    SeparateResnet {
        /// Encoder of channel stacked frames.
        encoder: Box<dyn Encoder<T>>,
        /// Pose decoder.
        decoder: Box<dyn PoseDecoder<T>>,
    },
    /// Decoder on shared depth encoder features.
    Shared {
        /// Pose decoder.
        decoder: Box<dyn PoseDecoder<T>>,
    },
    /// Monolithic network.
    Posecnn(Box<dyn PoseCnn<T>>),
}

impl<T: Real> PoseNetwork<T> {
    /// Flavor of this network.
    pub fn model_type(&self) -> PoseModelType {
        match self {
            PoseNetwork::SeparateResnet { .. } => PoseModelType::SeparateResnet,
            PoseNetwork::Shared { .. } => PoseModelType::Shared,
            PoseNetwork::Posecnn(_) => PoseModelType::Posecnn,
        }
    }

    /// Switch every module between training and inference behavior.
    pub fn set_train(&mut self, train: bool) {
        match self {
            PoseNetwork::SeparateResnet { encoder, decoder } => {
                encoder.set_train(train);
                decoder.set_train(train);
            }
            PoseNetwork::Shared { decoder } => decoder.set_train(train),
            PoseNetwork::Posecnn(net) => net.set_train(train),
        }
    }

    /// Parameters of every module, keyed by the module name used in checkpoints.
    pub fn state_dicts(&self) -> BTreeMap<&'static str, StateDict> {
        let mut dicts = BTreeMap::new();
        match self {
            PoseNetwork::SeparateResnet { encoder, decoder } => {
                dicts.insert("pose_encoder", encoder.state_dict());
                dicts.insert("pose", decoder.state_dict());
            }
            PoseNetwork::Shared { decoder } => {
                dicts.insert("pose", decoder.state_dict());
            }
            PoseNetwork::Posecnn(net) => {
                dicts.insert("pose", net.state_dict());
            }
        }
        dicts
    }

    /// Restore the overlapping parameters of the module called `name`.
    ///
    /// Returns `None` when this network has no such module.
    pub fn restore(
        &mut self,
        name: &str,
        loaded: &StateDict,
    ) -> Result<Option<usize>, NetworkError> {
        let restored = match (self, name) {
            (PoseNetwork::SeparateResnet { encoder, .. }, "pose_encoder") => {
                restore_overlapping(encoder.as_mut(), loaded)?
            }
            (PoseNetwork::SeparateResnet { decoder, .. }, "pose")
            | (PoseNetwork::Shared { decoder }, "pose") => {
                restore_overlapping(decoder.as_mut(), loaded)?
            }
            (PoseNetwork::Posecnn(net), "pose") => restore_overlapping(net.as_mut(), loaded)?,
            _ => return Ok(None),
        };
        Ok(Some(restored))
    }

    /// Predict poses from image inputs, or from per frame features
    /// for the shared flavor.
    fn predict(&self, input: PoseInput<'_, T>) -> Result<Vec<PoseParameters<T>>, NetworkError> {
        match (self, input) {
            (PoseNetwork::SeparateResnet { encoder, decoder }, PoseInput::Stacked(img)) => {
                let features = encoder.forward(&img)?;
                decoder.forward(&[&features])
            }
            (PoseNetwork::Posecnn(net), PoseInput::Stacked(img)) => net.forward(&img),
            (PoseNetwork::Shared { decoder }, PoseInput::Features(features)) => {
                decoder.forward(&features)
            }
            _ => Err(NetworkError::Contract {
                module: "pose",
                reason: "input kind does not match the pose model type".to_string(),
            }),
        }
    }
} // impl PoseNetwork

/// Inputs of one pose network call.
enum PoseInput<'a, T: Real> {
    Stacked(Image<T>),
    Features(Vec<&'a Features<T>>),
}

/// Relative transform from the reference frame to a source frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RelativePose<T: Real> {
    /// 4x4 homogeneous transform used to warp the source frame.
    pub transform: Mat4<T>,
    /// Raw network prediction, `None` for fixed stereo transforms.
    pub parameters: Option<PoseParameters<T>>,
    /// Whether the parameters were inverted to build the transform.
    pub inverted: bool,
}

impl<T: Real> RelativePose<T> {
    fn predicted(parameters: PoseParameters<T>, inverted: bool) -> Self {
        Self {
            transform: se3::transformation_from_parameters(
                parameters.axisangle,
                parameters.translation,
                inverted,
            ),
            parameters: Some(parameters),
            inverted,
        }
    }
}

/// Error of the pose estimation.
#[derive(Debug, thiserror::Error)]
pub enum PoseError {
    /// Missing sample quantities.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Failing network.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Frames fed to the pose network for a source frame,
/// always in temporal order `[earlier, later]`.
pub fn temporal_pair(source: FrameId) -> [FrameId; 2] {
    if source.is_before_reference() {
        [source, FrameId::REFERENCE]
    } else {
        [FrameId::REFERENCE, source]
    }
}

/// Random spatial mask with every location set with probability `ratio`.
pub fn corruption_mask<R: Rng>(
    rows: usize,
    cols: usize,
    ratio: f64,
    rng: &mut R,
) -> DMatrix<bool> {
    DMatrix::from_fn(rows, cols, |_, _| rng.gen::<f64>() < ratio)
}

/// Pose estimation over the frames of one sample.
pub struct PoseEstimator<'a, T: Real> {
    /// Pose network.
    pub network: &'a PoseNetwork<T>,
    /// Pairwise or joint prediction.
    pub mode: PoseInputMode,
    /// All frame ids, reference first.
    pub frame_ids: &'a [FrameId],
    /// Probability of zeroing each location of the pose inputs,
    /// `None` to disable the corruption.
    pub mask_ratio: Option<f64>,
}

impl<'a, T: Real> PoseEstimator<'a, T> {
    /// Relative pose of every source frame of a sample.
    ///
    /// `features` holds the depth encoder features per frame, required
    /// by the shared flavor only.
    pub fn estimate<R: Rng>(
        &self,
        sample: &Sample<T>,
        features: &BTreeMap<FrameId, Features<T>>,
        rng: &mut R,
    ) -> Result<BTreeMap<FrameId, RelativePose<T>>, PoseError> {
        let mut poses = BTreeMap::new();
        let sources = &self.frame_ids[1.min(self.frame_ids.len())..];
        if sources.contains(&FrameId::Stereo) {
            poses.insert(
                FrameId::Stereo,
                RelativePose {
                    transform: *sample.stereo_t()?,
                    parameters: None,
                    inverted: false,
                },
            );
        }
        match self.mode {
            PoseInputMode::Pairs => {
                self.estimate_pairs(sample, features, sources, rng, &mut poses)?;
            }
            PoseInputMode::All => self.estimate_all(sample, features, sources, &mut poses)?,
        }
        Ok(poses)
    }

    fn estimate_pairs<R: Rng>(
        &self,
        sample: &Sample<T>,
        features: &BTreeMap<FrameId, Features<T>>,
        sources: &[FrameId],
        rng: &mut R,
        poses: &mut BTreeMap<FrameId, RelativePose<T>>,
    ) -> Result<(), PoseError> {
        let shared = self.network.model_type() == PoseModelType::Shared;
        let mut images = BTreeMap::new();
        if !shared {
            for &frame in self.frame_ids.iter().filter(|&&f| f != FrameId::Stereo) {
                images.insert(frame, sample.color_aug(frame, 0)?.clone());
            }
            if let Some(ratio) = self.mask_ratio {
                let (rows, cols) = sample.color_aug(FrameId::REFERENCE, 0)?.shape();
                let mask = corruption_mask(rows, cols, ratio, rng);
                for image in images.values_mut() {
                    image.zero_where(&mask);
                }
            }
        }
        for &source in sources.iter().filter(|&&f| f != FrameId::Stereo) {
            let pair = temporal_pair(source);
            let input = if shared {
                PoseInput::Features(
                    pair.iter()
                        .map(|f| shared_features(features, *f))
                        .collect::<Result<_, _>>()?,
                )
            } else {
                let pair_images = [image_of(&images, pair[0])?, image_of(&images, pair[1])?];
                PoseInput::Stacked(Image::stack(&pair_images))
            };
            let parameters = first_prediction(self.network.predict(input)?)?;
            poses.insert(
                source,
                RelativePose::predicted(parameters, source.is_before_reference()),
            );
        }
        Ok(())
    }

    fn estimate_all(
        &self,
        sample: &Sample<T>,
        features: &BTreeMap<FrameId, Features<T>>,
        sources: &[FrameId],
        poses: &mut BTreeMap<FrameId, RelativePose<T>>,
    ) -> Result<(), PoseError> {
        let frames: Vec<FrameId> = self
            .frame_ids
            .iter()
            .copied()
            .filter(|&f| f != FrameId::Stereo)
            .collect();
        let input = if self.network.model_type() == PoseModelType::Shared {
            PoseInput::Features(
                frames
                    .iter()
                    .map(|&f| shared_features(features, f))
                    .collect::<Result<_, _>>()?,
            )
        } else {
            let images = frames
                .iter()
                .map(|&f| sample.color_aug(f, 0))
                .collect::<Result<Vec<_>, _>>()?;
            PoseInput::Stacked(Image::stack(&images))
        };
        let predictions = self.network.predict(input)?;
        // The i-th prediction belongs to the i-th source frame, never inverted.
        for (i, &source) in sources.iter().enumerate() {
            if source == FrameId::Stereo {
                continue;
            }
            let parameters = *predictions.get(i).ok_or_else(|| NetworkError::Contract {
                module: "pose",
                reason: format!("no prediction for source frame {}", source),
            })?;
            poses.insert(source, RelativePose::predicted(parameters, false));
        }
        Ok(())
    }
} // impl PoseEstimator

fn image_of<T: Real>(
    images: &BTreeMap<FrameId, Image<T>>,
    frame: FrameId,
) -> Result<&Image<T>, BatchError> {
    images.get(&frame).ok_or(BatchError::MissingImage {
        quantity: "color_aug",
        frame,
        scale: 0,
    })
}

fn shared_features<T: Real>(
    features: &BTreeMap<FrameId, Features<T>>,
    frame: FrameId,
) -> Result<&Features<T>, NetworkError> {
    features.get(&frame).ok_or_else(|| NetworkError::Contract {
        module: "encoder",
        reason: format!("no features for frame {}", frame),
    })
}

fn first_prediction<T: Real>(
    predictions: Vec<PoseParameters<T>>,
) -> Result<PoseParameters<T>, NetworkError> {
    predictions
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::Contract {
            module: "pose",
            reason: "empty prediction".to_string(),
        })
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::misc::type_aliases::Vec3;
    use rand::{rngs::StdRng, SeedableRng};

    /// Pose network predicting an x translation equal to the mean of the
    /// later frame minus the mean of the earlier one, and a y translation
    /// equal to the index of the prediction.
    struct MeanShift {
        nb_outputs: usize,
    }

    impl Module for MeanShift {
        fn set_train(&mut self, _train: bool) {}
        fn state_dict(&self) -> StateDict {
            StateDict::new()
        }
        fn load_state_dict(&mut self, _state: &StateDict) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    impl PoseCnn<f64> for MeanShift {
        fn forward(&self, stacked: &Image<f64>) -> Result<Vec<PoseParameters<f64>>, NetworkError> {
            let mean = |c: usize| crate::core::image::mean(&stacked.channels[c]);
            let shift = mean(stacked.nb_channels() / 2) - mean(0);
            Ok((0..self.nb_outputs)
                .map(|i| PoseParameters {
                    axisangle: Vec3::zeros(),
                    translation: Vec3::new(shift, i as f64, 0.0),
                })
                .collect())
        }
    }

    fn sample(values: &[(i32, f64)]) -> Sample<f64> {
        let color = values
            .iter()
            .map(|&(id, v)| (FrameId::Offset(id), Image::gray(DMatrix::repeat(4, 4, v))))
            .collect();
        let color_aug: BTreeMap<_, _> = values
            .iter()
            .map(|&(id, v)| (FrameId::Offset(id), Image::gray(DMatrix::repeat(4, 4, v))))
            .collect();
        Sample::from_frames(color, color_aug, &Mat4::identity(), 1).unwrap()
    }

    fn network(nb_outputs: usize) -> PoseNetwork<f64> {
        PoseNetwork::Posecnn(Box::new(MeanShift { nb_outputs }))
    }

    #[test]
    fn pairs_are_temporally_ordered() {
        assert_eq!(
            [FrameId::Offset(-1), FrameId::Offset(0)],
            temporal_pair(FrameId::Offset(-1))
        );
        assert_eq!(
            [FrameId::Offset(0), FrameId::Offset(1)],
            temporal_pair(FrameId::Offset(1))
        );
    }

    #[test]
    fn earlier_frames_get_inverted_transforms() {
        let net = network(1);
        let ids = [FrameId::Offset(0), FrameId::Offset(-1), FrameId::Offset(1)];
        let estimator = PoseEstimator {
            network: &net,
            mode: PoseInputMode::Pairs,
            frame_ids: &ids,
            mask_ratio: None,
        };
        let s = sample(&[(0, 0.5), (-1, 0.2), (1, 0.9)]);
        let mut rng = StdRng::seed_from_u64(0);
        let poses = estimator.estimate(&s, &BTreeMap::new(), &mut rng).unwrap();

        let before = &poses[&FrameId::Offset(-1)];
        assert!(before.inverted);
        // Pair [-1, 0]: shift 0.5 - 0.2, then negated by the inversion.
        assert!((before.transform[(0, 3)] + 0.3).abs() < 1e-12);

        let after = &poses[&FrameId::Offset(1)];
        assert!(!after.inverted);
        assert!((after.transform[(0, 3)] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn joint_mode_assigns_predictions_in_order() {
        let net = network(2);
        let ids = [FrameId::Offset(0), FrameId::Offset(-1), FrameId::Offset(1)];
        let estimator = PoseEstimator {
            network: &net,
            mode: PoseInputMode::All,
            frame_ids: &ids,
            mask_ratio: None,
        };
        let s = sample(&[(0, 0.5), (-1, 0.2), (1, 0.9)]);
        let mut rng = StdRng::seed_from_u64(0);
        let poses = estimator.estimate(&s, &BTreeMap::new(), &mut rng).unwrap();
        assert!(!poses[&FrameId::Offset(-1)].inverted);
        assert_eq!(0.0, poses[&FrameId::Offset(-1)].transform[(1, 3)]);
        assert_eq!(1.0, poses[&FrameId::Offset(1)].transform[(1, 3)]);
    }

    #[test]
    fn stereo_uses_the_fixed_transform() {
        let net = network(1);
        let ids = [FrameId::Offset(0), FrameId::Stereo];
        let estimator = PoseEstimator {
            network: &net,
            mode: PoseInputMode::Pairs,
            frame_ids: &ids,
            mask_ratio: None,
        };
        let mut s = sample(&[(0, 0.5)]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            estimator.estimate(&s, &BTreeMap::new(), &mut rng),
            Err(PoseError::Batch(BatchError::MissingStereoTransform))
        ));
        let mut stereo = Mat4::identity();
        stereo[(0, 3)] = -0.1;
        s.stereo_t = Some(stereo);
        let poses = estimator.estimate(&s, &BTreeMap::new(), &mut rng).unwrap();
        assert_eq!(stereo, poses[&FrameId::Stereo].transform);
        assert_eq!(None, poses[&FrameId::Stereo].parameters);
    }

    #[test]
    fn full_corruption_zeroes_pose_inputs() {
        let net = network(1);
        let ids = [FrameId::Offset(0), FrameId::Offset(1)];
        let estimator = PoseEstimator {
            network: &net,
            mode: PoseInputMode::Pairs,
            frame_ids: &ids,
            mask_ratio: Some(1.0),
        };
        let s = sample(&[(0, 0.5), (1, 0.9)]);
        let mut rng = StdRng::seed_from_u64(3);
        let poses = estimator.estimate(&s, &BTreeMap::new(), &mut rng).unwrap();
        assert_eq!(0.0, poses[&FrameId::Offset(1)].transform[(0, 3)]);
        // The sample itself is left untouched.
        assert_eq!(0.9, s.color_aug(FrameId::Offset(1), 0).unwrap().channels[0][(0, 0)]);
    }

    #[test]
    fn corruption_ratio_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(corruption_mask(8, 8, 0.0, &mut rng).iter().all(|&m| !m));
        assert!(corruption_mask(8, 8, 1.0, &mut rng).iter().all(|&m| m));
    }

    #[test]
    fn shared_flavor_requires_features() {
        struct NullDecoder;
        impl Module for NullDecoder {
            fn set_train(&mut self, _train: bool) {}
            fn state_dict(&self) -> StateDict {
                StateDict::new()
            }
            fn load_state_dict(&mut self, _state: &StateDict) -> Result<(), NetworkError> {
                Ok(())
            }
        }
        impl PoseDecoder<f64> for NullDecoder {
            fn forward(
                &self,
                features: &[&Features<f64>],
            ) -> Result<Vec<PoseParameters<f64>>, NetworkError> {
                assert_eq!(2, features.len());
                Ok(vec![PoseParameters {
                    axisangle: Vec3::zeros(),
                    translation: Vec3::zeros(),
                }])
            }
        }
        let net = PoseNetwork::Shared {
            decoder: Box::new(NullDecoder),
        };
        let ids = [FrameId::Offset(0), FrameId::Offset(1)];
        let estimator = PoseEstimator {
            network: &net,
            mode: PoseInputMode::Pairs,
            frame_ids: &ids,
            mask_ratio: None,
        };
        let s = sample(&[(0, 0.5), (1, 0.9)]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(estimator.estimate(&s, &BTreeMap::new(), &mut rng).is_err());
        let features: BTreeMap<_, _> = ids
            .iter()
            .map(|&f| (f, vec![Image::gray(DMatrix::zeros(2, 2))]))
            .collect();
        let poses = estimator.estimate(&s, &features, &mut rng).unwrap();
        assert_eq!(Mat4::identity(), poses[&FrameId::Offset(1)].transform);
        let dicts = net.state_dicts();
        assert_eq!(vec!["pose"], dicts.keys().copied().collect::<Vec<_>>());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Forward pass of a training batch and composition of the total loss.
//!
//! For every sample, the depth network predicts a disparity per scale,
//! the pose network a transform per source frame, and every source frame
//! is warped into the reference view. At every scale, the per pixel
//! photometric errors go through automasking (or predictive masking)
//! and ambiguity masking, and an edge-aware smoothness term is added.
//! The boundary triplet loss is accumulated over the whole batch.
//!
//! Per scale losses are means over pixels, averaged over samples.

use std::collections::BTreeMap;

use log::debug;
use nalgebra::DMatrix;
use rand::Rng;

use crate::core::ambiguity::{ambiguity_mask, AmbiguityWeighting};
use crate::core::automask::{self, apply_predictive_mask, Automasked};
use crate::core::batch::{BatchError, FrameId, Sample};
use crate::core::boundary::{segmentation_at_scale, BoundaryTriplet};
use crate::core::image::{mean, Image};
use crate::core::multires::resize_bilinear;
use crate::core::network::{
    restore_overlapping, DepthDecoder, DepthOutput, Encoder, Features, MaskDecoder, NetworkError,
    StateDict,
};
use crate::core::photometric::reprojection_loss;
use crate::core::pose::{PoseEstimator, PoseInputMode, PoseModelType, PoseNetwork, RelativePose};
use crate::core::smoothness::smoothness_loss;
use crate::core::warp::{ImageWarper, ScaleWarp, WarpError};
use crate::misc::type_aliases::{real, value, Real};
use crate::train::config::{ConfigError, Options};
use crate::train::error::TrainError;

/// Every network of a training run.
pub struct Networks<T: Real> {
    /// Depth encoder.
    pub encoder: Box<dyn Encoder<T>>,
    /// Depth decoder.
    pub depth: Box<dyn DepthDecoder<T>>,
    /// Predictive mask decoder, if used.
    pub predictive_mask: Option<Box<dyn MaskDecoder<T>>>,
    /// Pose network, absent for stereo only training.
    pub pose: Option<PoseNetwork<T>>,
}

impl<T: Real> Networks<T> {
    /// Switch every network between training and inference behavior.
    pub fn set_train(&mut self, train: bool) {
        self.encoder.set_train(train);
        self.depth.set_train(train);
        if let Some(mask) = self.predictive_mask.as_mut() {
            mask.set_train(train);
        }
        if let Some(pose) = self.pose.as_mut() {
            pose.set_train(train);
        }
    }

    /// Parameters of the depth side modules, keyed by module name.
    pub fn depth_state_dicts(&self) -> BTreeMap<&'static str, StateDict> {
        let mut dicts = BTreeMap::new();
        dicts.insert("encoder", self.encoder.state_dict());
        dicts.insert("depth", self.depth.state_dict());
        if let Some(mask) = self.predictive_mask.as_ref() {
            dicts.insert("predictive_mask", mask.state_dict());
        }
        dicts
    }

    /// Parameters of the pose side modules, keyed by module name.
    pub fn pose_state_dicts(&self) -> BTreeMap<&'static str, StateDict> {
        self.pose
            .as_ref()
            .map(PoseNetwork::state_dicts)
            .unwrap_or_default()
    }

    /// Restore the overlapping parameters of the module called `name`.
    ///
    /// Returns `None` when there is no such module.
    pub fn restore(
        &mut self,
        name: &str,
        loaded: &StateDict,
    ) -> Result<Option<usize>, NetworkError> {
        match name {
            "encoder" => restore_overlapping(self.encoder.as_mut(), loaded).map(Some),
            "depth" => restore_overlapping(self.depth.as_mut(), loaded).map(Some),
            "predictive_mask" => match self.predictive_mask.as_mut() {
                Some(mask) => restore_overlapping(mask.as_mut(), loaded).map(Some),
                None => Ok(None),
            },
            _ => match self.pose.as_mut() {
                Some(pose) => pose.restore(name, loaded),
                None => Ok(None),
            },
        }
    }
} // impl Networks

/// Named loss terms of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct LossTerms<T> {
    /// Loss at every scale, reprojection plus smoothness.
    pub per_scale: Vec<(usize, T)>,
    /// Unweighted boundary triplet loss, if enabled.
    pub boundary: Option<T>,
    /// Sum of the per scale losses plus the weighted triplet loss.
    pub total: T,
}

impl<T: Real> LossTerms<T> {
    /// Values of every term, named as in the logs.
    pub fn named(&self) -> Vec<(String, f64)> {
        let mut terms: Vec<(String, f64)> = self
            .per_scale
            .iter()
            .map(|(scale, loss)| (format!("loss/{}", scale), value(*loss)))
            .collect();
        if let Some(boundary) = self.boundary {
            terms.push(("sgt_loss".to_string(), value(boundary)));
        }
        terms.push(("loss".to_string(), value(self.total)));
        terms
    }
}

/// Output of the forward pass of a batch.
#[derive(Clone, Debug)]
pub struct BatchOutput<T: Real> {
    /// Loss terms.
    pub losses: LossTerms<T>,
    /// Depth predicted at the finest loss scale, per sample.
    pub depth: Vec<DMatrix<T>>,
    /// Automasking selections per sample and scale, true where
    /// a reprojection error won.
    pub selections: Vec<Vec<DMatrix<bool>>>,
}

/// Parameters of the forward pass and loss composition.
#[derive(Clone, Debug, PartialEq)]
pub struct Pipeline {
    /// All frame ids, reference first.
    pub frame_ids: Vec<FrameId>,
    /// Loss scales.
    pub scales: Vec<usize>,
    /// Pyramid levels required from every sample.
    pub pyramid_levels: usize,
    /// Input resolution `(height, width)`.
    pub resolution: (usize, usize),
    /// Warping stage.
    pub warper: ImageWarper,
    /// Plain L1 photometric error.
    pub no_ssim: bool,
    /// Average errors over source frames before the minimum.
    pub avg_reprojection: bool,
    /// Minimum over identity and reprojection errors.
    pub automasking: bool,
    /// Use the predictive mask decoder.
    pub predictive_mask: bool,
    /// Ambiguity weighting, if enabled.
    pub ambiguity: Option<AmbiguityWeighting>,
    /// Weight of the smoothness term.
    pub disparity_smoothness: f64,
    /// Boundary triplet loss and its weight, if enabled.
    pub boundary: Option<(BoundaryTriplet, f64)>,
    /// How frames are fed to the pose network.
    pub pose_mode: PoseInputMode,
    /// Probability of the pose input corruption, if enabled.
    pub pose_mask_ratio: Option<f64>,
}

impl Pipeline {
    /// Pipeline of validated options.
    pub fn new(options: &Options) -> Self {
        Self {
            frame_ids: options.all_frame_ids(),
            scales: options.scales.clone(),
            pyramid_levels: options.num_pyramid_levels(),
            resolution: (options.height, options.width),
            warper: options.warper(),
            no_ssim: options.no_ssim,
            avg_reprojection: options.avg_reprojection,
            automasking: !options.disable_automasking,
            predictive_mask: options.predictive_mask,
            ambiguity: options.ambiguity_weighting(),
            disparity_smoothness: options.disparity_smoothness,
            boundary: options.boundary_triplet().map(|b| (b, options.sgt)),
            pose_mode: options.pose_model_input,
            pose_mask_ratio: options.pose_mask_ratio(),
        }
    }

    fn sources(&self) -> &[FrameId] {
        &self.frame_ids[1.min(self.frame_ids.len())..]
    }

    /// Forward pass of a batch and its loss terms.
    pub fn process_batch<T: Real, R: Rng>(
        &self,
        networks: &Networks<T>,
        batch: &[Sample<T>],
        rng: &mut R,
    ) -> Result<BatchOutput<T>, TrainError> {
        if batch.is_empty() {
            return Err(BatchError::Empty.into());
        }
        let finest = self.scales.iter().copied().min().unwrap_or(0);
        let mut scale_sums = vec![T::zero(); self.scales.len()];
        let mut depth = Vec::with_capacity(batch.len());
        let mut selections = Vec::with_capacity(batch.len());
        let mut decoder_outputs = Vec::with_capacity(batch.len());
        for sample in batch {
            sample.check(&self.frame_ids, self.pyramid_levels)?;
            let (features, output) = self.predict_depth(networks, sample)?;
            let masks = match (&networks.predictive_mask, self.predictive_mask) {
                (Some(decoder), true) => Some(decoder.forward(&features[&FrameId::REFERENCE])?),
                _ => None,
            };
            let poses = self.predict_poses(networks, sample, &features, rng)?;
            let mut sample_selections = Vec::new();
            for (k, &scale) in self.scales.iter().enumerate() {
                let disp = output.disp.get(scale).ok_or_else(|| NetworkError::Contract {
                    module: "depth",
                    reason: format!("no disparity at scale {}", scale),
                })?;
                let warped = self
                    .warper
                    .warp(sample, disp, scale, self.sources(), &poses)?;
                let (loss, selection) =
                    self.scale_loss(sample, disp, scale, &warped, masks.as_deref(), rng)?;
                debug!("scale {} loss {:.5}", scale, value(loss));
                scale_sums[k] += loss;
                if let Some(selection) = selection {
                    sample_selections.push(selection);
                }
                if scale == finest {
                    depth.push(warped.depth);
                }
            }
            selections.push(sample_selections);
            decoder_outputs.push(output);
        }

        let nb_samples: T = real(batch.len() as f64);
        let per_scale: Vec<(usize, T)> = self
            .scales
            .iter()
            .copied()
            .zip(scale_sums.into_iter().map(|s| s / nb_samples))
            .collect();
        let mut total = per_scale.iter().fold(T::zero(), |acc, (_, l)| acc + *l);
        let boundary = match &self.boundary {
            Some((triplet, weight)) => {
                let loss = self.boundary_loss(triplet, batch, &decoder_outputs)?;
                total += real::<T>(*weight) * loss;
                Some(loss)
            }
            None => None,
        };
        Ok(BatchOutput {
            losses: LossTerms {
                per_scale,
                boundary,
                total,
            },
            depth,
            selections,
        })
    }

    /// Encoder features of the frames that need them, and depth decoder output.
    ///
    /// The shared pose flavor needs the features of every frame,
    /// otherwise only the reference frame is encoded.
    fn predict_depth<T: Real>(
        &self,
        networks: &Networks<T>,
        sample: &Sample<T>,
    ) -> Result<(BTreeMap<FrameId, Features<T>>, DepthOutput<T>), TrainError> {
        let shared = networks
            .pose
            .as_ref()
            .map_or(false, |p| p.model_type() == PoseModelType::Shared);
        let encoded: &[FrameId] = if shared {
            &self.frame_ids
        } else {
            &self.frame_ids[..1.min(self.frame_ids.len())]
        };
        let mut features = BTreeMap::new();
        for &frame in encoded {
            features.insert(frame, networks.encoder.forward(sample.color_aug(frame, 0)?)?);
        }
        let reference = features
            .get(&FrameId::REFERENCE)
            .ok_or(BatchError::MissingImage {
                quantity: "color_aug",
                frame: FrameId::REFERENCE,
                scale: 0,
            })?;
        let output = networks.depth.forward(reference)?;
        Ok((features, output))
    }

    /// Relative pose of every source frame.
    fn predict_poses<T: Real, R: Rng>(
        &self,
        networks: &Networks<T>,
        sample: &Sample<T>,
        features: &BTreeMap<FrameId, Features<T>>,
        rng: &mut R,
    ) -> Result<BTreeMap<FrameId, RelativePose<T>>, TrainError> {
        match &networks.pose {
            Some(network) => {
                let estimator = PoseEstimator {
                    network,
                    mode: self.pose_mode,
                    frame_ids: &self.frame_ids,
                    mask_ratio: self.pose_mask_ratio,
                };
                Ok(estimator.estimate(sample, features, rng)?)
            }
            None => {
                let mut poses = BTreeMap::new();
                if self.sources().contains(&FrameId::Stereo) {
                    poses.insert(
                        FrameId::Stereo,
                        RelativePose {
                            transform: *sample.stereo_t()?,
                            parameters: None,
                            inverted: false,
                        },
                    );
                }
                Ok(poses)
            }
        }
    }

    /// Loss of one sample at one scale, and the automasking selection.
    fn scale_loss<T: Real, R: Rng>(
        &self,
        sample: &Sample<T>,
        disp: &DMatrix<T>,
        scale: usize,
        warped: &ScaleWarp<T>,
        masks: Option<&[Image<T>]>,
        rng: &mut R,
    ) -> Result<(T, Option<DMatrix<bool>>), TrainError> {
        let source_scale = warped.source_scale;
        let target = sample.color(FrameId::REFERENCE, source_scale)?;
        let mut reprojection = Vec::new();
        let mut identity = Vec::new();
        let mut sources = Vec::new();
        let mut grids = Vec::new();
        for &frame in self.sources() {
            let view = warped
                .views
                .get(&frame)
                .ok_or(WarpError::MissingPose(frame))?;
            reprojection.push(reprojection_loss(&view.color, target, self.no_ssim));
            let source = sample.color(frame, source_scale)?;
            if self.automasking {
                identity.push(reprojection_loss(source, target, self.no_ssim));
            }
            sources.push(source);
            grids.push(&view.grid);
        }

        let mut loss = T::zero();
        if !self.automasking {
            if let Some(masks) = masks {
                let planes =
                    predictive_planes(masks, scale, target.shape(), self.warper.v1_multiscale)?;
                loss += apply_predictive_mask(&mut reprojection, &planes);
            }
        }
        if self.avg_reprojection {
            reprojection = automask::average(&reprojection).into_iter().collect();
            identity = automask::average(&identity).into_iter().collect();
        }

        let ambiguity = match self.ambiguity {
            Some(weighting) => {
                let (_, min_idx) = automask::argmin(&reprojection).ok_or_else(no_source)?;
                Some(ambiguity_mask(target, &sources, &grids, &min_idx, weighting))
            }
            None => None,
        };

        let (mut to_optimise, selection) = if self.automasking {
            let Automasked {
                to_optimise,
                selection,
            } = automask::automask(identity, reprojection, rng).ok_or_else(no_source)?;
            (to_optimise, Some(selection))
        } else {
            let (min, _) = automask::argmin(&reprojection).ok_or_else(no_source)?;
            (min, None)
        };
        if let Some(weights) = ambiguity {
            to_optimise.component_mul_assign(&weights);
        }
        loss += mean(&to_optimise);

        let color = sample.color(FrameId::REFERENCE, scale)?;
        let smoothness = smoothness_loss(disp, color);
        let scale_factor: T = real((1_u64 << scale) as f64);
        loss += real::<T>(self.disparity_smoothness) * smoothness / scale_factor;
        Ok((loss, selection))
    }

    /// Sum over the triplet scales of the batch loss at that scale, over `2^scale`.
    fn boundary_loss<T: Real>(
        &self,
        triplet: &BoundaryTriplet,
        batch: &[Sample<T>],
        outputs: &[DepthOutput<T>],
    ) -> Result<T, TrainError> {
        let (height, width) = self.resolution;
        let mut total = T::zero();
        for &(scale, kernel) in &triplet.scales {
            let mut segmentations = Vec::with_capacity(batch.len());
            let mut features = Vec::with_capacity(batch.len());
            for (sample, output) in batch.iter().zip(outputs) {
                let seg = sample
                    .segmentation
                    .as_ref()
                    .ok_or(BatchError::MissingSegmentation)?;
                segmentations.push(segmentation_at_scale(seg, scale, height, width));
                features.push(output.features.get(scale).ok_or_else(|| {
                    NetworkError::Contract {
                        module: "depth",
                        reason: format!("no decoder features at scale {}", scale),
                    }
                })?);
            }
            let loss = triplet
                .scale_loss(&segmentations, &features, kernel)
                .ok_or_else(|| NetworkError::Contract {
                    module: "depth",
                    reason: format!(
                        "decoder features at scale {} do not match {}x{}",
                        scale,
                        height >> scale,
                        width >> scale
                    ),
                })?;
            debug!("boundary loss at scale {}: {:.5}", scale, value(loss));
            total += loss / real((1_u64 << scale) as f64);
        }
        Ok(total)
    }
} // impl Pipeline

fn no_source() -> TrainError {
    ConfigError::Invalid {
        name: "frame_ids",
        reason: "no source frame".to_string(),
    }
    .into()
}

/// Predictive mask planes of a scale, one per source frame,
/// upsampled to the warping resolution unless warping at the loss scale.
fn predictive_planes<T: Real>(
    masks: &[Image<T>],
    scale: usize,
    (height, width): (usize, usize),
    v1_multiscale: bool,
) -> Result<Vec<DMatrix<T>>, NetworkError> {
    let image = masks.get(scale).ok_or_else(|| NetworkError::Contract {
        module: "predictive_mask",
        reason: format!("no mask at scale {}", scale),
    })?;
    Ok(image
        .channels
        .iter()
        .map(|plane| {
            if v1_multiscale {
                plane.clone()
            } else {
                resize_bilinear(plane, height, width)
            }
        })
        .collect())
}

// TESTS #############################################################

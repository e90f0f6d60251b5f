// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Inference over a held out split and depth metrics against ground truth.

use log::info;
use nalgebra::{DMatrix, Scalar};

use crate::core::image::Image;
use crate::core::inverse_depth::disp_to_depth;
use crate::core::metrics::{
    evaluate_disparity, ratio_stats, DepthErrors, EvalSettings, MetricsError,
};
use crate::core::network::NetworkError;
use crate::misc::type_aliases::{value, Float, Real};
use crate::train::error::TrainError;
use crate::train::pipeline::Networks;

/// One image of an evaluation split.
#[derive(Clone, Debug)]
pub struct EvalItem<T: Scalar> {
    /// Input color at network resolution.
    pub color: Image<T>,
    /// Ground truth depth at its own resolution.
    pub depth_gt: Option<DMatrix<Float>>,
}

/// Result of an evaluation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EvalReport {
    /// Metrics averaged over images.
    pub errors: DepthErrors,
    /// Median of the scaling ratios and their relative spread, if used.
    pub ratios: Option<(Float, Float)>,
    /// Number of evaluated images.
    pub nb_images: usize,
}

/// Disparity predicted for one image, rescaled to `[1 / max_depth, 1 / min_depth]`.
#[allow(clippy::cast_possible_truncation)]
pub fn predict_disparity<T: Real>(
    networks: &Networks<T>,
    color: &Image<T>,
    min_depth: f64,
    max_depth: f64,
) -> Result<DMatrix<Float>, TrainError> {
    let features = networks.encoder.forward(color)?;
    let output = networks.depth.forward(&features)?;
    let disp = output.disp.first().ok_or_else(|| NetworkError::Contract {
        module: "depth",
        reason: "no disparity at scale 0".to_string(),
    })?;
    let (scaled, _) = disp_to_depth(disp, min_depth, max_depth);
    Ok(scaled.map(|d| value(d) as Float))
}

/// Evaluate the networks on every item of a split.
///
/// Networks are expected in inference mode. Every item must carry
/// ground truth depth.
pub fn evaluate<T: Real>(
    networks: &Networks<T>,
    items: &[EvalItem<T>],
    settings: &EvalSettings,
    min_depth: f64,
    max_depth: f64,
) -> Result<EvalReport, TrainError> {
    let mut errors = Vec::with_capacity(items.len());
    let mut ratios = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let gt = item
            .depth_gt
            .as_ref()
            .ok_or(TrainError::MissingGroundTruth(index))?;
        let disp = predict_disparity(networks, &item.color, min_depth, max_depth)?;
        let (image_errors, ratio) = match evaluate_disparity(gt, &disp, settings) {
            Err(MetricsError::NoGroundTruth) => return Err(TrainError::MissingGroundTruth(index)),
            other => other?,
        };
        errors.push(image_errors);
        ratios.extend(ratio);
    }
    let ratios = ratio_stats(&ratios);
    if let Some((med, std)) = ratios {
        info!("scaling ratios | med: {:.3} | std: {:.3}", med, std);
    }
    let errors = DepthErrors::mean(&errors)?;
    info!(
        "abs_rel {:.3} | sq_rel {:.3} | rmse {:.3} | rmse_log {:.3} \
         | a1 {:.3} | a2 {:.3} | a3 {:.3}",
        errors.abs_rel, errors.sq_rel, errors.rms, errors.log_rms, errors.a1, errors.a2, errors.a3
    );
    Ok(EvalReport {
        errors,
        ratios,
        nb_images: items.len(),
    })
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::network::{DepthDecoder, DepthOutput, Encoder, Features, Module, StateDict};

    /// Predicts a uniform sigmoid output equal to the mean of the image.
    struct MeanDepth;

    impl Module for MeanDepth {
        fn set_train(&mut self, _train: bool) {}
        fn state_dict(&self) -> StateDict {
            StateDict::new()
        }
        fn load_state_dict(&mut self, _state: &StateDict) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    impl Encoder<f64> for MeanDepth {
        fn forward(&self, image: &Image<f64>) -> Result<Features<f64>, NetworkError> {
            Ok(vec![image.clone()])
        }
    }

    impl DepthDecoder<f64> for MeanDepth {
        fn forward(&self, features: &Features<f64>) -> Result<DepthOutput<f64>, NetworkError> {
            let plane = &features[0].channels[0];
            let m = plane.mean();
            Ok(DepthOutput {
                disp: vec![DMatrix::repeat(plane.nrows(), plane.ncols(), m)],
                features: Vec::new(),
            })
        }
    }

    fn networks() -> Networks<f64> {
        Networks {
            encoder: Box::new(MeanDepth),
            depth: Box::new(MeanDepth),
            predictive_mask: None,
            pose: None,
        }
    }

    fn settings() -> EvalSettings {
        EvalSettings {
            eigen_crop: true,
            median_scaling: true,
            pred_depth_scale_factor: 1.0,
        }
    }

    fn item(gt: Option<DMatrix<Float>>) -> EvalItem<f64> {
        EvalItem {
            color: Image::gray(DMatrix::repeat(8, 16, 0.5)),
            depth_gt: gt,
        }
    }

    #[test]
    fn uniform_scene_is_perfect_after_median_scaling() {
        let items = vec![
            item(Some(DMatrix::repeat(40, 120, 12.0))),
            item(Some(DMatrix::repeat(40, 120, 30.0))),
        ];
        let report = evaluate(&networks(), &items, &settings(), 0.1, 100.0).unwrap();
        assert_eq!(2, report.nb_images);
        assert!(report.errors.abs_rel < 1e-5);
        assert_eq!(1.0, report.errors.a1);
        let (_, std) = report.ratios.unwrap();
        assert!(std > 0.0);
    }

    #[test]
    fn missing_ground_truth_is_fatal() {
        let items = vec![item(Some(DMatrix::repeat(40, 120, 12.0))), item(None)];
        let result = evaluate(&networks(), &items, &settings(), 0.1, 100.0);
        assert!(matches!(result, Err(TrainError::MissingGroundTruth(1))));
        let empty_gt = vec![item(Some(DMatrix::zeros(40, 120)))];
        let result = evaluate(&networks(), &empty_gt, &settings(), 0.1, 100.0);
        assert!(matches!(result, Err(TrainError::MissingGroundTruth(0))));
    }

    #[test]
    fn empty_split_is_an_error() {
        let result = evaluate(&networks(), &[], &settings(), 0.1, 100.0);
        assert!(matches!(result, Err(TrainError::Metrics(MetricsError::Empty))));
    }

    #[test]
    fn disparity_is_rescaled() {
        let disp = predict_disparity(&networks(), &item(None).color, 0.1, 100.0).unwrap();
        let expected = (0.01 + (10.0 - 0.01) * 0.5) as Float;
        assert!((disp[(0, 0)] - expected).abs() < 1e-4);
    }
}

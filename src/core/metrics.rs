// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Depth error metrics against ground truth, evaluation crops,
//! median scaling and the record of the best metrics.

use std::ops::Range;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::multires::resize_bilinear;
use crate::misc::type_aliases::Float;

/// Lower bound of valid and predicted depths.
pub const MIN_DEPTH: Float = 1e-3;
/// Upper bound of valid and predicted depths.
pub const MAX_DEPTH: Float = 80.0;

/// Crop of Eigen et al. as fractions of `[top, bottom, left, right]`.
pub const EIGEN_CROP: [f64; 4] = [0.408_108_11, 0.991_891_89, 0.035_947_71, 0.964_052_29];

/// Crop of Garg et al. in pixels of a `375 x 1242` image.
const GARG_CROP: [usize; 4] = [153, 371, 44, 1197];
const GARG_SIZE: (usize, usize) = (375, 1242);

/// Error of the metrics computation.
#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    /// The ground truth has no valid pixel inside the evaluated region.
    #[error("no valid ground truth pixel")]
    NoGroundTruth,
    /// Nothing to average.
    #[error("no image evaluated")]
    Empty,
}

/// The seven standard depth metrics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthErrors {
    /// Mean of `|gt - pred| / gt`.
    pub abs_rel: Float,
    /// Mean of `(gt - pred)² / gt`.
    pub sq_rel: Float,
    /// Root mean squared error.
    pub rms: Float,
    /// Root mean squared error of the logs.
    pub log_rms: Float,
    /// Ratio of `max(gt / pred, pred / gt) < 1.25`.
    pub a1: Float,
    /// Ratio of `max(gt / pred, pred / gt) < 1.25²`.
    pub a2: Float,
    /// Ratio of `max(gt / pred, pred / gt) < 1.25³`.
    pub a3: Float,
}

impl DepthErrors {
    /// Names of the metrics, in the order of `values`.
    pub const NAMES: [&'static str; 7] = [
        "de/abs_rel",
        "de/sq_rel",
        "de/rms",
        "de/log_rms",
        "da/a1",
        "da/a2",
        "da/a3",
    ];

    /// Metrics between matching ground truth and predicted depths.
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute(gt: &[Float], pred: &[Float]) -> Result<Self, MetricsError> {
        if gt.is_empty() {
            return Err(MetricsError::NoGroundTruth);
        }
        let (mut abs_rel, mut sq_rel, mut sq, mut sq_log) = (0.0, 0.0, 0.0, 0.0);
        let (mut a1, mut a2, mut a3) = (0.0, 0.0, 0.0);
        for (&g, &p) in gt.iter().zip(pred) {
            let (g, p) = (f64::from(g), f64::from(p));
            let thresh = (g / p).max(p / g);
            a1 += f64::from(u8::from(thresh < 1.25));
            a2 += f64::from(u8::from(thresh < 1.25 * 1.25));
            a3 += f64::from(u8::from(thresh < 1.25 * 1.25 * 1.25));
            let diff = g - p;
            abs_rel += diff.abs() / g;
            sq_rel += diff * diff / g;
            sq += diff * diff;
            let diff_log = g.ln() - p.ln();
            sq_log += diff_log * diff_log;
        }
        let n = gt.len().min(pred.len()) as f64;
        Ok(Self {
            abs_rel: (abs_rel / n) as Float,
            sq_rel: (sq_rel / n) as Float,
            rms: (sq / n).sqrt() as Float,
            log_rms: (sq_log / n).sqrt() as Float,
            a1: (a1 / n) as Float,
            a2: (a2 / n) as Float,
            a3: (a3 / n) as Float,
        })
    }

    /// Metric values, in the order of `NAMES`.
    pub fn values(&self) -> [Float; 7] {
        [
            self.abs_rel,
            self.sq_rel,
            self.rms,
            self.log_rms,
            self.a1,
            self.a2,
            self.a3,
        ]
    }

    /// Mean of every metric over several images.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(all: &[Self]) -> Result<Self, MetricsError> {
        if all.is_empty() {
            return Err(MetricsError::Empty);
        }
        let n = all.len() as Float;
        let sum = |f: fn(&Self) -> Float| all.iter().map(f).sum::<Float>() / n;
        Ok(Self {
            abs_rel: sum(|e| e.abs_rel),
            sq_rel: sum(|e| e.sq_rel),
            rms: sum(|e| e.rms),
            log_rms: sum(|e| e.log_rms),
            a1: sum(|e| e.a1),
            a2: sum(|e| e.a2),
            a3: sum(|e| e.a3),
        })
    }
} // impl DepthErrors

/// Median of a set of values, averaging the two middle values for even sizes.
pub fn median(values: &[Float]) -> Option<Float> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(Float::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Median of the scaling ratios and standard deviation of the ratios
/// relative to that median.
#[allow(clippy::cast_precision_loss)]
pub fn ratio_stats(ratios: &[Float]) -> Option<(Float, Float)> {
    let med = median(ratios)?;
    let n = ratios.len() as Float;
    let relative: Vec<Float> = ratios.iter().map(|r| r / med).collect();
    let mean = relative.iter().sum::<Float>() / n;
    let var = relative.iter().map(|v| (v - mean) * (v - mean)).sum::<Float>() / n;
    Some((med, var.sqrt()))
}

/// Rows and columns kept by the Eigen crop for an image of the given size.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn eigen_crop(height: usize, width: usize) -> (Range<usize>, Range<usize>) {
    let at = |fraction: f64, len: usize| (fraction * len as f64) as usize;
    (
        at(EIGEN_CROP[0], height)..at(EIGEN_CROP[1], height),
        at(EIGEN_CROP[2], width)..at(EIGEN_CROP[3], width),
    )
}

/// Rows and columns kept by the Garg crop, scaled to the image size.
pub fn garg_crop(height: usize, width: usize) -> (Range<usize>, Range<usize>) {
    let (h0, w0) = GARG_SIZE;
    (
        GARG_CROP[0] * height / h0..GARG_CROP[1] * height / h0,
        GARG_CROP[2] * width / w0..GARG_CROP[3] * width / w0,
    )
}

/// Ground truth and predicted values at the pixels selected by `keep`.
pub fn masked_pairs<F>(
    gt: &DMatrix<Float>,
    pred: &DMatrix<Float>,
    keep: F,
) -> (Vec<Float>, Vec<Float>)
where
    F: Fn(usize, usize, Float) -> bool,
{
    let mut gt_values = Vec::new();
    let mut pred_values = Vec::new();
    for x in 0..gt.ncols() {
        for y in 0..gt.nrows() {
            let g = gt[(y, x)];
            if keep(y, x, g) {
                gt_values.push(g);
                pred_values.push(pred[(y, x)]);
            }
        }
    }
    (gt_values, pred_values)
}

/// How predictions are compared to the ground truth.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EvalSettings {
    /// Restrict to the Eigen crop.
    pub eigen_crop: bool,
    /// Rescale each prediction by the ratio of the medians.
    pub median_scaling: bool,
    /// Fixed factor applied to predictions before median scaling.
    pub pred_depth_scale_factor: Float,
}

/// Metrics of one predicted disparity (at network resolution) against
/// its ground truth depth, and the median scaling ratio if used.
pub fn evaluate_disparity(
    gt: &DMatrix<Float>,
    pred_disp: &DMatrix<Float>,
    settings: &EvalSettings,
) -> Result<(DepthErrors, Option<Float>), MetricsError> {
    let (height, width) = gt.shape();
    let pred_depth = resize_bilinear(pred_disp, height, width).map(|d| 1.0 / d);
    let (rows, cols) = if settings.eigen_crop {
        eigen_crop(height, width)
    } else {
        (0..height, 0..width)
    };
    let (gt_values, mut pred_values) = masked_pairs(gt, &pred_depth, |y, x, g| {
        g > MIN_DEPTH && g < MAX_DEPTH && rows.contains(&y) && cols.contains(&x)
    });
    if gt_values.is_empty() {
        return Err(MetricsError::NoGroundTruth);
    }
    for p in &mut pred_values {
        *p *= settings.pred_depth_scale_factor;
    }
    let ratio = if settings.median_scaling {
        let ratio = median_ratio(&gt_values, &pred_values)?;
        for p in &mut pred_values {
            *p *= ratio;
        }
        Some(ratio)
    } else {
        None
    };
    for p in &mut pred_values {
        *p = p.max(MIN_DEPTH).min(MAX_DEPTH);
    }
    Ok((DepthErrors::compute(&gt_values, &pred_values)?, ratio))
}

/// Metrics of a whole batch at once, as monitored during training.
///
/// Predicted depths are resized to their ground truth, pixels are kept
/// inside the Garg crop where the ground truth is positive, and a single
/// median ratio scales the whole batch.
pub fn batch_depth_errors(
    pairs: &[(&DMatrix<Float>, &DMatrix<Float>)],
) -> Result<DepthErrors, MetricsError> {
    let mut gt_values = Vec::new();
    let mut pred_values = Vec::new();
    for (gt, pred_depth) in pairs {
        let (height, width) = gt.shape();
        let pred =
            resize_bilinear(pred_depth, height, width).map(|d| d.max(MIN_DEPTH).min(MAX_DEPTH));
        let (rows, cols) = garg_crop(height, width);
        let (g, p) = masked_pairs(gt, &pred, |y, x, g| {
            g > 0.0 && rows.contains(&y) && cols.contains(&x)
        });
        gt_values.extend(g);
        pred_values.extend(p);
    }
    let ratio = median_ratio(&gt_values, &pred_values)?;
    for p in &mut pred_values {
        *p = (*p * ratio).max(MIN_DEPTH).min(MAX_DEPTH);
    }
    DepthErrors::compute(&gt_values, &pred_values)
}

fn median_ratio(gt: &[Float], pred: &[Float]) -> Result<Float, MetricsError> {
    match (median(gt), median(pred)) {
        (Some(g), Some(p)) => Ok(g / p),
        _ => Err(MetricsError::NoGroundTruth),
    }
}

// Best metrics ######################################################

/// The four error metrics of the best evaluation so far.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestMetrics {
    /// Absolute relative error.
    pub abs_rel: Float,
    /// Squared relative error.
    pub sq_rel: Float,
    /// Root mean squared error.
    pub rms: Float,
    /// Root mean squared log error.
    pub log_rms: Float,
}

impl Default for BestMetrics {
    /// Worst possible record, improved by any finite evaluation.
    fn default() -> Self {
        Self {
            abs_rel: Float::INFINITY,
            sq_rel: Float::INFINITY,
            rms: Float::INFINITY,
            log_rms: Float::INFINITY,
        }
    }
}

impl BestMetrics {
    /// Update the record if, walking `abs_rel`, `sq_rel`, `rms` then `log_rms`,
    /// one metric is strictly lower than its recorded value.
    ///
    /// All four values are then overwritten, even those that got worse.
    /// Returns the name of the metric that triggered the update.
    pub fn update(&mut self, current: &DepthErrors) -> Option<&'static str> {
        let checks = [
            ("abs_rel", current.abs_rel < self.abs_rel),
            ("sq_rel", current.sq_rel < self.sq_rel),
            ("rms", current.rms < self.rms),
            ("log_rms", current.log_rms < self.log_rms),
        ];
        let (name, _) = checks.iter().find(|(_, improved)| *improved)?;
        *self = Self {
            abs_rel: current.abs_rel,
            sq_rel: current.sq_rel,
            rms: current.rms,
            log_rms: current.log_rms,
        };
        Some(name)
    }
} // impl BestMetrics

// TESTS #############################################################

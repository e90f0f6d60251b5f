// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthesis of the reference view from every source frame,
//! using the predicted depth and relative poses.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, Scalar};
use thiserror::Error;

use crate::core::batch::{BatchError, FrameId, Sample};
use crate::core::camera::{self, Grid};
use crate::core::image::{mean, Image};
use crate::core::inverse_depth::disp_to_depth;
use crate::core::multires::resize_bilinear;
use crate::core::pose::RelativePose;
use crate::math::se3;
use crate::misc::type_aliases::Real;

/// Parameters of the warping stage.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ImageWarper {
    /// Warp at the loss scale instead of at full resolution.
    pub v1_multiscale: bool,
    /// Scale predicted translations by the mean inverse depth.
    pub posecnn_correction: bool,
    /// Minimum depth of the disparity reparameterization.
    pub min_depth: f64,
    /// Maximum depth of the disparity reparameterization.
    pub max_depth: f64,
}

/// Error of the warping stage.
#[derive(Debug, Error)]
pub enum WarpError {
    /// Missing sample quantities.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// No relative pose for a source frame.
    #[error("no relative pose for frame {0}")]
    MissingPose(FrameId),
}

/// A source frame resampled into the reference view.
#[derive(Clone, Debug, PartialEq)]
pub struct WarpedView<T: Scalar> {
    /// Normalized sampling coordinates in the source frame.
    pub grid: Grid<T>,
    /// Resampled source colors.
    pub color: Image<T>,
}

/// All the warped views of one sample at one loss scale.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleWarp<T: Scalar> {
    /// Scale of the images that were warped.
    pub source_scale: usize,
    /// Depth of the reference frame used for warping.
    pub depth: DMatrix<T>,
    /// Warped view of every source frame.
    pub views: BTreeMap<FrameId, WarpedView<T>>,
}

impl ImageWarper {
    /// Scale of the images used for a loss scale.
    pub fn source_scale(&self, scale: usize) -> usize {
        if self.v1_multiscale {
            scale
        } else {
            0
        }
    }

    /// Warp every source frame of a sample with the disparity
    /// predicted at `scale`.
    pub fn warp<T: Real>(
        &self,
        sample: &Sample<T>,
        disp: &DMatrix<T>,
        scale: usize,
        sources: &[FrameId],
        poses: &BTreeMap<FrameId, RelativePose<T>>,
    ) -> Result<ScaleWarp<T>, WarpError> {
        let source_scale = self.source_scale(scale);
        let disp = if self.v1_multiscale {
            disp.clone()
        } else {
            let (height, width) = sample.color(FrameId::REFERENCE, 0)?.shape();
            resize_bilinear(disp, height, width)
        };
        let (_, depth) = disp_to_depth(&disp, self.min_depth, self.max_depth);
        let intrinsics = sample.intrinsics(source_scale)?;
        let points = camera::backproject(&depth, &intrinsics.inv_k);

        let mut views = BTreeMap::new();
        for &frame in sources {
            let pose = poses.get(&frame).ok_or(WarpError::MissingPose(frame))?;
            let transform = match (&pose.parameters, self.posecnn_correction) {
                (Some(params), true) => {
                    let mean_inv_depth = mean(&depth.map(|d| T::one() / d));
                    se3::transformation_from_parameters(
                        params.axisangle,
                        params.translation * mean_inv_depth,
                        pose.inverted,
                    )
                }
                _ => pose.transform,
            };
            let grid = camera::project(&points, &intrinsics.k, &transform);
            let color = camera::grid_sample(sample.color(frame, source_scale)?, &grid);
            views.insert(frame, WarpedView { grid, color });
        }
        Ok(ScaleWarp {
            source_scale,
            depth,
            views,
        })
    }
} // impl ImageWarper

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::network::PoseParameters;
    use crate::misc::type_aliases::{Mat4, Vec3};

    fn textured(rows: usize, cols: usize) -> Image<f64> {
        Image::gray(DMatrix::from_fn(rows, cols, |i, j| ((i * 5 + j * 3) % 7) as f64 / 7.0))
    }

    #[rustfmt::skip]
    fn normalized_k() -> Mat4<f64> {
        Mat4::new(
            0.58, 0.0,  0.5, 0.0,
            0.0,  1.92, 0.5, 0.0,
            0.0,  0.0,  1.0, 0.0,
            0.0,  0.0,  0.0, 1.0,
        )
    }

    fn sample() -> Sample<f64> {
        let frames = || {
            vec![
                (FrameId::Offset(0), textured(16, 32)),
                (FrameId::Offset(1), textured(16, 32)),
            ]
            .into_iter()
            .collect()
        };
        Sample::from_frames(frames(), frames(), &normalized_k(), 2).unwrap()
    }

    fn warper(v1_multiscale: bool, posecnn_correction: bool) -> ImageWarper {
        ImageWarper {
            v1_multiscale,
            posecnn_correction,
            min_depth: 0.1,
            max_depth: 100.0,
        }
    }

    fn still() -> BTreeMap<FrameId, RelativePose<f64>> {
        let parameters = PoseParameters {
            axisangle: Vec3::zeros(),
            translation: Vec3::zeros(),
        };
        let mut poses = BTreeMap::new();
        poses.insert(
            FrameId::Offset(1),
            RelativePose {
                transform: Mat4::identity(),
                parameters: Some(parameters),
                inverted: false,
            },
        );
        poses
    }

    #[test]
    fn zero_motion_is_an_identity_warp_at_any_depth() {
        let s = sample();
        let sources = [FrameId::Offset(1)];
        for &disp_value in &[0.01, 0.5, 0.99] {
            let disp = DMatrix::repeat(8, 16, disp_value);
            let out = warper(false, false)
                .warp(&s, &disp, 1, &sources, &still())
                .unwrap();
            assert_eq!(0, out.source_scale);
            assert_eq!((16, 32), out.depth.shape());
            let warped = &out.views[&FrameId::Offset(1)].color;
            let source = s.color(FrameId::Offset(1), 0).unwrap();
            let diff = (&warped.channels[0] - &source.channels[0]).amax();
            assert!(diff < 1e-4, "max difference {}", diff);
        }
    }

    #[test]
    fn multiscale_warps_at_the_loss_scale() {
        let s = sample();
        let disp = DMatrix::repeat(8, 16, 0.5);
        let out = warper(true, true)
            .warp(&s, &disp, 1, &[FrameId::Offset(1)], &still())
            .unwrap();
        assert_eq!(1, out.source_scale);
        assert_eq!((8, 16), out.views[&FrameId::Offset(1)].grid.shape());
    }

    #[test]
    fn missing_pose_is_an_error() {
        let s = sample();
        let disp = DMatrix::repeat(8, 16, 0.5);
        let result =
            warper(false, false).warp(&s, &disp, 1, &[FrameId::Offset(1)], &BTreeMap::new());
        assert!(matches!(result, Err(WarpError::MissingPose(FrameId::Offset(1)))));
    }

    #[test]
    fn posecnn_correction_scales_translation() {
        let s = sample();
        // Uniform depth of 10: the mean inverse depth is 0.1.
        let (min_depth, max_depth) = (10.0, 10.0);
        let cnn_warper = ImageWarper {
            min_depth,
            max_depth,
            ..warper(true, true)
        };
        let mut poses = still();
        let pose = poses.get_mut(&FrameId::Offset(1)).unwrap();
        pose.parameters = Some(PoseParameters {
            axisangle: Vec3::zeros(),
            translation: Vec3::new(10.0, 0.0, 0.0),
        });
        pose.transform =
            se3::transformation_from_parameters(Vec3::zeros(), Vec3::new(10.0, 0.0, 0.0), false);
        let corrected = cnn_warper
            .warp(&s, &DMatrix::repeat(8, 16, 0.5), 1, &[FrameId::Offset(1)], &poses)
            .unwrap();
        // Equivalent to a plain unit translation.
        pose_check(&s, &corrected, 1.0);
    }

    fn pose_check(s: &Sample<f64>, out: &ScaleWarp<f64>, tx: f64) {
        let intrinsics = s.intrinsics(out.source_scale).unwrap();
        let points = camera::backproject(&out.depth, &intrinsics.inv_k);
        let t =
            se3::transformation_from_parameters(Vec3::zeros(), Vec3::new(tx, 0.0, 0.0), false);
        let expected = camera::project(&points, &intrinsics.k, &t);
        let grid = &out.views[&FrameId::Offset(1)].grid;
        for (a, b) in expected.iter().zip(grid.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }
}

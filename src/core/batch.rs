// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Training samples: multi-scale frames keyed by frame id and scale.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{DMatrix, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::camera::Intrinsics;
use crate::core::image::Image;
use crate::core::multires;
use crate::misc::type_aliases::{Float, Mat4, Real};

/// Identifier of a frame relative to the reference frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "FrameIdRepr", into = "FrameIdRepr")]
pub enum FrameId {
    /// Temporal offset, 0 being the reference frame.
    Offset(i32),
    /// The other camera of a stereo pair.
    Stereo,
}

impl FrameId {
    /// The reference frame.
    pub const REFERENCE: Self = FrameId::Offset(0);

    /// True when the frame precedes the reference frame in time.
    pub fn is_before_reference(self) -> bool {
        matches!(self, FrameId::Offset(offset) if offset < 0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameId::Offset(offset) => write!(f, "{}", offset),
            FrameId::Stereo => write!(f, "s"),
        }
    }
}

/// Serialized form of frame ids: an integer offset or `"s"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FrameIdRepr {
    Offset(i32),
    Named(String),
}

impl TryFrom<FrameIdRepr> for FrameId {
    type Error = String;
    fn try_from(repr: FrameIdRepr) -> Result<Self, Self::Error> {
        match repr {
            FrameIdRepr::Offset(offset) => Ok(FrameId::Offset(offset)),
            FrameIdRepr::Named(name) if name == "s" => Ok(FrameId::Stereo),
            FrameIdRepr::Named(name) => Err(format!("unknown frame id {:?}", name)),
        }
    }
}

impl From<FrameId> for FrameIdRepr {
    fn from(id: FrameId) -> Self {
        match id {
            FrameId::Offset(offset) => FrameIdRepr::Offset(offset),
            FrameId::Stereo => FrameIdRepr::Named("s".to_string()),
        }
    }
}

/// Missing or inconsistent quantities in a sample.
#[derive(Debug, Error)]
pub enum BatchError {
    /// An image is missing for a frame and scale.
    #[error("missing {quantity} of frame {frame} at scale {scale}")]
    MissingImage {
        /// `color` or `color_aug`.
        quantity: &'static str,
        /// Frame id.
        frame: FrameId,
        /// Pyramid scale.
        scale: usize,
    },
    /// No intrinsics for a scale.
    #[error("missing intrinsics at scale {0}")]
    MissingIntrinsics(usize),
    /// Intrinsics matrix cannot be inverted.
    #[error("intrinsics are not invertible")]
    SingularIntrinsics,
    /// Stereo frame requested without a stereo transform.
    #[error("missing stereo transform")]
    MissingStereoTransform,
    /// Boundary loss requested without segmentation.
    #[error("missing segmentation map")]
    MissingSegmentation,
    /// No sample at all.
    #[error("empty batch")]
    Empty,
}

/// Key of a frame image: frame id and pyramid scale.
pub type FrameKey = (FrameId, usize);

/// One training sample.
#[derive(Clone, Debug)]
pub struct Sample<T: Scalar> {
    /// Colors used by the losses, values in `[0, 1]`.
    pub color: BTreeMap<FrameKey, Image<T>>,
    /// Color augmented versions fed to the networks.
    pub color_aug: BTreeMap<FrameKey, Image<T>>,
    /// Intrinsics at every scale.
    pub intrinsics: Vec<Intrinsics<T>>,
    /// Transform to the stereo frame, if any.
    pub stereo_t: Option<Mat4<T>>,
    /// Ground truth depth, if any.
    pub depth_gt: Option<DMatrix<Float>>,
    /// Semantic segmentation of the reference frame at full resolution, if any.
    pub segmentation: Option<DMatrix<i32>>,
}

impl<T: Real> Sample<T> {
    /// Build a sample from full resolution frames, generating pyramids
    /// of `num_scales` levels by 2x2 mean halving.
    ///
    /// Intrinsics are scaled from the normalized ones at every level.
    pub fn from_frames(
        color: BTreeMap<FrameId, Image<T>>,
        color_aug: BTreeMap<FrameId, Image<T>>,
        normalized_k: &Mat4<T>,
        num_scales: usize,
    ) -> Result<Self, BatchError> {
        let (height, width) = color
            .get(&FrameId::REFERENCE)
            .ok_or(BatchError::MissingImage {
                quantity: "color",
                frame: FrameId::REFERENCE,
                scale: 0,
            })?
            .shape();
        let intrinsics = Intrinsics::multi_res(normalized_k, width, height, num_scales)
            .ok_or(BatchError::SingularIntrinsics)?;
        Ok(Self {
            color: pyramids(color, num_scales),
            color_aug: pyramids(color_aug, num_scales),
            intrinsics,
            stereo_t: None,
            depth_gt: None,
            segmentation: None,
        })
    }

    /// Color of a frame at a scale.
    pub fn color(&self, frame: FrameId, scale: usize) -> Result<&Image<T>, BatchError> {
        self.color
            .get(&(frame, scale))
            .ok_or(BatchError::MissingImage {
                quantity: "color",
                frame,
                scale,
            })
    }

    /// Augmented color of a frame at a scale.
    pub fn color_aug(&self, frame: FrameId, scale: usize) -> Result<&Image<T>, BatchError> {
        self.color_aug
            .get(&(frame, scale))
            .ok_or(BatchError::MissingImage {
                quantity: "color_aug",
                frame,
                scale,
            })
    }

    /// Intrinsics at a scale.
    pub fn intrinsics(&self, scale: usize) -> Result<&Intrinsics<T>, BatchError> {
        self.intrinsics
            .get(scale)
            .ok_or(BatchError::MissingIntrinsics(scale))
    }

    /// Transform to the stereo frame.
    pub fn stereo_t(&self) -> Result<&Mat4<T>, BatchError> {
        self.stereo_t
            .as_ref()
            .ok_or(BatchError::MissingStereoTransform)
    }

    /// Check that every frame is present at every scale,
    /// augmented colors being needed at scale 0 only.
    pub fn check(&self, frame_ids: &[FrameId], num_scales: usize) -> Result<(), BatchError> {
        for &frame in frame_ids {
            self.color_aug(frame, 0)?;
            for scale in 0..num_scales {
                self.color(frame, scale)?;
                self.intrinsics(scale)?;
            }
            if frame == FrameId::Stereo {
                self.stereo_t()?;
            }
        }
        Ok(())
    }
} // impl Sample

/// Generate the pyramid of every frame.
fn pyramids<T: Real>(
    frames: BTreeMap<FrameId, Image<T>>,
    num_scales: usize,
) -> BTreeMap<FrameKey, Image<T>> {
    let mut out = BTreeMap::new();
    for (frame, image) in frames {
        let levels: Vec<Vec<DMatrix<T>>> = image
            .channels
            .into_iter()
            .map(|plane| multires::mean_pyramid(num_scales, plane))
            .collect();
        let nb_levels = levels.iter().map(Vec::len).min().unwrap_or(0);
        for scale in 0..nb_levels {
            let planes = levels.iter().map(|l| l[scale].clone()).collect();
            out.insert((frame, scale), Image::new(planes));
        }
    }
    out
}

// TESTS #############################################################

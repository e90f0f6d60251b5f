// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Self-supervised monocular depth in Rust
//!
//! Training core for monocular depth estimation supervised only by
//! photometric reprojection between adjacent video frames.
//!
//! The crate is organized in the following modules:
//!
//! - `core`: the per-batch numerical pipeline. Camera geometry, image warping,
//!   photometric and smoothness losses, automasking, ambiguity masking,
//!   the boundary triplet loss and depth metrics.
//!   Neural networks are seen through the capability traits of `core::network`.
//! - `math`: rotations and rigid body transforms.
//! - `train`: configuration, loss composition, learning rate schedule,
//!   training session, evaluation and checkpoints.
//! - `dataset`: helpers for datasets compatible with KITTI.
//! - `misc`: type aliases, image interop and file helpers.
//!
//! All differentiable stages are generic over a `Real` scalar,
//! so an automatic differentiation number type can flow through them.

#![warn(missing_docs)]

pub mod core;
pub mod dataset;
pub mod math;
pub mod misc;
pub mod train;

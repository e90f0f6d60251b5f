// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-batch numerical pipeline of self-supervised depth training.

pub mod ambiguity;
pub mod automask;
pub mod batch;
pub mod boundary;
pub mod camera;
pub mod gradient;
pub mod image;
pub mod inverse_depth;
pub mod metrics;
pub mod multires;
pub mod network;
pub mod photometric;
pub mod pose;
pub mod smoothness;
pub mod warp;

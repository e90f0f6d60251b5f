// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors of a training run.

use thiserror::Error;

use crate::core::batch::BatchError;
use crate::core::metrics::MetricsError;
use crate::core::network::NetworkError;
use crate::core::pose::PoseError;
use crate::core::warp::WarpError;
use crate::dataset::kitti::DatasetError;
use crate::train::config::ConfigError;
use crate::train::session::Phase;

/// Anything that stops a training run.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Invalid options.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Missing or inconsistent batch content.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Pose estimation failure.
    #[error(transparent)]
    Pose(#[from] PoseError),
    /// Warping failure.
    #[error(transparent)]
    Warp(#[from] WarpError),
    /// Network failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Training data could not be read.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Metrics could not be computed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    /// An evaluation item comes without ground truth depth.
    #[error("no ground truth depth for evaluation item {0}")]
    MissingGroundTruth(usize),
    /// The session was driven out of order.
    #[error("cannot {action} while {phase:?}")]
    Phase {
        /// Attempted action.
        action: &'static str,
        /// Current phase.
        phase: Phase,
    },
    /// File system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed checkpoint.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

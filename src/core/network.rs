// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capabilities expected from the neural networks, by role.
//!
//! The training core never looks inside a network. It only needs to run
//! it on one sample, switch it between training and inference behavior,
//! and read or write its named parameters for checkpoints.
//! Networks are run one sample at a time; batching is a loop.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, Scalar};
use thiserror::Error;

use crate::core::image::Image;
use crate::misc::type_aliases::{Real, Vec3};

/// Named flat parameter tensors of a module.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// Multi-level feature maps of an encoder, finest first.
pub type Features<T> = Vec<Image<T>>;

/// Errors raised by network implementations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The output does not follow the expected contract.
    #[error("{module} broke its output contract: {reason}")]
    Contract {
        /// Role of the network.
        module: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// Parameters could not be loaded.
    #[error("invalid parameter {key}: {reason}")]
    InvalidParameter {
        /// Name of the tensor.
        key: String,
        /// What was wrong.
        reason: String,
    },
    /// Gradient propagation failed.
    #[error("backward pass failed: {0}")]
    Backward(String),
}

/// Behavior shared by every trainable module.
pub trait Module {
    /// Switch between training (`true`) and inference (`false`) behavior.
    fn set_train(&mut self, train: bool);
    /// Current parameters.
    fn state_dict(&self) -> StateDict;
    /// Replace parameters. Keys absent from `state` keep their value.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NetworkError>;
}

/// Image encoder producing multi-level features.
///
/// Used both as the depth encoder and as the separate pose encoder.
pub trait Encoder<T: Real>: Module {
    /// Encode one (possibly channel stacked) image.
    fn forward(&self, image: &Image<T>) -> Result<Features<T>, NetworkError>;
}

/// Output of the depth decoder, indexed by scale.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthOutput<T: Scalar> {
    /// Sigmoid disparity in `[0, 1]` at every scale.
    pub disp: Vec<DMatrix<T>>,
    /// Decoder features at every scale, for the boundary triplet loss.
    pub features: Vec<Image<T>>,
}

/// Depth decoder turning encoder features into multi-scale disparities.
pub trait DepthDecoder<T: Real>: Module {
    /// Decode the features of one image.
    fn forward(&self, features: &Features<T>) -> Result<DepthOutput<T>, NetworkError>;
}

/// Decoder of the predictive mask: one image per scale,
/// with one channel per source frame, values in `[0, 1]`.
pub trait MaskDecoder<T: Real>: Module {
    /// Decode the features of one image.
    fn forward(&self, features: &Features<T>) -> Result<Vec<Image<T>>, NetworkError>;
}

/// Raw relative pose predicted by a pose network.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PoseParameters<T: Scalar> {
    /// Rotation as an axis-angle vector.
    pub axisangle: Vec3<T>,
    /// Translation.
    pub translation: Vec3<T>,
}

/// Pose decoder working on features of one or several frames.
pub trait PoseDecoder<T: Real>: Module {
    /// Predict one pose per transform the decoder is built for.
    fn forward(&self, features: &[&Features<T>]) -> Result<Vec<PoseParameters<T>>, NetworkError>;
}

/// Monolithic pose network working directly on channel stacked frames.
pub trait PoseCnn<T: Real>: Module {
    /// Predict one pose per transform the network is built for.
    fn forward(&self, stacked: &Image<T>) -> Result<Vec<PoseParameters<T>>, NetworkError>;
}

/// Propagation of gradients from the scalar loss to the network parameters.
///
/// Implemented by the automatic differentiation backend the scalar
/// type belongs to.
pub trait Backward<T> {
    /// Accumulate the gradients of `loss` into the parameters.
    fn backward(&mut self, loss: &T) -> Result<(), NetworkError>;
}

/// Gradient based optimizer over the parameters of a group of modules.
pub trait Optimizer {
    /// Reset accumulated gradients.
    fn zero_grad(&mut self);
    /// Update parameters from accumulated gradients.
    fn step(&mut self);
    /// Current learning rate.
    fn learning_rate(&self) -> f64;
    /// Set the learning rate used by the next steps.
    fn set_learning_rate(&mut self, lr: f64);
    /// Internal state (moments, step counts).
    fn state_dict(&self) -> StateDict;
    /// Restore internal state.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NetworkError>;
}

/// Copy into a module the loaded tensors whose name it already has.
///
/// Returns the number of restored tensors.
pub fn restore_overlapping<M: Module + ?Sized>(
    module: &mut M,
    loaded: &StateDict,
) -> Result<usize, NetworkError> {
    let mut current = module.state_dict();
    let mut restored = 0;
    for (key, value) in loaded {
        if let Some(slot) = current.get_mut(key) {
            *slot = value.clone();
            restored += 1;
        }
    }
    module.load_state_dict(&current)?;
    Ok(restored)
}

// TESTS #############################################################

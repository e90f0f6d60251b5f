// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Type aliases for common types used all over the code base.

use nalgebra as na;

/// Evaluation, ground truth and logging work with f32.
pub type Float = f32;

/// Scalar type flowing through every differentiable stage.
///
/// `f32` and `f64` evaluate values.
/// Any automatic differentiation number implementing `RealField`
/// carries derivatives through the same code.
pub trait Real: na::RealField + Copy {}

impl<T: na::RealField + Copy> Real for T {}

/// A vector with two coordinates.
pub type Vec2<T> = na::Vector2<T>;
/// A vector with three coordinates.
pub type Vec3<T> = na::Vector3<T>;
/// A vector with four (homogeneous) coordinates.
pub type Vec4<T> = na::Vector4<T>;

/// A 3x3 matrix.
pub type Mat3<T> = na::Matrix3<T>;
/// A 4x4 homogeneous matrix.
pub type Mat4<T> = na::Matrix4<T>;

/// Convert a constant into the working scalar type.
pub fn real<T: Real>(x: f64) -> T {
    na::convert(x)
}

/// Convert a scalar back into an `f64`, dropping any derivative information.
pub fn value<T: Real>(x: T) -> f64 {
    na::try_convert(x).unwrap_or(f64::NAN)
}

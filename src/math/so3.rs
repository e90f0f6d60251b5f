// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Rotations parameterized by axis-angle vectors.
//!
//! Interesting reads:
//! - Sophus c++ library: <https://github.com/strasdat/Sophus>
//! - Ethan Eade course on Lie Groups for 2D and 3D transformations:
//!     - details: <http://ethaneade.com/lie.pdf>
//!     - summary: <http://ethaneade.com/lie_groups.pdf>

use crate::misc::type_aliases::{real, Mat3, Real, Vec3};

/// Added to the rotation angle before normalizing the axis,
/// so that a null axis-angle vector stays finite.
const EPSILON_AXIS: f64 = 1e-7;

/// Rotation matrix of an axis-angle vector (Rodrigues formula).
///
/// The angle is the norm of the vector and the axis its direction.
#[allow(clippy::many_single_char_names)]
#[rustfmt::skip]
pub fn exp<T: Real>(axisangle: Vec3<T>) -> Mat3<T> {
    let angle = axisangle.norm();
    let axis = axisangle / (angle + real(EPSILON_AXIS));
    let ca = angle.cos();
    let sa = angle.sin();
    let c = T::one() - ca;

    let (x, y, z) = (axis.x, axis.y, axis.z);
    let (xs, ys, zs) = (x * sa, y * sa, z * sa);
    let (x_c, y_c, z_c) = (x * c, y * c, z * c);
    let (xy_c, yz_c, zx_c) = (x * y_c, y * z_c, z * x_c);

    Mat3::new(
        x * x_c + ca,  xy_c - zs,     zx_c + ys,
        xy_c + zs,     y * y_c + ca,  yz_c - xs,
        zx_c - ys,     yz_c + xs,     z * z_c + ca,
    )
}

// TESTS #############################################################

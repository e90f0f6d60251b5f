// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Homogeneous 4x4 rigid body transforms built from axis-angle and translation.

use crate::math::so3;
use crate::misc::type_aliases::{Mat4, Real, Vec3};

/// Homogeneous matrix of a pure translation.
pub fn translation_matrix<T: Real>(translation: Vec3<T>) -> Mat4<T> {
    let mut mat = Mat4::identity();
    mat[(0, 3)] = translation.x;
    mat[(1, 3)] = translation.y;
    mat[(2, 3)] = translation.z;
    mat
}

/// Homogeneous matrix of a pure rotation given by an axis-angle vector.
pub fn rotation_matrix<T: Real>(axisangle: Vec3<T>) -> Mat4<T> {
    let rot = so3::exp(axisangle);
    let mut mat = Mat4::identity();
    mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
    mat
}

/// Convert the network pose parameters into a 4x4 transformation matrix.
///
/// Without inversion, the transform is `T · R`.
/// With inversion, the rotation is transposed, the translation negated,
/// and the composition is `R · T`, which is exactly the inverse of the
/// non inverted transform.
pub fn transformation_from_parameters<T: Real>(
    axisangle: Vec3<T>,
    translation: Vec3<T>,
    invert: bool,
) -> Mat4<T> {
    let mut rot = rotation_matrix(axisangle);
    if invert {
        rot.transpose_mut();
        let trans = translation_matrix(-translation);
        rot * trans
    } else {
        translation_matrix(translation) * rot
    }
}

// TESTS #############################################################

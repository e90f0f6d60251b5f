// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Conversion of the network sigmoid disparity into bounded depth.

use nalgebra::DMatrix;

use crate::misc::type_aliases::{real, Real};

/// Convert a sigmoid output into `(scaled_disparity, depth)`.
///
/// The disparity is mapped linearly into `[1 / max_depth, 1 / min_depth]`
/// so the depth always lies in `[min_depth, max_depth]`.
pub fn disp_to_depth_value<T: Real>(disp: T, min_depth: f64, max_depth: f64) -> (T, T) {
    let min_disp: T = real(1.0 / max_depth);
    let max_disp: T = real(1.0 / min_depth);
    let scaled_disp = min_disp + (max_disp - min_disp) * disp;
    (scaled_disp, T::one() / scaled_disp)
}

/// `disp_to_depth_value` on every pixel of a disparity map.
pub fn disp_to_depth<T: Real>(
    disp: &DMatrix<T>,
    min_depth: f64,
    max_depth: f64,
) -> (DMatrix<T>, DMatrix<T>) {
    let scaled = disp.map(|d| disp_to_depth_value(d, min_depth, max_depth).0);
    let depth = scaled.map(|s| T::one() / s);
    (scaled, depth)
}

// TESTS #############################################################

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions to compute one pixel finite differences.

use nalgebra::DMatrix;

use crate::misc::type_aliases::Real;

/// Horizontal difference `mat[y, x] - mat[y, x + 1]`.
///
/// The result has one column less than the input.
pub fn diff_x<T: Real>(mat: &DMatrix<T>) -> DMatrix<T> {
    let (rows, cols) = mat.shape();
    let cols = cols.saturating_sub(1);
    DMatrix::from_fn(rows, cols, |y, x| mat[(y, x)] - mat[(y, x + 1)])
}

/// Vertical difference `mat[y, x] - mat[y + 1, x]`.
///
/// The result has one row less than the input.
pub fn diff_y<T: Real>(mat: &DMatrix<T>) -> DMatrix<T> {
    let (rows, cols) = mat.shape();
    let rows = rows.saturating_sub(1);
    DMatrix::from_fn(rows, cols, |y, x| mat[(y, x)] - mat[(y + 1, x)])
}

// TESTS #############################################################

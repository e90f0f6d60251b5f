// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Functions to generate pyramids and resize matrices.

use nalgebra::{DMatrix, Scalar};

use crate::misc::type_aliases::{real, Real};

/// Recursively generate a pyramid of matrices where each level
/// is half the previous resolution, computed with the mean of each 2x2 block.
pub fn mean_pyramid<T: Real>(max_levels: usize, mat: DMatrix<T>) -> Vec<DMatrix<T>> {
    let quarter: T = real(0.25);
    limited_sequence(max_levels, mat, |m| {
        halve(m, |a, b, c, d| (a + b + c + d) * quarter)
    })
}

/// Recursively apply a function transforming the matrix
/// until it's not possible anymore or the max number of levels is reached.
///
/// Using `levels = 0` has the same effect as `levels = 1` since it always has
/// at least one matrix (the init matrix).
pub fn limited_sequence<F, T>(levels: usize, mat: DMatrix<T>, f: F) -> Vec<DMatrix<T>>
where
    F: Fn(&DMatrix<T>) -> Option<DMatrix<T>>,
    T: Scalar,
{
    let mut pyr = Vec::with_capacity(levels.max(1));
    let mut current = mat;
    while pyr.len() + 1 < levels {
        match f(&current) {
            Some(next) => pyr.push(std::mem::replace(&mut current, next)),
            None => break,
        }
    }
    pyr.push(current);
    pyr
}

/// Halve the resolution of a matrix by applying a function to each 2x2 block.
///
/// If one size of the matrix is < 2 then this function returns None.
/// If one size is odd, its last line/column is dropped.
pub fn halve<F, T, U>(mat: &DMatrix<T>, f: F) -> Option<DMatrix<U>>
where
    F: Fn(T, T, T, T) -> U,
    T: Scalar + Copy,
    U: Scalar,
{
    let (r, c) = mat.shape();
    let half_r = r / 2;
    let half_c = c / 2;
    if half_r == 0 || half_c == 0 {
        None
    } else {
        let half_mat = DMatrix::<U>::from_fn(half_r, half_c, |i, j| {
            let a = mat[(2 * i, 2 * j)];
            let b = mat[(2 * i + 1, 2 * j)];
            let c = mat[(2 * i, 2 * j + 1)];
            let d = mat[(2 * i + 1, 2 * j + 1)];
            f(a, b, c, d)
        });
        Some(half_mat)
    }
}

// Resizing ##########################################################

/// Bilinear resize where pixel centers are aligned (`align_corners = false`).
///
/// Source coordinates are `(dst + 0.5) · in / out - 0.5`,
/// clamped at zero before interpolation.
pub fn resize_bilinear<T: Real>(mat: &DMatrix<T>, height: usize, width: usize) -> DMatrix<T> {
    let (in_h, in_w) = mat.shape();
    if in_h == 0 || in_w == 0 {
        return DMatrix::zeros(height, width);
    }
    let rows: Vec<_> = (0..height).map(|y| source_coord(y, in_h, height)).collect();
    let cols: Vec<_> = (0..width).map(|x| source_coord(x, in_w, width)).collect();
    DMatrix::from_fn(height, width, |y, x| {
        let (y0, y1, wy) = rows[y];
        let (x0, x1, wx) = cols[x];
        let (wx, wy): (T, T) = (real(wx), real(wy));
        let one = T::one();
        let top = mat[(y0, x0)] * (one - wx) + mat[(y0, x1)] * wx;
        let bottom = mat[(y1, x0)] * (one - wx) + mat[(y1, x1)] * wx;
        top * (one - wy) + bottom * wy
    })
}

/// Integer neighbors and interpolation weight of the source coordinate
/// of the destination index `dst`.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn source_coord(dst: usize, in_len: usize, out_len: usize) -> (usize, usize, f64) {
    let scale = in_len as f64 / out_len as f64;
    let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(in_len - 1);
    let i1 = (i0 + 1).min(in_len - 1);
    (i0, i1, src - i0 as f64)
}

/// Nearest neighbor resize, picking source index `floor(dst · in / out)`.
///
/// An empty input resizes to a matrix of default values.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn resize_nearest<T: Scalar + Copy + Default>(
    mat: &DMatrix<T>,
    height: usize,
    width: usize,
) -> DMatrix<T> {
    let (in_h, in_w) = mat.shape();
    if in_h == 0 || in_w == 0 {
        return DMatrix::from_element(height, width, T::default());
    }
    let pick = |dst: usize, in_len: usize, out_len: usize| {
        ((dst as f64 * in_len as f64 / out_len as f64).floor() as usize).min(in_len - 1)
    };
    DMatrix::from_fn(height, width, |y, x| {
        mat[(pick(y, in_h, height), pick(x, in_w, width))]
    })
}

// TESTS #############################################################

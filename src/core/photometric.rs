// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Photometric error between a reconstructed image and its target:
//! a structural similarity term mixed with an absolute difference term.

use nalgebra::DMatrix;

use crate::core::image::Image;
use crate::misc::helper::reflect;
use crate::misc::type_aliases::{real, Real};

const C1: f64 = 0.01 * 0.01;
const C2: f64 = 0.03 * 0.03;

/// Weight of the SSIM term, the L1 term gets the complement.
pub const SSIM_WEIGHT: f64 = 0.85;

/// Per pixel SSIM dissimilarity `clamp((1 - SSIM) / 2, 0, 1)`
/// computed on 3x3 windows with reflection padding.
#[allow(clippy::similar_names)]
pub fn ssim<T: Real>(x: &DMatrix<T>, y: &DMatrix<T>) -> DMatrix<T> {
    let mu_x = box_mean(x);
    let mu_y = box_mean(y);
    let sigma_x = box_mean(&x.component_mul(x)) - mu_x.component_mul(&mu_x);
    let sigma_y = box_mean(&y.component_mul(y)) - mu_y.component_mul(&mu_y);
    let sigma_xy = box_mean(&x.component_mul(y)) - mu_x.component_mul(&mu_y);

    let (c1, c2, two, half): (T, T, T, T) = (real(C1), real(C2), real(2.0), real(0.5));
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
        let (mx, my) = (mu_x[(i, j)], mu_y[(i, j)]);
        let n = (two * mx * my + c1) * (two * sigma_xy[(i, j)] + c2);
        let d = (mx * mx + my * my + c1) * (sigma_x[(i, j)] + sigma_y[(i, j)] + c2);
        ((T::one() - n / d) * half).max(T::zero()).min(T::one())
    })
}

/// Mean over the 3x3 window of each pixel, borders mirrored.
#[allow(clippy::cast_possible_wrap)]
pub fn box_mean<T: Real>(mat: &DMatrix<T>) -> DMatrix<T> {
    let (rows, cols) = mat.shape();
    let ninth: T = real(1.0 / 9.0);
    DMatrix::from_fn(rows, cols, |i, j| {
        let mut sum = T::zero();
        for di in -1..=1 {
            let ii = reflect(i as isize + di, rows);
            for dj in -1..=1 {
                sum += mat[(ii, reflect(j as isize + dj, cols))];
            }
        }
        sum * ninth
    })
}

/// Photometric reprojection error of `pred` against `target`,
/// averaged over channels.
///
/// `0.85 · SSIM + 0.15 · L1`, or plain L1 when `no_ssim` is set.
pub fn reprojection_loss<T: Real>(pred: &Image<T>, target: &Image<T>, no_ssim: bool) -> DMatrix<T> {
    let (rows, cols) = target.shape();
    let nb: T = real(target.nb_channels().max(1) as f64);
    let mut l1 = DMatrix::zeros(rows, cols);
    let mut dissimilarity = DMatrix::zeros(rows, cols);
    for (p, t) in pred.channels.iter().zip(target.channels.iter()) {
        l1 += (t - p).map(|d| d.abs());
        if !no_ssim {
            dissimilarity += ssim(p, t);
        }
    }
    let l1 = l1.map(|x| x / nb);
    if no_ssim {
        l1
    } else {
        let w: T = real(SSIM_WEIGHT);
        let w_l1: T = real(1.0 - SSIM_WEIGHT);
        dissimilarity.zip_map(&l1, |s, l| w * s / nb + w_l1 * l)
    }
}

// TESTS #############################################################

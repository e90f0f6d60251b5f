// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Edge-aware disparity smoothness.

use nalgebra::DMatrix;

use crate::core::gradient::{diff_x, diff_y};
use crate::core::image::{mean, Image};
use crate::misc::type_aliases::{real, Real};

const EPSILON_MEAN: f64 = 1e-7;

/// Disparity divided by its mean, so that shrinking the whole map is not rewarded.
pub fn normalize_disparity<T: Real>(disp: &DMatrix<T>) -> DMatrix<T> {
    let denom = mean(disp) + real(EPSILON_MEAN);
    disp.map(|d| d / denom)
}

/// Disparity gradients weighted by `exp(-|∂I|)`, with `|∂I|` the channel mean
/// of the image absolute gradients.
///
/// Returns the mean of the x term plus the mean of the y term.
pub fn edge_aware_smoothness<T: Real>(disp: &DMatrix<T>, img: &Image<T>) -> T {
    let weighted = |d_disp: DMatrix<T>, d_img: Vec<DMatrix<T>>| {
        let img_grad = Image::new(d_img.into_iter().map(|g| g.map(|x| x.abs())).collect())
            .channel_mean();
        mean(&d_disp.zip_map(&img_grad, |d, g| d.abs() * (-g).exp()))
    };
    let x_term = weighted(diff_x(disp), img.channels.iter().map(diff_x).collect());
    let y_term = weighted(diff_y(disp), img.channels.iter().map(diff_y).collect());
    x_term + y_term
}

/// Smoothness of the mean normalized disparity against its color image.
pub fn smoothness_loss<T: Real>(disp: &DMatrix<T>, img: &Image<T>) -> T {
    edge_aware_smoothness(&normalize_disparity(disp), img)
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn constant_disparity_is_smooth() {
        let disp = DMatrix::repeat(4, 6, 0.3_f64);
        let img = Image::gray(DMatrix::from_fn(4, 6, |i, j| (i + j) as f64));
        assert_eq!(0.0, smoothness_loss(&disp, &img));
    }

    #[test]
    fn image_edges_discount_disparity_edges() {
        // Disparity step between columns 2 and 3.
        let disp = DMatrix::from_fn(4, 6, |_, j| if j < 3 { 1.0_f64 } else { 2.0 });
        let flat = Image::gray(DMatrix::repeat(4, 6, 0.5));
        let edge = Image::gray(DMatrix::from_fn(4, 6, |_, j| if j < 3 { 0.0 } else { 1.0 }));
        let on_flat = smoothness_loss(&disp, &flat);
        let on_edge = smoothness_loss(&disp, &edge);
        assert!(on_flat > 0.0);
        assert!((on_edge - on_flat * (-1.0_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn normalization_is_scale_invariant() {
        let disp = DMatrix::from_fn(3, 3, |i, j| 1.0 + (i * 3 + j) as f64);
        let img = Image::gray(DMatrix::zeros(3, 3));
        let a = smoothness_loss(&disp, &img);
        let b = smoothness_loss(&disp.map(|d| 10.0 * d), &img);
        assert!((a - b).abs() < 1e-6);
    }
}

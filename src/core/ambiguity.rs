// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Ambiguity masking of photometrically unreliable pixels.
//!
//! A pixel is ambiguous when, along one axis, the differences with its two
//! neighbors have the same sign: the intensity keeps increasing (or
//! decreasing) through it instead of forming a distinct feature.
//! The ambiguity value is the gradient magnitude at such pixels
//! and zero elsewhere.
//!
//! Sources are evaluated in their own layout, then resampled into the
//! target view with the sampling grid of the warp, so that the ambiguity
//! follows the pixels that actually got compared.

use nalgebra::DMatrix;

use crate::core::camera::{sample_plane, Grid};
use crate::core::gradient::{diff_x, diff_y};
use crate::core::image::Image;
use crate::misc::type_aliases::{real, Real};

/// How the ambiguity value turns into a loss weight.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AmbiguityWeighting {
    /// Hard mask, 1 where the ambiguity is strictly below the threshold.
    Threshold(f64),
    /// Smooth weight `exp(-k · ambiguity)`.
    NegativeExponential(f64),
}

/// Per pixel same sign indicator and ambiguity value of an image.
#[allow(clippy::similar_names)]
pub fn gradient_pattern<T: Real>(img: &Image<T>) -> (DMatrix<bool>, DMatrix<T>) {
    let (rows, cols) = img.shape();
    let mut same_sign = DMatrix::from_element(rows, cols, false);
    let mut grad_u = DMatrix::<T>::zeros(rows, cols);
    let mut grad_v = DMatrix::<T>::zeros(rows, cols);
    for plane in &img.channels {
        let dx = diff_x(plane);
        let dy = diff_y(plane);
        for y in 0..rows {
            for x in 0..cols {
                // Zero padded differences with the left/right and top/bottom neighbors.
                let left = if x > 0 { dx[(y, x - 1)] } else { T::zero() };
                let right = if x + 1 < cols { dx[(y, x)] } else { T::zero() };
                let top = if y > 0 { dy[(y - 1, x)] } else { T::zero() };
                let bottom = if y + 1 < rows { dy[(y, x)] } else { T::zero() };
                if left * right > T::zero() || top * bottom > T::zero() {
                    same_sign[(y, x)] = true;
                }
                grad_u[(y, x)] += left.abs() + right.abs();
                grad_v[(y, x)] += top.abs() + bottom.abs();
            }
        }
    }
    let half: T = real(0.5);
    let grad = grad_u.zip_map(&grad_v, |u, v| {
        let (u, v) = (u * half, v * half);
        (u * u + v * v).sqrt()
    });
    let ambiguity = grad.zip_map(&same_sign, |g, s| if s { g } else { T::zero() });
    (same_sign, ambiguity)
}

/// Ambiguity value of every pixel of an image.
pub fn extract_ambiguity<T: Real>(img: &Image<T>) -> DMatrix<T> {
    gradient_pattern(img).1
}

/// Ambiguity of the target view: the maximum between the target own
/// ambiguity and the warped ambiguity of the source frame selected
/// at each pixel by `min_idx`.
///
/// `min_idx` values index into `warped_sources`. Out of range indices
/// fall back on the target ambiguity alone.
pub fn synthetic_ambiguity<T: Real>(
    target: &DMatrix<T>,
    warped_sources: &[DMatrix<T>],
    min_idx: &DMatrix<usize>,
) -> DMatrix<T> {
    DMatrix::from_fn(target.nrows(), target.ncols(), |y, x| {
        let own = target[(y, x)];
        match warped_sources.get(min_idx[(y, x)]) {
            Some(source) => own.max(source[(y, x)]),
            None => own,
        }
    })
}

/// Weight of every pixel given its ambiguity.
pub fn weight_from_ambiguity<T: Real>(
    ambiguity: &DMatrix<T>,
    weighting: AmbiguityWeighting,
) -> DMatrix<T> {
    match weighting {
        AmbiguityWeighting::Threshold(thresh) => {
            let thresh: T = real(thresh);
            ambiguity.map(|a| if a < thresh { T::one() } else { T::zero() })
        }
        AmbiguityWeighting::NegativeExponential(k) => {
            let k: T = real(k);
            ambiguity.map(|a| (-(k * a)).exp())
        }
    }
}

/// Full ambiguity mask of one sample at one scale.
///
/// `sources` and `grids` are ordered like the source frames, each grid
/// being the one used to warp the corresponding source into the target.
pub fn ambiguity_mask<T: Real>(
    target: &Image<T>,
    sources: &[&Image<T>],
    grids: &[&Grid<T>],
    min_idx: &DMatrix<usize>,
    weighting: AmbiguityWeighting,
) -> DMatrix<T> {
    let target_ambiguity = extract_ambiguity(target);
    let warped: Vec<DMatrix<T>> = sources
        .iter()
        .zip(grids)
        .map(|(source, grid)| sample_plane(&extract_ambiguity(source), grid))
        .collect();
    let synthetic = synthetic_ambiguity(&target_ambiguity, &warped, min_idx);
    weight_from_ambiguity(&synthetic, weighting)
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::misc::type_aliases::Vec2;

    fn step_edge() -> Image<f64> {
        Image::gray(DMatrix::from_fn(5, 6, |_, x| if x < 3 { 0.0 } else { 1.0 }))
    }

    #[test]
    fn constant_image_is_not_ambiguous() {
        let img = Image::new(vec![DMatrix::repeat(4, 5, 0.3_f64); 3]);
        let (same_sign, ambiguity) = gradient_pattern(&img);
        assert!(ambiguity.iter().all(|&a| a == 0.0));
        assert!(same_sign.iter().all(|&s| !s));
    }

    #[test]
    fn step_edge_is_not_flagged_at_the_edge() {
        let (same_sign, ambiguity) = gradient_pattern(&step_edge());
        for y in 0..5 {
            assert!(!same_sign[(y, 2)]);
            assert!(!same_sign[(y, 3)]);
        }
        // Flat sides carry no gradient, hence no ambiguity either.
        assert!(ambiguity.iter().all(|&a| a == 0.0));
    }

    #[test]
    fn ramp_interior_is_ambiguous() {
        let ramp = Image::gray(DMatrix::from_fn(3, 6, |_, x| x as f64 / 10.0));
        let (same_sign, ambiguity) = gradient_pattern(&ramp);
        assert!(same_sign[(1, 2)]);
        // Horizontal differences of 0.1 on both sides, none vertically.
        assert!((ambiguity[(1, 2)] - 0.1).abs() < 1e-12);
        // Border columns only have one non zero neighbor difference.
        assert!(!same_sign[(1, 0)]);
        assert!(!same_sign[(1, 5)]);
    }

    #[test]
    fn channels_combine_with_or_and_sum() {
        let ramp = DMatrix::from_fn(3, 6, |_, x| x as f64 / 10.0);
        let flat = DMatrix::repeat(3, 6, 0.5);
        let (same_sign, ambiguity) = gradient_pattern(&Image::new(vec![ramp.clone(), flat]));
        assert!(same_sign[(1, 2)]);
        let (_, ambiguity_ramp) = gradient_pattern(&Image::new(vec![ramp.clone(), ramp]));
        assert!((ambiguity_ramp[(1, 2)] - 2.0 * ambiguity[(1, 2)]).abs() < 1e-12);
    }

    #[test]
    fn selected_source_and_target_maximum() {
        let target = DMatrix::from_row_slice(1, 3, &[0.2_f64, 0.2, 0.2]);
        let sources = vec![
            DMatrix::from_row_slice(1, 3, &[0.5, 0.0, 0.9]),
            DMatrix::from_row_slice(1, 3, &[0.0, 0.7, 0.1]),
        ];
        let min_idx = DMatrix::from_row_slice(1, 3, &[0, 1, 1]);
        let synthetic = synthetic_ambiguity(&target, &sources, &min_idx);
        assert_eq!(DMatrix::from_row_slice(1, 3, &[0.5, 0.7, 0.2]), synthetic);
    }

    #[test]
    fn weights() {
        let ambiguity = DMatrix::from_row_slice(1, 3, &[0.0_f64, 0.3, 1.0]);
        let hard = weight_from_ambiguity(&ambiguity, AmbiguityWeighting::Threshold(0.3));
        assert_eq!(DMatrix::from_row_slice(1, 3, &[1.0, 0.0, 0.0]), hard);
        let soft = weight_from_ambiguity(&ambiguity, AmbiguityWeighting::NegativeExponential(2.0));
        assert_eq!(1.0, soft[(0, 0)]);
        assert!((soft[(0, 2)] - (-2.0_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn identity_warp_keeps_source_ambiguity() {
        let ramp = Image::gray(DMatrix::from_fn(3, 5, |_, x| x as f64 / 4.0));
        let grid = DMatrix::from_fn(3, 5, |y, x| {
            Vec2::new(x as f64 / 2.0 - 1.0, y as f64 - 1.0)
        });
        let flat = Image::gray(DMatrix::zeros(3, 5));
        let min_idx = DMatrix::zeros(3, 5);
        let mask = ambiguity_mask(
            &flat,
            &[&ramp],
            &[&grid],
            &min_idx,
            AmbiguityWeighting::Threshold(0.1),
        );
        let expected = weight_from_ambiguity(
            &extract_ambiguity(&ramp),
            AmbiguityWeighting::Threshold(0.1),
        );
        assert_eq!(expected, mask);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Triplet loss on depth features around semantic boundaries.
//!
//! For every pixel, the neighbors in a square window sharing its
//! segmentation label are positives, the others are negatives.
//! Only pixels with enough of both, which are close to a boundary, enter
//! the loss. The loss pulls the features of positives towards the center
//! pixel and pushes negatives away, which sharpens depth discontinuities
//! along object borders.

use nalgebra::DMatrix;

use crate::core::image::Image;
use crate::core::multires::resize_nearest;
use crate::misc::type_aliases::{real, Real};

/// Label of the padding around segmentation maps.
pub const SENTINEL_LABEL: i32 = -1;

/// Norm floor when normalizing feature vectors.
const EPSILON_NORM: f64 = 1e-12;

/// Floor of `2 - 2 · similarity` before the square root.
const EPSILON_AFFINITY: f64 = 1e-9;

/// Configuration of the boundary triplet loss.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryTriplet {
    /// `(scale, window size)` pairs, window sizes being odd.
    pub scales: Vec<(usize, usize)>,
    /// Margin of the classic triplet form.
    pub margin: f64,
    /// Margin of the isolated form.
    pub isolated_margin: f64,
    /// Use the closest negative instead of the mean over negatives.
    pub hardest_negative: bool,
    /// Use `pos + max(0, isolated_margin - neg)` instead of
    /// `max(0, margin + pos - neg)`.
    pub isolated: bool,
}

/// Accumulated loss of all qualifying pixels.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TripletSum<T> {
    /// Sum of the per pixel losses.
    pub sum: T,
    /// Number of qualifying pixels.
    pub count: usize,
}

impl<T: Real> TripletSum<T> {
    /// Nothing accumulated.
    pub fn zero() -> Self {
        Self {
            sum: T::zero(),
            count: 0,
        }
    }

    /// Mean over qualifying pixels, zero when there is none.
    pub fn mean(&self) -> T {
        if self.count == 0 {
            T::zero()
        } else {
            self.sum / real(self.count as f64)
        }
    }
}

/// Label of a pixel, or the sentinel outside of the map.
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_sign_loss)]
fn label_at(seg: &DMatrix<i32>, y: isize, x: isize) -> i32 {
    let (rows, cols) = seg.shape();
    if y < 0 || x < 0 || y >= rows as isize || x >= cols as isize {
        SENTINEL_LABEL
    } else {
        seg[(y as usize, x as usize)]
    }
}

/// Offsets of a square window of odd size `kernel`, center included.
#[allow(clippy::cast_possible_wrap)]
fn window(kernel: usize) -> impl Iterator<Item = (isize, isize)> {
    let pad = (kernel / 2) as isize;
    (-pad..=pad).flat_map(move |dy| (-pad..=pad).map(move |dx| (dy, dx)))
}

/// Number of positive and negative neighbors of a pixel.
#[allow(clippy::cast_possible_wrap)]
fn neighbor_counts(seg: &DMatrix<i32>, y: usize, x: usize, kernel: usize) -> (usize, usize) {
    let center = seg[(y, x)];
    let (y, x) = (y as isize, x as isize);
    let pos = window(kernel)
        .filter(|&(dy, dx)| label_at(seg, y + dy, x + dx) == center)
        .count();
    (pos, kernel * kernel - pos)
}

/// Pixels straddling a boundary: at least `kernel - 1` positives
/// and `kernel - 1` negatives in their window.
pub fn qualifying_pixels(seg: &DMatrix<i32>, kernel: usize) -> DMatrix<bool> {
    let min_count = kernel.saturating_sub(1);
    DMatrix::from_fn(seg.nrows(), seg.ncols(), |y, x| {
        let (pos, neg) = neighbor_counts(seg, y, x, kernel);
        pos >= min_count && neg >= min_count
    })
}

/// Segmentation resized with nearest neighbors to the resolution of a scale.
pub fn segmentation_at_scale(
    seg: &DMatrix<i32>,
    scale: usize,
    height: usize,
    width: usize,
) -> DMatrix<i32> {
    resize_nearest(seg, height >> scale, width >> scale)
}

/// Feature planes divided by the per pixel feature norm.
fn normalize<T: Real>(features: &Image<T>) -> Image<T> {
    let (rows, cols) = features.shape();
    let floor: T = real(EPSILON_NORM);
    let norms = DMatrix::from_fn(rows, cols, |y, x| {
        let sq = features
            .channels
            .iter()
            .fold(T::zero(), |acc, c| acc + c[(y, x)] * c[(y, x)]);
        sq.sqrt().max(floor)
    });
    features.map_planes(|plane| plane.zip_map(&norms, |v, n| v / n))
}

impl BoundaryTriplet {
    /// Loss of one qualifying pixel given its positive and negative distances.
    fn hinge<T: Real>(&self, pos_dist: T, neg_dist: T) -> T {
        if self.isolated {
            pos_dist + (real::<T>(self.isolated_margin) - neg_dist).max(T::zero())
        } else {
            (real::<T>(self.margin) + pos_dist - neg_dist).max(T::zero())
        }
    }

    /// Accumulate the loss of every qualifying pixel of one sample.
    ///
    /// Returns `None` when the features and segmentation shapes differ.
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_sign_loss)]
    pub fn accumulate<T: Real>(
        &self,
        seg: &DMatrix<i32>,
        features: &Image<T>,
        kernel: usize,
    ) -> Option<TripletSum<T>> {
        let (rows, cols) = seg.shape();
        if features.shape() != (rows, cols) {
            return None;
        }
        let normalized = normalize(features);
        let floor: T = real(EPSILON_AFFINITY);
        let two: T = real(2.0);
        let qualifying = qualifying_pixels(seg, kernel);
        let mut acc = TripletSum::zero();
        for y in 0..rows {
            for x in 0..cols {
                if !qualifying[(y, x)] {
                    continue;
                }
                let center = seg[(y, x)];
                let (mut pos_sum, mut pos_num) = (T::zero(), 0_usize);
                let (mut neg_sum, mut neg_num) = (T::zero(), 0_usize);
                let mut neg_min: Option<T> = None;
                for (dy, dx) in window(kernel) {
                    let (ny, nx) = (y as isize + dy, x as isize + dx);
                    let inside = ny >= 0 && nx >= 0 && (ny as usize) < rows && (nx as usize) < cols;
                    // Padded neighbors have null features.
                    let similarity = if inside {
                        normalized.channels.iter().fold(T::zero(), |s, c| {
                            s + c[(y, x)] * c[(ny as usize, nx as usize)]
                        })
                    } else {
                        T::zero()
                    };
                    let affinity = (two - two * similarity).max(floor).sqrt();
                    if label_at(seg, ny, nx) == center {
                        pos_sum += affinity;
                        pos_num += 1;
                    } else {
                        neg_sum += affinity;
                        neg_num += 1;
                        neg_min = Some(neg_min.map_or(affinity, |m| m.min(affinity)));
                    }
                }
                let pos_dist = pos_sum / real(pos_num.max(1) as f64);
                let neg_dist = if self.hardest_negative {
                    neg_min.unwrap_or_else(T::zero)
                } else {
                    neg_sum / real(neg_num.max(1) as f64)
                };
                acc.sum += self.hinge(pos_dist, neg_dist);
                acc.count += 1;
            }
        }
        Some(acc)
    }

    /// Loss at one `(scale, kernel)` pair over a batch: the mean over every
    /// qualifying pixel of every sample, zero when none qualifies.
    ///
    /// `segmentations` are already at the resolution of the features.
    pub fn scale_loss<T: Real>(
        &self,
        segmentations: &[DMatrix<i32>],
        features: &[&Image<T>],
        kernel: usize,
    ) -> Option<T> {
        let mut total = TripletSum::zero();
        for (seg, feat) in segmentations.iter().zip(features) {
            let sample = self.accumulate(seg, feat, kernel)?;
            total.sum += sample.sum;
            total.count += sample.count;
        }
        Some(total.mean())
    }
} // impl BoundaryTriplet

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    fn two_regions(rows: usize, cols: usize, boundary: usize) -> DMatrix<i32> {
        DMatrix::from_fn(rows, cols, |_, x| if x < boundary { 3 } else { 7 })
    }

    fn config(isolated: bool, hardest_negative: bool) -> BoundaryTriplet {
        BoundaryTriplet {
            scales: vec![(0, 3)],
            margin: 0.3,
            isolated_margin: 0.65,
            hardest_negative,
            isolated,
        }
    }

    #[test]
    fn only_pixels_near_the_boundary_qualify() {
        for &kernel in &[3_usize, 5] {
            let pad = kernel / 2;
            let (rows, cols, boundary) = (12, 16, 8);
            let seg = two_regions(rows, cols, boundary);
            let qualifying = qualifying_pixels(&seg, kernel);
            // Away from the image border, which is padded with the sentinel,
            // only columns within `pad` of the boundary qualify.
            for y in pad..rows - pad {
                for x in pad..cols - pad {
                    let near = x + pad >= boundary && x < boundary + pad;
                    assert_eq!(near, qualifying[(y, x)], "kernel {} at ({}, {})", kernel, y, x);
                }
            }
        }
    }

    #[test]
    fn interior_and_isolated_pixels_are_excluded() {
        let uniform = DMatrix::from_element(6, 6, 1);
        assert!(!qualifying_pixels(&uniform, 3)[(2, 2)]);

        // Every pixel alone in its segment: only the center is positive.
        let isolated = DMatrix::from_fn(6, 6, |y, x| (6 * y + x) as i32);
        let features = Image::new(vec![DMatrix::from_fn(6, 6, |y, x| (y * x) as f64); 4]);
        let cfg = config(false, true);
        let sum = cfg.accumulate(&isolated, &features, 3).unwrap();
        assert_eq!(0, sum.count);
        assert_eq!(Some(0.0), cfg.scale_loss(&[isolated], &[&features], 3));
    }

    #[test]
    fn empty_batch_contributes_zero() {
        let cfg = config(true, false);
        assert_eq!(Some(0.0), cfg.scale_loss::<f64>(&[], &[], 3));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let cfg = config(true, true);
        let seg = two_regions(4, 4, 2);
        let features = Image::new(vec![DMatrix::<f64>::zeros(2, 2)]);
        assert_eq!(None, cfg.accumulate(&seg, &features, 3));
    }

    #[test]
    fn separated_features_satisfy_the_margin() {
        // Features aligned within each region and orthogonal across.
        let (rows, cols, boundary) = (7, 8, 4);
        let seg = two_regions(rows, cols, boundary);
        let features = Image::new(vec![
            DMatrix::from_fn(rows, cols, |_, x| if x < boundary { 1.0_f64 } else { 0.0 }),
            DMatrix::from_fn(rows, cols, |_, x| if x < boundary { 0.0 } else { 1.0 }),
        ]);
        let classic = config(false, true);
        let sum = classic.accumulate(&seg, &features, 3).unwrap();
        assert!(sum.count > 0);
        // Interior boundary pixels: positives at distance ~0, negatives at sqrt(2).
        // Padded neighbors of border pixels are at sqrt(2) too.
        assert!(sum.sum.abs() < 1e-3);

        // Identical features on both sides violate the margin.
        let confused = Image::new(vec![DMatrix::repeat(rows, cols, 1.0_f64)]);
        let sum_confused = classic.accumulate(&seg, &confused, 3).unwrap();
        // The 14 pixels of columns 3 and 4 see real negatives at null distance.
        // Other border pixels only see padded negatives, far enough.
        assert!((sum_confused.sum - 14.0 * 0.3).abs() < 1e-3);
    }

    #[test]
    fn isolated_form_adds_positive_distance() {
        let seg = two_regions(5, 6, 3);
        let features = Image::new(vec![DMatrix::repeat(5, 6, 1.0_f64)]);
        let isolated = config(true, false);
        let classic = config(false, false);
        let a = isolated.accumulate(&seg, &features, 3).unwrap();
        let b = classic.accumulate(&seg, &features, 3).unwrap();
        assert_eq!(a.count, b.count);
        assert!(a.mean() > 0.0 && b.mean() > 0.0);
    }

    #[test]
    fn segmentation_follows_scale() {
        let seg = two_regions(8, 16, 8);
        let small = segmentation_at_scale(&seg, 2, 8, 16);
        assert_eq!((2, 4), small.shape());
        assert_eq!(DMatrix::from_row_slice(2, 4, &[3, 3, 7, 7, 3, 3, 7, 7]), small);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Automasking of static pixels and predictive masking.
//!
//! With automasking, every pixel keeps the smallest error among the
//! identity errors (unwarped sources) and the reprojection errors
//! (warped sources). Pixels where an identity error wins did not need any
//! motion compensation, typically objects moving with the camera or
//! a static camera, and thus do not push the warp anywhere.
//!
//! Without automasking, a learned per pixel mask may scale the
//! reprojection errors instead, with a penalty pulling it towards 1.

use itertools::izip;
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::core::image::mean;
use crate::misc::type_aliases::{real, Real};

/// Standard deviation of the noise added to identity errors.
pub const TIE_BREAK_STD: f64 = 1e-5;

/// Weight of the binary cross entropy pulling the predictive mask to 1.
pub const PREDICTIVE_MASK_WEIGHT: f64 = 0.2;

/// Lower bound of the log in the binary cross entropy.
const BCE_LOG_CLAMP: f64 = -100.0;

/// Result of the per pixel minimum over error maps.
#[derive(Clone, Debug, PartialEq)]
pub struct Automasked<T: nalgebra::Scalar> {
    /// Error kept for every pixel.
    pub to_optimise: DMatrix<T>,
    /// True where one of the reprojection errors won.
    pub selection: DMatrix<bool>,
}

/// Mean of several error maps of the same shape.
pub fn average<T: Real>(maps: &[DMatrix<T>]) -> Option<DMatrix<T>> {
    let first = maps.first()?;
    let nb: T = real(maps.len() as f64);
    let sum = maps
        .iter()
        .skip(1)
        .fold(first.clone(), |acc, m| acc + m);
    Some(sum.map(|x| x / nb))
}

/// Per pixel minimum over error maps and index of the map reaching it.
///
/// Ties resolve to the first map.
pub fn argmin<T: Real>(maps: &[DMatrix<T>]) -> Option<(DMatrix<T>, DMatrix<usize>)> {
    let first = maps.first()?;
    let mut min = first.clone();
    let mut idx = DMatrix::zeros(first.nrows(), first.ncols());
    for (k, map) in maps.iter().enumerate().skip(1) {
        for (m, i, &v) in izip!(min.iter_mut(), idx.iter_mut(), map.iter()) {
            if v < *m {
                *m = v;
                *i = k;
            }
        }
    }
    Some((min, idx))
}

/// Add zero mean gaussian noise of tiny magnitude to every error,
/// so that exact ties between identity and reprojection errors
/// are not systematically resolved to the same side.
pub fn add_tie_break_noise<T: Real, R: Rng>(maps: &mut [DMatrix<T>], rng: &mut R) {
    for map in maps {
        for x in map.iter_mut() {
            let noise: f64 = rng.sample(StandardNormal);
            *x += real(noise * TIE_BREAK_STD);
        }
    }
}

/// Select per pixel the minimum over identity and reprojection errors.
///
/// Identity errors receive tie break noise first. With a single error map
/// in total, that map is kept as is and nothing is selected.
pub fn automask<T: Real, R: Rng>(
    mut identity: Vec<DMatrix<T>>,
    reprojection: Vec<DMatrix<T>>,
    rng: &mut R,
) -> Option<Automasked<T>> {
    add_tie_break_noise(&mut identity, rng);
    let nb_identity = identity.len();
    let mut combined = identity;
    combined.extend(reprojection);
    let (to_optimise, idx) = argmin(&combined)?;
    Some(Automasked {
        selection: idx.map(|i| i >= nb_identity),
        to_optimise,
    })
}

/// Scale every reprojection error by its predicted mask and return
/// the regularization term `0.2 · BCE(mask, 1)`.
///
/// `masks` holds one plane per source frame, matching `reprojection`.
pub fn apply_predictive_mask<T: Real>(reprojection: &mut [DMatrix<T>], masks: &[DMatrix<T>]) -> T {
    let clamp: T = real(BCE_LOG_CLAMP);
    let mut bce = T::zero();
    for (loss, mask) in reprojection.iter_mut().zip(masks) {
        loss.component_mul_assign(mask);
        bce += mean(&mask.map(|m| -(m.ln().max(clamp))));
    }
    let nb: T = real(masks.len().max(1) as f64);
    real::<T>(PREDICTIVE_MASK_WEIGHT) * bce / nb
}

// TESTS #############################################################

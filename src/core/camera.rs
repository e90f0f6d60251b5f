// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pinhole camera model: back projection of depth maps into point clouds,
//! projection of point clouds into normalized sampling grids,
//! and bilinear resampling of images at those grids.

use nalgebra::{DMatrix, Scalar};

use crate::core::image::Image;
use crate::misc::type_aliases::{real, value, Mat4, Real, Vec2, Vec3, Vec4};

/// Guard of the perspective divide.
pub const EPSILON_PROJECTION: f64 = 1e-7;

/// Homogeneous camera space coordinates of every pixel.
pub type PointCloud<T> = DMatrix<Vec4<T>>;

/// Sampling coordinates of every pixel, normalized in `[-1, 1]`.
pub type Grid<T> = DMatrix<Vec2<T>>;

/// Intrinsic parameters of one pyramid level, with the inverse computed once.
#[derive(Clone, Debug, PartialEq)]
pub struct Intrinsics<T: Scalar> {
    /// 4x4 homogeneous intrinsics matrix in pixel units.
    pub k: Mat4<T>,
    /// Inverse of `k`.
    pub inv_k: Mat4<T>,
}

impl<T: Real> Intrinsics<T> {
    /// Intrinsics from a pixel matrix, `None` if it is not invertible.
    pub fn new(k: Mat4<T>) -> Option<Self> {
        let inv_k = k.try_inverse()?;
        Some(Self { k, inv_k })
    }

    /// Pixel intrinsics from resolution independent intrinsics.
    ///
    /// The first row is scaled by the width, the second by the height.
    pub fn from_normalized(normalized: &Mat4<T>, width: usize, height: usize) -> Option<Self> {
        let mut k = *normalized;
        let w: T = real(width as f64);
        let h: T = real(height as f64);
        for col in 0..4 {
            k[(0, col)] *= w;
            k[(1, col)] *= h;
        }
        Self::new(k)
    }

    /// Intrinsics of `n` pyramid levels, level `s` at resolution
    /// `width / 2^s` x `height / 2^s`.
    pub fn multi_res(
        normalized: &Mat4<T>,
        width: usize,
        height: usize,
        n: usize,
    ) -> Option<Vec<Self>> {
        (0..n)
            .map(|s| Self::from_normalized(normalized, width >> s, height >> s))
            .collect()
    }
} // impl Intrinsics

/// Back project a depth map into camera space.
///
/// Every pixel `(x, y)` becomes `inv_K · [x, y, 1]ᵗ · depth`,
/// with a homogeneous 1 appended.
pub fn backproject<T: Real>(depth: &DMatrix<T>, inv_k: &Mat4<T>) -> PointCloud<T> {
    let inv_k3 = inv_k.fixed_view::<3, 3>(0, 0).into_owned();
    DMatrix::from_fn(depth.nrows(), depth.ncols(), |y, x| {
        let pixel = Vec3::new(real(x as f64), real(y as f64), T::one());
        let cam = inv_k3 * pixel * depth[(y, x)];
        Vec4::new(cam.x, cam.y, cam.z, T::one())
    })
}

/// Project a point cloud into the pixel grid of a camera moved by `t`.
///
/// Coordinates are normalized into the `[-1, 1]` range of `grid_sample`.
pub fn project<T: Real>(points: &PointCloud<T>, k: &Mat4<T>, t: &Mat4<T>) -> Grid<T> {
    let (height, width) = points.shape();
    let p = (k * t).fixed_view::<3, 4>(0, 0).into_owned();
    let eps: T = real(EPSILON_PROJECTION);
    let w_norm: T = real((width.max(2) - 1) as f64);
    let h_norm: T = real((height.max(2) - 1) as f64);
    let half: T = real(0.5);
    let two: T = real(2.0);
    points.map(|point| {
        let cam = p * point;
        let mut denom = cam.z + eps;
        if denom.abs() < eps {
            denom = eps;
        }
        let px = cam.x / denom;
        let py = cam.y / denom;
        Vec2::new((px / w_norm - half) * two, (py / h_norm - half) * two)
    })
}

/// Bilinear resampling of an image at normalized coordinates.
///
/// Corners are aligned (-1 and 1 are the centers of the border pixels)
/// and coordinates falling outside are clamped to the border.
/// The output has the shape of the grid.
pub fn grid_sample<T: Real>(image: &Image<T>, grid: &Grid<T>) -> Image<T> {
    image.map_planes(|plane| sample_plane(plane, grid))
}

/// `grid_sample` on a single plane.
pub fn sample_plane<T: Real>(plane: &DMatrix<T>, grid: &Grid<T>) -> DMatrix<T> {
    let (height, width) = plane.shape();
    if height == 0 || width == 0 {
        return DMatrix::zeros(grid.nrows(), grid.ncols());
    }
    let x_max: T = real((width - 1) as f64);
    let y_max: T = real((height - 1) as f64);
    let half: T = real(0.5);
    grid.map(|coords| {
        let x = ((coords.x + T::one()) * half * x_max).max(T::zero()).min(x_max);
        let y = ((coords.y + T::one()) * half * y_max).max(T::zero()).min(y_max);
        let (x0, x1, wx) = neighbors(x, width);
        let (y0, y1, wy) = neighbors(y, height);
        let one = T::one();
        let top = plane[(y0, x0)] * (one - wx) + plane[(y0, x1)] * wx;
        let bottom = plane[(y1, x0)] * (one - wx) + plane[(y1, x1)] * wx;
        top * (one - wy) + bottom * wy
    })
}

/// Integer neighbors of a clamped coordinate and the weight of the second one.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn neighbors<T: Real>(coord: T, len: usize) -> (usize, usize, T) {
    let floor = value(coord).floor();
    let i0 = if floor.is_finite() && floor > 0.0 {
        (floor as usize).min(len - 1)
    } else {
        0
    };
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, coord - real(i0 as f64))
}

// TESTS #############################################################

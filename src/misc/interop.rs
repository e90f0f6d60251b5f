// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interoperability conversions between the image and matrix types.

use image::RgbImage;
use nalgebra::DMatrix;

use crate::core::image::Image;
use crate::misc::type_aliases::{real, Real};

/// Convert an `RgbImage` into a 3 channels image with values in `[0, 1]`.
pub fn image_from_rgb<T: Real>(img: &RgbImage) -> Image<T> {
    let (width, height) = img.dimensions();
    let plane = |c: usize| {
        DMatrix::from_fn(height as usize, width as usize, |y, x| {
            let pixel = img.get_pixel(x as u32, y as u32);
            real::<T>(f64::from(pixel[c]) / 255.0)
        })
    };
    Image::new(vec![plane(0), plane(1), plane(2)])
}

/// Matrix of a row major buffer, such as the one of a decoded png.
pub fn matrix_from_row_major<T: nalgebra::Scalar>(
    width: usize,
    height: usize,
    buffer: &[T],
) -> DMatrix<T> {
    DMatrix::from_row_slice(height, width, buffer)
}

// TESTS #############################################################

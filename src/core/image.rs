// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-channel images stored as one matrix per channel.
//!
//! Matrices follow the image layout: rows are image lines (height)
//! and columns are image columns (width).

use nalgebra::{DMatrix, Scalar};

use crate::misc::type_aliases::{real, Real};

/// A multi-channel image, one plane per channel, all planes sharing the same shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Image<T: Scalar> {
    /// Channel planes.
    pub channels: Vec<DMatrix<T>>,
}

impl<T: Scalar> Image<T> {
    /// Build an image from its channel planes.
    pub fn new(channels: Vec<DMatrix<T>>) -> Self {
        debug_assert!(
            channels.windows(2).all(|w| w[0].shape() == w[1].shape()),
            "all channels of an image must share the same shape"
        );
        Self { channels }
    }

    /// Single channel image.
    pub fn gray(plane: DMatrix<T>) -> Self {
        Self {
            channels: vec![plane],
        }
    }

    /// `(height, width)` of the image.
    pub fn shape(&self) -> (usize, usize) {
        self.channels.first().map_or((0, 0), |plane| plane.shape())
    }

    /// Number of channels.
    pub fn nb_channels(&self) -> usize {
        self.channels.len()
    }

    /// Apply a function to every plane.
    pub fn map_planes<U, F>(&self, f: F) -> Image<U>
    where
        U: Scalar,
        F: Fn(&DMatrix<T>) -> DMatrix<U>,
    {
        Image {
            channels: self.channels.iter().map(f).collect(),
        }
    }

    /// Concatenate images along the channel dimension.
    pub fn stack(images: &[&Image<T>]) -> Self {
        Self::new(
            images
                .iter()
                .flat_map(|img| img.channels.iter().cloned())
                .collect(),
        )
    }
}

impl<T: Real> Image<T> {
    /// Image filled with zeros.
    pub fn zeros(nb_channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels: vec![DMatrix::zeros(height, width); nb_channels],
        }
    }

    /// Mean over channels of every pixel.
    pub fn channel_mean(&self) -> DMatrix<T> {
        let (height, width) = self.shape();
        let mut sum = DMatrix::zeros(height, width);
        for plane in &self.channels {
            sum += plane;
        }
        let nb: T = real(self.channels.len().max(1) as f64);
        sum.map(|x| x / nb)
    }

    /// Zero every channel at locations where `mask` is true.
    pub fn zero_where(&mut self, mask: &DMatrix<bool>) {
        for plane in &mut self.channels {
            plane.zip_apply(mask, |x, masked| {
                if masked {
                    *x = T::zero();
                }
            });
        }
    }
}

/// Mean of all the values of a matrix, zero for an empty one.
pub fn mean<T: Real>(mat: &DMatrix<T>) -> T {
    if mat.is_empty() {
        T::zero()
    } else {
        mat.iter().fold(T::zero(), |acc, &x| acc + x) / real(mat.len() as f64)
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn stack_concatenates_channels() {
        let a = Image::<f64>::zeros(3, 2, 4);
        let b = Image::gray(DMatrix::repeat(2, 4, 1.0));
        let stacked = Image::stack(&[&a, &b]);
        assert_eq!(4, stacked.nb_channels());
        assert_eq!((2, 4), stacked.shape());
        assert_eq!(b.channels[0], stacked.channels[3]);
    }

    #[test]
    fn channel_mean_and_mask() {
        let mut img = Image::new(vec![
            DMatrix::repeat(2, 2, 1.0_f64),
            DMatrix::repeat(2, 2, 3.0),
        ]);
        assert_eq!(DMatrix::repeat(2, 2, 2.0), img.channel_mean());
        let mask = DMatrix::from_row_slice(2, 2, &[true, false, false, false]);
        img.zero_where(&mask);
        assert_eq!(0.0, img.channels[1][(0, 0)]);
        assert_eq!(3.0, img.channels[1][(0, 1)]);
        assert!((mean(&img.channels[1]) - 2.25).abs() < 1e-12);
    }
}

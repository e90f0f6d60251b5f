// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mono_depth_rs::core::image::Image;
use mono_depth_rs::core::{multires, photometric};
use nalgebra::DMatrix;

fn textured(shift: usize) -> Image<f32> {
    let plane = |c: usize| {
        DMatrix::from_fn(192, 640, |i, j| ((i * 7 + j * 3 + c + shift) % 11) as f32 / 11.0)
    };
    Image::new(vec![plane(0), plane(1), plane(2)])
}

fn criterion_benchmark(c: &mut Criterion) {
    let pred = textured(0);
    let target = textured(1);
    c.bench_function("reprojection ssim 3x192x640", |b| {
        b.iter(|| photometric::reprojection_loss(black_box(&pred), black_box(&target), false))
    });
    c.bench_function("reprojection l1 3x192x640", |b| {
        b.iter(|| photometric::reprojection_loss(black_box(&pred), black_box(&target), true))
    });
    c.bench_function("mean_pyramid 4 192x640", |b| {
        let mat = target.channels[0].clone();
        b.iter(|| multires::mean_pyramid(4, mat.clone()))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

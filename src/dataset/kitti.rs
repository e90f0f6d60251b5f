// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions to handle datasets compatible with KITTI raw.
//!
//! The expected layout is the one of the raw KITTI archives:
//! `<data>/<date>/<drive>/image_0{2,3}/data/<frame:010>.<ext>` for colors,
//! `<data>/<date>/<drive>/proj_depth/groundtruth/image_0{2,3}/<frame:010>.png`
//! for the improved ground truth depth, and a parallel
//! `<data>/segmentation/<date>/<drive>/image_0{2,3}/<frame:010>.png` tree
//! of semantic labels for the boundary triplet loss.

use image::imageops::{self, FilterType};
use nalgebra::DMatrix;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::batch::{BatchError, FrameId, Sample};
use crate::core::image::Image;
use crate::core::multires::resize_nearest;
use crate::misc::helper::{read_png_16bits, read_png_8bits};
use crate::misc::interop::{image_from_rgb, matrix_from_row_major};
use crate::misc::type_aliases::{real, Float, Mat4, Real};
use crate::train::config::Options;
use crate::train::error::TrainError;
use crate::train::evaluate::EvalItem;
use crate::train::session::TrainData;

/// Width of full resolution KITTI images.
pub const FULL_RES_WIDTH: usize = 1242;
/// Height of full resolution KITTI images.
pub const FULL_RES_HEIGHT: usize = 375;

/// U16 depth values are scaled for better precision.
/// So 256 in the 16 bits gray png corresponds to 1 meter.
pub const DEPTH_SCALE: Float = 256.0;

/// Half the stereo baseline, in units of the training scale.
pub const STEREO_BASELINE: f64 = 0.1;

/// Label ignored by the semantic classes.
pub const VOID_TRAIN_ID: i32 = 255;

/// Train id of each Cityscapes label id, used to merge the label ids
/// of segmentation maps into the classes they are trained on.
#[rustfmt::skip]
const TRAIN_IDS: [i32; 34] = [
    255, 255, 255, 255, 255, 255, 255,   0,   1, 255, // 0-9
    255,   2,   3,   4, 255, 255, 255,   5, 255,   6, // 10-19
      7,   8,   9,  10,  11,  12,  13,  14,  15, 255, // 20-29
    255,  16,  17,  18,                               // 30-33
];

/// Train id of a Cityscapes label id. Unknown ids are void.
pub fn train_id(label_id: u8) -> i32 {
    TRAIN_IDS
        .get(usize::from(label_id))
        .copied()
        .unwrap_or(VOID_TRAIN_ID)
}

/// Intrinsics shared by all KITTI cameras, normalized by the image size.
#[rustfmt::skip]
pub fn normalized_intrinsics<T: Real>() -> Mat4<T> {
    Mat4::new(
        real(0.58), T::zero(), real(0.5), T::zero(),
        T::zero(), real(1.92), real(0.5), T::zero(),
        T::zero(), T::zero(), T::one(), T::zero(),
        T::zero(), T::zero(), T::zero(), T::one(),
    )
}

/// Errors when reading a KITTI dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A split line could not be parsed.
    #[error("cannot parse split line {line}: {content:?}")]
    Parse {
        /// Line number, starting at 1.
        line: usize,
        /// Content of the line.
        content: String,
    },
    /// A neighbor frame would have a negative index.
    #[error("frame {frame} is out of range for index {index}")]
    FrameOutOfRange {
        /// Requested frame.
        frame: FrameId,
        /// Index of the reference frame.
        index: usize,
    },
    /// Stereo frame of an entry without camera side.
    #[error("no camera side for {0}")]
    MissingSide(String),
    /// Frames do not make a valid sample.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Png decoding failure.
    #[error("cannot decode {path}: {source}")]
    Png {
        /// Decoded file.
        path: PathBuf,
        /// Decoder error.
        source: png::DecodingError,
    },
    /// Image decoding failure.
    #[error("cannot read {path}: {source}")]
    Image {
        /// Decoded file.
        path: PathBuf,
        /// Decoder error.
        source: image::ImageError,
    },
}

/// Camera of a stereo pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// Left color camera, `image_02`.
    Left,
    /// Right color camera, `image_03`.
    Right,
}

impl Side {
    /// KITTI index of the camera.
    pub fn camera_index(self) -> u8 {
        match self {
            Side::Left => 2,
            Side::Right => 3,
        }
    }

    /// The other camera of the pair.
    pub fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Transform from the reference camera to the other one.
    pub fn stereo_transform<T: Real>(self) -> Mat4<T> {
        let sign = match self {
            Side::Left => -1.0,
            Side::Right => 1.0,
        };
        let mut t = Mat4::identity();
        t[(0, 3)] = real(sign * STEREO_BASELINE);
        t
    }
}

/// One line of a split file: `folder frame_index [side]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitEntry {
    /// Drive folder, relative to the data root.
    pub folder: String,
    /// Index of the reference frame in the drive.
    pub frame_index: usize,
    /// Camera side, absent in some splits.
    pub side: Option<Side>,
}

impl SplitEntry {
    /// Entry of a frame relative to this one.
    ///
    /// The stereo frame is the other camera at the same time.
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    pub fn neighbor(&self, frame: FrameId) -> Result<Self, DatasetError> {
        match frame {
            FrameId::Offset(offset) => {
                let index = self.frame_index as i64 + i64::from(offset);
                if index < 0 {
                    return Err(DatasetError::FrameOutOfRange {
                        frame,
                        index: self.frame_index,
                    });
                }
                Ok(Self {
                    frame_index: index as usize,
                    ..self.clone()
                })
            }
            FrameId::Stereo => Ok(Self {
                side: Some(self.side()?.other()),
                ..self.clone()
            }),
        }
    }

    fn side(&self) -> Result<Side, DatasetError> {
        self.side
            .ok_or_else(|| DatasetError::MissingSide(self.folder.clone()))
    }

    fn file_name(&self, extension: &str) -> String {
        format!("{:010}.{}", self.frame_index, extension)
    }

    fn camera_dir(&self) -> Result<String, DatasetError> {
        Ok(format!("image_0{}", self.side()?.camera_index()))
    }

    /// Path of the color image.
    pub fn color_path(&self, data_path: &Path, extension: &str) -> Result<PathBuf, DatasetError> {
        Ok(data_path
            .join(&self.folder)
            .join(self.camera_dir()?)
            .join("data")
            .join(self.file_name(extension)))
    }

    /// Path of the improved ground truth depth.
    pub fn depth_path(&self, data_path: &Path) -> Result<PathBuf, DatasetError> {
        Ok(data_path
            .join(&self.folder)
            .join("proj_depth")
            .join("groundtruth")
            .join(self.camera_dir()?)
            .join(self.file_name("png")))
    }

    /// Path of the semantic labels, relative to a segmentation root.
    pub fn segmentation_path(&self, segmentation_root: &Path) -> Result<PathBuf, DatasetError> {
        Ok(segmentation_root
            .join(&self.folder)
            .join(self.camera_dir()?)
            .join(self.file_name("png")))
    }
} // impl SplitEntry

/// Read a 16 bits depth png, in meters, 0 meaning no measure.
pub fn read_depth(path: &Path) -> Result<DMatrix<Float>, DatasetError> {
    let (width, height, buffer) = read_png_16bits(path).map_err(|source| DatasetError::Png {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = matrix_from_row_major(width, height, &buffer);
    Ok(raw.map(|d| Float::from(d) / DEPTH_SCALE))
}

/// Read a color image resized to `(height, width)`.
#[allow(clippy::cast_possible_truncation)]
pub fn read_color<T: Real>(
    path: &Path,
    height: usize,
    width: usize,
) -> Result<Image<T>, DatasetError> {
    let img = image::open(path)
        .map_err(|source| DatasetError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let resized = imageops::resize(&img, width as u32, height as u32, FilterType::Lanczos3);
    Ok(image_from_rgb(&resized))
}

/// Read an 8 bits label image resized to `(height, width)` by nearest neighbor.
///
/// Pixels of indexed pngs hold Cityscapes label ids (palette indices),
/// which are merged into their train ids.
pub fn read_segmentation(
    path: &Path,
    height: usize,
    width: usize,
) -> Result<DMatrix<i32>, DatasetError> {
    let (w, h, buffer) = read_png_8bits(path).map_err(|source| DatasetError::Png {
        path: path.to_path_buf(),
        source,
    })?;
    let labels = matrix_from_row_major(w, h, &buffer).map(train_id);
    Ok(resize_nearest(&labels, height, width))
}

/// Parse split files.
pub mod parse {
    use super::{DatasetError, Side, SplitEntry};
    use nom::{
        branch::alt,
        bytes::complete::is_not,
        character::complete::{char, digit1, space0, space1},
        combinator::{all_consuming, map, map_res, opt},
        sequence::{preceded, terminated},
        IResult,
    };

    /// Parse a split file, skipping blank lines.
    pub fn split(file_content: &str) -> Result<Vec<SplitEntry>, DatasetError> {
        let mut entries = Vec::new();
        for (number, line) in file_content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match all_consuming(terminated(entry, space0))(line) {
                Ok((_, entry)) => entries.push(entry),
                Err(_) => {
                    return Err(DatasetError::Parse {
                        line: number + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    // nom parsers ###################################################

    fn entry(input: &str) -> IResult<&str, SplitEntry> {
        let (input, folder) = is_not(" \t\r\n")(input)?;
        let (input, frame_index) = preceded(space1, map_res(digit1, str::parse))(input)?;
        let (input, side) = opt(preceded(space1, side))(input)?;
        let entry = SplitEntry {
            folder: folder.to_string(),
            frame_index,
            side,
        };
        Ok((input, entry))
    }

    fn side(input: &str) -> IResult<&str, Side> {
        alt((
            map(alt((char('l'), char('2'))), |_| Side::Left),
            map(alt((char('r'), char('3'))), |_| Side::Right),
        ))(input)
    }
} // pub mod parse

/// Training and evaluation samples read from a KITTI raw tree.
#[derive(Clone, Debug)]
pub struct KittiData {
    /// Root of the dataset.
    pub data_path: PathBuf,
    /// Root of the semantic labels, read only when needed.
    pub segmentation_root: Option<PathBuf>,
    /// Extension of color images.
    pub image_extension: String,
    /// Entries of the split.
    pub entries: Vec<SplitEntry>,
    /// Network input resolution.
    pub height: usize,
    /// Network input resolution.
    pub width: usize,
    /// Every frame of a sample, reference first.
    pub frame_ids: Vec<FrameId>,
    /// Number of pyramid levels of a sample.
    pub num_scales: usize,
    /// Samples per batch, the incomplete last batch is dropped.
    pub batch_size: usize,
    /// Seed of the per epoch shuffling.
    pub seed: u64,
    order: Option<(usize, Vec<usize>)>,
}

impl KittiData {
    /// Reader of the split entries for a training run.
    ///
    /// Segmentation labels are read from `<data_path>/segmentation`
    /// when the boundary triplet loss is enabled.
    pub fn new(options: &Options, entries: Vec<SplitEntry>) -> Self {
        let segmentation_root = if options.disable_triplet_loss {
            None
        } else {
            Some(options.data_path.join("segmentation"))
        };
        Self {
            data_path: options.data_path.clone(),
            segmentation_root,
            image_extension: "jpg".to_string(),
            entries,
            height: options.height,
            width: options.width,
            frame_ids: options.all_frame_ids(),
            num_scales: options.num_pyramid_levels(),
            batch_size: options.batch_size,
            seed: options.random_seed,
            order: None,
        }
    }

    /// Read every frame of an entry into a sample.
    ///
    /// Ground truth depth is attached when the file exists,
    /// resized to full resolution by nearest neighbor.
    pub fn load_sample<T: Real>(&self, entry: &SplitEntry) -> Result<Sample<T>, DatasetError> {
        let mut colors = BTreeMap::new();
        for &frame in &self.frame_ids {
            let path = entry
                .neighbor(frame)?
                .color_path(&self.data_path, &self.image_extension)?;
            colors.insert(frame, read_color(&path, self.height, self.width)?);
        }
        // No color augmentation, the network sees the plain colors.
        let mut sample = Sample::from_frames(
            colors.clone(),
            colors,
            &normalized_intrinsics(),
            self.num_scales,
        )?;
        if self.frame_ids.contains(&FrameId::Stereo) {
            sample.stereo_t = Some(entry.side()?.stereo_transform());
        }
        let depth_path = entry.depth_path(&self.data_path)?;
        if depth_path.is_file() {
            let depth = read_depth(&depth_path)?;
            sample.depth_gt = Some(resize_nearest(&depth, FULL_RES_HEIGHT, FULL_RES_WIDTH));
        }
        if let Some(root) = &self.segmentation_root {
            let path = entry.segmentation_path(root)?;
            sample.segmentation = Some(read_segmentation(&path, self.height, self.width)?);
        }
        Ok(sample)
    }

    /// Read evaluation items: reference color and ground truth depth.
    pub fn eval_items<T: Real>(
        &self,
        entries: &[SplitEntry],
    ) -> Result<Vec<EvalItem<T>>, DatasetError> {
        entries
            .iter()
            .map(|entry| {
                let color_path = entry.color_path(&self.data_path, &self.image_extension)?;
                let depth_path = entry.depth_path(&self.data_path)?;
                Ok(EvalItem {
                    color: read_color(&color_path, self.height, self.width)?,
                    depth_gt: if depth_path.is_file() {
                        Some(read_depth(&depth_path)?)
                    } else {
                        None
                    },
                })
            })
            .collect()
    }

    fn epoch_order(&mut self, epoch: usize) -> &[usize] {
        let stale = self.order.as_ref().map_or(true, |(e, _)| *e != epoch);
        if stale {
            let mut order: Vec<usize> = (0..self.entries.len()).collect();
            order.shuffle(&mut StdRng::seed_from_u64(self.seed + epoch as u64));
            self.order = Some((epoch, order));
        }
        match &self.order {
            Some((_, order)) => order.as_slice(),
            None => &[],
        }
    }
} // impl KittiData

impl<T: Real> TrainData<T> for KittiData {
    fn nb_batches(&self) -> usize {
        self.entries.len() / self.batch_size.max(1)
    }

    fn batch(&mut self, epoch: usize, index: usize) -> Result<Vec<Sample<T>>, TrainError> {
        let batch_size = self.batch_size;
        let indices: Vec<usize> = self
            .epoch_order(epoch)
            .iter()
            .skip(index * batch_size)
            .take(batch_size)
            .copied()
            .collect();
        let samples = indices
            .iter()
            .map(|&i| self.load_sample(&self.entries[i]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use image::{Rgb, RgbImage};
    use std::fs::{self, File};
    use std::io::BufWriter;

    fn write_depth(path: &Path, width: usize, height: usize, value: u16) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let writer = BufWriter::new(File::create(path).unwrap());
        let mut encoder = png::Encoder::new(writer, width as u32, height as u32);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Sixteen);
        let mut writer = encoder.write_header().unwrap();
        let bytes: Vec<u8> = (0..width * height)
            .flat_map(|i| (if i == 0 { 0 } else { value }).to_be_bytes())
            .collect();
        writer.write_image_data(&bytes).unwrap();
    }

    fn write_color(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(128, 64, Rgb([shade, shade, shade]))
            .save(path)
            .unwrap();
    }

    fn entry(index: usize, side: Side) -> SplitEntry {
        SplitEntry {
            folder: "2011_09_26/2011_09_26_drive_0001_sync".to_string(),
            frame_index: index,
            side: Some(side),
        }
    }

    #[test]
    fn split_lines() {
        let content = "2011_09_26/2011_09_26_drive_0022_sync 473 r\n\
                       \n\
                       2011_09_29/2011_09_29_drive_0026_sync 1 l  \n\
                       odometry/09 12\n";
        let entries = parse::split(content).unwrap();
        assert_eq!(3, entries.len());
        assert_eq!("2011_09_26/2011_09_26_drive_0022_sync", entries[0].folder);
        assert_eq!(473, entries[0].frame_index);
        assert_eq!(Some(Side::Right), entries[0].side);
        assert_eq!(Some(Side::Left), entries[1].side);
        assert_eq!(None, entries[2].side);
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let content = "drive 12 l\ndrive twelve l\n";
        match parse::split(content) {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(2, line),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn neighbors_and_paths() {
        let e = entry(5, Side::Left);
        assert_eq!(4, e.neighbor(FrameId::Offset(-1)).unwrap().frame_index);
        assert_eq!(Some(Side::Right), e.neighbor(FrameId::Stereo).unwrap().side);
        assert!(matches!(
            entry(0, Side::Left).neighbor(FrameId::Offset(-1)),
            Err(DatasetError::FrameOutOfRange { .. })
        ));
        let root = Path::new("/kitti");
        assert_eq!(
            root.join("2011_09_26/2011_09_26_drive_0001_sync/image_02/data/0000000005.jpg"),
            e.color_path(root, "jpg").unwrap()
        );
        assert_eq!(
            root.join("2011_09_26/2011_09_26_drive_0001_sync")
                .join("proj_depth/groundtruth/image_02/0000000005.png"),
            e.depth_path(root).unwrap()
        );
    }

    #[test]
    fn stereo_transform_signs() {
        let left: Mat4<f64> = Side::Left.stereo_transform();
        let right: Mat4<f64> = Side::Right.stereo_transform();
        assert_eq!(-0.1, left[(0, 3)]);
        assert_eq!(0.1, right[(0, 3)]);
    }

    #[test]
    fn depth_png_is_in_meters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.png");
        write_depth(&path, 4, 3, 5120);
        let depth = read_depth(&path).unwrap();
        assert_eq!((3, 4), depth.shape());
        assert_eq!(0.0, depth[(0, 0)]);
        assert_eq!(20.0, depth[(2, 3)]);
    }

    #[test]
    fn label_ids_become_train_ids() {
        assert_eq!(0, train_id(7));
        assert_eq!(13, train_id(26));
        assert_eq!(18, train_id(33));
        assert_eq!(VOID_TRAIN_ID, train_id(0));
        assert_eq!(VOID_TRAIN_ID, train_id(34));
        assert_eq!(VOID_TRAIN_ID, train_id(255));
    }

    #[test]
    fn indexed_labels_are_merged_into_classes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.png");
        let writer = BufWriter::new(File::create(&path).unwrap());
        let mut encoder = png::Encoder::new(writer, 4, 2);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(vec![255_u8; 3 * 34]);
        let mut writer = encoder.write_header().unwrap();
        // Ids 1 (ego vehicle) and 6 (ground) are both void.
        writer
            .write_image_data(&[1, 6, 26, 26, 1, 7, 26, 19])
            .unwrap();
        drop(writer);
        let seg = read_segmentation(&path, 4, 8).unwrap();
        assert_eq!((4, 8), seg.shape());
        assert_eq!(VOID_TRAIN_ID, seg[(0, 0)]);
        assert_eq!(VOID_TRAIN_ID, seg[(0, 3)]);
        assert_eq!(13, seg[(0, 7)]);
        assert_eq!(0, seg[(3, 2)]);
        assert_eq!(6, seg[(3, 7)]);
        // The two void ids form one class, so no boundary between them.
        assert_eq!(seg[(0, 1)], seg[(0, 2)]);
    }

    #[test]
    fn batches_of_a_drive() {
        let dir = tempfile::tempdir().unwrap();
        for index in 0..5 {
            let e = entry(index, Side::Left);
            write_color(&e.color_path(dir.path(), "png").unwrap(), 20 * index as u8);
        }
        write_depth(&entry(2, Side::Left).depth_path(dir.path()).unwrap(), 8, 4, 2560);
        let options = Options {
            data_path: dir.path().to_path_buf(),
            height: 32,
            width: 64,
            batch_size: 2,
            disable_triplet_loss: true,
            ..Options::default()
        };
        let entries = vec![entry(1, Side::Left), entry(2, Side::Left), entry(3, Side::Left)];
        let mut data = KittiData::new(&options, entries);
        data.image_extension = "png".to_string();

        let sample: Sample<f64> = data.load_sample(&entry(2, Side::Left)).unwrap();
        sample.check(&options.all_frame_ids(), 3).unwrap();
        let reference = sample.color(FrameId::REFERENCE, 0).unwrap();
        assert_eq!((32, 64), reference.shape());
        assert!((reference.channels[0][(10, 10)] - 40.0 / 255.0).abs() < 1e-6);
        let gt = sample.depth_gt.as_ref().unwrap();
        assert_eq!((FULL_RES_HEIGHT, FULL_RES_WIDTH), gt.shape());
        assert_eq!(10.0, gt[(300, 1000)]);

        assert_eq!(1, TrainData::<f64>::nb_batches(&data));
        let batch: Vec<Sample<f64>> = data.batch(0, 0).unwrap();
        assert_eq!(2, batch.len());
    }
}

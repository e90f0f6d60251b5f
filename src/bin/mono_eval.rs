// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use log::{error, info};
use std::{env, error::Error, fs, path::PathBuf};

use mono_depth_rs::core::metrics::{
    evaluate_disparity, ratio_stats, DepthErrors, EvalSettings, MetricsError,
};
use mono_depth_rs::dataset::kitti::{self, parse};
use mono_depth_rs::misc::helper::read_png_16bits;
use mono_depth_rs::misc::interop::matrix_from_row_major;
use mono_depth_rs::misc::type_aliases::Float;
use mono_depth_rs::train::error::TrainError;

/// Predicted disparities are stored in 16 bits pngs multiplied by this factor.
const DISPARITY_SCALE: Float = 6000.0;

/// Models trained on stereo pairs predict depth at this scale of the metric one.
const STEREO_SCALE_FACTOR: Float = 5.4;

const USAGE: &str = "Usage: ./mono_eval data_path split_file.txt predictions_dir [mono|stereo]

Predictions are 16 bits pngs named after the split line number (000000.png, ...)
holding disparities multiplied by 6000.";

fn main() {
    pretty_env_logger::init();
    let args: Vec<String> = env::args().collect();
    if let Err(error) = my_run(&args) {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

fn my_run(args: &[String]) -> Result<(), Box<dyn Error>> {
    // Check that the arguments are correct.
    let valid_args = check_args(args)?;

    let (errors, ratios) = evaluate_split(&valid_args)?;
    if let Some((med, std)) = ratios {
        println!("Scaling ratios | med: {:.3} | std: {:.3}", med, std);
    }
    let names: Vec<&str> = DepthErrors::NAMES
        .iter()
        .map(|name| name.rsplit('/').next().unwrap_or(*name))
        .collect();
    println!("{}", names.join(" | "));
    let values: Vec<String> = errors.values().iter().map(|v| format!("{:.3}", v)).collect();
    println!("{}", values.join(" | "));
    Ok(())
}

/// Mean errors over every image of the split, and the scaling ratios statistics.
///
/// Every image of the split must have a ground truth depth.
fn evaluate_split(args: &Args) -> Result<(DepthErrors, Option<(Float, Float)>), Box<dyn Error>> {
    let entries = parse::split(&fs::read_to_string(&args.split_path)?)?;
    info!("evaluating {} images", entries.len());

    let mut errors = Vec::with_capacity(entries.len());
    let mut ratios = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let gt_path = entry.depth_path(&args.data_path)?;
        if !gt_path.is_file() {
            error!("no ground truth {}", gt_path.display());
            return Err(TrainError::MissingGroundTruth(index).into());
        }
        let gt = kitti::read_depth(&gt_path)?;
        let pred_path = args.predictions_dir.join(format!("{:06}.png", index));
        let (width, height, buffer) = read_png_16bits(&pred_path)?;
        let pred_disp =
            matrix_from_row_major(width, height, &buffer).map(|d| Float::from(d) / DISPARITY_SCALE);
        let (image_errors, ratio) = match evaluate_disparity(&gt, &pred_disp, &args.settings) {
            Err(MetricsError::NoGroundTruth) => {
                return Err(TrainError::MissingGroundTruth(index).into())
            }
            other => other?,
        };
        errors.push(image_errors);
        ratios.extend(ratio);
    }
    Ok((DepthErrors::mean(&errors)?, ratio_stats(&ratios)))
}

struct Args {
    data_path: PathBuf,
    split_path: PathBuf,
    predictions_dir: PathBuf,
    settings: EvalSettings,
}

/// Verify that command line arguments are correct.
fn check_args(args: &[String]) -> Result<Args, String> {
    let (data, split, predictions, mode) = match args {
        [_, data, split, predictions] => (data, split, predictions, "mono"),
        [_, data, split, predictions, mode] => (data, split, predictions, mode.as_str()),
        _ => {
            eprintln!("{}", USAGE);
            return Err("Wrong number of arguments".to_string());
        }
    };
    let settings = match mode {
        "mono" => EvalSettings {
            eigen_crop: true,
            median_scaling: true,
            pred_depth_scale_factor: 1.0,
        },
        "stereo" => EvalSettings {
            eigen_crop: true,
            median_scaling: false,
            pred_depth_scale_factor: STEREO_SCALE_FACTOR,
        },
        other => {
            eprintln!("{}", USAGE);
            return Err(format!("Unknown mode: {}", other));
        }
    };
    let args = Args {
        data_path: PathBuf::from(data),
        split_path: PathBuf::from(split),
        predictions_dir: PathBuf::from(predictions),
        settings,
    };
    if !args.split_path.is_file() {
        eprintln!("{}", USAGE);
        return Err(format!("The split file does not exist: {}", split));
    }
    if !args.predictions_dir.is_dir() {
        eprintln!("{}", USAGE);
        return Err(format!("The predictions directory does not exist: {}", predictions));
    }
    Ok(args)
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use mono_depth_rs::dataset::kitti::{Side, SplitEntry};
    use std::{fs::File, io::BufWriter, path::Path};

    const FOLDER: &str = "2011_09_26/2011_09_26_drive_0001_sync";

    fn write_png_16bits(path: &Path, width: usize, height: usize, value: u16) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let writer = BufWriter::new(File::create(path).unwrap());
        let mut encoder = png::Encoder::new(writer, width as u32, height as u32);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Sixteen);
        let mut writer = encoder.write_header().unwrap();
        let bytes: Vec<u8> = (0..width * height).flat_map(|_| value.to_be_bytes()).collect();
        writer.write_image_data(&bytes).unwrap();
    }

    /// A split of `nb_frames` frames, with ground truth for the first `nb_gt`.
    fn setup(dir: &Path, nb_frames: usize, nb_gt: usize) -> Args {
        let data_path = dir.join("data");
        let predictions_dir = dir.join("predictions");
        let mut split = String::new();
        for index in 0..nb_frames {
            split.push_str(&format!("{} {} l\n", FOLDER, index));
            let entry = SplitEntry {
                folder: FOLDER.to_string(),
                frame_index: index,
                side: Some(Side::Left),
            };
            if index < nb_gt {
                // 10 meters everywhere.
                write_png_16bits(&entry.depth_path(&data_path).unwrap(), 64, 32, 2560);
            }
            // Disparity 0.5 everywhere.
            let pred_path = predictions_dir.join(format!("{:06}.png", index));
            write_png_16bits(&pred_path, 32, 16, 3000);
        }
        let split_path = dir.join("split.txt");
        fs::write(&split_path, split).unwrap();
        Args {
            data_path,
            split_path,
            predictions_dir,
            settings: EvalSettings {
                eigen_crop: false,
                median_scaling: true,
                pred_depth_scale_factor: 1.0,
            },
        }
    }

    #[test]
    fn complete_split_is_evaluated() {
        let dir = tempfile::tempdir().unwrap();
        let args = setup(dir.path(), 2, 2);
        let (errors, ratios) = evaluate_split(&args).unwrap();
        assert!(errors.abs_rel < 1e-5);
        assert_eq!(1.0, errors.a1);
        let (med, std) = ratios.unwrap();
        assert!((med - 5.0).abs() < 1e-4);
        assert!(std < 1e-5);
    }

    #[test]
    fn missing_ground_truth_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let args = setup(dir.path(), 3, 2);
        let error = evaluate_split(&args).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TrainError>(),
            Some(TrainError::MissingGroundTruth(2))
        ));
    }
}

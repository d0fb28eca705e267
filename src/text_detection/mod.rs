pub mod loss;
pub mod metrics;
pub mod options;
pub mod postprocess;

use crate::config::TrainConfig;
use crate::dataset::{visualize_example, Mode, StdDataLoader, StdDataModule, StdDataset};
use crate::detector::{DetectParams, DetectedText, TextDetector, TextDetectorOptions};
use crate::image_ops;
use crate::model_store::{
    check_model_name, checkpoint_file_name, parse_epoch, resolve_model_file, store_root,
};
use crate::polygon::area;
use crate::transforms::train_transforms;
use crate::utils::device_for_gpus;
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use imageproc::point::Point;
use log::{debug, info, warn};
use loss::DbLoss;
use metrics::{gather_measure, validate_measure, Metrics};
use options::{EvalOptions, TrainOptions, VisualizeOptions};
use postprocess::{binarize, boxes_from_bitmap, PostProcessParams};
use std::fs;
use std::path::{Path, PathBuf};
use tch::nn::{self, OptimizerConfig};

/// Detections scored below this value are left out of validation metrics.
const VALIDATION_BOX_THRESH: f64 = 0.6;
const RESULT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

pub fn train_model(opts: &TrainOptions) -> Result<()> {
    check_model_name(opts.model_name)?;
    let config = TrainConfig::from_file(opts.train_config_fp)?;
    let data_mod = StdDataModule::from_config(opts.index_dir, &config)?;
    if data_mod.train.is_empty() {
        return Err(anyhow!("no training samples listed in {}", opts.index_dir));
    }
    if config.debug {
        visualize_example(&data_mod.train.get(0)?, config.ckpt_dir.join("debug"))?;
    }
    if config.pin_memory {
        debug!("pin_memory is set, batches are moved to the device as they are consumed");
    }

    let device = device_for_gpus(config.gpus);
    let (model_fp, start_epoch) = match (opts.resume_from_checkpoint, opts.pretrained_model_fp) {
        (Some(ckpt), _) => {
            let start_epoch = parse_epoch(ckpt).map_or(0, |epoch| epoch + 1);
            info!("resuming from {} at epoch {}", ckpt, start_epoch);
            (PathBuf::from(ckpt), start_epoch)
        }
        (None, Some(pretrained)) => (PathBuf::from(pretrained), 0),
        (None, None) => (
            resolve_model_file(
                opts.model_name,
                None,
                None,
                &store_root(opts.model_root_dir.as_deref())?,
            )?,
            0,
        ),
    };
    if !model_fp.is_file() {
        return Err(anyhow!("File {} doesn't exist", model_fp.display()));
    }

    let vs = nn::VarStore::new(device);
    let mut net = measure_time!(
        "load scripted model",
        || tch::TrainableCModule::load(&model_fp, vs.root()),
        log::Level::Info
    )?;
    let mut opt = nn::Sgd {
        momentum: config.momentum,
        dampening: config.dampening,
        wd: config.weight_decay,
        nesterov: config.nesterov,
    }
    .build(&vs, config.learning_rate)?;
    let loss_fn = DbLoss::default();
    fs::create_dir_all(&config.ckpt_dir)?;

    if start_epoch >= config.epochs {
        warn!(
            "checkpoint epoch {} already reaches the configured {} epochs",
            start_epoch, config.epochs
        );
    }
    for epoch in start_epoch..config.epochs {
        net.set_train();
        let mut loader = data_mod.train_dataloader();
        loader.to_device(device);
        let (mut epoch_loss, mut batches) = (0., 0);
        for (i, batch) in loader.enumerate() {
            let batch = batch?;
            let targets = batch
                .targets
                .as_ref()
                .ok_or_else(|| anyhow!("training batch {} has no targets", i))?;
            let pred = net.forward_ts(&[&batch.images])?;
            let loss = loss_fn.compute(&pred, targets)?;
            opt.backward_step(&loss.total);
            let value = loss.total.double_value(&[]);
            debug!("epoch {} batch {}: loss {:.5}", epoch, i, value);
            epoch_loss += value;
            batches += 1;
        }
        info!(
            "epoch: {:4} train loss: {:.5}",
            epoch,
            epoch_loss / batches.max(1) as f64
        );

        let ckpt_fp = config
            .ckpt_dir
            .join(checkpoint_file_name(opts.model_name, epoch));
        measure_time!("save checkpoint", || net.save(&ckpt_fp))?;
        debug!("saved {}", ckpt_fp.display());

        if (epoch + 1) % config.val_interval == 0 || epoch + 1 == config.epochs {
            net.set_eval();
            let mut loader = data_mod.val_dataloader();
            loader.to_device(device);
            let (val_loss, metrics) = measure_time!(
                "validation",
                || validate(&net, loader, &loss_fn, config.rotated_bbox),
                log::Level::Info
            )?;
            info!(
                "epoch: {:4} val loss: {:.5} precision: {:5.2}% recall: {:5.2}% hmean: {:5.2}%",
                epoch,
                val_loss,
                100. * metrics.precision,
                100. * metrics.recall,
                100. * metrics.hmean
            );
        }
    }

    Ok(())
}

fn validate(
    net: &tch::TrainableCModule,
    loader: StdDataLoader,
    loss_fn: &DbLoss,
    rotated_bbox: bool,
) -> Result<(f64, Metrics)> {
    tch::no_grad(|| {
        let params = PostProcessParams::default();
        let (mut total_loss, mut batches) = (0., 0);
        let mut raw_metrics = Vec::new();
        for batch in loader {
            let batch = batch?;
            let targets = batch
                .targets
                .as_ref()
                .ok_or_else(|| anyhow!("validation batch has no targets"))?;
            let pred = net.forward_ts(&[&batch.images])?;
            total_loss += loss_fn.compute(&pred, targets)?.total.double_value(&[]);
            batches += 1;

            let prob = pred.select(1, 0);
            let mut polygons = Vec::with_capacity(batch.len());
            let mut scores = Vec::with_capacity(batch.len());
            for i in 0..batch.len() {
                let prob_map = image_ops::convert_tensor_to_map(&prob.get(i as i64))?;
                let size = prob_map.dimensions();
                let bitmap = binarize(&prob_map, params.binary_thresh);
                let boxes = boxes_from_bitmap(&prob_map, &bitmap, &params, size, size);
                let (polys, box_scores): (Vec<Vec<Point<f64>>>, Vec<f64>) = boxes
                    .into_iter()
                    .map(|b| if rotated_bbox { b } else { b.axis_aligned() })
                    .map(|b| (b.points.to_vec(), b.score))
                    .unzip();
                polygons.push(polys);
                scores.push(box_scores);
            }
            raw_metrics.push(validate_measure(
                &targets.polygons,
                &targets.ignore_tags,
                &polygons,
                &scores,
                VALIDATION_BOX_THRESH,
            ));
        }
        Ok((total_loss / batches.max(1) as f64, gather_measure(&raw_metrics)))
    })
}

/// `x1,y1,x2,y2,x3,y3,x4,y4,score`
pub fn format_detection(text: &DetectedText) -> String {
    let mut values = text
        .text_box
        .iter()
        .flat_map(|p| [format!("{}", p.x), format!("{}", p.y)])
        .collect::<Vec<String>>();
    values.push(format!("{:.4}", text.score));
    values.join(",")
}

/// Draws the outline of every detected box.
pub fn draw_detections(image: &mut RgbImage, texts: &[DetectedText]) {
    for text in texts {
        for i in 0..4 {
            let (a, b) = (text.text_box[i], text.text_box[(i + 1) % 4]);
            draw_line_segment_mut(
                image,
                (a.x as f32, a.y as f32),
                (b.x as f32, b.y as f32),
                RESULT_COLOR,
            );
        }
    }
}

fn save_detections(
    img_fp: &Path,
    image: &RgbImage,
    texts: &[DetectedText],
    output_dir: &Path,
) -> Result<()> {
    let stem = img_fp
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("invalid image file name {}", img_fp.display()))?;
    let lines = texts.iter().map(format_detection).collect::<Vec<String>>();
    fs::write(output_dir.join(format!("{}.txt", stem)), lines.join("\n"))?;

    let mut result = image.clone();
    draw_detections(&mut result, texts);
    result.save(output_dir.join(format!("{}-result.png", stem)))?;
    Ok(())
}

/// Runs detection on a single image or every image of a directory, writing
/// the boxes and an annotated copy of each image into the output directory.
pub fn evaluate(opts: &EvalOptions) -> Result<()> {
    let detector = TextDetector::new(TextDetectorOptions {
        model_name: opts.backbone.to_string(),
        model_epoch: opts.model_epoch,
        model_fp: None,
        root: opts.model_root_dir.clone(),
        device: device_for_gpus(opts.gpu),
        rotated_bbox: true,
    })?;
    let side = (opts.max_size / 32).max(1) * 32;
    if side != opts.max_size {
        warn!("max size {} rounded down to {}", opts.max_size, side);
    }
    let params = DetectParams {
        resized_shape: (side, side),
        binary_thresh: opts.pse_threshold,
        ..DetectParams::default()
    };

    let output_dir = Path::new(opts.output_dir);
    fs::create_dir_all(output_dir)?;
    let img_paths = image_ops::collect_image_paths(opts.img_dir)?;
    if img_paths.is_empty() {
        warn!("no images found in {}", opts.img_dir);
    }
    for img_fp in &img_paths {
        let image = image_ops::read_image(img_fp)?;
        let texts = detector
            .detect_one(image.clone(), &params)?
            .into_iter()
            .filter(|text| area(&text.text_box) >= opts.pse_min_area)
            .collect::<Vec<DetectedText>>();
        info!("{}: {} text boxes", img_fp.display(), texts.len());
        save_detections(img_fp, &image, &texts, output_dir)?;
    }
    Ok(())
}

/// Saves the debug images of one training sample.
pub fn visualize(opts: &VisualizeOptions) -> Result<()> {
    let config = TrainConfig::from_file(opts.train_config_fp)?;
    let (height, width) = config.image_dimensions();
    let dataset = StdDataset::new(
        Path::new(opts.index_dir).join("train.tsv"),
        train_transforms(height, width),
        config.data_root_dir.as_deref(),
        Mode::Train,
    )?;
    let sample = dataset.get(opts.index)?;
    visualize_example(&sample, opts.output_dir)
}

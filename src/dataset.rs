use crate::annotation::{load_annotation, read_idx_file, TextLine};
use crate::config::TrainConfig;
use crate::image_ops::{self, FloatMap};
use crate::transforms::{process_data, train_transforms, val_transforms};
use crate::transforms::{Compose, ImageTransform, ProcessData};
use anyhow::{anyhow, Context, Result};
use imageproc::point::Point;
use log::{debug, info};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use tch::{Device, Tensor};

const TRAIN_INDEX_FILE: &str = "train.tsv";
const VAL_INDEX_FILE: &str = "dev.tsv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

/// Supervision targets of a single sample, all of the resized image's size.
#[derive(Debug, Clone)]
pub struct SampleTargets {
    pub gt: FloatMap,
    pub mask: FloatMap,
    pub thresh_map: FloatMap,
    pub thresh_mask: FloatMap,
    pub polygons: Vec<Vec<Point<f64>>>,
    pub ignore_tags: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct DetectionSample {
    /// Normalized CHW image values.
    pub image: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// `(height, width)` of the image before transforms.
    pub shape: (u32, u32),
    pub targets: Option<SampleTargets>,
}

pub struct StdDataset {
    img_paths: Vec<PathBuf>,
    targets: Vec<Vec<TextLine>>,
    transforms: Compose,
    mode: Mode,
}

impl StdDataset {
    pub fn new<P: AsRef<Path>>(
        index_fp: P,
        transforms: Compose,
        data_root_dir: Option<&Path>,
        mode: Mode,
    ) -> Result<Self> {
        let join = |p: PathBuf| match data_root_dir {
            Some(root) => root.join(p),
            None => p,
        };
        let (img_paths, gt_paths): (Vec<PathBuf>, Vec<PathBuf>) = read_idx_file(&index_fp)?
            .into_iter()
            .map(|(img_fp, gt_fp)| (join(img_fp), join(gt_fp)))
            .unzip();

        let targets = if mode == Mode::Test {
            Vec::new()
        } else {
            let targets = measure_time!("load annotations", || gt_paths
                .iter()
                .map(load_annotation)
                .collect::<Result<Vec<Vec<TextLine>>>>())?;
            if targets.len() != img_paths.len() {
                return Err(anyhow!(
                    "{} images but {} annotation files",
                    img_paths.len(),
                    targets.len()
                ));
            }
            targets
        };
        info!(
            "loaded {} samples from {}",
            img_paths.len(),
            index_fp.as_ref().display()
        );

        Ok(Self {
            img_paths,
            targets,
            transforms,
            mode,
        })
    }

    pub fn len(&self) -> usize {
        self.img_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.img_paths.is_empty()
    }

    /// Reads, transforms and rasterizes the sample at `index`. The stored
    /// polygons are scaled on a copy, so every access starts from the
    /// annotation coordinates.
    pub fn get(&self, index: usize) -> Result<DetectionSample> {
        let img_fp = self
            .img_paths
            .get(index)
            .ok_or_else(|| anyhow!("index {} out of range ({} samples)", index, self.len()))?;
        let image = image_ops::read_image(img_fp)?;
        let (w, h) = image.dimensions();
        let image = self.transforms.apply(image);
        let (new_w, new_h) = image.dimensions();

        if self.mode == Mode::Test {
            return Ok(DetectionSample {
                image: image_ops::normalize_image(&image),
                width: new_w,
                height: new_h,
                shape: (h, w),
                targets: None,
            });
        }

        let scale_x = new_w as f64 / w as f64;
        let scale_y = new_h as f64 / h as f64;
        let lines = &self.targets[index];
        let polygons = lines
            .iter()
            .map(|line| {
                line.poly
                    .iter()
                    .map(|p| Point::new(p.x * scale_x, p.y * scale_y))
                    .collect()
            })
            .collect();
        let ignore_tags = lines.iter().map(TextLine::is_ignored).collect();

        let data = process_data(ProcessData::new(image, polygons, ignore_tags))
            .with_context(|| format!("rasterizing {}", img_fp.display()))?;
        let missing = || anyhow!("label generation left a map empty for {}", img_fp.display());
        let targets = SampleTargets {
            gt: data.gt.ok_or_else(missing)?,
            mask: data.mask.ok_or_else(missing)?,
            thresh_map: data.thresh_map.ok_or_else(missing)?,
            thresh_mask: data.thresh_mask.ok_or_else(missing)?,
            polygons: data.polygons,
            ignore_tags: data.ignore_tags,
        };

        Ok(DetectionSample {
            image: image_ops::normalize_image(&data.image),
            width: new_w,
            height: new_h,
            shape: (h, w),
            targets: Some(targets),
        })
    }
}

/// Writes the image and its rasterized targets as debug images.
pub fn visualize_example<P: AsRef<Path>>(sample: &DetectionSample, output_dir: P) -> Result<()> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)?;
    image_ops::denormalize_image(&sample.image, sample.width, sample.height)?
        .save(output_dir.join("debug-image.jpg"))?;
    if let Some(targets) = &sample.targets {
        image_ops::save_map(&targets.gt, output_dir.join("debug-gt.jpg"))?;
        image_ops::save_map(&targets.mask, output_dir.join("debug-mask.jpg"))?;
        image_ops::save_map(&targets.thresh_map, output_dir.join("debug-thresh-map.jpg"))?;
        image_ops::save_map(&targets.thresh_mask, output_dir.join("debug-thresh-mask.jpg"))?;
    }
    info!("saved debug images into {}", output_dir.display());
    Ok(())
}

#[derive(Debug)]
pub struct BatchTargets {
    /// `(N, 1, H, W)`
    pub gt: Tensor,
    /// `(N, H, W)`
    pub mask: Tensor,
    /// `(N, H, W)`
    pub thresh_map: Tensor,
    /// `(N, H, W)`
    pub thresh_mask: Tensor,
    pub polygons: Vec<Vec<Vec<Point<f64>>>>,
    pub ignore_tags: Vec<Vec<bool>>,
}

#[derive(Debug)]
pub struct Batch {
    /// `(N, 3, H, W)`
    pub images: Tensor,
    /// Original `(height, width)` of every image.
    pub shapes: Vec<(u32, u32)>,
    pub targets: Option<BatchTargets>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn to_device(self, device: Device) -> Batch {
        Batch {
            images: self.images.to_device(device),
            shapes: self.shapes,
            targets: self.targets.map(|t| BatchTargets {
                gt: t.gt.to_device(device),
                mask: t.mask.to_device(device),
                thresh_map: t.thresh_map.to_device(device),
                thresh_mask: t.thresh_mask.to_device(device),
                polygons: t.polygons,
                ignore_tags: t.ignore_tags,
            }),
        }
    }
}

fn stack_maps(targets: &[SampleTargets], map: impl Fn(&SampleTargets) -> &FloatMap) -> Tensor {
    Tensor::stack(
        &targets
            .iter()
            .map(|t| image_ops::convert_map_to_tensor(map(t)))
            .collect::<Vec<Tensor>>(),
        0,
    )
}

/// Stacks samples of equal size into a batch.
pub fn collate(samples: Vec<DetectionSample>) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| anyhow!("cannot collate an empty batch"))?;
    let (w, h) = (first.width, first.height);
    if samples.iter().any(|s| s.width != w || s.height != h) {
        return Err(anyhow!("all samples of a batch must share the same size"));
    }
    let with_targets = samples.iter().filter(|s| s.targets.is_some()).count();
    if with_targets != 0 && with_targets != samples.len() {
        return Err(anyhow!("cannot mix samples with and without targets"));
    }

    let images = Tensor::stack(
        &samples
            .iter()
            .map(|s| image_ops::convert_image_to_tensor(&s.image, s.width, s.height))
            .collect::<Vec<Tensor>>(),
        0,
    );
    let shapes = samples.iter().map(|s| s.shape).collect();
    let targets = if with_targets == 0 {
        None
    } else {
        let targets = samples
            .into_iter()
            .filter_map(|s| s.targets)
            .collect::<Vec<SampleTargets>>();
        Some(BatchTargets {
            gt: stack_maps(&targets, |t| &t.gt).unsqueeze(1),
            mask: stack_maps(&targets, |t| &t.mask),
            thresh_map: stack_maps(&targets, |t| &t.thresh_map),
            thresh_mask: stack_maps(&targets, |t| &t.thresh_mask),
            polygons: targets.iter().map(|t| t.polygons.clone()).collect(),
            ignore_tags: targets.iter().map(|t| t.ignore_tags.clone()).collect(),
        })
    };

    Ok(Batch {
        images,
        shapes,
        targets,
    })
}

/// Iterates over a dataset in batches. Batches are assembled on the worker
/// pool, and the next batch is requested as soon as the current one is handed
/// out.
pub struct StdDataLoader {
    dataset: Arc<StdDataset>,
    pool: Arc<ThreadPool>,
    indices: Vec<usize>,
    batch_index: usize,
    batch_size: usize,
    device: Device,
    return_smaller_last_batch: bool,
    pending: Option<Receiver<Result<Vec<DetectionSample>>>>,
}

impl StdDataLoader {
    pub fn new(dataset: Arc<StdDataset>, pool: Arc<ThreadPool>, batch_size: usize) -> Self {
        let indices = (0..dataset.len()).collect();
        Self {
            dataset,
            pool,
            indices,
            batch_index: 0,
            batch_size: batch_size.max(1),
            device: Device::Cpu,
            return_smaller_last_batch: false,
            pending: None,
        }
    }

    /// Shuffles the dataset.
    ///
    /// The iterator would still run over the whole dataset but the order in
    /// which elements are grouped in mini-batches is randomized.
    pub fn shuffle(&mut self) -> &mut StdDataLoader {
        self.indices.shuffle(&mut rand::thread_rng());
        self.pending = None;
        self
    }

    /// Transfers the mini-batches to a specified device.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_device(&mut self, device: Device) -> &mut StdDataLoader {
        self.device = device;
        self
    }

    /// When set, returns the last batch even if smaller than the batch size.
    pub fn return_smaller_last_batch(&mut self) -> &mut StdDataLoader {
        self.return_smaller_last_batch = true;
        self.pending = None;
        self
    }

    fn batch_indices(&self, batch_index: usize) -> Option<Vec<usize>> {
        let start = batch_index * self.batch_size;
        let size = self.batch_size.min(self.indices.len().saturating_sub(start));
        if size == 0 || (!self.return_smaller_last_batch && size < self.batch_size) {
            return None;
        }
        Some(self.indices[start..start + size].to_vec())
    }

    fn request(&self, batch_index: usize) -> Option<Receiver<Result<Vec<DetectionSample>>>> {
        let indices = self.batch_indices(batch_index)?;
        let dataset = Arc::clone(&self.dataset);
        let (tx, rx) = channel();
        self.pool.spawn(move || {
            let samples = measure_time!(format!("assemble batch {}", batch_index), || indices
                .par_iter()
                .map(|&i| dataset.get(i))
                .collect::<Result<Vec<DetectionSample>>>());
            // the receiver is gone when the loader was dropped mid-epoch
            let _ = tx.send(samples);
        });
        Some(rx)
    }
}

impl Iterator for StdDataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = match self.pending.take() {
            Some(rx) => rx,
            None => self.request(self.batch_index)?,
        };
        self.batch_index += 1;
        self.pending = self.request(self.batch_index);

        let samples = match current.recv() {
            Ok(samples) => samples,
            Err(_) => return Some(Err(anyhow!("data loader worker stopped unexpectedly"))),
        };
        Some(
            samples
                .and_then(collate)
                .map(|batch| batch.to_device(self.device)),
        )
    }
}

/// Training and validation splits read from `train.tsv` and `dev.tsv` of an
/// index directory.
pub struct StdDataModule {
    pub train: Arc<StdDataset>,
    pub val: Arc<StdDataset>,
    batch_size: usize,
    pool: Arc<ThreadPool>,
}

impl StdDataModule {
    pub fn new<P: AsRef<Path>>(
        index_dir: P,
        data_root_dir: Option<&Path>,
        train_transforms: Compose,
        val_transforms: Compose,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        let index_dir = index_dir.as_ref();
        let train = StdDataset::new(
            index_dir.join(TRAIN_INDEX_FILE),
            train_transforms,
            data_root_dir,
            Mode::Train,
        )?;
        let val = StdDataset::new(
            index_dir.join(VAL_INDEX_FILE),
            val_transforms,
            data_root_dir,
            Mode::Train,
        )?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("data-loader-{}", i))
            .build()?;
        debug!(
            "data module ready: {} train / {} val samples, {} workers",
            train.len(),
            val.len(),
            num_workers.max(1)
        );

        Ok(Self {
            train: Arc::new(train),
            val: Arc::new(val),
            batch_size,
            pool: Arc::new(pool),
        })
    }

    pub fn from_config<P: AsRef<Path>>(index_dir: P, config: &TrainConfig) -> Result<Self> {
        let (height, width) = config.image_dimensions();
        Self::new(
            index_dir,
            config.data_root_dir.as_deref(),
            train_transforms(height, width),
            val_transforms(height, width),
            config.batch_size,
            config.num_workers,
        )
    }

    pub fn train_dataloader(&self) -> StdDataLoader {
        let mut loader = StdDataLoader::new(
            Arc::clone(&self.train),
            Arc::clone(&self.pool),
            self.batch_size,
        );
        loader.shuffle().return_smaller_last_batch();
        loader
    }

    pub fn val_dataloader(&self) -> StdDataLoader {
        let mut loader =
            StdDataLoader::new(Arc::clone(&self.val), Arc::clone(&self.pool), self.batch_size);
        loader.return_smaller_last_batch();
        loader
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transforms::augment::Resize;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    /// Writes `count` 200x100 images, each with a 100x40 text box, one ignored
    /// box and an index file listing them.
    pub(crate) fn write_samples(dir: &Path, index_name: &str, count: usize) -> Result<()> {
        fs::create_dir_all(dir.join("images"))?;
        fs::create_dir_all(dir.join("gts"))?;
        let mut index = String::new();
        for i in 0..count {
            let image = RgbImage::from_fn(200, 100, |x, y| {
                if (40..140).contains(&x) && (30..70).contains(&y) {
                    Rgb([20, 20, 20])
                } else {
                    Rgb([230, 230, 230])
                }
            });
            let img_fp = format!("images/{}-{}.png", index_name, i);
            let gt_fp = format!("gts/{}-{}.txt", index_name, i);
            image.save(dir.join(&img_fp))?;
            fs::write(
                dir.join(&gt_fp),
                "40,30,140,30,140,70,40,70,text\n160,10,190,10,190,25,160,25,###\n",
            )?;
            index.push_str(&format!("{}\t{}\n", img_fp, gt_fp));
        }
        fs::write(dir.join(index_name), index)?;
        Ok(())
    }

    fn resize(height: u32, width: u32) -> Compose {
        Compose::new(vec![Box::new(Resize { height, width })])
    }

    #[test]
    fn dataset_rasterizes_resized_sample() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 1)?;
        let dataset = StdDataset::new(
            dir.path().join("train.tsv"),
            resize(64, 128),
            Some(dir.path()),
            Mode::Train,
        )?;
        assert_eq!(dataset.len(), 1);

        let sample = dataset.get(0)?;
        assert_eq!((sample.width, sample.height), (128, 64));
        assert_eq!(sample.shape, (100, 200));
        assert_eq!(sample.image.len(), 3 * 128 * 64);
        let targets = sample.targets.expect("train samples carry targets");
        for map in [&targets.gt, &targets.mask, &targets.thresh_map, &targets.thresh_mask] {
            assert_eq!(map.dimensions(), (128, 64));
        }
        assert_eq!(targets.ignore_tags, vec![false, true]);
        let (min_x, max_x, min_y, max_y) = crate::polygon::bounds(&targets.polygons[0]);
        assert!((min_x - 25.6).abs() < 1e-9 && (max_x - 89.6).abs() < 1e-9);
        assert!((min_y - 19.2).abs() < 1e-9 && (max_y - 44.8).abs() < 1e-9);
        assert_eq!(targets.gt.get_pixel(57, 32).0[0], 1.);
        Ok(())
    }

    #[test]
    fn repeated_access_does_not_rescale_twice() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 1)?;
        let dataset = StdDataset::new(
            dir.path().join("train.tsv"),
            resize(64, 128),
            Some(dir.path()),
            Mode::Train,
        )?;
        let first = dataset.get(0)?.targets.unwrap();
        let second = dataset.get(0)?.targets.unwrap();
        assert_eq!(first.polygons, second.polygons);
        assert_eq!(first.gt, second.gt);
        assert_eq!(first.thresh_map, second.thresh_map);
        Ok(())
    }

    #[test]
    fn test_mode_skips_annotations() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "test.tsv", 1)?;
        fs::remove_file(dir.path().join("gts/test.tsv-0.txt"))?;
        let dataset = StdDataset::new(
            dir.path().join("test.tsv"),
            Compose::default(),
            Some(dir.path()),
            Mode::Test,
        )?;
        let sample = dataset.get(0)?;
        assert!(sample.targets.is_none());
        assert_eq!((sample.width, sample.height), (200, 100));
        assert!(dataset.get(1).is_err());
        Ok(())
    }

    #[test]
    fn missing_annotation_fails_in_train_mode() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 1)?;
        fs::remove_file(dir.path().join("gts/train.tsv-0.txt"))?;
        assert!(StdDataset::new(
            dir.path().join("train.tsv"),
            Compose::default(),
            Some(dir.path()),
            Mode::Train,
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn collate_stacks_samples() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 2)?;
        let dataset = StdDataset::new(
            dir.path().join("train.tsv"),
            resize(32, 64),
            Some(dir.path()),
            Mode::Train,
        )?;
        let batch = collate(vec![dataset.get(0)?, dataset.get(1)?])?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.size(), vec![2, 3, 32, 64]);
        let targets = batch.targets.expect("targets are collated");
        assert_eq!(targets.gt.size(), vec![2, 1, 32, 64]);
        assert_eq!(targets.mask.size(), vec![2, 32, 64]);
        assert_eq!(targets.thresh_map.size(), vec![2, 32, 64]);
        assert_eq!(targets.thresh_mask.size(), vec![2, 32, 64]);
        assert_eq!(targets.ignore_tags.len(), 2);
        assert!(collate(vec![]).is_err());
        Ok(())
    }

    #[test]
    fn data_module_batches() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 5)?;
        write_samples(dir.path(), "dev.tsv", 2)?;
        let data_mod = StdDataModule::new(
            dir.path(),
            Some(dir.path()),
            resize(32, 64),
            resize(32, 64),
            2,
            2,
        )?;
        let sizes = data_mod
            .train_dataloader()
            .map(|batch| batch.map(|b| b.len()))
            .collect::<Result<Vec<usize>>>()?;
        assert_eq!(sizes, vec![2, 2, 1]);

        let val = data_mod
            .val_dataloader()
            .collect::<Result<Vec<Batch>>>()?;
        assert_eq!(val.len(), 1);
        assert_eq!(val[0].shapes, vec![(100, 200), (100, 200)]);

        let loader = StdDataLoader::new(Arc::clone(&data_mod.train), Arc::clone(&data_mod.pool), 2);
        assert_eq!(loader.count(), 2);
        Ok(())
    }

    #[test]
    fn visualize_example_writes_debug_images() -> Result<()> {
        let dir = TempDir::new()?;
        write_samples(dir.path(), "train.tsv", 1)?;
        let dataset = StdDataset::new(
            dir.path().join("train.tsv"),
            resize(32, 64),
            Some(dir.path()),
            Mode::Train,
        )?;
        let out = dir.path().join("debug");
        visualize_example(&dataset.get(0)?, &out)?;
        for name in [
            "debug-image.jpg",
            "debug-gt.jpg",
            "debug-mask.jpg",
            "debug-thresh-map.jpg",
            "debug-thresh-mask.jpg",
        ] {
            assert!(out.join(name).is_file());
        }
        Ok(())
    }
}

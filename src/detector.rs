use crate::image_ops::{self, FloatMap};
use crate::model_store::{check_model_name, resolve_model_file, store_root, DEFAULT_MODEL_NAME};
use crate::text_detection::postprocess::{binarize, boxes_from_bitmap, PostProcessParams, TextBox};
use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::point::Point;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tch::{CModule, Device, Tensor};

#[derive(Debug, Clone)]
pub struct TextDetectorOptions {
    pub model_name: String,
    /// Epoch of the stored checkpoint; the released one when `None`.
    pub model_epoch: Option<usize>,
    /// Explicit checkpoint, bypassing the model store.
    pub model_fp: Option<PathBuf>,
    /// Model store root; [`crate::model_store::data_dir`] when `None`.
    pub root: Option<PathBuf>,
    pub device: Device,
    /// Keep rotated boxes; otherwise every box is made axis aligned.
    pub rotated_bbox: bool,
}

impl Default for TextDetectorOptions {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            model_epoch: None,
            model_fp: None,
            root: None,
            device: Device::Cpu,
            rotated_bbox: true,
        }
    }
}

/// An image to run detection on.
#[derive(Debug, Clone)]
pub enum DetectInput {
    Path(PathBuf),
    Image(RgbImage),
}

impl From<&str> for DetectInput {
    fn from(path: &str) -> Self {
        DetectInput::Path(PathBuf::from(path))
    }
}

impl From<&Path> for DetectInput {
    fn from(path: &Path) -> Self {
        DetectInput::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for DetectInput {
    fn from(path: PathBuf) -> Self {
        DetectInput::Path(path)
    }
}

impl From<RgbImage> for DetectInput {
    fn from(image: RgbImage) -> Self {
        DetectInput::Image(image)
    }
}

impl From<DynamicImage> for DetectInput {
    fn from(image: DynamicImage) -> Self {
        DetectInput::Image(image.to_rgb8())
    }
}

impl DetectInput {
    fn into_image(self) -> Result<RgbImage> {
        match self {
            DetectInput::Path(path) => image_ops::read_image(path),
            DetectInput::Image(image) => Ok(image),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
    /// `(height, width)` the images are resized to; both multiples of 32.
    pub resized_shape: (u32, u32),
    pub preserve_aspect_ratio: bool,
    /// Boxes with a side shorter than this, in original pixels, are dropped.
    pub min_box_size: f64,
    pub box_score_thresh: f64,
    pub binary_thresh: f32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            resized_shape: (768, 768),
            preserve_aspect_ratio: true,
            min_box_size: 8.,
            box_score_thresh: 0.3,
            binary_thresh: 0.3,
        }
    }
}

impl DetectParams {
    pub fn validate(&self) -> Result<()> {
        let (h, w) = self.resized_shape;
        if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
            return Err(anyhow!(
                "resized shape {:?} must be positive multiples of 32",
                self.resized_shape
            ));
        }
        Ok(())
    }

    fn post_process(&self) -> PostProcessParams {
        PostProcessParams {
            binary_thresh: self.binary_thresh,
            box_thresh: self.box_score_thresh,
            ..PostProcessParams::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedText {
    /// Corners ordered top-left, top-right, bottom-right, bottom-left.
    pub text_box: [Point<f64>; 4],
    pub score: f64,
    /// The box content, rotated to horizontal.
    pub cropped_img: RgbImage,
}

pub struct TextDetector {
    model: CModule,
    device: Device,
    rotated_bbox: bool,
}

impl TextDetector {
    pub fn new(options: TextDetectorOptions) -> Result<Self> {
        check_model_name(&options.model_name)?;
        let model_fp = resolve_model_file(
            &options.model_name,
            options.model_epoch,
            options.model_fp.as_deref(),
            &store_root(options.root.as_deref())?,
        )?;
        info!("use model: {}", model_fp.display());
        let mut model = measure_time!("load model", || CModule::load_on_device(
            &model_fp,
            options.device
        ))?;
        model.set_eval();
        Ok(Self {
            model,
            device: options.device,
            rotated_bbox: options.rotated_bbox,
        })
    }

    pub fn detect_one<I: Into<DetectInput>>(
        &self,
        input: I,
        params: &DetectParams,
    ) -> Result<Vec<DetectedText>> {
        let mut results = self.detect(vec![input.into()], params)?;
        results
            .pop()
            .ok_or_else(|| anyhow!("no detection result returned"))
    }

    /// Detects text boxes on every input; results keep the input order.
    pub fn detect(
        &self,
        inputs: Vec<DetectInput>,
        params: &DetectParams,
    ) -> Result<Vec<Vec<DetectedText>>> {
        params.validate()?;
        let images = inputs
            .into_iter()
            .map(DetectInput::into_image)
            .collect::<Result<Vec<RgbImage>>>()?;
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let (height, width) = params.resized_shape;
        let prepared = images
            .iter()
            .map(|image| resize_for_detection(image, params))
            .collect::<Vec<_>>();
        let batch = Tensor::stack(
            &prepared
                .iter()
                .map(|(resized, _)| {
                    image_ops::convert_image_to_tensor(
                        &image_ops::normalize_image(resized),
                        width,
                        height,
                    )
                })
                .collect::<Vec<Tensor>>(),
            0,
        )
        .to_device(self.device);

        let pred = measure_time!("inference", || tch::no_grad(|| self
            .model
            .forward_ts(&[&batch])))?;
        let prob = pred.select(1, 0);

        let mut results = Vec::with_capacity(images.len());
        for (i, (image, (_, content_size))) in images.iter().zip(prepared.iter()).enumerate() {
            let prob_map = image_ops::convert_tensor_to_map(&prob.get(i as i64))?;
            let texts = texts_from_prediction(
                &prob_map,
                image,
                *content_size,
                params,
                self.rotated_bbox,
            );
            debug!("image {}: {} text boxes", i, texts.len());
            results.push(texts);
        }
        Ok(results)
    }
}

/// Resizes the image to `params.resized_shape`. With a preserved aspect ratio
/// the image is scaled to fit and padded at the right and bottom. Returns the
/// network input and the `(width, height)` of the image content inside it.
pub fn resize_for_detection(image: &RgbImage, params: &DetectParams) -> (RgbImage, (u32, u32)) {
    let (height, width) = params.resized_shape;
    if !params.preserve_aspect_ratio {
        let resized = imageops::resize(image, width, height, FilterType::Triangle);
        return (resized, (width, height));
    }
    let (w, h) = image.dimensions();
    let ratio = (height as f64 / h.max(1) as f64).min(width as f64 / w.max(1) as f64);
    let new_w = ((w as f64 * ratio).round() as u32).clamp(1, width);
    let new_h = ((h as f64 * ratio).round() as u32).clamp(1, height);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(width, height);
    imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, (new_w, new_h))
}

/// Turns the probability map of one image into detected texts, mapping the
/// boxes back onto `image`.
pub fn texts_from_prediction(
    prob_map: &FloatMap,
    image: &RgbImage,
    content_size: (u32, u32),
    params: &DetectParams,
    rotated_bbox: bool,
) -> Vec<DetectedText> {
    let bitmap = binarize(prob_map, params.binary_thresh);
    boxes_from_bitmap(
        prob_map,
        &bitmap,
        &params.post_process(),
        content_size,
        image.dimensions(),
    )
    .into_iter()
    .map(|text_box| {
        if rotated_bbox {
            text_box
        } else {
            text_box.axis_aligned()
        }
    })
    .filter(|text_box| {
        let (w, h) = text_box.sides();
        w.min(h) >= params.min_box_size
    })
    .map(|text_box| DetectedText {
        cropped_img: crop_text_box(image, &text_box),
        text_box: text_box.points,
        score: text_box.score,
    })
    .collect()
}

fn crop_axis_aligned(image: &RgbImage, text_box: &TextBox) -> RgbImage {
    let aligned = text_box.axis_aligned();
    let [tl, _, br, _] = aligned.points;
    let (w, h) = image.dimensions();
    let x0 = (tl.x.max(0.) as u32).min(w.saturating_sub(1));
    let y0 = (tl.y.max(0.) as u32).min(h.saturating_sub(1));
    let x1 = (br.x.max(0.).round() as u32).clamp(x0 + 1, w.max(x0 + 1));
    let y1 = (br.y.max(0.).round() as u32).clamp(y0 + 1, h.max(y0 + 1));
    imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}

/// Cuts the box out of the image; rotated boxes are warped to horizontal.
pub fn crop_text_box(image: &RgbImage, text_box: &TextBox) -> RgbImage {
    let [tl, tr, br, bl] = text_box.points;
    if tl.y == tr.y && tl.x == bl.x {
        return crop_axis_aligned(image, text_box);
    }
    let (box_w, box_h) = text_box.sides();
    let (out_w, out_h) = ((box_w.round() as u32).max(1), (box_h.round() as u32).max(1));
    let from = [tl, tr, br, bl].map(|p| (p.x as f32, p.y as f32));
    let to = [
        (0., 0.),
        (out_w as f32, 0.),
        (out_w as f32, out_h as f32),
        (0., out_h as f32),
    ];
    match Projection::from_control_points(from, to) {
        Some(projection) => {
            let mut out = RgbImage::new(out_w, out_h);
            warp_into(
                image,
                &projection,
                Interpolation::Bilinear,
                Rgb([0, 0, 0]),
                &mut out,
            );
            out
        }
        None => crop_axis_aligned(image, text_box),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    #[test]
    fn params_validation() {
        assert!(DetectParams::default().validate().is_ok());
        let params = DetectParams {
            resized_shape: (700, 768),
            ..DetectParams::default()
        };
        assert!(params.validate().is_err());
        let params = DetectParams {
            resized_shape: (0, 0),
            ..DetectParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn resize_preserving_aspect_ratio() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let params = DetectParams {
            resized_shape: (128, 128),
            ..DetectParams::default()
        };
        let (resized, content) = resize_for_detection(&image, &params);
        assert_eq!(resized.dimensions(), (128, 128));
        assert_eq!(content, (128, 64));
        assert_eq!(resized.get_pixel(10, 10), &Rgb([255, 255, 255]));
        assert_eq!(resized.get_pixel(10, 100), &Rgb([0, 0, 0]));

        let stretched = DetectParams {
            preserve_aspect_ratio: false,
            ..params
        };
        let (resized, content) = resize_for_detection(&image, &stretched);
        assert_eq!(resized.dimensions(), (128, 128));
        assert_eq!(content, (128, 128));
    }

    #[test]
    fn input_conversions() -> Result<()> {
        assert!(matches!(DetectInput::from("a.jpg"), DetectInput::Path(_)));
        assert!(matches!(
            DetectInput::from(RgbImage::new(2, 2)),
            DetectInput::Image(_)
        ));
        assert!(matches!(
            DetectInput::from(DynamicImage::new_luma8(2, 2)),
            DetectInput::Image(_)
        ));
        assert!(DetectInput::from("missing-image.jpg").into_image().is_err());
        Ok(())
    }

    #[test]
    fn detector_requires_known_model_and_existing_file() -> Result<()> {
        let dir = TempDir::new()?;
        let unknown = TextDetectorOptions {
            model_name: "crnn".to_string(),
            root: Some(dir.path().to_path_buf()),
            ..TextDetectorOptions::default()
        };
        assert!(TextDetector::new(unknown).is_err());
        let missing = TextDetectorOptions {
            model_fp: Some(dir.path().join("missing.ckpt")),
            root: Some(dir.path().to_path_buf()),
            ..TextDetectorOptions::default()
        };
        let err = TextDetector::new(missing).err().expect("missing model file");
        assert!(err.to_string().contains("can not find model file"));
        Ok(())
    }

    fn prob_map_with_text() -> FloatMap {
        FloatMap::from_fn(128, 64, |x, y| {
            if (20..100).contains(&x) && (20..40).contains(&y) {
                Luma([0.9])
            } else {
                Luma([0.])
            }
        })
    }

    #[test]
    fn texts_are_mapped_to_original_image() {
        let image = RgbImage::from_pixel(256, 128, Rgb([10, 20, 30]));
        let params = DetectParams::default();
        let texts = texts_from_prediction(&prob_map_with_text(), &image, (128, 64), &params, false);
        assert_eq!(texts.len(), 1);
        let text = &texts[0];
        assert!((text.score - 0.9).abs() < 1e-6);
        let [tl, tr, br, bl] = text.text_box;
        assert_eq!(tl.y, tr.y);
        assert_eq!(tl.x, bl.x);
        assert!(tl.x < 40. && br.x > 198. && tl.y < 40. && br.y > 78.);
        assert!(br.x <= 256. && br.y <= 128.);
        assert_eq!(
            text.cropped_img.dimensions(),
            ((br.x - tl.x) as u32, (br.y - tl.y) as u32)
        );
        assert_eq!(text.cropped_img.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn small_boxes_are_dropped() {
        let image = RgbImage::new(128, 64);
        let params = DetectParams {
            min_box_size: 100.,
            ..DetectParams::default()
        };
        assert!(texts_from_prediction(&prob_map_with_text(), &image, (128, 64), &params, true)
            .is_empty());
    }

    #[test]
    fn rotated_crop_is_rectified() {
        let image = RgbImage::from_pixel(100, 100, Rgb([200, 100, 50]));
        let text_box = TextBox {
            points: [
                Point::new(50., 10.),
                Point::new(90., 50.),
                Point::new(70., 70.),
                Point::new(30., 30.),
            ],
            score: 1.,
        };
        let crop = crop_text_box(&image, &text_box);
        let (w, h) = text_box.sides();
        assert_eq!(crop.dimensions(), (w.round() as u32, h.round() as u32));
        let (cx, cy) = (crop.width() / 2, crop.height() / 2);
        let center = crop.get_pixel(cx, cy);
        for (c, expected) in center.0.iter().zip([200u8, 100, 50]) {
            assert!((*c as i32 - expected as i32).abs() <= 1);
        }
    }
}

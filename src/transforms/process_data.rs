use crate::image_ops::{fill_polygon, FloatMap};
use crate::polygon::{
    area, bounds, clamp_polygon, expand_polygon, normalize_winding, offset_distance,
    segment_distance, shrink_polygon,
};
use anyhow::{anyhow, Result};
use image::{Luma, RgbImage};
use imageproc::point::Point;
use log::trace;

/// A sample on its way through the rasterization processors. The maps are
/// filled in by the processors and always share the image's size.
pub struct ProcessData {
    pub image: RgbImage,
    pub polygons: Vec<Vec<Point<f64>>>,
    pub ignore_tags: Vec<bool>,
    pub gt: Option<FloatMap>,
    pub mask: Option<FloatMap>,
    pub thresh_map: Option<FloatMap>,
    pub thresh_mask: Option<FloatMap>,
}

impl ProcessData {
    pub fn new(image: RgbImage, polygons: Vec<Vec<Point<f64>>>, ignore_tags: Vec<bool>) -> Self {
        Self {
            image,
            polygons,
            ignore_tags,
            gt: None,
            mask: None,
            thresh_map: None,
            thresh_mask: None,
        }
    }
}

pub trait Processor: Send + Sync {
    fn process(&self, data: &mut ProcessData) -> Result<()>;
}

lazy_static! {
    /// Label generation run on every training sample, in order.
    pub static ref PROCESSORS: Vec<Box<dyn Processor>> = vec![
        Box::new(MakeSegDetectionData::default()),
        Box::new(MakeBorderMap::default()),
    ];
}

pub fn process_data(mut data: ProcessData) -> Result<ProcessData> {
    if data.polygons.len() != data.ignore_tags.len() {
        return Err(anyhow!(
            "{} polygons but {} ignore tags",
            data.polygons.len(),
            data.ignore_tags.len()
        ));
    }
    for processor in PROCESSORS.iter() {
        processor.process(&mut data)?;
    }
    Ok(data)
}

/// Builds the shrunk text kernel map (`gt`) and the training mask.
#[derive(Debug, Clone, Copy)]
pub struct MakeSegDetectionData {
    pub min_text_size: f64,
    pub shrink_ratio: f64,
}

impl Default for MakeSegDetectionData {
    fn default() -> Self {
        Self {
            min_text_size: 8.,
            shrink_ratio: 0.4,
        }
    }
}

impl MakeSegDetectionData {
    /// Clamps the polygons into the image, ignores the ones with (almost) no
    /// area and normalizes the winding of the rest.
    fn validate_polygons(data: &mut ProcessData) {
        let (w, h) = data.image.dimensions();
        for (polygon, ignore) in data.polygons.iter_mut().zip(data.ignore_tags.iter_mut()) {
            clamp_polygon(polygon, w, h);
            if polygon.len() < 3 || area(polygon) < 1. {
                *ignore = true;
            }
            normalize_winding(polygon);
        }
    }
}

impl Processor for MakeSegDetectionData {
    fn process(&self, data: &mut ProcessData) -> Result<()> {
        Self::validate_polygons(data);
        let (w, h) = data.image.dimensions();
        let mut gt = FloatMap::new(w, h);
        let mut mask = FloatMap::from_pixel(w, h, Luma([1.]));

        for (polygon, ignore) in data.polygons.iter().zip(data.ignore_tags.iter_mut()) {
            let (min_x, max_x, min_y, max_y) = bounds(polygon);
            let height = max_y - min_y;
            let width = max_x - min_x;
            if *ignore || height.min(width) < self.min_text_size {
                fill_polygon(&mut mask, polygon, 0.);
                *ignore = true;
                continue;
            }
            let distance = offset_distance(polygon, self.shrink_ratio);
            match shrink_polygon(polygon, distance) {
                Some(shrunk) => fill_polygon(&mut gt, &shrunk, 1.),
                None => {
                    trace!("polygon {:?} vanished when shrunk by {}", polygon, distance);
                    fill_polygon(&mut mask, polygon, 0.);
                    *ignore = true;
                }
            }
        }

        data.gt = Some(gt);
        data.mask = Some(mask);
        Ok(())
    }
}

/// Builds the threshold map: close to `thresh_max` on text borders, decaying
/// to `thresh_min` over the offset distance, plus the mask of the expanded
/// regions where it is supervised.
#[derive(Debug, Clone, Copy)]
pub struct MakeBorderMap {
    pub shrink_ratio: f64,
    pub thresh_min: f32,
    pub thresh_max: f32,
}

impl Default for MakeBorderMap {
    fn default() -> Self {
        Self {
            shrink_ratio: 0.4,
            thresh_min: 0.3,
            thresh_max: 0.7,
        }
    }
}

impl MakeBorderMap {
    fn draw_border_map(&self, polygon: &[Point<f64>], canvas: &mut FloatMap, mask: &mut FloatMap) {
        if polygon.len() < 3 || area(polygon) <= 0. {
            return;
        }
        let distance = offset_distance(polygon, self.shrink_ratio);
        if distance <= 0. {
            return;
        }
        let padded = match expand_polygon(polygon, distance) {
            Some(padded) => padded,
            None => return,
        };
        fill_polygon(mask, &padded, 1.);

        let (min_x, max_x, min_y, max_y) = bounds(&padded);
        let (xmin, xmax) = (min_x as i64, max_x as i64);
        let (ymin, ymax) = (min_y as i64, max_y as i64);
        let (w, h) = (canvas.width() as i64, canvas.height() as i64);
        let xmin_valid = xmin.max(0).min(w - 1);
        let xmax_valid = xmax.max(0).min(w - 1);
        let ymin_valid = ymin.max(0).min(h - 1);
        let ymax_valid = ymax.max(0).min(h - 1);

        let edges = (0..polygon.len())
            .map(|i| (polygon[i], polygon[(i + 1) % polygon.len()]))
            .collect::<Vec<(Point<f64>, Point<f64>)>>();
        for y in ymin_valid..=ymax_valid {
            for x in xmin_valid..=xmax_valid {
                let p = Point::new(x as f64, y as f64);
                let relative = edges
                    .iter()
                    .map(|&(a, b)| (segment_distance(p, a, b) / distance).min(1.))
                    .fold(1f64, f64::min);
                let value = (1. - relative) as f32;
                let pixel = canvas.get_pixel_mut(x as u32, y as u32);
                if value > pixel.0[0] {
                    pixel.0[0] = value;
                }
            }
        }
    }
}

impl Processor for MakeBorderMap {
    fn process(&self, data: &mut ProcessData) -> Result<()> {
        let (w, h) = data.image.dimensions();
        let mut canvas = FloatMap::new(w, h);
        let mut mask = FloatMap::new(w, h);
        if w > 0 && h > 0 {
            for (polygon, &ignore) in data.polygons.iter().zip(data.ignore_tags.iter()) {
                if !ignore {
                    self.draw_border_map(polygon, &mut canvas, &mut mask);
                }
            }
        }
        let scale = self.thresh_max - self.thresh_min;
        for pixel in canvas.pixels_mut() {
            pixel.0[0] = pixel.0[0] * scale + self.thresh_min;
        }

        data.thresh_map = Some(canvas);
        data.thresh_mask = Some(mask);
        Ok(())
    }
}

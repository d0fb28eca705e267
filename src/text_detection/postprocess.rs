use crate::image_ops::{fill_polygon, FloatMap};
use crate::polygon::{area, bounds, expand_polygon, perimeter};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;
use log::trace;
use num_traits::clamp;

/// Parameters turning a probability map into text boxes.
#[derive(Debug, Clone, Copy)]
pub struct PostProcessParams {
    pub binary_thresh: f32,
    pub box_thresh: f64,
    pub max_candidates: usize,
    pub unclip_ratio: f64,
    /// Candidates whose short side is below this value are dropped before
    /// unclipping; after unclipping the limit is `min_size + 2`.
    pub min_size: f64,
}

impl Default for PostProcessParams {
    fn default() -> Self {
        Self {
            binary_thresh: 0.3,
            box_thresh: 0.7,
            max_candidates: 1000,
            unclip_ratio: 1.5,
            min_size: 3.,
        }
    }
}

/// A detected quadrilateral, points ordered top-left, top-right,
/// bottom-right, bottom-left.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox {
    pub points: [Point<f64>; 4],
    pub score: f64,
}

impl TextBox {
    /// Lengths of the `top-left -> top-right` and `top-left -> bottom-left` sides.
    pub fn sides(&self) -> (f64, f64) {
        let [tl, tr, _, bl] = self.points;
        (distance(tl, tr), distance(tl, bl))
    }

    /// The smallest axis aligned box covering this one.
    pub fn axis_aligned(&self) -> TextBox {
        let (min_x, max_x, min_y, max_y) = bounds(&self.points);
        TextBox {
            points: [
                Point::new(min_x, min_y),
                Point::new(max_x, min_y),
                Point::new(max_x, max_y),
                Point::new(min_x, max_y),
            ],
            score: self.score,
        }
    }
}

fn distance(a: Point<f64>, b: Point<f64>) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Pixels above `thresh` become white.
pub fn binarize(pred: &FloatMap, thresh: f32) -> GrayImage {
    GrayImage::from_fn(pred.width(), pred.height(), |x, y| {
        if pred.get_pixel(x, y).0[0] > thresh {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Minimum area rectangle of the points, ordered top-left, top-right,
/// bottom-right, bottom-left, along with the length of its shorter side.
pub fn get_min_area_bounding_box(contour: &[Point<i32>]) -> ([Point<f64>; 4], f64) {
    let mut rect = min_area_rect(contour);
    rect.sort_by(|a, b| a.x.cmp(&b.x));
    let (tl, bl) = if rect[1].y > rect[0].y {
        (rect[0], rect[1])
    } else {
        (rect[1], rect[0])
    };
    let (tr, br) = if rect[3].y > rect[2].y {
        (rect[2], rect[3])
    } else {
        (rect[3], rect[2])
    };
    let points = [tl, tr, br, bl].map(|p| Point::new(p.x as f64, p.y as f64));
    let short_side = distance(points[0], points[1]).min(distance(points[0], points[3]));
    (points, short_side)
}

/// Mean of `pred` over the pixels covered by the polygon.
pub fn box_score_fast(pred: &FloatMap, points: &[Point<f64>]) -> f64 {
    let (w, h) = pred.dimensions();
    if w == 0 || h == 0 || points.is_empty() {
        return 0.;
    }
    let (min_x, max_x, min_y, max_y) = bounds(points);
    let x0 = clamp(min_x.floor() as i64, 0, w as i64 - 1) as u32;
    let x1 = clamp(max_x.ceil() as i64, 0, w as i64 - 1) as u32;
    let y0 = clamp(min_y.floor() as i64, 0, h as i64 - 1) as u32;
    let y1 = clamp(max_y.ceil() as i64, 0, h as i64 - 1) as u32;

    let mut mask = FloatMap::new(x1 - x0 + 1, y1 - y0 + 1);
    let moved = points
        .iter()
        .map(|p| Point::new(p.x - x0 as f64, p.y - y0 as f64))
        .collect::<Vec<Point<f64>>>();
    fill_polygon(&mut mask, &moved, 1.);

    let (sum, count) = mask
        .enumerate_pixels()
        .filter(|(_, _, m)| m.0[0] > 0.)
        .fold((0., 0.), |(sum, count), (x, y, _)| {
            (sum + pred.get_pixel(x + x0, y + y0).0[0] as f64, count + 1.)
        });
    if count == 0. {
        0.
    } else {
        sum / count
    }
}

/// Expands a box by `area * unclip_ratio / perimeter`.
pub fn unclip(points: &[Point<f64>], unclip_ratio: f64) -> Option<Vec<Point<f64>>> {
    let length = perimeter(points);
    if length <= 0. {
        return None;
    }
    expand_polygon(points, area(points) * unclip_ratio / length)
}

/// Extracts scored boxes from the probability map `pred` and its binarized
/// `bitmap`. Box coordinates are mapped from `content_size`, the part of the
/// map covering the input image, onto `dest_size`, both given as `(width, height)`.
pub fn boxes_from_bitmap(
    pred: &FloatMap,
    bitmap: &GrayImage,
    params: &PostProcessParams,
    content_size: (u32, u32),
    dest_size: (u32, u32),
) -> Vec<TextBox> {
    let scale_x = dest_size.0 as f64 / content_size.0.max(1) as f64;
    let scale_y = dest_size.1 as f64 / content_size.1.max(1) as f64;
    let contours = find_contours::<i32>(bitmap)
        .into_iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer))
        .take(params.max_candidates)
        .collect::<Vec<_>>();
    trace!("{} contour candidates", contours.len());

    let mut boxes = Vec::new();
    for contour in contours {
        if contour.points.len() < 4 {
            continue;
        }
        let (points, short_side) = get_min_area_bounding_box(&contour.points);
        if short_side < params.min_size {
            continue;
        }
        let score = box_score_fast(pred, &points);
        if score < params.box_thresh {
            continue;
        }
        let expanded = match unclip(&points, params.unclip_ratio) {
            Some(expanded) => expanded,
            None => continue,
        };
        let expanded = expanded
            .iter()
            .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32))
            .collect::<Vec<Point<i32>>>();
        let (points, short_side) = get_min_area_bounding_box(&expanded);
        if short_side < params.min_size + 2. {
            continue;
        }
        let points = points.map(|p| {
            Point::new(
                clamp((p.x * scale_x).round(), 0., dest_size.0 as f64),
                clamp((p.y * scale_y).round(), 0., dest_size.1 as f64),
            )
        });
        boxes.push(TextBox { points, score });
    }
    boxes
}

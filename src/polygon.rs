use geo::{Area, EuclideanLength, LineString, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use imageproc::point::Point;
use num_traits::clamp;

/// Arc tolerance used for round joins, in pixels.
const ROUND_JOIN_TOLERANCE: f64 = 0.25;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ClippingType {
    Shrink,
    Expand,
}

fn to_geo(polygon: &[Point<f64>]) -> Polygon<f64> {
    Polygon::new(
        LineString::from(
            polygon
                .iter()
                .map(|p| (p.x, p.y))
                .collect::<Vec<(f64, f64)>>(),
        ),
        vec![],
    )
}

pub fn signed_area(polygon: &[Point<f64>]) -> f64 {
    to_geo(polygon).signed_area()
}

pub fn area(polygon: &[Point<f64>]) -> f64 {
    to_geo(polygon).unsigned_area()
}

pub fn perimeter(polygon: &[Point<f64>]) -> f64 {
    to_geo(polygon).exterior().euclidean_length()
}

/// Reverses the point order of a polygon with negative signed area, so that
/// every polygon handed to the rasterizers has the same winding.
pub fn normalize_winding(polygon: &mut [Point<f64>]) {
    if signed_area(polygon) < 0. {
        polygon.reverse();
    }
}

pub fn clamp_polygon(polygon: &mut [Point<f64>], width: u32, height: u32) {
    let max_x = (width.max(1) - 1) as f64;
    let max_y = (height.max(1) - 1) as f64;
    for p in polygon.iter_mut() {
        p.x = clamp(p.x, 0., max_x);
        p.y = clamp(p.y, 0., max_y);
    }
}

/// Offset distance of the DB label generation: `A * (1 - r^2) / L`.
pub fn offset_distance(polygon: &[Point<f64>], shrink_ratio: f64) -> f64 {
    let length = perimeter(polygon);
    if length <= 0. {
        return 0.;
    }
    area(polygon) * (1. - shrink_ratio * shrink_ratio) / length
}

/// Offsets the polygon by `distance` (inwards for `Shrink`, outwards for
/// `Expand`) and returns the first resulting ring without its closing point.
pub fn clip_polygon(
    polygon: &[Point<f64>],
    distance: f64,
    clipping_type: ClippingType,
) -> Option<Vec<Point<f64>>> {
    if polygon.len() < 3 {
        return None;
    }
    let delta = match clipping_type {
        ClippingType::Shrink => -distance.abs(),
        ClippingType::Expand => distance.abs(),
    };
    let clipped = to_geo(polygon).offset(
        delta,
        JoinType::Round(ROUND_JOIN_TOLERANCE),
        EndType::ClosedPolygon,
        1.,
    );
    let ring = clipped.0.first()?.exterior();
    let mut points = ring
        .coords()
        .map(|c| Point::new(c.x, c.y))
        .collect::<Vec<Point<f64>>>();
    if points.len() > 1 && points[0] == points[points.len() - 1] {
        points.pop();
    }
    if points.len() < 3 {
        return None;
    }
    Some(points)
}

pub fn shrink_polygon(polygon: &[Point<f64>], distance: f64) -> Option<Vec<Point<f64>>> {
    clip_polygon(polygon, distance, ClippingType::Shrink)
}

pub fn expand_polygon(polygon: &[Point<f64>], distance: f64) -> Option<Vec<Point<f64>>> {
    clip_polygon(polygon, distance, ClippingType::Expand)
}

/// Returns `(min_x, max_x, min_y, max_y)`.
pub fn bounds(polygon: &[Point<f64>]) -> (f64, f64, f64, f64) {
    polygon.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |acc, p| (acc.0.min(p.x), acc.1.max(p.x), acc.2.min(p.y), acc.3.max(p.y)),
    )
}

/// Euclidean distance from `p` to the segment `a`-`b`.
pub fn segment_distance(p: Point<f64>, a: Point<f64>, b: Point<f64>) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let length_sq = dx * dx + dy * dy;
    let t = if length_sq == 0. {
        0.
    } else {
        clamp(((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq, 0., 1.)
    };
    let (px, py) = (a.x + t * dx - p.x, a.y + t * dy - p.y);
    (px * px + py * py).sqrt()
}

/// Truncates to pixel coordinates, dropping repeated and closing points.
pub fn to_pixel_points(polygon: &[Point<f64>]) -> Vec<Point<i32>> {
    let mut points: Vec<Point<i32>> = polygon
        .iter()
        .map(|p| Point::new(p.x as i32, p.y as i32))
        .collect();
    points.dedup();
    while points.len() > 1 && points[0] == points[points.len() - 1] {
        points.pop();
    }
    points
}

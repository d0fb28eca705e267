use geo::Area;
use geo::{LineString, Polygon};
use geo_clipper::Clipper;
use imageproc::point::Point;
use itertools::izip;

const AREA_PRECISION_CONSTRAINT: f64 = 0.5;
const IOU_CONSTRAINT: f64 = 0.5;
const CLIPPER_FACTOR: f64 = 1000.;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MetricsItem {
    pub precision: f64,
    pub recall: f64,
    pub hmean: f64,
    pub gt_care: usize,
    pub det_care: usize,
    pub det_matched: usize,
}

/// Dataset level detection quality.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    pub precision: f64,
    pub recall: f64,
    pub hmean: f64,
}

fn to_geo(points: &[Point<f64>]) -> Polygon<f64> {
    Polygon::new(
        LineString::from(points.iter().map(|p| (p.x, p.y)).collect::<Vec<(f64, f64)>>()),
        vec![],
    )
}

fn get_intersection(poly1: &Polygon<f64>, poly2: &Polygon<f64>) -> f64 {
    poly1.intersection(poly2, CLIPPER_FACTOR).unsigned_area()
}

fn get_union(poly1: &Polygon<f64>, poly2: &Polygon<f64>) -> f64 {
    poly1.union(poly2, CLIPPER_FACTOR).unsigned_area()
}

fn get_intersection_over_union(poly1: &Polygon<f64>, poly2: &Polygon<f64>) -> f64 {
    let union = get_union(poly1, poly2);
    if union == 0. {
        0.
    } else {
        get_intersection(poly1, poly2) / union
    }
}

/// Matches the detections of one image against its ground truth.
///
/// A detection covering an ignored region by more than half of its own area
/// is left out, and a ground truth/detection pair matches when their IoU is
/// above 0.5. Every polygon takes part in at most one match.
pub fn evaluate_image(
    gt_points: &[Vec<Point<f64>>],
    ignore_flags: &[bool],
    pred: &[Vec<Point<f64>>],
) -> MetricsItem {
    let gt_polys = gt_points.iter().map(|p| to_geo(p)).collect::<Vec<_>>();
    let gt_dont_care = (0..gt_polys.len())
        .filter(|&n| ignore_flags.get(n).copied().unwrap_or(false))
        .collect::<Vec<usize>>();

    let det_polys = pred.iter().map(|p| to_geo(p)).collect::<Vec<_>>();
    let det_dont_care = det_polys
        .iter()
        .enumerate()
        .filter(|(_, det)| {
            let det_area = det.unsigned_area();
            gt_dont_care.iter().any(|&gt_num| {
                det_area > 0.
                    && get_intersection(&gt_polys[gt_num], det) / det_area
                        > AREA_PRECISION_CONSTRAINT
            })
        })
        .map(|(n, _)| n)
        .collect::<Vec<usize>>();

    let mut det_matched = 0;
    let mut gt_rect_mat = vec![false; gt_polys.len()];
    let mut det_rect_mat = vec![false; det_polys.len()];
    for (gt_num, gt_poly) in gt_polys.iter().enumerate() {
        if gt_dont_care.contains(&gt_num) {
            continue;
        }
        for (det_num, det_poly) in det_polys.iter().enumerate() {
            if gt_rect_mat[gt_num] || det_rect_mat[det_num] || det_dont_care.contains(&det_num) {
                continue;
            }
            if get_intersection_over_union(det_poly, gt_poly) > IOU_CONSTRAINT {
                gt_rect_mat[gt_num] = true;
                det_rect_mat[det_num] = true;
                det_matched += 1;
            }
        }
    }

    let num_gt_care = gt_polys.len() - gt_dont_care.len();
    let num_det_care = det_polys.len() - det_dont_care.len();
    let (recall, precision) = if num_gt_care == 0 {
        (1., if num_det_care > 0 { 0. } else { 1. })
    } else {
        let precision = if num_det_care == 0 {
            0.
        } else {
            det_matched as f64 / num_det_care as f64
        };
        (det_matched as f64 / num_gt_care as f64, precision)
    };
    let hmean = if precision + recall == 0. {
        0.
    } else {
        2. * precision * recall / (precision + recall)
    };

    MetricsItem {
        precision,
        recall,
        hmean,
        gt_care: num_gt_care,
        det_care: num_det_care,
        det_matched,
    }
}

/// Evaluates a batch, keeping only detections scored at least `box_thresh`.
pub fn validate_measure(
    polygons: &[Vec<Vec<Point<f64>>>],
    ignore_tags: &[Vec<bool>],
    pred: &[Vec<Vec<Point<f64>>>],
    scores: &[Vec<f64>],
    box_thresh: f64,
) -> Vec<MetricsItem> {
    izip!(polygons, ignore_tags, pred, scores)
        .map(|(curr_polygons, curr_ignore_flags, curr_pred, curr_scores)| {
            let kept = curr_pred
                .iter()
                .zip(curr_scores)
                .filter(|(_, score)| **score >= box_thresh)
                .map(|(poly, _)| poly.clone())
                .collect::<Vec<Vec<Point<f64>>>>();
            evaluate_image(curr_polygons, curr_ignore_flags, &kept)
        })
        .collect()
}

pub fn gather_measure(metrics: &[Vec<MetricsItem>]) -> Metrics {
    combine_results(&metrics.concat())
}

pub fn combine_results(results: &[MetricsItem]) -> Metrics {
    let (gt_care, det_care, matched) = results.iter().fold((0, 0, 0), |acc, res| {
        (
            acc.0 + res.gt_care,
            acc.1 + res.det_care,
            acc.2 + res.det_matched,
        )
    });
    let recall = if gt_care == 0 {
        0.
    } else {
        matched as f64 / gt_care as f64
    };
    let precision = if det_care == 0 {
        0.
    } else {
        matched as f64 / det_care as f64
    };
    let hmean = if recall + precision == 0. {
        0.
    } else {
        2. * recall * precision / (recall + precision)
    };
    Metrics {
        precision,
        recall,
        hmean,
    }
}

use crate::polygon::to_pixel_points;
use anyhow::{anyhow, Context, Result};
use image::{open, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::drawing;
use imageproc::point::Point;
use num_traits::clamp;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// Single channel `f32` image used for every rasterized target.
pub type FloatMap = ImageBuffer<Luma<f32>, Vec<f32>>;

pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

pub fn read_image<P: AsRef<Path>>(file_path: P) -> Result<RgbImage> {
    let file_path = file_path.as_ref();
    if !file_path.is_file() {
        return Err(anyhow!("File {} doesn't exist", file_path.display()));
    }
    Ok(open(file_path)
        .with_context(|| format!("decoding image {}", file_path.display()))?
        .into_rgb8())
}

/// Lists a single image file, or every image file of a directory (sorted).
pub fn collect_image_paths<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(anyhow!("Path {} doesn't exist", path.display()));
    }
    let mut files = fs::read_dir(path)
        .with_context(|| format!("Could not open dir {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect::<Vec<PathBuf>>();
    files.sort();
    Ok(files)
}

/// Fills the polygon with `value`; the outline is included.
pub fn fill_polygon(map: &mut FloatMap, polygon: &[Point<f64>], value: f32) {
    let points = to_pixel_points(polygon);
    match points.len() {
        0 => {}
        1 => {
            let p = points[0];
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < map.width() && (p.y as u32) < map.height() {
                map.put_pixel(p.x as u32, p.y as u32, Luma([value]));
            }
        }
        _ => drawing::draw_polygon_mut(map, &points, Luma([value])),
    }
}

/// Scales to `[0, 1]`, subtracts the ImageNet mean, divides by the std and
/// lays the result out as CHW.
pub fn normalize_image(image: &RgbImage) -> Vec<f32> {
    let plane = (image.width() * image.height()) as usize;
    let mut values = vec![0f32; 3 * plane];
    if plane == 0 {
        return values;
    }
    values
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(c, channel)| {
            for (n, pixel) in image.pixels().enumerate() {
                channel[n] = (pixel.0[c] as f32 / 255. - IMAGE_MEAN[c]) / IMAGE_STD[c];
            }
        });
    values
}

pub fn denormalize_image(values: &[f32], width: u32, height: u32) -> Result<RgbImage> {
    let plane = (width * height) as usize;
    if values.len() != 3 * plane {
        return Err(anyhow!(
            "expected {} values for a {}x{} image, got {}",
            3 * plane,
            width,
            height,
            values.len()
        ));
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let n = (y * width + x) as usize;
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let v = (values[c * plane + n] * IMAGE_STD[c] + IMAGE_MEAN[c]) * 255.;
            rgb[c] = clamp(v.round(), 0., 255.) as u8;
        }
        Rgb(rgb)
    }))
}

pub fn convert_image_to_tensor(values: &[f32], width: u32, height: u32) -> Tensor {
    Tensor::from_slice(values).view([3, height as i64, width as i64])
}

pub fn convert_map_to_tensor(map: &FloatMap) -> Tensor {
    Tensor::from_slice(map.as_raw()).view([map.height() as i64, map.width() as i64])
}

/// Converts a tensor whose last two dimensions are `(H, W)` and whose leading
/// dimensions are all 1 into a map.
pub fn convert_tensor_to_map(tensor: &Tensor) -> Result<FloatMap> {
    let size = tensor.size();
    if size.len() < 2 || size[..size.len() - 2].iter().any(|&d| d != 1) {
        return Err(anyhow!("expected a single (H, W) map, got shape {:?}", size));
    }
    let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view(-1);
    let values = Vec::<f32>::try_from(&flat)?;
    FloatMap::from_raw(w as u32, h as u32, values)
        .ok_or_else(|| anyhow!("tensor of shape {:?} doesn't fit a map", size))
}

/// Maps `[0, 1]` values onto `[0, 255]` gray levels.
pub fn convert_map_to_image(map: &FloatMap) -> GrayImage {
    GrayImage::from_fn(map.width(), map.height(), |x, y| {
        Luma([clamp(map.get_pixel(x, y).0[0] * 255., 0., 255.).round() as u8])
    })
}

pub fn save_map<P: AsRef<Path>>(map: &FloatMap, file_path: P) -> Result<()> {
    let file_path = file_path.as_ref();
    convert_map_to_image(map)
        .save(file_path)
        .with_context(|| format!("saving {}", file_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_polygon_test() {
        let mut map = FloatMap::new(10, 10);
        fill_polygon(
            &mut map,
            &[
                Point::new(2., 2.),
                Point::new(5., 2.),
                Point::new(5., 5.),
                Point::new(2., 5.),
            ],
            1.,
        );
        let filled = map.pixels().filter(|p| p.0[0] == 1.).count();
        assert_eq!(filled, 16);
        assert_eq!(map.get_pixel(3, 3).0[0], 1.);
        assert_eq!(map.get_pixel(6, 6).0[0], 0.);
    }

    #[test]
    fn fill_degenerate_polygons_test() {
        let mut map = FloatMap::new(4, 4);
        fill_polygon(&mut map, &[], 1.);
        fill_polygon(&mut map, &[Point::new(1.2, 2.7); 4], 1.);
        fill_polygon(&mut map, &[Point::new(40., 40.)], 1.);
        assert_eq!(map.get_pixel(1, 2).0[0], 1.);
        assert_eq!(map.pixels().filter(|p| p.0[0] == 1.).count(), 1);
    }

    #[test]
    fn normalize_and_denormalize_image() -> Result<()> {
        let image = RgbImage::from_fn(3, 2, |x, y| Rgb([(x * 80) as u8, (y * 100) as u8, 200]));
        let values = normalize_image(&image);
        assert_eq!(values.len(), 18);
        assert!((values[0] - (0. - IMAGE_MEAN[0]) / IMAGE_STD[0]).abs() < 1e-6);
        assert!((values[12] - (200. / 255. - IMAGE_MEAN[2]) / IMAGE_STD[2]).abs() < 1e-6);
        assert_eq!(denormalize_image(&values, 3, 2)?, image);
        assert!(denormalize_image(&values, 2, 2).is_err());
        Ok(())
    }

    #[test]
    fn map_tensor_conversion() -> Result<()> {
        let map = FloatMap::from_fn(4, 3, |x, y| Luma([(x + 10 * y) as f32]));
        let tensor = convert_map_to_tensor(&map);
        assert_eq!(tensor.size(), vec![3, 4]);
        assert_eq!(tensor.double_value(&[2, 1]), 21.);
        let back = convert_tensor_to_map(&tensor.view([1, 1, 3, 4]))?;
        assert_eq!(back, map);
        assert!(convert_tensor_to_map(&Tensor::zeros([2, 3, 4], (Kind::Float, Device::Cpu))).is_err());
        Ok(())
    }

    #[test]
    fn convert_map_to_image_test() {
        let map = FloatMap::from_raw(3, 1, vec![0., 0.5, 2.]).unwrap();
        let image = convert_map_to_image(&map);
        assert_eq!(image.as_raw(), &vec![0u8, 128, 255]);
    }
}

use image::imageops::{self, colorops, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use num_traits::clamp;
use rand::seq::SliceRandom;
use rand::Rng;

/// An image transformation applied before rasterization. Implementations may
/// be random; they are shared by the loader workers.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, image: RgbImage) -> RgbImage;
}

#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn ImageTransform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn ImageTransform>>) -> Self {
        Self { transforms }
    }
}

impl ImageTransform for Compose {
    fn apply(&self, image: RgbImage) -> RgbImage {
        self.transforms
            .iter()
            .fold(image, |image, transform| transform.apply(image))
    }
}

/// Resizes to exactly `height x width`, ignoring the aspect ratio.
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    pub height: u32,
    pub width: u32,
}

impl ImageTransform for Resize {
    fn apply(&self, image: RgbImage) -> RgbImage {
        if image.width() == self.width && image.height() == self.height {
            return image;
        }
        imageops::resize(&image, self.width, self.height, FilterType::Triangle)
    }
}

/// Randomly changes brightness, contrast, saturation and hue. Each factor is
/// drawn from `[1 - v, 1 + v]` (hue from `[-v, v]` of a full turn) and the
/// four adjustments run in random order.
#[derive(Debug, Clone, Copy)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.3,
            contrast: 0.2,
            saturation: 0.2,
            hue: 0.2,
        }
    }
}

fn gray_level(p: &Rgb<u8>) -> f32 {
    0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32
}

fn blend(image: &mut RgbImage, factor: f32, other: impl Fn(&Rgb<u8>) -> f32) {
    for pixel in image.pixels_mut() {
        let base = other(pixel);
        for c in pixel.0.iter_mut() {
            *c = clamp(factor * *c as f32 + (1. - factor) * base, 0., 255.).round() as u8;
        }
    }
}

pub fn adjust_brightness(image: &mut RgbImage, factor: f32) {
    blend(image, factor, |_| 0.);
}

pub fn adjust_contrast(image: &mut RgbImage, factor: f32) {
    let count = (image.width() * image.height()).max(1) as f32;
    let mean = image.pixels().map(gray_level).sum::<f32>() / count;
    blend(image, factor, |_| mean);
}

pub fn adjust_saturation(image: &mut RgbImage, factor: f32) {
    blend(image, factor, gray_level);
}

fn sample_factor<R: Rng>(rng: &mut R, spread: f32) -> f32 {
    if spread <= 0. {
        1.
    } else {
        rng.gen_range((1. - spread).max(0.)..=1. + spread)
    }
}

impl ImageTransform for ColorJitter {
    fn apply(&self, mut image: RgbImage) -> RgbImage {
        let mut rng = rand::thread_rng();
        let mut order = [0, 1, 2, 3];
        order.shuffle(&mut rng);
        for step in order {
            match step {
                0 => adjust_brightness(&mut image, sample_factor(&mut rng, self.brightness)),
                1 => adjust_contrast(&mut image, sample_factor(&mut rng, self.contrast)),
                2 => adjust_saturation(&mut image, sample_factor(&mut rng, self.saturation)),
                _ => {
                    let degrees = if self.hue > 0. {
                        (rng.gen_range(-self.hue..=self.hue) * 360.).round() as i32
                    } else {
                        0
                    };
                    if degrees != 0 {
                        image = colorops::huerotate(&image, degrees);
                    }
                }
            }
        }
        image
    }
}

/// Equalizes the histogram of every channel with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct RandomEqualize {
    pub p: f64,
}

pub fn equalize(image: &RgbImage) -> RgbImage {
    let channels = (0..3)
        .map(|c| {
            let channel = GrayImage::from_fn(image.width(), image.height(), |x, y| {
                Luma([image.get_pixel(x, y).0[c]])
            });
            equalize_histogram(&channel)
        })
        .collect::<Vec<GrayImage>>();
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        Rgb([
            channels[0].get_pixel(x, y).0[0],
            channels[1].get_pixel(x, y).0[0],
            channels[2].get_pixel(x, y).0[0],
        ])
    })
}

impl ImageTransform for RandomEqualize {
    fn apply(&self, image: RgbImage) -> RgbImage {
        if rand::thread_rng().gen::<f64>() < self.p {
            equalize(&image)
        } else {
            image
        }
    }
}

/// Gaussian blur with a sigma drawn from `sigma`; the sigma is capped so that
/// the 3-sigma support fits a `kernel_size` window.
#[derive(Debug, Clone, Copy)]
pub struct GaussianBlur {
    pub kernel_size: u32,
    pub sigma: (f32, f32),
}

impl GaussianBlur {
    pub fn new(kernel_size: u32) -> Self {
        Self {
            kernel_size,
            sigma: (0.1, 2.),
        }
    }

    fn max_sigma(&self) -> f32 {
        (self.kernel_size.saturating_sub(1) as f32 / 6.).min(self.sigma.1)
    }
}

impl ImageTransform for GaussianBlur {
    fn apply(&self, image: RgbImage) -> RgbImage {
        let max_sigma = self.max_sigma();
        if max_sigma <= 0. {
            return image;
        }
        let min_sigma = self.sigma.0.min(max_sigma);
        let sigma = rand::thread_rng().gen_range(min_sigma..=max_sigma);
        gaussian_blur_f32(&image, sigma)
    }
}

/// Augmentations used on the training split.
pub fn train_transforms(height: u32, width: u32) -> Compose {
    Compose::new(vec![
        Box::new(Resize { height, width }),
        Box::new(ColorJitter::default()),
        Box::new(RandomEqualize { p: 0.3 }),
        Box::new(GaussianBlur::new(21)),
    ])
}

pub fn val_transforms(height: u32, width: u32) -> Compose {
    Compose::new(vec![Box::new(Resize { height, width })])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10 % 256) as u8, (y * 20 % 256) as u8, 100])
        })
    }

    #[test]
    fn resize_test() {
        let resized = Resize {
            height: 32,
            width: 64,
        }
        .apply(gradient(100, 50));
        assert_eq!(resized.dimensions(), (64, 32));
    }

    #[test]
    fn compose_keeps_order() {
        let image = Compose::new(vec![
            Box::new(Resize {
                height: 10,
                width: 20,
            }),
            Box::new(Resize {
                height: 16,
                width: 16,
            }),
        ])
        .apply(gradient(40, 40));
        assert_eq!(image.dimensions(), (16, 16));
    }

    #[test]
    fn neutral_color_jitter_is_identity() {
        let image = gradient(12, 12);
        let jitter = ColorJitter {
            brightness: 0.,
            contrast: 0.,
            saturation: 0.,
            hue: 0.,
        };
        assert_eq!(jitter.apply(image.clone()), image);
    }

    #[test]
    fn brightness_and_saturation_test() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([100, 50, 200]));
        adjust_brightness(&mut image, 0.5);
        assert_eq!(image.get_pixel(0, 0), &Rgb([50, 25, 100]));

        let mut image = RgbImage::from_pixel(2, 2, Rgb([100, 50, 200]));
        adjust_saturation(&mut image, 0.);
        let p = image.get_pixel(1, 1);
        assert_eq!(p.0[0], p.0[1]);
        assert_eq!(p.0[1], p.0[2]);
    }

    #[test]
    fn contrast_zero_gives_mean() {
        let mut image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([200, 200, 200])
            }
        });
        adjust_contrast(&mut image, 0.);
        assert_eq!(image.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([100, 100, 100]));
    }

    #[test]
    fn equalize_keeps_dimensions() {
        let image = gradient(30, 20);
        let equalized = RandomEqualize { p: 1. }.apply(image.clone());
        assert_eq!(equalized.dimensions(), image.dimensions());
        assert_eq!(RandomEqualize { p: 0. }.apply(image.clone()), image);
    }

    #[test]
    fn gaussian_blur_test() {
        let blur = GaussianBlur::new(21);
        assert!((blur.max_sigma() - 2.).abs() < f32::EPSILON);
        assert!((GaussianBlur::new(7).max_sigma() - 1.).abs() < f32::EPSILON);
        assert_eq!(blur.apply(gradient(16, 12)).dimensions(), (16, 12));
        let unchanged = GaussianBlur::new(1).apply(gradient(8, 8));
        assert_eq!(unchanged, gradient(8, 8));
    }

    #[test]
    fn train_and_val_transforms_resize() {
        let image = gradient(50, 70);
        assert_eq!(train_transforms(64, 32).apply(image.clone()).dimensions(), (32, 64));
        assert_eq!(val_transforms(64, 32).apply(image).dimensions(), (32, 64));
    }
}

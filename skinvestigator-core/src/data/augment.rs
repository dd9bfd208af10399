//! Random per-sample image augmentation.

use image::RgbImage;
use image::imageops;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Augmentations applied to each decoded sample before rescaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    /// Mirror left/right with probability 0.5.
    pub horizontal_flip: bool,
    /// Mirror top/bottom with probability 0.5.
    pub vertical_flip: bool,
    /// Multiply pixel intensities by a factor drawn uniformly from this range.
    pub brightness_range: Option<(f32, f32)>,
}

impl Augmentation {
    /// Rescale only.
    pub fn none() -> Self {
        Self {
            horizontal_flip: false,
            vertical_flip: false,
            brightness_range: None,
        }
    }

    /// Both flips plus brightness jitter in `[0.8, 1.2]`.
    pub fn standard() -> Self {
        Self {
            horizontal_flip: true,
            vertical_flip: true,
            brightness_range: Some((0.8, 1.2)),
        }
    }

    pub fn is_identity(&self) -> bool {
        !self.horizontal_flip && !self.vertical_flip && self.brightness_range.is_none()
    }

    /// Apply the enabled transforms to `img` in place.
    pub fn apply<R: Rng + ?Sized>(&self, img: &mut RgbImage, rng: &mut R) {
        if self.horizontal_flip && rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(img);
        }
        if self.vertical_flip && rng.gen_bool(0.5) {
            imageops::flip_vertical_in_place(img);
        }
        if let Some((low, high)) = self.brightness_range {
            let factor = if high > low {
                rng.gen_range(low..high)
            } else {
                low
            };
            adjust_brightness(img, factor);
        }
    }
}

impl Default for Augmentation {
    fn default() -> Self {
        Self::none()
    }
}

/// Scale every channel by `factor`, saturating at the 8-bit range.
pub fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (f32::from(*channel) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gradient() -> RgbImage {
        RgbImage::from_fn(4, 4, |x, y| Rgb([(x * 40) as u8, (y * 40) as u8, 200]))
    }

    #[test]
    fn test_none_is_identity() {
        let mut img = gradient();
        let mut rng = StdRng::seed_from_u64(1);
        Augmentation::none().apply(&mut img, &mut rng);
        assert_eq!(img, gradient());
        assert!(Augmentation::none().is_identity());
        assert!(!Augmentation::standard().is_identity());
    }

    #[test]
    fn test_brightness_saturates() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([250, 100, 0]));
        adjust_brightness(&mut img, 1.2);
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 120, 0]));
    }

    #[test]
    fn test_standard_changes_some_samples() {
        let mut rng = StdRng::seed_from_u64(7);
        let changed = (0..20)
            .filter(|_| {
                let mut img = gradient();
                Augmentation::standard().apply(&mut img, &mut rng);
                img != gradient()
            })
            .count();
        assert!(changed > 0);
    }
}

//! Coarse visual signatures.
//!
//! A signature is an area-averaged `side × side` grayscale thumbnail,
//! flattened and L2-normalized. It is cheap enough to compute on every
//! sampled frame and is used only for ranking and stability checks, never
//! for the final match decision.

use crate::types::cosine_similarity;
use image::{imageops, DynamicImage, GrayImage};

pub const DEFAULT_SIGNATURE_SIDE: u32 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    values: Vec<f32>,
}

impl Signature {
    /// Build a signature from a grayscale image.
    pub fn from_luma(gray: &GrayImage, side: u32) -> Self {
        if gray.width() == 0 || gray.height() == 0 || side == 0 {
            return Self { values: Vec::new() };
        }
        let thumb = imageops::thumbnail(gray, side, side);
        let raw = thumb.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        Self::from_values(raw)
    }

    /// Build a signature from any decoded image.
    pub fn from_image(image: &DynamicImage, side: u32) -> Self {
        Self::from_luma(&image.to_luma8(), side)
    }

    /// Normalize raw values into a signature. A zero vector stays zero.
    pub fn from_values(mut values: Vec<f32>) -> Self {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in values.iter_mut() {
                *v /= norm;
            }
        }
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1].
    pub fn similarity(&self, other: &Signature) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Population variance of the normalized values.
    ///
    /// Near zero for uniform (empty or low-contrast) frames; used as the
    /// presence metric by the stability detector.
    pub fn variance(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let n = self.values.len() as f32;
        let mean = self.values.iter().sum::<f32>() / n;
        self.values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(width: u32, height: u32, offset: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([((x * 3 + y * 5 + offset) % 256) as u8]))
    }

    #[test]
    fn test_signature_has_side_squared_values() {
        let sig = Signature::from_luma(&gradient(64, 48, 0), DEFAULT_SIGNATURE_SIDE);
        assert_eq!(sig.len(), 256);
    }

    #[test]
    fn test_signature_is_unit_norm() {
        let sig = Signature::from_luma(&gradient(64, 64, 7), 16);
        let norm = sig.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm = {norm}");
    }

    #[test]
    fn test_identical_images_have_similarity_one() {
        let a = Signature::from_luma(&gradient(32, 32, 0), 16);
        let b = Signature::from_luma(&gradient(32, 32, 0), 16);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_image_has_zero_variance() {
        let flat = Signature::from_luma(&GrayImage::from_pixel(40, 40, Luma([180])), 16);
        assert!(flat.variance() < 1e-9);

        let textured = Signature::from_luma(&gradient(40, 40, 0), 16);
        assert!(textured.variance() > 1e-5);
    }

    #[test]
    fn test_black_image_is_zero_vector() {
        let black = Signature::from_luma(&GrayImage::from_pixel(16, 16, Luma([0])), 16);
        assert!(black.values().iter().all(|&v| v == 0.0));
        assert_eq!(black.variance(), 0.0);
    }

    #[test]
    fn test_empty_image() {
        let sig = Signature::from_luma(&GrayImage::new(0, 0), 16);
        assert!(sig.is_empty());
        assert_eq!(sig.variance(), 0.0);
    }
}

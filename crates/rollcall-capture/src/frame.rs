//! Frame type and grayscale helpers: decoding, brightness and dark detection.

use image::{DynamicImage, GrayImage};
use std::sync::Arc;
use tokio::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DEFAULT_DARK_THRESHOLD: f32 = 0.95;

/// A captured camera frame.
///
/// The decoded image is shared behind an `Arc` so a frame can be handed to
/// the matcher (and onward to the descriptor oracle) without copying pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<DynamicImage>,
    /// Monotonic per-source sequence number, starting at 0.
    pub sequence: u32,
    pub captured_at: Instant,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a decoded image, classifying it as dark or not.
    pub fn new(image: DynamicImage, sequence: u32, dark_threshold: f32) -> Self {
        let is_dark = is_dark_frame(image.to_luma8().as_raw(), dark_threshold);
        Self {
            image: Arc::new(image),
            sequence,
            captured_at: Instant::now(),
            is_dark,
        }
    }

    /// Grayscale view of the frame.
    pub fn luma(&self) -> GrayImage {
        self.image.to_luma8()
    }

    /// Average pixel brightness (0.0 to 255.0).
    pub fn avg_brightness(&self) -> f32 {
        let gray = self.luma();
        let data = gray.as_raw();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }
}

/// Decode an encoded image (PNG, JPEG, ...) from memory.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Whether a grayscale buffer is too dark to contain a usable face.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// bucket (0 to 31) of an 8-bucket histogram.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    let Some(total) = std::num::NonZeroUsize::new(gray.len()) else {
        return true;
    };
    let bottom_bucket = gray.iter().filter(|&&p| p >> 5 == 0).count();
    bottom_bucket as f32 / total.get() as f32 > threshold_pct
}

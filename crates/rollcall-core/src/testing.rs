//! Test doubles shared by the unit tests.

use crate::error::OracleError;
use crate::oracle::{DescriptorOracle, Extraction};
use crate::types::Descriptor;
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A textured grayscale image whose top-left pixel carries `marker`.
///
/// `pattern` changes the texture so different people get different
/// signatures; the marker lets [`ScriptedOracle`] recognize the image.
pub fn face_image(marker: u8, pattern: u32) -> DynamicImage {
    let mut gray = GrayImage::from_fn(64, 64, |x, y| {
        Luma([(((x * (pattern + 1)) ^ (y * (pattern + 3))) % 200 + 30) as u8])
    });
    gray.put_pixel(0, 0, Luma([marker]));
    DynamicImage::ImageLuma8(gray)
}

pub fn png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Oracle that answers by looking up the image's marker pixel.
#[derive(Default)]
pub struct ScriptedOracle {
    faces: Mutex<HashMap<u8, Extraction>>,
    failing: Mutex<bool>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn face(self, marker: u8, values: Vec<f32>) -> Self {
        self.faces_with_count(marker, values, 1)
    }

    pub fn faces_with_count(self, marker: u8, values: Vec<f32>, face_count: usize) -> Self {
        self.faces.lock().unwrap().insert(
            marker,
            Extraction {
                descriptor: Descriptor::new(values),
                face_count,
            },
        );
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptorOracle for ScriptedOracle {
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Extraction>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(OracleError::Unavailable("scripted outage".into()));
        }
        let marker = image.to_luma8().get_pixel(0, 0)[0];
        Ok(self.faces.lock().unwrap().get(&marker).cloned())
    }
}

//! Decoding of inline image payloads and pixel-budget downscaling.

use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use tracing::debug;

use crate::error::ServiceError;

/// 1024 x 1024.
pub const DEFAULT_MAX_PIXELS: u64 = 1024 * 1024;

/// Standard alphabet, padding optional: browsers and scripts disagree on it.
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy)]
pub struct ImageNormalizer {
    pub max_pixels: u64,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl ImageNormalizer {
    pub fn new(max_pixels: u64) -> Self {
        Self {
            max_pixels: max_pixels.max(1),
        }
    }

    /// Target size for a `width` x `height` image, or `None` when it already
    /// fits the budget.
    pub fn target_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let area = u64::from(width) * u64::from(height);
        if area <= self.max_pixels {
            return None;
        }

        let scale = (self.max_pixels as f64 / area as f64).sqrt();
        let mut new_w = ((f64::from(width) * scale).floor() as u32).max(1);
        let mut new_h = ((f64::from(height) * scale).floor() as u32).max(1);

        // Clamping to one pixel or float rounding can overshoot the budget.
        while u64::from(new_w) * u64::from(new_h) > self.max_pixels {
            if new_w >= new_h && new_w > 1 {
                new_w -= 1;
            } else if new_h > 1 {
                new_h -= 1;
            } else {
                break;
            }
        }

        Some((new_w, new_h))
    }

    /// Downscale `image` with a bicubic filter so that `w*h <= max_pixels`.
    pub fn normalize(&self, image: RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        match self.target_size(width, height) {
            None => image,
            Some((new_w, new_h)) => {
                debug!(width, height, new_w, new_h, "downscaling image to pixel budget");
                image::imageops::resize(&image, new_w, new_h, FilterType::CatmullRom)
            }
        }
    }

    /// Decode a request payload and bring it within the pixel budget.
    pub fn decode_and_normalize(&self, payload: &str) -> Result<RgbImage, ServiceError> {
        let image = decode_payload(payload)?;
        Ok(self.normalize(image))
    }
}

/// Decode a base64 image, optionally prefixed as a data URI
/// (`data:image/png;base64,...`), into an RGB bitmap.
pub fn decode_payload(payload: &str) -> Result<RgbImage, ServiceError> {
    let encoded = payload.rsplit(',').next().unwrap_or(payload);
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = LENIENT_STANDARD.decode(compact.as_bytes())?;
    let image = image::load_from_memory(&bytes)?;
    debug!(
        width = image.width(),
        height = image.height(),
        bytes = bytes.len(),
        "decoded request image"
    );
    Ok(into_rgb(image))
}

fn into_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

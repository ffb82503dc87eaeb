//! Decoded video frames and JPEG encoding.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};

use crate::error::PipelineError;

/// Frames larger than this are rejected before decode.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// One decoded RGB frame, owned by the session that pulled it.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: Utc::now(),
        }
    }

    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self::new(RgbImage::new(width, height), seq)
    }

    /// Wrap packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("invalid RGB buffer"))?;
        Ok(Self::new(image, seq))
    }

    pub fn decode_jpeg(bytes: &[u8], seq: u64) -> Result<Self> {
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg of {} bytes exceeds limit", bytes.len()));
        }
        let image = image::load_from_memory(bytes).context("decode jpeg")?;
        Ok(Self::new(image.into_rgb8(), seq))
    }

    /// Same capture metadata, different pixels.
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            image,
            seq: self.seq,
            captured_at: self.captured_at,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> std::result::Result<Vec<u8>, PipelineError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::EncodeFailed("empty image".into()));
    }
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|err| PipelineError::EncodeFailed(err.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_encode_then_decode_keeps_dimensions() {
        let frame = Frame::blank(32, 16, 1);
        let jpeg = encode_jpeg(frame.image(), DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = Frame::decode_jpeg(&jpeg, 2).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn rgb_length_mismatch_is_rejected() {
        assert!(Frame::from_rgb(vec![0; 10], 2, 2, 0).is_err());
        assert!(Frame::from_rgb(vec![0; 12], 2, 2, 0).is_ok());
    }

    #[test]
    fn empty_image_fails_encode_as_skip_tick() {
        let err = encode_jpeg(&RgbImage::new(0, 0), 80).unwrap_err();
        assert_eq!(err.disposition(), crate::error::Disposition::SkipTick);
    }
}

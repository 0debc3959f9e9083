//! JPEG thumbnails for uploaded photos.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};

use crate::config::ThumbnailConfig;

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("Image read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Thumbnail task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(&self, image: Bytes) -> Result<Bytes, ThumbnailError>;
}

/// Orientation-corrected, centre-cropped square JPEG.
#[derive(Debug, Clone)]
pub struct JpegThumbnailer {
    size: u32,
    quality: u8,
}

impl JpegThumbnailer {
    pub fn new(size: u32, quality: u8) -> Self {
        Self { size: size.max(1), quality: quality.clamp(1, 100) }
    }

    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::new(config.size, config.quality)
    }
}

impl Default for JpegThumbnailer {
    fn default() -> Self {
        Self::from_config(&ThumbnailConfig::default())
    }
}

#[async_trait]
impl ThumbnailGenerator for JpegThumbnailer {
    async fn generate(&self, image: Bytes) -> Result<Bytes, ThumbnailError> {
        let (size, quality) = (self.size, self.quality);
        // Decoding and resizing are CPU bound.
        tokio::task::spawn_blocking(move || render(&image, size, quality))
            .await
            .map_err(|e| ThumbnailError::Task(e.to_string()))?
            .map(Bytes::from)
    }
}

fn render(data: &[u8], size: u32, quality: u8) -> Result<Vec<u8>, ThumbnailError> {
    let mut decoder = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);

    let thumb = img.resize_to_fill(size, size, FilterType::Triangle);
    let mut out = Vec::new();
    thumb
        .to_rgb8()
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out)
}

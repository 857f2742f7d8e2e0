//! Image codec adapter.
//!
//! Loads source images, JPEG-compresses them at a given quality and decodes
//! received payloads back into RGB frames.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageFormat, Rgb, RgbImage};
use rand::Rng;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::protocol::Resolution;

/// Decoded pixel buffer (RGB8)
#[derive(Debug, Clone)]
pub struct RawFrame {
    image: RgbImage,
}

impl RawFrame {
    /// Load a stored image (JPEG or PNG) from disk
    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?
            .to_rgb8();
        Ok(Self { image })
    }

    /// Random RGB noise, the worst case for JPEG
    pub fn noise(width: u32, height: u32) -> Self {
        let mut rng = rand::thread_rng();
        let image = RgbImage::from_fn(width, height, |_, _| Rgb(rng.gen()));
        Self { image }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image.width(), self.image.height())
    }

    /// Resize to `target`, or return a copy when already that size
    pub fn resized(&self, target: Resolution) -> RawFrame {
        if self.resolution() == target {
            return self.clone();
        }
        let image = image::imageops::resize(&self.image, target.width, target.height, FilterType::Triangle);
        Self { image }
    }
}

/// JPEG output of one encode call
#[derive(Debug)]
pub struct CompressedFrame {
    pub data: Vec<u8>,
    pub quality: u8,
    pub resolution: Resolution,
}

impl CompressedFrame {
    pub fn size_kb(&self) -> f64 {
        self.data.len() as f64 / 1024.0
    }
}

/// JPEG encode a frame. Quality is clamped to 1..=100.
pub fn encode(frame: &RawFrame, quality: u8) -> Result<(CompressedFrame, Duration)> {
    let start = Instant::now();
    let quality = quality.clamp(1, 100);

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    frame
        .image
        .write_with_encoder(encoder)
        .map_err(|e| anyhow::anyhow!("JPEG encode failed: {}", e))?;

    let compressed = CompressedFrame {
        data: buf.into_inner(),
        quality,
        resolution: frame.resolution(),
    };
    Ok((compressed, start.elapsed()))
}

/// Decode a JPEG payload
pub fn decode(data: &[u8]) -> Result<RawFrame> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| anyhow::anyhow!("JPEG decode failed: {}", e))?
        .to_rgb8();
    Ok(RawFrame { image })
}

/// Write a frame to disk as JPEG
pub fn save_jpeg(frame: &RawFrame, path: &Path, quality: u8) -> Result<()> {
    let (compressed, _) = encode(frame, quality)?;
    std::fs::write(path, compressed.data)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

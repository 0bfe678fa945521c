//! Captured frames.
//!
//! A `Frame` owns tightly packed RGB24 pixels. Capture sources produce frames,
//! the orchestrator hands them to detection capabilities, the recorder writes
//! them to an incident sink, and the output stream carries them JPEG-encoded.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in full-resolution pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Map a rectangle found on a frame resized by `factor` back to the source frame.
    pub fn unscale(&self, factor: f32) -> Self {
        if factor <= 0.0 {
            return *self;
        }
        let map = |v: i32| (v as f32 / factor) as i32;
        Self {
            left: map(self.left),
            top: map(self.top),
            width: map(self.width),
            height: map(self.height),
        }
    }

    pub fn right(&self) -> i32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.top.saturating_add(self.height)
    }
}

/// RGB color used for overlays.
pub type Rgb = [u8; 3];

#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Build a frame from packed RGB24 pixels.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    /// Decode an encoded still image (jpeg, png, webp).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode image")?;
        Ok(Self::from_image(image.into_rgb8()))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Resize by a uniform factor. Returns a copy when the factor is 1.0.
    pub fn resize_by(&self, factor: f32) -> Result<Frame> {
        if factor <= 0.0 {
            return Err(anyhow!("resize factor must be positive, got {}", factor));
        }
        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);
        if width == self.width && height == self.height {
            return Frame::from_rgb(self.data.clone(), width, height);
        }
        let resized = image::imageops::resize(&self.to_image()?, width, height, FilterType::Triangle);
        Ok(Frame::from_image(resized))
    }

    /// Downscale so the width does not exceed `target_width`.
    ///
    /// Returns the scaled frame and the factor applied. Frames already at or
    /// below the target width are copied with factor 1.0.
    pub fn downscale_to_width(&self, target_width: u32) -> Result<(Frame, f32)> {
        let factor = target_width as f32 / self.width.max(1) as f32;
        if factor >= 1.0 {
            return Ok((Frame::from_rgb(self.data.clone(), self.width, self.height)?, 1.0));
        }
        Ok((self.resize_by(factor)?, factor))
    }

    /// Copy the region under `rect`, clipped to the frame. `None` when empty.
    pub fn crop(&self, rect: &FaceRect) -> Option<Frame> {
        let x0 = rect.left.clamp(0, self.width as i32) as u32;
        let y0 = rect.top.clamp(0, self.height as i32) as u32;
        let x1 = rect.right().clamp(0, self.width as i32) as u32;
        let y1 = rect.bottom().clamp(0, self.height as i32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let (w, h) = (x1 - x0, y1 - y0);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in y0..y1 {
            let start = ((y * self.width + x0) * 3) as usize;
            let end = start + (w * 3) as usize;
            data.extend_from_slice(&self.data[start..end]);
        }
        Frame::from_rgb(data, w, h).ok()
    }

    /// Draw an unfilled box. Only the part inside the frame is painted.
    pub fn draw_box(&mut self, rect: &FaceRect, color: Rgb, thickness: u32) {
        let (w, h) = (self.width as i64, self.height as i64);
        let (left, top) = (rect.left as i64, rect.top as i64);
        let (right, bottom) = (rect.right() as i64, rect.bottom() as i64);
        if right < left || bottom < top || right < 0 || bottom < 0 || left >= w || top >= h {
            return;
        }
        let t = thickness.max(1) as i64;
        for y in top.max(0)..=bottom.min(h - 1) {
            let horizontal_edge = y - top < t || bottom - y < t;
            for x in left.max(0)..=right.min(w - 1) {
                if horizontal_edge || x - left < t || right - x < t {
                    let idx = ((y * w + x) * 3) as usize;
                    self.data[idx..idx + 3].copy_from_slice(&color);
                }
            }
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("jpeg encode")?;
        Ok(out)
    }

    /// JPEG-encode and wrap in standard base64 for the output stream.
    pub fn encode_base64_jpeg(&self, quality: u8) -> Result<String> {
        let jpeg = self.encode_jpeg(quality)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

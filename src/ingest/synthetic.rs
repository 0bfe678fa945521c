//! Synthetic source (`stub://`) for tests and demos.
//!
//! Renders a flat backdrop with a bright block that sweeps across the frame,
//! plus a little sensor noise so consecutive frames are never identical.

use anyhow::Result;
use rand::Rng;

use super::SourceStats;
use crate::config::CameraSettings;
use crate::frame::Frame;

const BACKDROP: u8 = 60;
const NOISE: u8 = 6;

pub struct SyntheticSource {
    settings: CameraSettings,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!("camera: connected to {} (synthetic)", self.settings.url);
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.render();
        Frame::from_rgb(pixels, self.settings.width, self.settings.height)
    }

    fn render(&self) -> Vec<u8> {
        let width = self.settings.width as usize;
        let height = self.settings.height as usize;
        let block = (width.min(height) / 4).max(1);
        let span = width.saturating_sub(block).max(1);
        let block_x = (self.frame_count as usize * 4) % span;
        let block_y = height.saturating_sub(block) / 2;

        let mut rng = rand::thread_rng();
        let mut pixels = vec![0u8; width * height * 3];
        for y in 0..height {
            for x in 0..width {
                let inside = x >= block_x && x < block_x + block && y >= block_y && y < block_y + block;
                let base = if inside { 200 } else { BACKDROP };
                let offset = (y * width + x) * 3;
                for c in 0..3 {
                    pixels[offset + c] = base.saturating_add(rng.gen_range(0..=NOISE));
                }
            }
        }
        pixels
    }

    pub fn is_healthy(&self) -> bool {
        true
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }
}

use anyhow::Result;
use image::imageops::FilterType;
use image::{GrayImage, Luma};

use crate::detect::backend::{FaceDetector, FaceEncoder};
use crate::detect::result::Signature;
use crate::frame::{FaceRect, Frame};

const PATCH_SIDE: u32 = 16;
const CELL: u32 = 8;
const MIN_SKIN_SHARE: f32 = 0.5;
const MIN_FILL: f32 = 0.4;
const ASPECT_RANGE: (f32, f32) = (0.6, 2.5);

/// CPU face detector.
///
/// Splits the frame into 8x8 cells, marks cells where most pixels fall in
/// the YCbCr skin range, and reports each connected blob of skin cells that
/// is large enough and roughly face-shaped. Largest blob first.
pub struct SkinRegionDetector {
    min_cells: usize,
}

impl Default for SkinRegionDetector {
    fn default() -> Self {
        Self { min_cells: 4 }
    }
}

impl SkinRegionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn skin_grid(frame: &Frame, cols: u32, rows: u32) -> Vec<bool> {
        let px = frame.pixels();
        let mut grid = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let mut skin = 0u32;
                for y in row * CELL..(row + 1) * CELL {
                    for x in col * CELL..(col + 1) * CELL {
                        let i = ((y * frame.width + x) * 3) as usize;
                        if is_skin(px[i], px[i + 1], px[i + 2]) {
                            skin += 1;
                        }
                    }
                }
                grid.push(skin as f32 >= MIN_SKIN_SHARE * (CELL * CELL) as f32);
            }
        }
        grid
    }
}

fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

impl FaceDetector for SkinRegionDetector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRect>> {
        let (cols, rows) = (frame.width / CELL, frame.height / CELL);
        if cols == 0 || rows == 0 {
            return Ok(Vec::new());
        }
        let mut grid = Self::skin_grid(frame, cols, rows);
        let (cols, rows) = (cols as usize, rows as usize);

        let mut faces = Vec::new();
        for start in 0..grid.len() {
            if !grid[start] {
                continue;
            }
            // Flood fill, clearing cells as they are claimed.
            grid[start] = false;
            let mut stack = vec![start];
            let (mut c0, mut c1, mut r0, mut r1) = (cols, 0, rows, 0);
            let mut cells = 0usize;
            while let Some(i) = stack.pop() {
                let (c, r) = (i % cols, i / cols);
                cells += 1;
                c0 = c0.min(c);
                c1 = c1.max(c);
                r0 = r0.min(r);
                r1 = r1.max(r);
                let mut visit = |j: usize| {
                    if grid[j] {
                        grid[j] = false;
                        stack.push(j);
                    }
                };
                if c > 0 {
                    visit(i - 1);
                }
                if c + 1 < cols {
                    visit(i + 1);
                }
                if r > 0 {
                    visit(i - cols);
                }
                if r + 1 < rows {
                    visit(i + cols);
                }
            }

            let (w, h) = (c1 - c0 + 1, r1 - r0 + 1);
            let aspect = h as f32 / w as f32;
            let fill = cells as f32 / (w * h) as f32;
            if cells < self.min_cells
                || fill < MIN_FILL
                || aspect < ASPECT_RANGE.0
                || aspect > ASPECT_RANGE.1
            {
                continue;
            }
            let cell = CELL as i32;
            faces.push(FaceRect::new(
                c0 as i32 * cell,
                r0 as i32 * cell,
                w as i32 * cell,
                h as i32 * cell,
            ));
        }
        faces.sort_by_key(|f| std::cmp::Reverse(f.width as i64 * f.height as i64));
        Ok(faces)
    }
}

/// CPU face encoder.
///
/// The face region is reduced to a 16x16 grayscale patch, centred on its mean
/// and scaled to unit length, so signatures compare by Euclidean distance in
/// `[0, 2]` and are insensitive to global brightness.
#[derive(Default)]
pub struct PatchEncoder;

impl PatchEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl FaceEncoder for PatchEncoder {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn encode(&mut self, frame: &Frame, rect: &FaceRect) -> Result<Option<Signature>> {
        let Some(region) = frame.crop(rect) else {
            return Ok(None);
        };
        let gray = GrayImage::from_fn(region.width, region.height, |x, y| {
            let i = ((y * region.width + x) * 3) as usize;
            let px = &region.pixels()[i..i + 3];
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            Luma([luma.round() as u8])
        });
        let patch = image::imageops::resize(&gray, PATCH_SIDE, PATCH_SIDE, FilterType::Triangle);

        let values: Vec<f32> = patch.pixels().map(|p| p.0[0] as f32).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let centred: Vec<f32> = values.iter().map(|v| v - mean).collect();
        let norm = centred.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            // Flat region, nothing to identify.
            return Ok(None);
        }
        Ok(Some(Signature(centred.iter().map(|v| v / norm).collect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, invert: bool) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) * 255 / (width + height)) as u8;
                let v = if invert { 255 - v } else { v };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::from_rgb(data, width, height).unwrap()
    }

    #[test]
    fn identical_regions_match_and_inverted_regions_do_not() -> Result<()> {
        let mut encoder = PatchEncoder::new();
        let rect = FaceRect::new(0, 0, 64, 64);
        let a = encoder.encode(&gradient(64, 64, false), &rect)?.unwrap();
        let b = encoder.encode(&gradient(64, 64, false), &rect)?.unwrap();
        let c = encoder.encode(&gradient(64, 64, true), &rect)?.unwrap();

        assert!(a.distance(&b) < 1e-4);
        assert!(a.distance(&c) > 1.5);
        Ok(())
    }

    const SKIN: [u8; 3] = [220, 170, 140];
    const WALL: [u8; 3] = [30, 60, 160];

    fn scene(width: u32, height: u32, face: Option<(u32, u32, u32, u32)>) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let inside = face
                    .map(|(fx, fy, fw, fh)| x >= fx && x < fx + fw && y >= fy && y < fy + fh)
                    .unwrap_or(false);
                data.extend_from_slice(if inside { &SKIN } else { &WALL });
            }
        }
        Frame::from_rgb(data, width, height).unwrap()
    }

    #[test]
    fn skin_blob_is_reported_as_a_face() -> Result<()> {
        let mut detector = SkinRegionDetector::new();
        let faces = detector.detect_faces(&scene(64, 64, Some((16, 8, 24, 32))))?;
        assert_eq!(faces, vec![FaceRect::new(16, 8, 24, 32)]);
        Ok(())
    }

    #[test]
    fn no_skin_or_tiny_frames_yield_nothing() -> Result<()> {
        let mut detector = SkinRegionDetector::new();
        assert!(detector.detect_faces(&scene(64, 64, None))?.is_empty());
        assert!(detector.detect_faces(&scene(4, 4, Some((0, 0, 4, 4))))?.is_empty());
        // A thin horizontal strip is not face-shaped.
        assert!(detector
            .detect_faces(&scene(64, 64, Some((0, 24, 64, 8))))?
            .is_empty());
        Ok(())
    }

    #[test]
    fn flat_region_has_no_signature() -> Result<()> {
        let frame = Frame::from_rgb(vec![90u8; 32 * 32 * 3], 32, 32)?;
        let mut encoder = PatchEncoder::new();
        assert!(encoder.encode(&frame, &FaceRect::new(0, 0, 32, 32))?.is_none());
        assert!(encoder.encode(&frame, &FaceRect::new(40, 40, 8, 8))?.is_none());
        Ok(())
    }
}

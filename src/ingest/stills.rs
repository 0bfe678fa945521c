//! Replays a directory of still images as a looping feed.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use super::SourceStats;
use crate::frame::Frame;

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct StillsSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl StillsSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
            frame_count: 0,
            last_error: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("read camera dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            let accepted = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if accepted {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no still images in {}", self.dir.display()));
        }
        files.sort();
        log::info!(
            "camera: replaying {} stills from {}",
            files.len(),
            self.dir.display()
        );
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        if self.files.is_empty() {
            return Err(anyhow!("stills source not connected"));
        }
        let path = &self.files[self.cursor];
        self.cursor = (self.cursor + 1) % self.files.len();

        let decoded = std::fs::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Frame::decode(&bytes))
            .with_context(|| format!("load still {}", path.display()));
        match decoded {
            Ok(frame) => {
                self.frame_count += 1;
                self.last_error = None;
                Ok(frame)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &std::path::Path, shade: u8) -> Result<()> {
        let image = image::RgbImage::from_pixel(4, 3, image::Rgb([shade, shade, shade]));
        image.save(path)?;
        Ok(())
    }

    #[test]
    fn loops_in_filename_order_and_reports_bad_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_png(&dir.path().join("a.png"), 10)?;
        write_png(&dir.path().join("b.png"), 200)?;
        std::fs::write(dir.path().join("c.jpg"), b"not a jpeg")?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = StillsSource::new(dir.path());
        source.connect()?;
        assert_eq!(source.next_frame()?.pixels()[0], 10);
        assert_eq!(source.next_frame()?.pixels()[0], 200);
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert_eq!(source.next_frame()?.pixels()[0], 10);
        assert!(source.is_healthy());
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn empty_directory_fails_to_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(StillsSource::new(dir.path()).connect().is_err());
        Ok(())
    }
}

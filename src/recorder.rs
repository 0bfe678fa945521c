//! Incident recording and upload.
//!
//! At most one recording is active. Stopping hands the finished file to a
//! detached upload worker and frees the recorder immediately, so a new
//! incident can start while earlier uploads are still in flight.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{RecordingSettings, RemoteSettings};
use crate::frame::Frame;
use crate::remote::RemoteHandles;
use crate::storage::{BlobStore, TableEntity, TableStore};

pub const INCIDENT_PARTITION: &str = "incidents";
pub const INCIDENT_STATUS_NEW: &str = "New";

pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. The file is complete once this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait SinkFactory: Send {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn VideoSink>>;

    fn extension(&self) -> &'static str;
}

/// Motion-JPEG: every frame is appended as a standalone JPEG.
pub struct MjpegSinkFactory {
    quality: u8,
}

impl MjpegSinkFactory {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl SinkFactory for MjpegSinkFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn VideoSink>> {
        let file = File::create(path)
            .with_context(|| format!("failed to create incident file {}", path.display()))?;
        log::debug!(
            "recorder: opened {} ({}x{} @ {:.1} fps)",
            path.display(),
            width,
            height,
            fps
        );
        Ok(Box::new(MjpegSink {
            writer: BufWriter::new(file),
            width,
            height,
            quality: self.quality,
        }))
    }

    fn extension(&self) -> &'static str {
        "mjpeg"
    }
}

struct MjpegSink {
    writer: BufWriter<File>,
    width: u32,
    height: u32,
    quality: u8,
}

impl VideoSink for MjpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame {}x{} does not match recording {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let jpeg = frame.encode_jpeg(self.quality)?;
        self.writer.write_all(&jpeg)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

struct ActiveRecording {
    sink: Box<dyn VideoSink>,
    path: PathBuf,
    filename: String,
    frames: u64,
}

pub struct IncidentRecorder {
    factory: Box<dyn SinkFactory>,
    temp_dir: PathBuf,
    active: Option<ActiveRecording>,
}

impl IncidentRecorder {
    pub fn new(factory: Box<dyn SinkFactory>, temp_dir: PathBuf) -> Self {
        Self {
            factory,
            temp_dir,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open a new recording. Returns `Ok(false)` without touching the sink
    /// when one is already active. A sink that fails to open leaves the
    /// recorder idle.
    pub fn start(&mut self, width: u32, height: u32, fps: f64) -> Result<bool> {
        if self.active.is_some() {
            return Ok(false);
        }
        let (path, filename) = self.fresh_path();
        let sink = self.factory.open(&path, width, height, fps)?;
        log::info!("recorder: started {}", filename);
        self.active = Some(ActiveRecording {
            sink,
            path,
            filename,
            frames: 0,
        });
        Ok(true)
    }

    fn fresh_path(&self) -> (PathBuf, String) {
        let stem = chrono::Local::now()
            .format("incident_%Y%m%d_%H%M%S")
            .to_string();
        let ext = self.factory.extension();
        let mut filename = format!("{}.{}", stem, ext);
        let mut n = 1;
        while self.temp_dir.join(&filename).exists() {
            filename = format!("{}_{}.{}", stem, n, ext);
            n += 1;
        }
        (self.temp_dir.join(&filename), filename)
    }

    /// Append a frame. No-op when idle.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match self.active.as_mut() {
            Some(active) => {
                active.sink.write_frame(frame)?;
                active.frames += 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close the active recording and hand it to `uploader` on a new thread.
    /// Without an uploader the file is discarded. No-op when idle.
    pub fn stop(&mut self, uploader: Option<IncidentUploader>) -> Option<JoinHandle<()>> {
        let active = self.active.take()?;
        log::info!(
            "recorder: stopped {} after {} frames",
            active.filename,
            active.frames
        );
        if let Err(err) = active.sink.finish() {
            log::error!("recorder: failed to finalize {}: {:#}", active.filename, err);
        }
        match uploader {
            Some(uploader) => {
                let ActiveRecording { path, filename, .. } = active;
                Some(std::thread::spawn(move || uploader.run(&path, &filename)))
            }
            None => {
                log::warn!(
                    "recorder: no remote storage; discarding {}",
                    active.filename
                );
                remove_incident_file(&active.path);
                None
            }
        }
    }
}

fn remove_incident_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("recorder: failed to remove {}: {}", path.display(), err);
        }
    }
}

/// Uploads one finished incident and registers its metadata row.
pub struct IncidentUploader {
    blobs: Arc<dyn BlobStore>,
    tables: Arc<dyn TableStore>,
    container: String,
    table: String,
    grace: Duration,
}

impl IncidentUploader {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        tables: Arc<dyn TableStore>,
        container: &str,
        table: &str,
        grace: Duration,
    ) -> Self {
        Self {
            blobs,
            tables,
            container: container.to_string(),
            table: table.to_string(),
            grace,
        }
    }

    pub fn from_handles(
        handles: &RemoteHandles,
        remote: &RemoteSettings,
        recording: &RecordingSettings,
    ) -> Self {
        Self::new(
            handles.blobs.clone(),
            handles.tables.clone(),
            &remote.incident_container,
            &remote.incident_table,
            recording.upload_grace,
        )
    }

    /// Wait out the grace period, upload, register, then delete the local
    /// file whatever happened. Failures are logged, never retried.
    pub fn run(self, path: &Path, filename: &str) {
        std::thread::sleep(self.grace);
        match self.upload(path, filename) {
            Ok(location) => log::info!("upload: {} stored at {}", filename, location),
            Err(err) => log::error!("upload: {} failed: {:#}", filename, err),
        }
        remove_incident_file(path);
    }

    fn upload(&self, path: &Path, filename: &str) -> Result<String> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read incident file {}", path.display()))?;
        let location = self
            .blobs
            .put(&self.container, filename, &data)
            .context("blob upload failed")?;

        let mut properties = serde_json::Map::new();
        properties.insert("Timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
        properties.insert("Status".into(), json!(INCIDENT_STATUS_NEW));
        properties.insert("VideoUrl".into(), json!(location));
        let entity = TableEntity {
            partition_key: INCIDENT_PARTITION.to_string(),
            row_key: filename.to_string(),
            properties,
        };
        self.tables
            .upsert(&self.table, &entity)
            .context("metadata write failed")?;
        Ok(location)
    }
}

/// When the current incident should end. Retriggering only ever moves it
/// later.
#[derive(Debug, Default, Clone, Copy)]
pub struct IncidentDeadline {
    deadline: Option<Instant>,
}

impl IncidentDeadline {
    pub fn trigger(&mut self, now: Instant, extension: Duration) -> Instant {
        let candidate = now + extension;
        let next = match self.deadline {
            Some(current) if current > candidate => current,
            _ => candidate,
        };
        self.deadline = Some(next);
        next
    }

    pub fn get(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_before(&self, now: Instant) -> bool {
        self.deadline.map(|d| now < d).unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

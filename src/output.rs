//! Per-frame output stream: one JSON record per line, flushed as written.

use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use crate::detect::ThreatDetection;
use crate::profiles::DetectionResult;
use crate::theme::Theme;

#[derive(Clone, Debug, Serialize)]
pub struct OutputRecord {
    /// Base64 JPEG of the (possibly annotated) frame.
    pub frame: Option<String>,
    pub results: Vec<DetectionResult>,
    pub threats: Vec<ThreatDetection>,
    pub theme: Theme,
    /// Seconds until the next identity sampling tick.
    pub timer: f64,
    pub is_recording: bool,
    pub is_offline: bool,
    pub weapon_detection_enabled: bool,
    pub system_status: String,
}

pub struct OutputWriter<W: Write> {
    out: W,
    emitted: u64,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, emitted: 0 }
    }

    pub fn emit(&mut self, record: &OutputRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

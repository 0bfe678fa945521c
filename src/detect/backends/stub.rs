use anyhow::Result;

use crate::detect::backend::{FaceDetector, ThreatDetector};
use crate::detect::result::ThreatDetection;
use crate::frame::{FaceRect, Frame};

/// Stub face detector. Never finds a face; for runs that only exercise
/// threats and recording.
#[derive(Default)]
pub struct StubFaceDetector;

impl StubFaceDetector {
    pub fn new() -> Self {
        Self
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<FaceRect>> {
        Ok(Vec::new())
    }
}

/// Stub threat detector. Reports a fixed set of detections on every call.
#[derive(Default)]
pub struct StubThreatDetector {
    detections: Vec<ThreatDetection>,
}

impl StubThreatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<ThreatDetection>) -> Self {
        Self { detections }
    }
}

impl ThreatDetector for StubThreatDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_threats(&mut self, _frame: &Frame) -> Result<Vec<ThreatDetection>> {
        Ok(self.detections.clone())
    }
}

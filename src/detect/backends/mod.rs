mod cpu;
mod stub;
#[cfg(feature = "backend-tract")]
mod tract;

use anyhow::{anyhow, Result};

pub use cpu::{PatchEncoder, SkinRegionDetector};
pub use stub::{StubFaceDetector, StubThreatDetector};
#[cfg(feature = "backend-tract")]
pub use tract::{TractFaceDetector, TractThreatDetector};

use crate::config::DetectionSettings;
use crate::detect::backend::{FaceDetector, FaceEncoder, ThreatDetector};

/// Local capabilities the loop falls back to when the remote side is gone.
pub struct LocalBackends {
    pub faces: Box<dyn FaceDetector>,
    pub encoder: Box<dyn FaceEncoder>,
    pub threats: Box<dyn ThreatDetector>,
}

/// Load the configured local backends.
///
/// Failure here is fatal for the daemon: offline operation depends on them.
pub fn build_local_backends(settings: &DetectionSettings) -> Result<LocalBackends> {
    match settings.backend.as_str() {
        "stub" => Ok(LocalBackends {
            faces: Box::new(StubFaceDetector::new()),
            encoder: Box::new(PatchEncoder::new()),
            threats: Box::new(StubThreatDetector::new()),
        }),
        "cpu" => Ok(LocalBackends {
            faces: Box::new(SkinRegionDetector::new()),
            encoder: Box::new(PatchEncoder::new()),
            threats: Box::new(StubThreatDetector::new()),
        }),
        "tract" => build_tract(settings),
        other => Err(anyhow!("unknown detection backend '{}'", other)),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectionSettings) -> Result<LocalBackends> {
    let face_model = settings
        .face_model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires detection.face_model_path"))?;
    let threat_model = settings
        .threat_model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires detection.threat_model_path"))?;
    let mut threats = TractThreatDetector::new(
        threat_model,
        settings.threat_labels.clone(),
        settings.threat_confidence,
    )?;
    threats.warm_up()?;
    Ok(LocalBackends {
        faces: Box::new(TractFaceDetector::new(face_model, 0.5)?),
        encoder: Box::new(PatchEncoder::new()),
        threats: Box::new(threats),
    })
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectionSettings) -> Result<LocalBackends> {
    Err(anyhow!("detection backend 'tract' requires the backend-tract feature"))
}

use anyhow::Result;

use crate::detect::result::{Signature, ThreatDetection};
use crate::frame::{FaceRect, Frame};

/// Face localisation capability.
///
/// Implementations may block on I/O (the remote client does) and must bound
/// that with their own timeout. Any error is treated by the caller as a
/// capability failure, never as fatal.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Return face rectangles in the coordinate space of `frame`.
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRect>>;
}

/// Produces identity signatures for face regions.
pub trait FaceEncoder: Send {
    fn name(&self) -> &'static str;

    /// Encode the face under `rect`. `Ok(None)` when the region is unusable.
    fn encode(&mut self, frame: &Frame, rect: &FaceRect) -> Result<Option<Signature>>;
}

/// Weapon/threat detection capability.
pub trait ThreatDetector: Send {
    fn name(&self) -> &'static str;

    /// Detect threats. Boxes are in the coordinate space of `frame`; an empty
    /// list means nothing was found.
    fn detect_threats(&mut self, frame: &Frame) -> Result<Vec<ThreatDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

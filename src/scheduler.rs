//! Per-capability frame sampling.
//!
//! Detection capabilities are far slower than capture, so the loop only runs
//! them on "sampling ticks": frame counters divisible by a capability's
//! interval. The identity interval depends on the mode because the remote
//! capability is costlier than the local one; the threat interval is fixed.

use anyhow::{anyhow, Result};

use crate::state::SystemMode;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingPolicy {
    pub face_interval_online: u64,
    pub face_interval_offline: u64,
    pub threat_interval: u64,
    pub assumed_fps: f64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            face_interval_online: 90,
            face_interval_offline: 15,
            threat_interval: 15,
            assumed_fps: 30.0,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.face_interval_offline == 0 || self.threat_interval == 0 {
            return Err(anyhow!("sampling intervals must be greater than zero"));
        }
        if self.face_interval_online <= self.face_interval_offline {
            return Err(anyhow!(
                "face_interval_online ({}) must exceed face_interval_offline ({})",
                self.face_interval_online,
                self.face_interval_offline
            ));
        }
        if self.assumed_fps.is_nan() || self.assumed_fps <= 0.0 {
            return Err(anyhow!("assumed_fps must be positive"));
        }
        Ok(())
    }

    /// Identity sampling interval for `mode`. `Reconnecting` samples like `Offline`.
    pub fn face_interval(&self, mode: SystemMode) -> u64 {
        match mode {
            SystemMode::Online => self.face_interval_online,
            SystemMode::Offline | SystemMode::Reconnecting => self.face_interval_offline,
        }
    }

    pub fn is_face_tick(&self, frame_counter: u64, mode: SystemMode) -> bool {
        frame_counter % self.face_interval(mode) == 0
    }

    pub fn is_threat_tick(&self, frame_counter: u64) -> bool {
        frame_counter % self.threat_interval == 0
    }

    /// Seconds until the next identity tick, assuming `assumed_fps`.
    pub fn seconds_until_face_tick(&self, frame_counter: u64, mode: SystemMode) -> f64 {
        let interval = self.face_interval(mode);
        let frames_left = interval - (frame_counter % interval);
        (frames_left as f64 / self.assumed_fps).max(0.0)
    }
}

//! The per-frame pipeline.
//!
//! Capture runs at camera rate; detection capabilities only run on their
//! sampling ticks and their last results are held in between, so every
//! emitted record carries the most recent known state. Capability failures
//! downgrade the mode and never end the loop.

use anyhow::Result;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::command::{Command, Toggles};
use crate::config::{DetectionSettings, DoorwatchConfig, OutputSettings, RecordingSettings, RemoteSettings};
use crate::detect::{FaceDetector, LocalBackends, ThreatDetection, ThreatDetector};
use crate::frame::{FaceRect, Frame};
use crate::identity::{Gallery, Recognizer};
use crate::ingest::FrameSource;
use crate::output::{OutputRecord, OutputWriter};
use crate::overlay::draw_overlays;
use crate::profiles::{DetectionResult, ProfileStore};
use crate::recorder::{IncidentDeadline, IncidentUploader};
use crate::remote::Reachability;
use crate::scheduler::SamplingPolicy;
use crate::state::{
    ModeEvent, SharedState, SystemMode, STATUS_CONNECTION_DROP, STATUS_REMOTE_API_ERROR,
    STATUS_REMOTE_ERROR,
};
use crate::theme::derive_theme;

const FPS_SEED: f64 = 10.0;
const FPS_SMOOTHING: f64 = 0.9;
const RECORDING_FPS_MARGIN: f64 = 2.0;
const CAPTURE_RETRY: Duration = Duration::from_millis(100);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential moving average of processing rate.
#[derive(Debug, Clone, Copy)]
pub struct FpsEstimator {
    ema: f64,
    last: Option<Instant>,
}

impl Default for FpsEstimator {
    fn default() -> Self {
        Self {
            ema: FPS_SEED,
            last: None,
        }
    }
}

impl FpsEstimator {
    pub fn tick(&mut self, now: Instant) -> f64 {
        if let Some(prev) = self.last {
            let dt = now.saturating_duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                self.ema = FPS_SMOOTHING * self.ema + (1.0 - FPS_SMOOTHING) / dt;
            }
        }
        self.last = Some(now);
        self.ema
    }

    pub fn current(&self) -> f64 {
        self.ema
    }

    /// Rate a new recording is opened at: a little under the measured rate
    /// so playback does not run fast, but never below `min_fps`.
    pub fn recording_fps(&self, min_fps: f64) -> f64 {
        (self.ema - RECORDING_FPS_MARGIN).max(min_fps)
    }
}

/// Shared collaborators the loop reads from but does not own.
pub struct Collaborators {
    pub state: Arc<SharedState>,
    pub probe: Arc<dyn Reachability>,
    pub gallery: Arc<Gallery>,
    pub profiles: Arc<ProfileStore>,
    pub commands: Receiver<Command>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Emitted,
    CaptureFailed,
}

pub struct Orchestrator<W: Write> {
    source: Box<dyn FrameSource>,
    face_detector: Box<dyn FaceDetector>,
    threat_detector: Box<dyn ThreatDetector>,
    recognizer: Recognizer,
    profiles: Arc<ProfileStore>,
    state: Arc<SharedState>,
    probe: Arc<dyn Reachability>,
    commands: Receiver<Command>,
    output: OutputWriter<W>,

    policy: SamplingPolicy,
    detection: DetectionSettings,
    recording: RecordingSettings,
    remote: RemoteSettings,
    output_settings: OutputSettings,
    online_probe_timeout: Duration,
    frame_budget: Option<Duration>,

    toggles: Toggles,
    frame_counter: u64,
    faces: Vec<DetectionResult>,
    threats: Vec<ThreatDetection>,
    fps: FpsEstimator,
    deadline: IncidentDeadline,
    last_health_log: Instant,
}

impl<W: Write> Orchestrator<W> {
    pub fn new(
        cfg: &DoorwatchConfig,
        source: Box<dyn FrameSource>,
        backends: LocalBackends,
        shared: Collaborators,
        out: W,
    ) -> Self {
        let LocalBackends {
            faces,
            encoder,
            threats,
        } = backends;
        let frame_budget = if cfg.camera.target_fps > 0 {
            Some(Duration::from_secs_f64(1.0 / cfg.camera.target_fps as f64))
        } else {
            None
        };
        Self {
            source,
            face_detector: faces,
            threat_detector: threats,
            recognizer: Recognizer::new(encoder, shared.gallery, cfg.detection.match_tolerance),
            profiles: shared.profiles,
            state: shared.state,
            probe: shared.probe,
            commands: shared.commands,
            output: OutputWriter::new(out),
            policy: cfg.sampling,
            detection: cfg.detection.clone(),
            recording: cfg.recording.clone(),
            remote: cfg.remote.clone(),
            output_settings: cfg.output.clone(),
            online_probe_timeout: cfg.connectivity.online_probe_timeout,
            frame_budget,
            toggles: Toggles::default(),
            frame_counter: 0,
            faces: Vec::new(),
            threats: Vec::new(),
            fps: FpsEstimator::default(),
            deadline: IncidentDeadline::default(),
            last_health_log: Instant::now(),
        }
    }

    /// Disable pacing; `step` then runs as fast as the source delivers.
    pub fn unpaced(mut self) -> Self {
        self.frame_budget = None;
        self
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn toggles(&self) -> Toggles {
        self.toggles
    }

    pub fn faces(&self) -> &[DetectionResult] {
        &self.faces
    }

    pub fn threats(&self) -> &[ThreatDetection] {
        &self.threats
    }

    pub fn output(&self) -> &OutputWriter<W> {
        &self.output
    }

    /// Run until `shutdown` is set or the output stream fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("loop: running");
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.step()?;
            self.log_health();
            if let Some(budget) = self.frame_budget {
                let spent = started.elapsed();
                if spent < budget {
                    std::thread::sleep(budget - spent);
                }
            }
        }
        log::info!("loop: stopping after {} frames", self.frame_counter);
        Ok(())
    }

    /// Process one captured frame and emit one output record.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.drain_commands();

        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("loop: capture failed: {:#}", err);
                std::thread::sleep(CAPTURE_RETRY);
                return Ok(StepOutcome::CaptureFailed);
            }
        };
        self.frame_counter += 1;
        let now = Instant::now();
        self.fps.tick(now);

        self.update_threats(&frame);

        let mode = self.state.mode()?;
        if self.policy.is_face_tick(self.frame_counter, mode) {
            match self.detect_faces(&frame, mode) {
                Ok(results) => self.faces = results,
                Err(err) => log::warn!("loop: face pass failed, keeping last results: {:#}", err),
            }
        }

        let theme = derive_theme(&self.faces, &self.threats);
        let alarm = !self.threats.is_empty()
            || self.faces.iter().any(|result| result.profile().is_unknown());
        if alarm {
            self.deadline.trigger(now, self.recording.extension);
        }

        let annotated = if self.toggles.show_overlays || self.deadline.get().is_some() {
            let mut annotated = frame.clone();
            draw_overlays(&mut annotated, &self.faces, &self.threats);
            Some(annotated)
        } else {
            None
        };

        let snapshot = self.drive_recorder(&frame, annotated.as_ref(), now)?;

        let display = match (&annotated, self.toggles.show_overlays) {
            (Some(annotated), true) => annotated,
            _ => &frame,
        };
        let encoded = if self.output_settings.emit_frames {
            match display.encode_base64_jpeg(self.output_settings.jpeg_quality) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    log::warn!("loop: frame encode failed: {:#}", err);
                    None
                }
            }
        } else {
            None
        };

        let record = OutputRecord {
            frame: encoded,
            results: self.faces.clone(),
            threats: self.threats.clone(),
            theme,
            // Counted against the interval this frame was sampled under, even
            // if the face pass just downgraded the mode.
            timer: self.policy.seconds_until_face_tick(self.frame_counter, mode),
            is_recording: snapshot.is_recording,
            is_offline: snapshot.mode.is_offline(),
            weapon_detection_enabled: self.toggles.threat_detection,
            system_status: snapshot.status,
        };
        self.output.emit(&record)?;
        Ok(StepOutcome::Emitted)
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.toggles.apply(command);
        }
    }

    fn update_threats(&mut self, frame: &Frame) {
        if !self.toggles.threat_detection {
            self.threats.clear();
            return;
        }
        if !self.policy.is_threat_tick(self.frame_counter) {
            return;
        }
        match self.detect_threats(frame) {
            Ok(threats) => self.threats = threats,
            Err(err) => log::warn!("loop: threat pass failed, keeping last results: {:#}", err),
        }
    }

    fn detect_threats(&mut self, frame: &Frame) -> Result<Vec<ThreatDetection>> {
        let (small, factor) = frame.downscale_to_width(self.detection.threat_target_width)?;
        let raw = self.threat_detector.detect_threats(&small)?;
        Ok(raw.iter().map(|t| t.to_source(factor)).collect())
    }

    /// Identity pass. While Online the remote capability runs first; a
    /// failed probe or call downgrades the mode and the local capability
    /// covers the same frame.
    fn detect_faces(&mut self, frame: &Frame, mode: SystemMode) -> Result<Vec<DetectionResult>> {
        let mut rects: Vec<FaceRect> = Vec::new();
        let mut offline = mode.is_offline();

        if !offline {
            if let Some(found) = self.detect_remote(frame)? {
                rects = found;
            } else {
                offline = true;
            }
        }
        if offline && rects.is_empty() {
            rects = self.detect_local(frame)?;
        }
        if rects.is_empty() {
            return Ok(Vec::new());
        }

        let names = self.recognizer.recognize(frame, &rects)?;
        Ok(rects
            .into_iter()
            .zip(names)
            .map(|(rect, name)| DetectionResult(rect, self.profiles.resolve(&name)))
            .collect())
    }

    /// `Ok(None)` when the remote side failed and the mode was downgraded.
    fn detect_remote(&mut self, frame: &Frame) -> Result<Option<Vec<FaceRect>>> {
        if !self.probe.is_reachable(self.online_probe_timeout) {
            log::warn!("loop: reachability probe failed");
            self.state
                .lock()?
                .go_offline(ModeEvent::ProbeFailure, STATUS_CONNECTION_DROP);
            return Ok(None);
        }

        let handles = self.state.lock()?.remote();
        let Some(handles) = handles else {
            log::warn!("loop: online without remote handles");
            self.state
                .lock()?
                .go_offline(ModeEvent::RemoteFailure, STATUS_REMOTE_ERROR);
            return Ok(None);
        };

        match handles.faces.detect_faces(frame) {
            Ok(rects) => Ok(Some(rects)),
            Err(err) => {
                log::warn!("loop: remote face detection failed: {:#}", err);
                self.state
                    .lock()?
                    .go_offline(ModeEvent::RemoteFailure, STATUS_REMOTE_API_ERROR);
                Ok(None)
            }
        }
    }

    fn detect_local(&mut self, frame: &Frame) -> Result<Vec<FaceRect>> {
        let scale = self.detection.local_face_scale;
        let small = frame.resize_by(scale)?;
        Ok(self
            .face_detector
            .detect_faces(&small)?
            .into_iter()
            .map(|rect| rect.unscale(scale))
            .collect())
    }

    /// Start, feed or stop the recorder under the shared lock, and take a
    /// consistent snapshot of the shared state for the output record.
    fn drive_recorder(
        &mut self,
        frame: &Frame,
        annotated: Option<&Frame>,
        now: Instant,
    ) -> Result<SharedSnapshot> {
        let mut shared = self.state.lock()?;

        // Retried on every frame until the deadline if the sink fails to open.
        if self.deadline.is_before(now) && !shared.recorder.is_recording() {
            let fps = self.fps.recording_fps(self.recording.min_fps);
            if let Err(err) = shared.recorder.start(frame.width, frame.height, fps) {
                log::error!("loop: recording not started: {:#}", err);
            }
        }

        if shared.recorder.is_recording() {
            if self.deadline.is_before(now) {
                if let Err(err) = shared.recorder.write_frame(annotated.unwrap_or(frame)) {
                    log::warn!("loop: recording write failed: {:#}", err);
                }
            } else {
                let uploader = shared.remote().map(|handles| {
                    IncidentUploader::from_handles(&handles, &self.remote, &self.recording)
                });
                shared.recorder.stop(uploader);
                self.deadline.clear();
            }
        } else if !self.deadline.is_before(now) {
            self.deadline.clear();
        }

        Ok(SharedSnapshot {
            mode: shared.mode(),
            status: shared.status().to_string(),
            is_recording: shared.recorder.is_recording(),
        })
    }

    /// Stop any active recording. The returned upload worker may be joined
    /// to let the last incident finish uploading.
    pub fn finish(&mut self) -> Result<Option<JoinHandle<()>>> {
        let mut shared = self.state.lock()?;
        let uploader = shared
            .remote()
            .map(|handles| IncidentUploader::from_handles(&handles, &self.remote, &self.recording));
        self.deadline.clear();
        Ok(shared.recorder.stop(uploader))
    }

    fn log_health(&mut self) {
        if self.last_health_log.elapsed() < HEALTH_LOG_INTERVAL {
            return;
        }
        let stats = self.source.stats();
        let (mode, recording) = match self.state.lock() {
            Ok(shared) => (Some(shared.mode()), shared.recorder.is_recording()),
            Err(_) => (None, false),
        };
        log::info!(
            "camera health={} frames={} url={} fps={:.1} mode={:?} recording={}",
            self.source.is_healthy(),
            stats.frames_captured,
            stats.url,
            self.fps.current(),
            mode,
            recording
        );
        self.last_health_log = Instant::now();
    }
}

struct SharedSnapshot {
    mode: SystemMode,
    status: String,
    is_recording: bool,
}

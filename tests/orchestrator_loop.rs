use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use doorwatch::command::Command;
use doorwatch::config::DoorwatchConfig;
use doorwatch::detect::{FaceDetector, LocalBackends, PatchEncoder, StubThreatDetector, ThreatDetection};
use doorwatch::frame::{FaceRect, Frame};
use doorwatch::identity::Gallery;
use doorwatch::ingest::{FrameSource, SourceStats};
use doorwatch::profiles::ProfileStore;
use doorwatch::recorder::{IncidentRecorder, MjpegSinkFactory, SinkFactory, VideoSink};
use doorwatch::remote::{Reachability, RemoteFaceService, RemoteHandles};
use doorwatch::state::{SharedState, SystemMode};
use doorwatch::storage::{InMemoryBlobStore, InMemoryTableStore};
use doorwatch::{Collaborators, Orchestrator, StepOutcome};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

struct ScriptedSource {
    fail_on: Vec<u64>,
    calls: u64,
    captured: u64,
}

impl ScriptedSource {
    fn new(fail_on: Vec<u64>) -> Self {
        Self {
            fail_on,
            calls: 0,
            captured: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.calls += 1;
        if self.fail_on.contains(&self.calls) {
            return Err(anyhow!("camera read timed out"));
        }
        self.captured += 1;
        Frame::from_rgb(vec![90u8; (WIDTH * HEIGHT * 3) as usize], WIDTH, HEIGHT)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.captured,
            url: "scripted".into(),
        }
    }
}

/// Local detector that reports one face and counts its calls.
struct CountingDetector {
    calls: Arc<AtomicUsize>,
}

impl FaceDetector for CountingDetector {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<FaceRect>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![FaceRect::new(4, 4, 8, 8)])
    }
}

struct FakeRemoteFaces {
    fail: bool,
    found: Vec<FaceRect>,
    calls: AtomicUsize,
}

fn remote_faces(fail: bool, found: Vec<FaceRect>) -> Arc<FakeRemoteFaces> {
    Arc::new(FakeRemoteFaces {
        fail,
        found,
        calls: AtomicUsize::new(0),
    })
}

impl RemoteFaceService for FakeRemoteFaces {
    fn detect_faces(&self, _frame: &Frame) -> Result<Vec<FaceRect>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(anyhow!("request timed out"))
        } else {
            Ok(self.found.clone())
        }
    }
}

/// Sink factory whose first `failures` opens fail.
struct FlakySinkFactory {
    inner: MjpegSinkFactory,
    failures: AtomicUsize,
}

impl SinkFactory for FlakySinkFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn VideoSink>> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("disk full"));
        }
        self.inner.open(path, width, height, fps)
    }

    fn extension(&self) -> &'static str {
        self.inner.extension()
    }
}

struct FixedProbe(bool);

impl Reachability for FixedProbe {
    fn is_reachable(&self, _timeout: Duration) -> bool {
        self.0
    }
}

struct Rig {
    orchestrator: Orchestrator<Vec<u8>>,
    commands: Sender<Command>,
    state: Arc<SharedState>,
    local_calls: Arc<AtomicUsize>,
    _temp: tempfile::TempDir,
}

impl Rig {
    fn lines(&self) -> Vec<Value> {
        String::from_utf8(self.orchestrator.output().get_ref().clone())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

fn config(temp: &tempfile::TempDir) -> DoorwatchConfig {
    let mut cfg = DoorwatchConfig::load_from(None).unwrap();
    cfg.recording.temp_dir = temp.path().to_path_buf();
    cfg.recording.upload_grace = Duration::ZERO;
    cfg.detection.threat_target_width = WIDTH / 2;
    cfg.output.emit_frames = false;
    cfg
}

fn rig(
    cfg: DoorwatchConfig,
    temp: tempfile::TempDir,
    state: Arc<SharedState>,
    probe_up: bool,
    threats: Vec<ThreatDetection>,
    fail_on: Vec<u64>,
) -> Rig {
    let local_calls = Arc::new(AtomicUsize::new(0));
    let backends = LocalBackends {
        faces: Box::new(CountingDetector {
            calls: local_calls.clone(),
        }),
        encoder: Box::new(PatchEncoder::new()),
        threats: Box::new(StubThreatDetector::with_detections(threats)),
    };
    let (commands, rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(
        &cfg,
        Box::new(ScriptedSource::new(fail_on)),
        backends,
        Collaborators {
            state: state.clone(),
            probe: Arc::new(FixedProbe(probe_up)),
            gallery: Arc::new(Gallery::new()),
            profiles: Arc::new(ProfileStore::new()),
            commands: rx,
        },
        Vec::new(),
    )
    .unpaced();
    Rig {
        orchestrator,
        commands,
        state,
        local_calls,
        _temp: temp,
    }
}

fn recorder(temp: &tempfile::TempDir) -> IncidentRecorder {
    IncidentRecorder::new(Box::new(MjpegSinkFactory::new(60)), temp.path().to_path_buf())
}

fn online_state(
    temp: &tempfile::TempDir,
    faces: Arc<FakeRemoteFaces>,
    tables: Arc<InMemoryTableStore>,
) -> Arc<SharedState> {
    let handles = RemoteHandles {
        faces,
        blobs: Arc::new(InMemoryBlobStore::new()),
        tables,
    };
    Arc::new(SharedState::online(handles, recorder(temp)))
}

#[test]
fn emits_one_record_per_frame_with_timer() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(&temp);
    let state = Arc::new(SharedState::offline(recorder(&temp)));
    let mut rig = rig(cfg, temp, state, false, Vec::new(), Vec::new());

    for _ in 0..30 {
        assert_eq!(rig.orchestrator.step()?, StepOutcome::Emitted);
    }
    let lines = rig.lines();
    assert_eq!(lines.len(), 30);

    // Offline interval is 15 frames at an assumed 30 fps.
    let timer = |n: usize| lines[n - 1]["timer"].as_f64().unwrap();
    assert!((timer(1) - 14.0 / 30.0).abs() < 1e-9);
    assert!((timer(14) - 1.0 / 30.0).abs() < 1e-9);
    assert!((timer(15) - 0.5).abs() < 1e-9);

    // Local detection ran on frames 15 and 30 only; results hold in between.
    assert_eq!(rig.local_calls.load(Ordering::SeqCst), 2);
    assert!(lines[13]["results"].as_array().unwrap().is_empty());
    for line in &lines[14..] {
        assert_eq!(line["results"].as_array().unwrap().len(), 1);
        assert_eq!(line["is_offline"], true);
        assert_eq!(line["system_status"], "Offline Mode");
        assert!(line["frame"].is_null());
    }
    // Local detection runs on a half-size frame; boxes come back at full size.
    assert_eq!(lines[14]["results"][0][0]["left"], 8);
    assert_eq!(lines[14]["results"][0][0]["width"], 16);
    assert_eq!(lines[14]["results"][0][1]["surname"], "Unknown");
    assert_eq!(lines[14]["theme"], "theme-red");
    Ok(())
}

#[test]
fn remote_failure_falls_back_within_the_same_tick() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.sampling.face_interval_online = 2;
    cfg.sampling.face_interval_offline = 1;
    let faces = remote_faces(true, Vec::new());
    let state = online_state(&temp, faces.clone(), Arc::new(InMemoryTableStore::new()));
    let mut rig = rig(cfg, temp, state, true, Vec::new(), Vec::new());

    rig.orchestrator.step()?;
    assert_eq!(faces.calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.state.mode()?, SystemMode::Online);

    rig.orchestrator.step()?;
    assert_eq!(faces.calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.state.mode()?, SystemMode::Offline);
    assert_eq!(rig.orchestrator.faces().len(), 1);

    let lines = rig.lines();
    assert_eq!(lines[0]["is_offline"], false);
    assert_eq!(lines[1]["is_offline"], true);
    assert_eq!(lines[1]["system_status"], "Offline (Remote API Error)");
    assert_eq!(lines[1]["results"].as_array().unwrap().len(), 1);
    Ok(())
}

#[test]
fn failed_probe_skips_remote_call() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.sampling.face_interval_online = 1;
    let faces = remote_faces(false, Vec::new());
    let state = online_state(&temp, faces.clone(), Arc::new(InMemoryTableStore::new()));
    let mut rig = rig(cfg, temp, state, false, Vec::new(), Vec::new());

    rig.orchestrator.step()?;
    assert_eq!(faces.calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.local_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.state.status()?, "Offline (Connection Drop)");
    Ok(())
}

#[test]
fn threats_are_rescaled_and_toggle_off() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.sampling.threat_interval = 1;
    let state = Arc::new(SharedState::offline(recorder(&temp)));
    let threat = ThreatDetection {
        label: "knife".into(),
        confidence: 0.9,
        bbox: [10, 20, 30, 40],
    };
    let mut rig = rig(cfg, temp, state, false, vec![threat], Vec::new());

    rig.orchestrator.step()?;
    rig.commands.send(Command::ThreatDetection(false))?;
    rig.orchestrator.step()?;

    let lines = rig.lines();
    assert_eq!(lines[0]["threats"][0]["label"], "KNIFE 0.90");
    assert_eq!(lines[0]["threats"][0]["box"], serde_json::json!([20, 40, 60, 80]));
    assert_eq!(lines[0]["theme"], "theme-red");
    assert_eq!(lines[0]["weapon_detection_enabled"], true);

    assert!(lines[1]["threats"].as_array().unwrap().is_empty());
    assert_eq!(lines[1]["weapon_detection_enabled"], false);
    assert_eq!(lines[1]["theme"], "theme-neutral");
    Ok(())
}

#[test]
fn capture_failure_skips_the_iteration() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(&temp);
    let state = Arc::new(SharedState::offline(recorder(&temp)));
    let mut rig = rig(cfg, temp, state, false, Vec::new(), vec![2]);

    assert_eq!(rig.orchestrator.step()?, StepOutcome::Emitted);
    assert_eq!(rig.orchestrator.step()?, StepOutcome::CaptureFailed);
    assert_eq!(rig.orchestrator.step()?, StepOutcome::Emitted);
    assert_eq!(rig.orchestrator.frame_counter(), 2);
    assert_eq!(rig.lines().len(), 2);
    Ok(())
}

#[test]
fn overlay_toggle_emits_annotated_frames() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.output.emit_frames = true;
    let state = Arc::new(SharedState::offline(recorder(&temp)));
    let mut rig = rig(cfg, temp, state, false, Vec::new(), Vec::new());

    rig.commands.send(Command::ShowOverlays(true))?;
    rig.orchestrator.step()?;
    assert!(rig.orchestrator.toggles().show_overlays);
    let lines = rig.lines();
    assert!(lines[0]["frame"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
    Ok(())
}

#[test]
fn threat_records_an_incident_and_uploads_it() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let temp_path = temp.path().to_path_buf();
    let mut cfg = config(&temp);
    cfg.sampling.threat_interval = 1;
    cfg.recording.extension = Duration::from_millis(40);
    let tables = Arc::new(InMemoryTableStore::new());
    let faces = remote_faces(false, Vec::new());
    let state = online_state(&temp, faces, tables.clone());
    let threat = ThreatDetection {
        label: "pistol".into(),
        confidence: 0.8,
        bbox: [0, 0, 8, 8],
    };
    let mut rig = rig(cfg, temp, state, true, vec![threat], Vec::new());

    rig.orchestrator.step()?;
    rig.orchestrator.step()?;
    assert!(rig.state.lock()?.recorder.is_recording());

    rig.commands.send(Command::ThreatDetection(false))?;
    std::thread::sleep(Duration::from_millis(60));
    rig.orchestrator.step()?;
    assert!(!rig.state.lock()?.recorder.is_recording());

    let lines = rig.lines();
    assert_eq!(lines[0]["is_recording"], true);
    assert_eq!(lines[1]["is_recording"], true);
    assert_eq!(lines[2]["is_recording"], false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while tables.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(tables.len(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while std::fs::read_dir(&temp_path)?.count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(std::fs::read_dir(&temp_path)?.count(), 0);
    Ok(())
}

#[test]
fn run_exits_on_shutdown_and_finish_is_idle() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(&temp);
    let state = Arc::new(SharedState::offline(recorder(&temp)));
    let mut rig = rig(cfg, temp, state, false, Vec::new(), Vec::new());

    let shutdown = AtomicBool::new(true);
    rig.orchestrator.run(&shutdown)?;
    assert_eq!(rig.orchestrator.frame_counter(), 0);
    assert!(rig.orchestrator.finish()?.is_none());
    Ok(())
}

#[test]
fn oversized_remote_rect_does_not_break_the_loop() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.sampling.face_interval_online = 1;
    cfg.output.emit_frames = true;
    let faces = remote_faces(false, vec![FaceRect::new(10, 10, i32::MAX, 20)]);
    let state = online_state(&temp, faces, Arc::new(InMemoryTableStore::new()));
    let mut rig = rig(cfg, temp, state, true, Vec::new(), Vec::new());

    assert_eq!(rig.orchestrator.step()?, StepOutcome::Emitted);
    let lines = rig.lines();
    assert_eq!(lines[0]["results"][0][0]["width"], i32::MAX);
    assert_eq!(lines[0]["is_recording"], true);
    assert_eq!(lines[0]["is_offline"], false);
    Ok(())
}

#[test]
fn timer_uses_the_interval_the_frame_was_sampled_under() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let cfg = config(&temp);
    let state = online_state(&temp, remote_faces(true, Vec::new()), Arc::new(InMemoryTableStore::new()));
    let mut rig = rig(cfg, temp, state, true, Vec::new(), Vec::new());

    for _ in 0..91 {
        rig.orchestrator.step()?;
    }
    let lines = rig.lines();
    let timer = |n: usize| lines[n - 1]["timer"].as_f64().unwrap();

    assert_eq!(lines[88]["is_offline"], false);
    assert!((timer(89) - 1.0 / 30.0).abs() < 1e-9);
    // Frame 90 was an Online tick; the failure downgrades the mode but the
    // timer still counts a full Online interval.
    assert_eq!(lines[89]["is_offline"], true);
    assert!((timer(90) - 3.0).abs() < 1e-9);
    assert!((timer(91) - 14.0 / 30.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn failed_recording_start_is_retried_before_the_deadline() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cfg = config(&temp);
    cfg.sampling.threat_interval = 1;
    let flaky = FlakySinkFactory {
        inner: MjpegSinkFactory::new(60),
        failures: AtomicUsize::new(1),
    };
    let recorder = IncidentRecorder::new(Box::new(flaky), temp.path().to_path_buf());
    let state = Arc::new(SharedState::offline(recorder));
    let threat = ThreatDetection {
        label: "knife".into(),
        confidence: 0.7,
        bbox: [0, 0, 4, 4],
    };
    let mut rig = rig(cfg, temp, state, false, vec![threat], Vec::new());

    rig.orchestrator.step()?;
    // No new alarm on the next frame; the open deadline alone restarts it.
    rig.commands.send(Command::ThreatDetection(false))?;
    rig.orchestrator.step()?;

    let lines = rig.lines();
    assert_eq!(lines[0]["is_recording"], false);
    assert!(lines[1]["threats"].as_array().unwrap().is_empty());
    assert_eq!(lines[1]["is_recording"], true);
    Ok(())
}

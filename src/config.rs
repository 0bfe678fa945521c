//! Daemon configuration.
//!
//! An optional JSON file supplies any subset of keys; missing keys take
//! defaults, a few `DOORWATCH_*` environment variables override the result,
//! and the whole is validated before the daemon starts.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SamplingPolicy;

const DEFAULT_CAMERA_URL: &str = "stub://front_door";
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_FACE_INTERVAL_ONLINE: u64 = 90;
const DEFAULT_FACE_INTERVAL_OFFLINE: u64 = 15;
const DEFAULT_THREAT_INTERVAL: u64 = 15;
const DEFAULT_ASSUMED_FPS: f64 = 30.0;
const DEFAULT_BACKEND: &str = "cpu";
const DEFAULT_THREAT_CONFIDENCE: f32 = 0.45;
const DEFAULT_THREAT_TARGET_WIDTH: u32 = 640;
const DEFAULT_LOCAL_FACE_SCALE: f32 = 0.5;
const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;
const DEFAULT_MAX_GALLERY_DIM: u32 = 500;
const DEFAULT_STORAGE_ROOT: &str = "remote_store";
const DEFAULT_TABLE_DB_PATH: &str = "incidents.db";
const DEFAULT_PROFILE_CONTAINER: &str = "profiles";
const DEFAULT_IMAGE_CONTAINER: &str = "images";
const DEFAULT_INCIDENT_CONTAINER: &str = "incidents";
const DEFAULT_INCIDENT_TABLE: &str = "Incidents";
const DEFAULT_CAPABILITY_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ONLINE_PROBE_TIMEOUT_MS: u64 = 100;
const DEFAULT_POLL_SECS: u64 = 5;
const DEFAULT_EXTENSION_SECS: f64 = 5.0;
const DEFAULT_UPLOAD_GRACE_MS: u64 = 1_500;
const DEFAULT_MIN_RECORDING_FPS: f64 = 5.0;
const DEFAULT_MIRROR_ROOT: &str = "local_data";
const DEFAULT_JPEG_QUALITY: u8 = 60;

const KNOWN_BACKENDS: &[&str] = &["cpu", "stub", "tract"];

#[derive(Debug, Deserialize, Default)]
struct DoorwatchConfigFile {
    camera: Option<CameraConfigFile>,
    sampling: Option<SamplingConfigFile>,
    detection: Option<DetectionConfigFile>,
    remote: Option<RemoteConfigFile>,
    connectivity: Option<ConnectivityConfigFile>,
    recording: Option<RecordingConfigFile>,
    mirror: Option<MirrorConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    face_interval_online: Option<u64>,
    face_interval_offline: Option<u64>,
    threat_interval: Option<u64>,
    assumed_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    face_model_path: Option<PathBuf>,
    threat_model_path: Option<PathBuf>,
    threat_labels: Option<Vec<String>>,
    threat_confidence: Option<f32>,
    threat_target_width: Option<u32>,
    local_face_scale: Option<f32>,
    match_tolerance: Option<f32>,
    max_gallery_dim: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    face_endpoint: Option<String>,
    face_key: Option<String>,
    storage_root: Option<PathBuf>,
    table_db_path: Option<String>,
    profile_container: Option<String>,
    image_container: Option<String>,
    incident_container: Option<String>,
    incident_table: Option<String>,
    capability_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConnectivityConfigFile {
    probe_addr: Option<String>,
    probe_timeout_ms: Option<u64>,
    online_probe_timeout_ms: Option<u64>,
    poll_secs: Option<u64>,
    require_profile_mirror: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    extension_secs: Option<f64>,
    upload_grace_ms: Option<u64>,
    temp_dir: Option<PathBuf>,
    min_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MirrorConfigFile {
    root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    jpeg_quality: Option<u8>,
    emit_frames: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct DoorwatchConfig {
    pub camera: CameraSettings,
    pub sampling: SamplingPolicy,
    pub detection: DetectionSettings,
    pub remote: RemoteSettings,
    pub connectivity: ConnectivitySettings,
    pub recording: RecordingSettings,
    pub mirror_root: PathBuf,
    pub output: OutputSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub face_model_path: Option<PathBuf>,
    pub threat_model_path: Option<PathBuf>,
    pub threat_labels: Vec<String>,
    pub threat_confidence: f32,
    pub threat_target_width: u32,
    pub local_face_scale: f32,
    pub match_tolerance: f32,
    pub max_gallery_dim: u32,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub face_endpoint: Option<String>,
    pub face_key: Option<String>,
    pub storage_root: PathBuf,
    pub table_db_path: String,
    pub profile_container: String,
    pub image_container: String,
    pub incident_container: String,
    pub incident_table: String,
    pub capability_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
    pub probe_addr: String,
    pub probe_timeout: Duration,
    pub online_probe_timeout: Duration,
    pub poll_interval: Duration,
    pub require_profile_mirror: bool,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub extension: Duration,
    pub upload_grace: Duration,
    pub temp_dir: PathBuf,
    pub min_fps: f64,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub jpeg_quality: u8,
    pub emit_frames: bool,
}

impl DoorwatchConfig {
    /// Load from the file named by `DOORWATCH_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DOORWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DoorwatchConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let sampling = file.sampling.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let remote = file.remote.unwrap_or_default();
        let connectivity = file.connectivity.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let output = file.output.unwrap_or_default();

        Ok(Self {
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            sampling: SamplingPolicy {
                face_interval_online: sampling
                    .face_interval_online
                    .unwrap_or(DEFAULT_FACE_INTERVAL_ONLINE),
                face_interval_offline: sampling
                    .face_interval_offline
                    .unwrap_or(DEFAULT_FACE_INTERVAL_OFFLINE),
                threat_interval: sampling.threat_interval.unwrap_or(DEFAULT_THREAT_INTERVAL),
                assumed_fps: sampling.assumed_fps.unwrap_or(DEFAULT_ASSUMED_FPS),
            },
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                face_model_path: detection.face_model_path,
                threat_model_path: detection.threat_model_path,
                threat_labels: detection
                    .threat_labels
                    .unwrap_or_else(|| vec!["knife".to_string(), "pistol".to_string()]),
                threat_confidence: detection
                    .threat_confidence
                    .unwrap_or(DEFAULT_THREAT_CONFIDENCE),
                threat_target_width: detection
                    .threat_target_width
                    .unwrap_or(DEFAULT_THREAT_TARGET_WIDTH),
                local_face_scale: detection
                    .local_face_scale
                    .unwrap_or(DEFAULT_LOCAL_FACE_SCALE),
                match_tolerance: detection.match_tolerance.unwrap_or(DEFAULT_MATCH_TOLERANCE),
                max_gallery_dim: detection.max_gallery_dim.unwrap_or(DEFAULT_MAX_GALLERY_DIM),
            },
            remote: RemoteSettings {
                face_endpoint: remote.face_endpoint,
                face_key: remote.face_key,
                storage_root: remote
                    .storage_root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
                table_db_path: remote
                    .table_db_path
                    .unwrap_or_else(|| DEFAULT_TABLE_DB_PATH.to_string()),
                profile_container: remote
                    .profile_container
                    .unwrap_or_else(|| DEFAULT_PROFILE_CONTAINER.to_string()),
                image_container: remote
                    .image_container
                    .unwrap_or_else(|| DEFAULT_IMAGE_CONTAINER.to_string()),
                incident_container: remote
                    .incident_container
                    .unwrap_or_else(|| DEFAULT_INCIDENT_CONTAINER.to_string()),
                incident_table: remote
                    .incident_table
                    .unwrap_or_else(|| DEFAULT_INCIDENT_TABLE.to_string()),
                capability_timeout: Duration::from_millis(
                    remote
                        .capability_timeout_ms
                        .unwrap_or(DEFAULT_CAPABILITY_TIMEOUT_MS),
                ),
            },
            connectivity: ConnectivitySettings {
                probe_addr: connectivity
                    .probe_addr
                    .unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string()),
                probe_timeout: Duration::from_millis(
                    connectivity
                        .probe_timeout_ms
                        .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
                ),
                online_probe_timeout: Duration::from_millis(
                    connectivity
                        .online_probe_timeout_ms
                        .unwrap_or(DEFAULT_ONLINE_PROBE_TIMEOUT_MS),
                ),
                poll_interval: Duration::from_secs(
                    connectivity.poll_secs.unwrap_or(DEFAULT_POLL_SECS),
                ),
                require_profile_mirror: connectivity.require_profile_mirror.unwrap_or(true),
            },
            recording: RecordingSettings {
                extension: secs_to_duration(
                    "recording.extension_secs",
                    recording.extension_secs.unwrap_or(DEFAULT_EXTENSION_SECS),
                )?,
                upload_grace: Duration::from_millis(
                    recording
                        .upload_grace_ms
                        .unwrap_or(DEFAULT_UPLOAD_GRACE_MS),
                ),
                temp_dir: recording.temp_dir.unwrap_or_else(std::env::temp_dir),
                min_fps: recording.min_fps.unwrap_or(DEFAULT_MIN_RECORDING_FPS),
            },
            mirror_root: file
                .mirror
                .and_then(|mirror| mirror.root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MIRROR_ROOT)),
            output: OutputSettings {
                jpeg_quality: output.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                emit_frames: output.emit_frames.unwrap_or(true),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("DOORWATCH_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(endpoint) = non_empty_env("DOORWATCH_FACE_ENDPOINT") {
            self.remote.face_endpoint = Some(endpoint);
        }
        if let Some(key) = non_empty_env("DOORWATCH_FACE_KEY") {
            self.remote.face_key = Some(key);
        }
        if let Some(root) = non_empty_env("DOORWATCH_STORAGE_ROOT") {
            self.remote.storage_root = PathBuf::from(root);
        }
        if let Some(root) = non_empty_env("DOORWATCH_MIRROR_ROOT") {
            self.mirror_root = PathBuf::from(root);
        }
        if let Some(addr) = non_empty_env("DOORWATCH_PROBE_ADDR") {
            self.connectivity.probe_addr = addr;
        }
        if let Some(backend) = non_empty_env("DOORWATCH_DETECTION_BACKEND") {
            self.detection.backend = backend;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.sampling.validate()?;
        self.detection.backend = self.detection.backend.to_lowercase();
        if !KNOWN_BACKENDS.contains(&self.detection.backend.as_str()) {
            return Err(anyhow!(
                "unknown detection backend '{}' (expected one of {:?})",
                self.detection.backend,
                KNOWN_BACKENDS
            ));
        }
        if self.detection.threat_target_width == 0 {
            return Err(anyhow!("threat_target_width must be greater than zero"));
        }
        let scale = self.detection.local_face_scale;
        if scale.is_nan() || scale <= 0.0 || scale > 1.0 {
            return Err(anyhow!("local_face_scale must be in (0, 1]"));
        }
        let tolerance = self.detection.match_tolerance;
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(anyhow!("match_tolerance must be in [0, 1], got {}", tolerance));
        }
        let min_fps = self.recording.min_fps;
        if !min_fps.is_finite() || min_fps <= 0.0 {
            return Err(anyhow!("recording min_fps must be positive, got {}", min_fps));
        }
        if self.recording.extension.is_zero() {
            return Err(anyhow!("recording extension must be greater than zero"));
        }
        if self.output.jpeg_quality == 0 || self.output.jpeg_quality > 100 {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera dimensions must be non-zero"));
        }
        Ok(())
    }

    pub fn images_dir(&self) -> PathBuf {
        self.mirror_root.join("images")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.mirror_root.join("profiles")
    }
}

fn read_config_file(path: &Path) -> Result<DoorwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn secs_to_duration(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("invalid {} {}: {}", key, secs, e))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

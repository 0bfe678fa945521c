//! Doorwatch
//!
//! Edge agent that watches a door camera, recognizes known occupants, flags
//! unknown persons and weapon-like objects, and records incidents while
//! tolerating an unreliable link to its remote identity and storage backend.
//!
//! # Architecture
//!
//! One sequential loop owns capture, detection scheduling, aggregation and
//! output. Two background tasks share state with it:
//!
//! 1. **Connectivity monitor**: probes the network while Offline and, on
//!    success, rebuilds remote handles and the local mirror before going
//!    Online.
//! 2. **Command listener**: applies runtime toggles sent on the control
//!    channel.
//!
//! Mode, remote handles and the incident recorder sit behind a single lock
//! ([`state::SharedState`]). Finished incidents upload on detached worker
//! threads.
//!
//! # Module Structure
//!
//! - `orchestrator`: the per-frame loop
//! - `state`, `scheduler`: mode state machine and sampling ticks
//! - `recorder`: incident recording and upload
//! - `monitor`, `command`: background tasks
//! - `detect`, `identity`, `profiles`: local capabilities, gallery, profile mirror
//! - `remote`, `storage`, `sync`: remote collaborators and mirror sync
//! - `ingest`, `frame`, `overlay`, `output`, `theme`: frames in, records out

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod command;
pub mod config;
pub mod detect;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod monitor;
pub mod orchestrator;
pub mod output;
pub mod overlay;
pub mod profiles;
pub mod recorder;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod sync;
pub mod theme;

pub use command::{parse_command, spawn_listener, Command, Toggles};
pub use config::DoorwatchConfig;
pub use detect::{build_local_backends, LocalBackends, Signature, ThreatDetection};
pub use frame::{FaceRect, Frame};
pub use identity::{Gallery, GalleryEncoder, IdentityCache, Recognizer, ReloadReport};
pub use ingest::{CameraSource, FrameSource, SourceStats};
pub use monitor::{ConnectivityMonitor, TickOutcome};
pub use orchestrator::{Collaborators, FpsEstimator, Orchestrator, StepOutcome};
pub use output::{OutputRecord, OutputWriter};
pub use profiles::{DetectionResult, ProfileRecord, ProfileStore};
pub use recorder::{IncidentDeadline, IncidentRecorder, IncidentUploader, MjpegSinkFactory};
pub use remote::{
    HttpFaceClient, Reachability, RemoteConnector, RemoteFaceService, RemoteHandles,
    StorageConnector, TcpProbe,
};
pub use scheduler::SamplingPolicy;
pub use state::{ModeEvent, SharedState, SystemMode};
pub use storage::{
    BlobStore, FsBlobStore, InMemoryBlobStore, InMemoryTableStore, SqliteTableStore, TableEntity,
    TableStore,
};
pub use sync::{MirrorSync, Resync};
pub use theme::{derive_theme, Theme};

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

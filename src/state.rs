//! Detection mode and the state shared between the loop and its background
//! tasks.
//!
//! One mutex guards the mode, the status string, the remote handles and the
//! incident recorder. Every transition goes through [`SystemMode::on`], so an
//! illegal edge (the loop starting a reconnect, say) is simply refused.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::recorder::IncidentRecorder;
use crate::remote::RemoteHandles;

pub const STATUS_READY: &str = "Ready";
pub const STATUS_ONLINE: &str = "Online";
pub const STATUS_OFFLINE: &str = "Offline Mode";
pub const STATUS_CONNECTION_DROP: &str = "Offline (Connection Drop)";
pub const STATUS_REMOTE_API_ERROR: &str = "Offline (Remote API Error)";
pub const STATUS_RECONNECTING: &str = "Reconnecting...";
pub const STATUS_SYNC_FAILED: &str = "Offline (Sync Failed)";
pub const STATUS_REMOTE_ERROR: &str = "Offline (Remote Error)";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SystemMode {
    Online,
    Offline,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeEvent {
    /// The remote face capability failed or timed out.
    RemoteFailure,
    /// The quick reachability probe before an online tick failed.
    ProbeFailure,
    /// The connectivity monitor found the network and is reconnecting.
    ReconnectStarted,
    ReconnectSucceeded,
    ReconnectFailed,
}

impl SystemMode {
    /// Next mode for `event`, or `None` when the edge does not exist.
    pub fn on(self, event: ModeEvent) -> Option<SystemMode> {
        use ModeEvent::*;
        use SystemMode::*;
        match (self, event) {
            (Online, RemoteFailure) | (Online, ProbeFailure) => Some(Offline),
            (Offline, ReconnectStarted) => Some(Reconnecting),
            (Reconnecting, ReconnectSucceeded) => Some(Online),
            (Reconnecting, ReconnectFailed) => Some(Offline),
            _ => None,
        }
    }

    /// Offline and Reconnecting both run detection locally.
    pub fn is_offline(self) -> bool {
        self != SystemMode::Online
    }
}

/// Everything guarded by the shared lock.
pub struct Shared {
    mode: SystemMode,
    status: String,
    remote: Option<RemoteHandles>,
    pub recorder: IncidentRecorder,
}

impl Shared {
    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Current remote handles, if any were ever established.
    pub fn remote(&self) -> Option<RemoteHandles> {
        self.remote.clone()
    }

    fn apply(&mut self, event: ModeEvent) -> bool {
        match self.mode.on(event) {
            Some(next) => {
                log::info!("mode: {:?} -> {:?} on {:?}", self.mode, next, event);
                self.mode = next;
                true
            }
            None => false,
        }
    }

    /// Downgrade from Online. Returns false (and leaves the status alone)
    /// when not Online.
    pub fn go_offline(&mut self, event: ModeEvent, status: &str) -> bool {
        if self.apply(event) {
            self.status = status.to_string();
            true
        } else {
            false
        }
    }

    /// Claim the reconnect slot. Only succeeds from Offline, so two monitors
    /// can never reconnect at once.
    pub fn begin_reconnect(&mut self) -> bool {
        if self.apply(ModeEvent::ReconnectStarted) {
            self.status = STATUS_RECONNECTING.to_string();
            true
        } else {
            false
        }
    }

    /// Install fresh handles and go Online in one step.
    pub fn finish_reconnect(&mut self, handles: RemoteHandles) -> bool {
        if self.apply(ModeEvent::ReconnectSucceeded) {
            self.remote = Some(handles);
            self.status = STATUS_ONLINE.to_string();
            true
        } else {
            false
        }
    }

    pub fn abort_reconnect(&mut self, status: &str) -> bool {
        if self.apply(ModeEvent::ReconnectFailed) {
            self.status = status.to_string();
            true
        } else {
            false
        }
    }
}

pub struct SharedState {
    inner: Mutex<Shared>,
}

impl SharedState {
    /// Start Offline without handles.
    pub fn offline(recorder: IncidentRecorder) -> Self {
        Self::with_mode(SystemMode::Offline, STATUS_OFFLINE, None, recorder)
    }

    /// Start Online with handles established at startup.
    pub fn online(handles: RemoteHandles, recorder: IncidentRecorder) -> Self {
        Self::with_mode(SystemMode::Online, STATUS_ONLINE, Some(handles), recorder)
    }

    fn with_mode(
        mode: SystemMode,
        status: &str,
        remote: Option<RemoteHandles>,
        recorder: IncidentRecorder,
    ) -> Self {
        Self {
            inner: Mutex::new(Shared {
                mode,
                status: status.to_string(),
                remote,
                recorder,
            }),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Shared>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("shared state lock poisoned"))
    }

    pub fn mode(&self) -> Result<SystemMode> {
        Ok(self.lock()?.mode())
    }

    pub fn status(&self) -> Result<String> {
        Ok(self.lock()?.status().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MjpegSinkFactory;

    fn recorder() -> IncidentRecorder {
        IncidentRecorder::new(Box::new(MjpegSinkFactory::new(60)), std::env::temp_dir())
    }

    #[test]
    fn transition_table() {
        use ModeEvent::*;
        use SystemMode::*;
        assert_eq!(Online.on(RemoteFailure), Some(Offline));
        assert_eq!(Online.on(ProbeFailure), Some(Offline));
        assert_eq!(Offline.on(ReconnectStarted), Some(Reconnecting));
        assert_eq!(Reconnecting.on(ReconnectSucceeded), Some(Online));
        assert_eq!(Reconnecting.on(ReconnectFailed), Some(Offline));

        assert_eq!(Online.on(ReconnectStarted), None);
        assert_eq!(Reconnecting.on(ReconnectStarted), None);
        assert_eq!(Offline.on(RemoteFailure), None);
        assert_eq!(Offline.on(ReconnectSucceeded), None);
    }

    #[test]
    fn reconnect_slot_is_exclusive() -> Result<()> {
        let state = SharedState::offline(recorder());
        assert!(state.lock()?.begin_reconnect());
        assert!(!state.lock()?.begin_reconnect());
        assert_eq!(state.status()?, STATUS_RECONNECTING);

        assert!(state.lock()?.abort_reconnect(STATUS_SYNC_FAILED));
        assert_eq!(state.mode()?, SystemMode::Offline);
        assert_eq!(state.status()?, STATUS_SYNC_FAILED);
        Ok(())
    }

    #[test]
    fn go_offline_only_from_online() -> Result<()> {
        let state = SharedState::offline(recorder());
        assert!(!state
            .lock()?
            .go_offline(ModeEvent::RemoteFailure, STATUS_REMOTE_API_ERROR));
        assert_eq!(state.status()?, STATUS_OFFLINE);
        Ok(())
    }

    #[test]
    fn reconnecting_counts_as_offline() {
        assert!(SystemMode::Reconnecting.is_offline());
        assert!(SystemMode::Offline.is_offline());
        assert!(!SystemMode::Online.is_offline());
    }
}

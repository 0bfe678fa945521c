//! Background connectivity monitor.
//!
//! Polls while the agent is Offline. When the network answers it claims the
//! reconnect slot, builds fresh remote handles, refreshes the mirror, and
//! only then installs the handles and flips to Online, all in one critical
//! section. The loop never sees new handles with a stale gallery.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ConnectivitySettings;
use crate::remote::{Reachability, RemoteConnector, RemoteHandles};
use crate::state::{SharedState, SystemMode, STATUS_REMOTE_ERROR, STATUS_SYNC_FAILED};
use crate::sync::Resync;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Online, or a reconnect is already running.
    Idle,
    Unreachable,
    Reconnected,
    Failed,
}

pub struct ConnectivityMonitor {
    state: Arc<SharedState>,
    probe: Arc<dyn Reachability>,
    connector: Arc<dyn RemoteConnector>,
    resync: Arc<dyn Resync>,
    settings: ConnectivitySettings,
}

impl ConnectivityMonitor {
    pub fn new(
        state: Arc<SharedState>,
        probe: Arc<dyn Reachability>,
        connector: Arc<dyn RemoteConnector>,
        resync: Arc<dyn Resync>,
        settings: ConnectivitySettings,
    ) -> Self {
        Self {
            state,
            probe,
            connector,
            resync,
            settings,
        }
    }

    /// One polling step.
    pub fn tick(&self) -> Result<TickOutcome> {
        if self.state.mode()? != SystemMode::Offline {
            return Ok(TickOutcome::Idle);
        }
        if !self.probe.is_reachable(self.settings.probe_timeout) {
            return Ok(TickOutcome::Unreachable);
        }
        if !self.state.lock()?.begin_reconnect() {
            return Ok(TickOutcome::Idle);
        }
        log::info!("monitor: network restored, reconnecting");

        match self.reconnect() {
            Ok(handles) => {
                self.state.lock()?.finish_reconnect(handles);
                log::info!("monitor: sync complete, switching to online");
                Ok(TickOutcome::Reconnected)
            }
            Err((status, err)) => {
                log::warn!("monitor: reconnect failed: {:#}", err);
                self.state.lock()?.abort_reconnect(status);
                Ok(TickOutcome::Failed)
            }
        }
    }

    fn reconnect(&self) -> std::result::Result<RemoteHandles, (&'static str, anyhow::Error)> {
        let handles = self
            .connector
            .connect()
            .map_err(|e| (STATUS_REMOTE_ERROR, e))?;
        let report = self
            .resync
            .refresh_identities(&handles)
            .map_err(|e| (STATUS_SYNC_FAILED, e))?;
        log::info!(
            "monitor: gallery refreshed ({} cached, {} new)",
            report.reused,
            report.computed
        );
        match self.resync.refresh_profiles(&handles) {
            Ok(count) => log::info!("monitor: {} profiles mirrored", count),
            Err(err) if self.settings.require_profile_mirror => {
                return Err((STATUS_SYNC_FAILED, err));
            }
            Err(err) => log::warn!("monitor: keeping stale profile mirror: {:#}", err),
        }
        Ok(handles)
    }

    /// Poll every `poll_interval` until `shutdown` is set.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            log::info!(
                "monitor: polling every {:?} (probe {})",
                self.settings.poll_interval,
                self.settings.probe_addr
            );
            while sleep_unless_shutdown(self.settings.poll_interval, &shutdown) {
                if let Err(err) = self.tick() {
                    log::error!("monitor: {:#}", err);
                }
            }
            log::info!("monitor: stopped");
        })
    }
}

/// Sleep for `total`, waking early on shutdown. Returns false on shutdown.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_false_on_shutdown() {
        let flag = AtomicBool::new(true);
        assert!(!sleep_unless_shutdown(Duration::from_secs(10), &flag));
        flag.store(false, Ordering::SeqCst);
        assert!(sleep_unless_shutdown(Duration::from_millis(1), &flag));
    }
}

//! doorwatchd - door camera monitoring daemon
//!
//! This daemon:
//! 1. Loads local detection backends (fatal if they cannot be loaded)
//! 2. Connects to the remote backend if reachable, else starts Offline from
//!    the local mirror
//! 3. Spawns the connectivity monitor and the stdin command listener
//! 4. Runs the frame loop, writing one JSON record per frame to stdout
//! 5. On Ctrl-C, stops the loop and lets the last incident upload finish

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use doorwatch::{
    build_local_backends, spawn_listener, CameraSource, Collaborators, ConnectivityMonitor,
    DoorwatchConfig, FrameSource, Gallery, GalleryEncoder, IncidentRecorder, MirrorSync,
    MjpegSinkFactory, Orchestrator, ProfileStore, Reachability, RemoteConnector, Resync,
    SharedState, StorageConnector, TcpProbe,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Door camera agent: occupant recognition, threat alerts, incident recording"
)]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "DOORWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // stderr only; stdout carries the output stream
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = DoorwatchConfig::load_from(args.config.as_deref())?;

    let backends = build_local_backends(&cfg.detection)
        .context("failed to load local detection backends")?;
    let gallery_backends = build_local_backends(&cfg.detection)
        .context("failed to load gallery backends")?;
    let encoder = GalleryEncoder {
        detector: gallery_backends.faces,
        encoder: gallery_backends.encoder,
        max_dim: cfg.detection.max_gallery_dim,
    };

    let gallery = Arc::new(Gallery::new());
    let profiles = Arc::new(ProfileStore::new());
    let mirror = Arc::new(MirrorSync::new(
        &cfg,
        gallery.clone(),
        encoder,
        profiles.clone(),
    ));
    let probe = Arc::new(TcpProbe::new(cfg.connectivity.probe_addr.clone()));
    let connector = Arc::new(StorageConnector::new(cfg.remote.clone()));
    let recorder = IncidentRecorder::new(
        Box::new(MjpegSinkFactory::new(cfg.output.jpeg_quality)),
        cfg.recording.temp_dir.clone(),
    );

    let initial = connect_initial(&cfg, probe.as_ref(), connector.as_ref(), mirror.as_ref());
    let state = Arc::new(match initial {
        Ok(handles) => {
            log::info!("online: remote backend connected");
            SharedState::online(handles, recorder)
        }
        Err(err) => {
            log::warn!("offline fallback: {:#}", err);
            if let Err(err) = mirror.load_local() {
                log::warn!("local mirror unavailable: {:#}", err);
            }
            SharedState::offline(recorder)
        }
    });

    let mut source = CameraSource::new(&cfg.camera)?;
    source.connect()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    let (commands_tx, commands_rx) = mpsc::channel();
    spawn_listener(BufReader::new(std::io::stdin()), commands_tx);

    ConnectivityMonitor::new(
        state.clone(),
        probe.clone(),
        connector,
        mirror,
        cfg.connectivity.clone(),
    )
    .spawn(shutdown.clone());

    let mut orchestrator = Orchestrator::new(
        &cfg,
        Box::new(source),
        backends,
        Collaborators {
            state,
            probe,
            gallery,
            profiles,
            commands: commands_rx,
        },
        std::io::stdout(),
    );

    log::info!(
        "doorwatchd running. camera={} mirror={}",
        cfg.camera.url,
        cfg.mirror_root.display()
    );
    let result = orchestrator.run(&shutdown);
    shutdown.store(true, Ordering::SeqCst);

    if let Some(upload) = orchestrator.finish()? {
        log::info!("waiting for the last incident upload");
        let _ = upload.join();
    }
    result
}

/// Probe, connect and sync the mirror. Any failure means starting Offline.
fn connect_initial(
    cfg: &DoorwatchConfig,
    probe: &dyn Reachability,
    connector: &dyn RemoteConnector,
    mirror: &MirrorSync,
) -> Result<doorwatch::RemoteHandles> {
    log::info!("checking connection to {}", cfg.connectivity.probe_addr);
    if !probe.is_reachable(cfg.connectivity.probe_timeout) {
        anyhow::bail!("no network connection");
    }
    let handles = connector.connect()?;
    mirror.refresh_identities(&handles)?;
    if let Err(err) = mirror.refresh_profiles(&handles) {
        if cfg.connectivity.require_profile_mirror {
            return Err(err);
        }
        log::warn!("keeping stale profile mirror: {:#}", err);
        mirror.load_local_profiles()?;
    }
    Ok(handles)
}

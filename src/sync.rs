//! Local mirror of the remote profile and image containers.
//!
//! The loop only ever reads the mirror. A resync downloads the containers,
//! then rebuilds the identity gallery and swaps in a fresh profile map.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::DoorwatchConfig;
use crate::identity::{is_gallery_file, Gallery, GalleryEncoder, ReloadReport};
use crate::profiles::ProfileStore;
use crate::remote::RemoteHandles;
use crate::storage::{validate_segment, BlobStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub pruned: usize,
    /// Keys that would not map to a plain file name inside the mirror.
    pub rejected: usize,
}

/// Download every key of `container` accepted by `filter` into `dest`.
/// With `prune`, local files no longer present remotely are removed.
/// Keys that are not a single path segment are skipped.
pub fn sync_container(
    blobs: &dyn BlobStore,
    container: &str,
    dest: &Path,
    filter: fn(&str) -> bool,
    prune: bool,
) -> Result<SyncReport> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("create mirror dir {}", dest.display()))?;
    let mut report = SyncReport::default();
    let mut keys = BTreeSet::new();
    for key in blobs
        .list(container)
        .with_context(|| format!("list container {}", container))?
    {
        if !filter(&key) {
            continue;
        }
        if let Err(err) = validate_segment(&key) {
            log::warn!("mirror: skipping {}/{}: {}", container, key, err);
            report.rejected += 1;
            continue;
        }
        keys.insert(key);
    }

    for key in &keys {
        let data = blobs
            .get(container, key)
            .with_context(|| format!("download {}/{}", container, key))?;
        let partial = dest.join(format!(".{}.partial", key));
        std::fs::write(&partial, &data)?;
        std::fs::rename(&partial, dest.join(key))?;
        report.downloaded += 1;
    }

    if prune {
        for entry in std::fs::read_dir(dest)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if filter(&name) && !keys.contains(&name) {
                std::fs::remove_file(entry.path())?;
                report.pruned += 1;
            }
        }
    }
    Ok(report)
}

fn is_profile_file(name: &str) -> bool {
    name.ends_with(".json")
}

/// What the connectivity monitor needs to bring the mirror up to date.
pub trait Resync: Send + Sync {
    fn refresh_identities(&self, handles: &RemoteHandles) -> Result<ReloadReport>;

    fn refresh_profiles(&self, handles: &RemoteHandles) -> Result<usize>;
}

pub struct MirrorSync {
    gallery: Arc<Gallery>,
    encoder: Mutex<GalleryEncoder>,
    profiles: Arc<ProfileStore>,
    images_dir: PathBuf,
    profiles_dir: PathBuf,
    image_container: String,
    profile_container: String,
}

impl MirrorSync {
    pub fn new(
        cfg: &DoorwatchConfig,
        gallery: Arc<Gallery>,
        encoder: GalleryEncoder,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        Self {
            gallery,
            encoder: Mutex::new(encoder),
            profiles,
            images_dir: cfg.images_dir(),
            profiles_dir: cfg.profiles_dir(),
            image_container: cfg.remote.image_container.clone(),
            profile_container: cfg.remote.profile_container.clone(),
        }
    }

    fn reload_gallery(&self) -> Result<ReloadReport> {
        let mut encoder = self
            .encoder
            .lock()
            .map_err(|_| anyhow!("gallery encoder lock poisoned"))?;
        self.gallery.reload_from_dir(&self.images_dir, &mut encoder)
    }

    pub fn load_local_profiles(&self) -> Result<usize> {
        self.profiles.load_dir(&self.profiles_dir)
    }

    /// Build the gallery and profile map from whatever is already mirrored.
    pub fn load_local(&self) -> Result<()> {
        let report = self.reload_gallery()?;
        let profiles = self.load_local_profiles()?;
        log::info!(
            "mirror: loaded {} identities and {} profiles from {}",
            report.total(),
            profiles,
            self.images_dir
                .parent()
                .unwrap_or(&self.images_dir)
                .display()
        );
        Ok(())
    }
}

impl Resync for MirrorSync {
    fn refresh_identities(&self, handles: &RemoteHandles) -> Result<ReloadReport> {
        let synced = sync_container(
            handles.blobs.as_ref(),
            &self.image_container,
            &self.images_dir,
            is_gallery_file,
            false,
        )?;
        log::info!("mirror: {} images downloaded", synced.downloaded);
        self.reload_gallery()
    }

    fn refresh_profiles(&self, handles: &RemoteHandles) -> Result<usize> {
        let synced = sync_container(
            handles.blobs.as_ref(),
            &self.profile_container,
            &self.profiles_dir,
            is_profile_file,
            true,
        )?;
        log::info!(
            "mirror: {} profiles downloaded, {} removed",
            synced.downloaded,
            synced.pruned
        );
        self.profiles.load_dir(&self.profiles_dir)
    }
}

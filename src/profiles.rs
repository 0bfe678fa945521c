//! Occupant profiles and the local profile mirror.
//!
//! Recognized names resolve to profiles synchronously from an in-memory
//! mirror of the remote profile container. The mirror is replaced wholesale
//! whenever the remote store is reached; lookups never touch the network.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::frame::FaceRect;

/// Name the recognizer reports for faces with no gallery match.
pub const UNKNOWN_NAME: &str = "Unknown";

const UNKNOWN_STATUS: &str = "Access Denied - Unknown Person";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileRecord {
    pub name: String,
    pub surname: String,
    pub status: String,
    pub dynamic_field: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessLevel {
    Full,
    Partial,
    Denied,
    Other,
}

impl ProfileRecord {
    /// Sentinel for an unrecognized face.
    pub fn unknown_person() -> Self {
        Self {
            name: String::new(),
            surname: UNKNOWN_NAME.to_string(),
            status: UNKNOWN_STATUS.to_string(),
            dynamic_field: String::new(),
        }
    }

    /// Sentinel for a recognized name with no mirrored profile.
    pub fn missing(name: &str) -> Self {
        Self {
            name: String::new(),
            surname: name.to_string(),
            status: format!("No profile for {}", name),
            dynamic_field: String::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name.is_empty() && self.surname == UNKNOWN_NAME
    }

    pub fn access_level(&self) -> AccessLevel {
        let status = self.status.as_str();
        if status.contains("Denied") || status.contains("No profile") {
            AccessLevel::Denied
        } else if status.contains("Only first floor") {
            AccessLevel::Partial
        } else if status.contains("Full") {
            AccessLevel::Full
        } else {
            AccessLevel::Other
        }
    }
}

/// A detected face paired with its resolved profile. Serializes as a
/// two-element array `[rect, profile]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult(pub FaceRect, pub ProfileRecord);

impl DetectionResult {
    pub fn rect(&self) -> &FaceRect {
        &self.0
    }

    pub fn profile(&self) -> &ProfileRecord {
        &self.1
    }
}

/// Local mirror of the profile container, keyed by identity name.
#[derive(Default)]
pub struct ProfileStore {
    records: RwLock<HashMap<String, ProfileRecord>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: HashMap<String, ProfileRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Resolve a recognized name. Never fails: unknown and unmirrored names
    /// map to sentinel profiles.
    pub fn resolve(&self, name: &str) -> ProfileRecord {
        if name == UNKNOWN_NAME {
            return ProfileRecord::unknown_person();
        }
        match self.records.read() {
            Ok(records) => records
                .get(name)
                .cloned()
                .unwrap_or_else(|| ProfileRecord::missing(name)),
            Err(_) => {
                log::error!("profile mirror lock poisoned; treating {} as unmirrored", name);
                ProfileRecord::missing(name)
            }
        }
    }

    /// Replace the whole mirror.
    pub fn replace(&self, records: HashMap<String, ProfileRecord>) -> Result<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| anyhow!("profile mirror lock poisoned"))?;
        *guard = records;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload from `*.json` files in `dir`, keyed by file stem. Unreadable
    /// files are skipped. A missing directory yields an empty mirror.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let records = read_profile_dir(dir)?;
        let count = records.len();
        self.replace(records)?;
        Ok(count)
    }
}

fn read_profile_dir(dir: &Path) -> Result<HashMap<String, ProfileRecord>> {
    let mut records = HashMap::new();
    if !dir.exists() {
        return Ok(records);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<ProfileRecord>(&raw).map_err(Into::into));
        match parsed {
            Ok(record) => {
                records.insert(name.to_string(), record);
            }
            Err(err) => log::warn!("skipping profile {}: {}", path.display(), err),
        }
    }
    Ok(records)
}

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::detect::Signature;

/// A gallery identity ready for matching.
#[derive(Clone, Debug, PartialEq)]
pub struct KnownFace {
    pub name: String,
    pub signature: Signature,
}

/// Outcome of a gallery reload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Signatures taken from the cache.
    pub reused: usize,
    /// Signatures computed during this reload.
    pub computed: usize,
    /// Files that produced no signature (no face, decode error).
    pub skipped: usize,
}

impl ReloadReport {
    /// Identities in the resulting known set.
    pub fn total(&self) -> usize {
        self.reused + self.computed
    }
}

/// Source filename -> signature. Append-only: entries are never evicted.
#[derive(Default)]
pub struct IdentityCache {
    entries: HashMap<String, Signature>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.contains_key(filename)
    }

    /// Build the known set for `filenames`, computing signatures only for
    /// filenames not yet cached. Duplicate filenames are collapsed.
    ///
    /// `compute` failures and `None` results are counted as skipped and are
    /// retried on the next reload.
    pub fn reload<I, F>(&mut self, filenames: I, mut compute: F) -> (Vec<KnownFace>, ReloadReport)
    where
        I: IntoIterator<Item = String>,
        F: FnMut(&str) -> Result<Option<Signature>>,
    {
        let filenames: BTreeSet<String> = filenames.into_iter().collect();
        let total = filenames.len();
        let mut known = Vec::with_capacity(total);
        let mut report = ReloadReport::default();

        for (i, filename) in filenames.into_iter().enumerate() {
            let name = display_name(&filename);
            if let Some(signature) = self.entries.get(&filename) {
                known.push(KnownFace {
                    name,
                    signature: signature.clone(),
                });
                report.reused += 1;
                continue;
            }

            log::info!("processing new face image {}/{}: {}", i + 1, total, filename);
            match compute(&filename) {
                Ok(Some(signature)) => {
                    self.entries.insert(filename, signature.clone());
                    known.push(KnownFace { name, signature });
                    report.computed += 1;
                }
                Ok(None) => {
                    log::warn!("no face found in {}, skipping", filename);
                    report.skipped += 1;
                }
                Err(err) => {
                    log::warn!("skipping file {}: {}", filename, err);
                    report.skipped += 1;
                }
            }
        }
        (known, report)
    }
}

/// Identity name for a gallery file: the file stem.
pub fn display_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn sig(v: f32) -> Signature {
        Signature(vec![v, v])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reload_reuses_cached_and_computes_new() {
        let mut cache = IdentityCache::new();
        let (_, first) = cache.reload(names(&["anna.jpg", "piotr.png"]), |_| Ok(Some(sig(1.0))));
        assert_eq!(first.computed, 2);

        let mut computed_for = Vec::new();
        let (known, report) = cache.reload(
            names(&["anna.jpg", "piotr.png", "ola.jpg", "marek.webp", "ewa.jpeg"]),
            |filename| {
                computed_for.push(filename.to_string());
                Ok(Some(sig(2.0)))
            },
        );

        assert_eq!(report.reused, 2);
        assert_eq!(report.computed, 3);
        assert_eq!(known.len(), 5);
        assert_eq!(cache.len(), 5);
        assert!(!computed_for.contains(&"anna.jpg".to_string()));

        let mut known_names: Vec<&str> = known.iter().map(|k| k.name.as_str()).collect();
        known_names.sort();
        known_names.dedup();
        assert_eq!(known_names, vec!["anna", "ewa", "marek", "ola", "piotr"]);
    }

    #[test]
    fn duplicate_filenames_are_collapsed() {
        let mut cache = IdentityCache::new();
        let (known, report) = cache.reload(names(&["anna.jpg", "anna.jpg"]), |_| Ok(Some(sig(1.0))));
        assert_eq!(known.len(), 1);
        assert_eq!(report.computed, 1);
    }

    #[test]
    fn failed_files_are_skipped_and_retried() {
        let mut cache = IdentityCache::new();
        let (known, report) = cache.reload(names(&["blurry.jpg", "anna.jpg"]), |f| {
            if f == "blurry.jpg" {
                Err(anyhow!("decode failed"))
            } else {
                Ok(Some(sig(1.0)))
            }
        });
        assert_eq!(known.len(), 1);
        assert_eq!(report.skipped, 1);
        assert!(!cache.contains("blurry.jpg"));

        let (_, report) = cache.reload(names(&["blurry.jpg", "anna.jpg"]), |_| Ok(Some(sig(3.0))));
        assert_eq!(report, ReloadReport { reused: 1, computed: 1, skipped: 0 });
    }
}

//! Identity gallery and recognition.
//!
//! The gallery is built from reference images in the local mirror. Each image
//! is reduced to a signature once; the cache keeps signatures across reloads
//! so a resync only pays for new files. Matching is nearest-neighbour with a
//! distance tolerance.

mod cache;

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

pub use cache::{display_name, IdentityCache, KnownFace, ReloadReport};

use crate::detect::{FaceDetector, FaceEncoder, Signature};
use crate::frame::{FaceRect, Frame};
use crate::profiles::UNKNOWN_NAME;

/// Image extensions accepted as gallery sources.
pub const GALLERY_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

pub fn is_gallery_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| GALLERY_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Detector and encoder pair used to compute gallery signatures.
pub struct GalleryEncoder {
    pub detector: Box<dyn FaceDetector>,
    pub encoder: Box<dyn FaceEncoder>,
    pub max_dim: u32,
}

impl GalleryEncoder {
    /// Signature of the largest face found in `image`, after bounding its
    /// largest side by `max_dim`. Reference images are usually cropped
    /// portraits, so when the detector finds nothing the whole image is
    /// encoded as the face.
    pub fn signature_for_image(&mut self, image: &Frame) -> Result<Option<Signature>> {
        let largest = image.width.max(image.height);
        let scaled;
        let image = if self.max_dim > 0 && largest > self.max_dim {
            scaled = image.resize_by(self.max_dim as f32 / largest as f32)?;
            &scaled
        } else {
            image
        };
        let faces = self.detector.detect_faces(image)?;
        let region = faces.first().copied().unwrap_or_else(|| {
            FaceRect::new(0, 0, image.width as i32, image.height as i32)
        });
        self.encoder.encode(image, &region)
    }
}

/// Current known identities plus the signature cache that produced them.
#[derive(Default)]
pub struct Gallery {
    cache: Mutex<IdentityCache>,
    known: RwLock<Vec<KnownFace>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_count(&self) -> usize {
        self.known.read().map(|k| k.len()).unwrap_or(0)
    }

    /// Reload from an in-memory list of filenames. The new known set replaces
    /// the old one in a single swap.
    pub fn reload_with<I, F>(&self, filenames: I, compute: F) -> Result<ReloadReport>
    where
        I: IntoIterator<Item = String>,
        F: FnMut(&str) -> Result<Option<Signature>>,
    {
        let (known, report) = {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| anyhow!("identity cache lock poisoned"))?;
            cache.reload(filenames, compute)
        };
        let mut guard = self
            .known
            .write()
            .map_err(|_| anyhow!("gallery lock poisoned"))?;
        *guard = known;
        Ok(report)
    }

    /// Reload from the image files in `dir`. A missing directory yields an
    /// empty gallery.
    pub fn reload_from_dir(&self, dir: &Path, encoder: &mut GalleryEncoder) -> Result<ReloadReport> {
        let mut filenames = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)
                .with_context(|| format!("read gallery dir {}", dir.display()))?
            {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if is_gallery_file(name) {
                        filenames.push(name.to_string());
                    }
                }
            }
        } else {
            log::warn!("gallery directory {} does not exist", dir.display());
        }

        let report = self.reload_with(filenames, |filename| {
            let bytes = std::fs::read(dir.join(filename))?;
            let image = Frame::decode(&bytes)?;
            encoder.signature_for_image(&image)
        })?;
        log::info!(
            "face database updated. cached: {}, new: {}, skipped: {}",
            report.reused,
            report.computed,
            report.skipped
        );
        Ok(report)
    }

    /// Name of the nearest known face within `tolerance`.
    pub fn best_match(&self, signature: &Signature, tolerance: f32) -> Option<String> {
        let known = self.known.read().ok()?;
        let best = known
            .iter()
            .map(|k| (k, k.signature.distance(signature)))
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, d)| *d <= tolerance)
            .map(|(k, _)| k.name.clone());
        best
    }
}

/// Maps face rectangles to gallery names.
pub struct Recognizer {
    encoder: Box<dyn FaceEncoder>,
    gallery: Arc<Gallery>,
    tolerance: f32,
}

impl Recognizer {
    pub fn new(encoder: Box<dyn FaceEncoder>, gallery: Arc<Gallery>, tolerance: f32) -> Self {
        Self {
            encoder,
            gallery,
            tolerance,
        }
    }

    /// One name per rect, `Unknown` when nothing in the gallery is close enough.
    pub fn recognize(&mut self, frame: &Frame, rects: &[FaceRect]) -> Result<Vec<String>> {
        if self.gallery.known_count() == 0 {
            return Ok(vec![UNKNOWN_NAME.to_string(); rects.len()]);
        }
        let mut names = Vec::with_capacity(rects.len());
        for rect in rects {
            let name = match self.encoder.encode(frame, rect)? {
                Some(signature) => self.gallery.best_match(&signature, self.tolerance),
                None => None,
            };
            names.push(name.unwrap_or_else(|| UNKNOWN_NAME.to_string()));
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder(Vec<f32>);

    impl FaceEncoder for FixedEncoder {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn encode(&mut self, _frame: &Frame, _rect: &FaceRect) -> Result<Option<Signature>> {
            Ok(Some(Signature(self.0.clone())))
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(vec![0u8; 4 * 4 * 3], 4, 4).unwrap()
    }

    #[test]
    fn empty_gallery_yields_unknown_per_rect() -> Result<()> {
        let mut recognizer =
            Recognizer::new(Box::new(FixedEncoder(vec![0.0])), Arc::new(Gallery::new()), 0.6);
        let names = recognizer.recognize(&frame(), &[FaceRect::default(), FaceRect::default()])?;
        assert_eq!(names, vec!["Unknown", "Unknown"]);
        Ok(())
    }

    #[test]
    fn nearest_match_within_tolerance() -> Result<()> {
        let gallery = Arc::new(Gallery::new());
        gallery.reload_with(
            vec!["anna.jpg".to_string(), "piotr.jpg".to_string()],
            |f| {
                Ok(Some(Signature(if f == "anna.jpg" {
                    vec![0.0, 0.0]
                } else {
                    vec![1.0, 0.0]
                })))
            },
        )?;

        let mut near_piotr =
            Recognizer::new(Box::new(FixedEncoder(vec![0.8, 0.0])), gallery.clone(), 0.6);
        assert_eq!(near_piotr.recognize(&frame(), &[FaceRect::default()])?, vec!["piotr"]);

        let mut far = Recognizer::new(Box::new(FixedEncoder(vec![5.0, 5.0])), gallery, 0.6);
        assert_eq!(far.recognize(&frame(), &[FaceRect::default()])?, vec!["Unknown"]);
        Ok(())
    }

    #[test]
    fn gallery_file_filter() {
        assert!(is_gallery_file("anna.JPG"));
        assert!(is_gallery_file("piotr.webp"));
        assert!(!is_gallery_file("notes.txt"));
        assert!(!is_gallery_file("noext"));
    }
}

//! Face matching against a known-face gallery.
//!
//! Recognition is a three-stage pass: detect regions on a half-resolution
//! copy (throughput), extract a feature vector per surviving region, then
//! nearest-neighbor match against the gallery by Euclidean distance. A
//! region whose best distance exceeds the configured threshold, or any
//! region when the gallery is empty, is labeled "Unknown".
//!
//! Every recognized region is persisted as a face-seen record through the
//! repository collaborator, repeated sightings included; deduplication and
//! tagging happen downstream of this engine.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::backend::{FaceBackend, FaceRegion};
use crate::error::EngineError;
use crate::frame::{BoundingBox, Frame};
use crate::repository::Repository;

/// Label used when no gallery entry is close enough.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Detection runs at half resolution; boxes are scaled back up by this.
const DETECT_DOWNSCALE: u32 = 2;

/// One recognized face within a frame.
#[derive(Clone, Debug)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub label: String,
    /// Euclidean distance to the best gallery entry; `f32::INFINITY` when
    /// the gallery was empty.
    pub distance: f32,
}

/// A labeled reference feature vector.
#[derive(Clone, Debug)]
pub struct GalleryEntry {
    pub label: String,
    pub features: Vec<f32>,
}

/// The set of known labeled faces, loaded once at startup and read-only
/// during normal operation.
#[derive(Clone, Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, features: Vec<f32>) {
        self.entries.push(GalleryEntry {
            label: label.into(),
            features,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest entry by Euclidean distance. Entries whose vector length
    /// does not match the query are ignored.
    pub fn best_match(&self, features: &[f32]) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for entry in &self.entries {
            if entry.features.len() != features.len() {
                continue;
            }
            let dist = euclidean(&entry.features, features);
            match best {
                Some((_, best_dist)) if best_dist <= dist => {}
                _ => best = Some((entry.label.as_str(), dist)),
            }
        }
        best
    }

    /// Build the gallery from a flat directory of `<label>.<ext>` reference
    /// images. References that yield no detectable face are logged and
    /// skipped; a missing directory is a configuration error.
    pub fn load_dir(
        dir: &Path,
        backend: &Arc<Mutex<dyn FaceBackend>>,
        min_confidence: f32,
    ) -> std::result::Result<Self, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::Configuration(format!(
                "known-face gallery directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut gallery = Gallery::empty();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if !matches!(ext.as_deref(), Some("jpg") | Some("jpeg") | Some("png")) {
                continue;
            }
            let Some(label) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };

            match reference_features(&path, backend, min_confidence) {
                Ok(Some(features)) => {
                    log::info!("gallery: loaded reference for '{}'", label);
                    gallery.insert(label, features);
                }
                Ok(None) => {
                    log::warn!(
                        "gallery: no face found in reference {} - skipping",
                        path.display()
                    );
                }
                Err(e) => {
                    log::warn!("gallery: failed to read {}: {}", path.display(), e);
                }
            }
        }

        log::info!("gallery: {} known face(s)", gallery.len());
        Ok(gallery)
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Decode a reference image and run detection + extraction on it.
fn reference_features(
    path: &Path,
    backend: &Arc<Mutex<dyn FaceBackend>>,
    min_confidence: f32,
) -> Result<Option<Vec<f32>>> {
    let decoded = image::open(path)?.to_rgb8();
    let (width, height) = decoded.dimensions();
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for px in decoded.pixels() {
        data.extend_from_slice(&[px.0[2], px.0[1], px.0[0]]);
    }
    let frame = Frame::new(data, width, height, chrono::Local::now());

    let mut guard = backend
        .lock()
        .map_err(|_| anyhow!("face backend lock poisoned"))?;
    let regions = detect_downscaled(&mut *guard, &frame, min_confidence)?;
    let Some(first) = regions
        .into_iter()
        .find(|r| r.region.fits_within(width, height))
    else {
        return Ok(None);
    };

    let side = guard.input_size();
    let crop = frame.cropped(&first.region).resized(side, side);
    let features = guard.extract_features(crop.data(), side)?;
    Ok(Some(features))
}

/// Run region detection on a half-resolution copy and rescale the boxes
/// back to full resolution, dropping low-confidence proposals.
fn detect_downscaled(
    backend: &mut dyn FaceBackend,
    frame: &Frame,
    min_confidence: f32,
) -> Result<Vec<FaceRegion>> {
    let small = frame.resized(
        (frame.width() / DETECT_DOWNSCALE).max(1),
        (frame.height() / DETECT_DOWNSCALE).max(1),
    );
    let regions = backend.detect_regions(small.data(), small.width(), small.height())?;
    Ok(regions
        .into_iter()
        .filter(|r| r.confidence >= min_confidence)
        .map(|r| FaceRegion {
            region: r.region.scaled(DETECT_DOWNSCALE),
            confidence: r.confidence,
        })
        .collect())
}

/// Face-region detector + feature extractor + nearest-neighbor matcher.
pub struct FaceMatcher {
    backend: Arc<Mutex<dyn FaceBackend>>,
    gallery: Gallery,
    min_confidence: f32,
    distance_threshold: f32,
}

impl FaceMatcher {
    pub fn new(
        backend: Arc<Mutex<dyn FaceBackend>>,
        gallery: Gallery,
        min_confidence: f32,
        distance_threshold: f32,
    ) -> Self {
        Self {
            backend,
            gallery,
            min_confidence,
            distance_threshold,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Detect candidate face regions at full-frame coordinates.
    pub fn detect_regions(&self, frame: &Frame) -> Result<Vec<FaceRegion>> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("face backend lock poisoned"))?;
        detect_downscaled(&mut *guard, frame, self.min_confidence)
    }

    /// Label a feature vector against the gallery.
    fn match_label(&self, features: &[f32]) -> (String, f32) {
        match self.gallery.best_match(features) {
            Some((label, dist)) if dist <= self.distance_threshold => (label.to_string(), dist),
            Some((_, dist)) => (UNKNOWN_LABEL.to_string(), dist),
            None => (UNKNOWN_LABEL.to_string(), f32::INFINITY),
        }
    }

    /// Run one full recognition pass over a frame.
    ///
    /// Per-region failures are transient: the region is skipped, the pass
    /// continues, and nothing propagates to the caller. Each recognized
    /// region is stored as a face-seen record through `repository`.
    pub fn recognize(
        &self,
        frame: &Frame,
        repository: &Arc<Mutex<dyn Repository>>,
    ) -> Vec<DetectedFace> {
        let regions = match self.detect_regions(frame) {
            Ok(regions) => regions,
            Err(e) => {
                log::warn!("face detection failed: {}", e);
                return Vec::new();
            }
        };

        let mut recognized = Vec::new();
        for candidate in regions {
            if !candidate.region.fits_within(frame.width(), frame.height()) {
                continue;
            }

            let features = match self.extract(frame, &candidate.region) {
                Ok(features) => features,
                Err(e) => {
                    log::warn!("{}", EngineError::Recognition(e.to_string()));
                    continue;
                }
            };

            let (label, distance) = self.match_label(&features);
            self.persist_sighting(frame, &candidate.region, &label, repository);
            recognized.push(DetectedFace {
                region: candidate.region,
                label,
                distance,
            });
        }

        recognized
    }

    fn extract(&self, frame: &Frame, region: &BoundingBox) -> Result<Vec<f32>> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("face backend lock poisoned"))?;
        let side = guard.input_size();
        let crop = frame.cropped(region).resized(side, side);
        guard.extract_features(crop.data(), side)
    }

    fn persist_sighting(
        &self,
        frame: &Frame,
        region: &BoundingBox,
        label: &str,
        repository: &Arc<Mutex<dyn Repository>>,
    ) {
        let crop = frame.cropped(region);
        let jpeg = match crate::overlay::encode_jpeg(&crop) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::warn!("face crop encode failed: {}", e);
                return;
            }
        };
        let saved = repository
            .lock()
            .map_err(|_| anyhow!("repository lock poisoned"))
            .and_then(|mut repo| repo.save_face(&jpeg, label, frame.captured_at()));
        if let Err(e) = saved {
            log::warn!("failed to persist face sighting: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubFaceBackend;
    use crate::frame::solid_frame;
    use crate::repository::InMemoryRepository;
    use chrono::Local;

    fn stub_backend() -> Arc<Mutex<dyn FaceBackend>> {
        Arc::new(Mutex::new(StubFaceBackend::new()))
    }

    fn matcher_with(gallery: Gallery, threshold: f32) -> FaceMatcher {
        FaceMatcher::new(stub_backend(), gallery, 0.5, threshold)
    }

    fn three_entry_gallery() -> Gallery {
        // Distances from the query [0.0] are exactly 1.0, 4.9, and 9.0.
        let mut gallery = Gallery::empty();
        gallery.insert("alice", vec![1.0]);
        gallery.insert("bob", vec![4.9]);
        gallery.insert("carol", vec![9.0]);
        gallery
    }

    #[test]
    fn nearest_entry_wins_under_threshold() {
        let matcher = matcher_with(three_entry_gallery(), 5.0);
        let (label, distance) = matcher.match_label(&[0.0]);
        assert_eq!(label, "alice");
        assert!((distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tight_threshold_yields_unknown() {
        let matcher = matcher_with(three_entry_gallery(), 0.5);
        let (label, distance) = matcher.match_label(&[0.0]);
        assert_eq!(label, UNKNOWN_LABEL);
        assert!((distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_gallery_is_always_unknown() {
        let matcher = matcher_with(Gallery::empty(), 5.0);
        let (label, distance) = matcher.match_label(&[0.0, 1.0]);
        assert_eq!(label, UNKNOWN_LABEL);
        assert!(distance.is_infinite());
    }

    /// A frame the stub backend sees a "face" in: dark scene with a bright
    /// block in the top-left corner.
    fn face_frame() -> Frame {
        let width = 64u32;
        let height = 64u32;
        let mut frame = solid_frame(width, height, [20, 20, 20]);
        for y in 0..16u32 {
            for x in 0..16u32 {
                let idx = ((y * width + x) * 3) as usize;
                frame.data_mut()[idx] = 250;
                frame.data_mut()[idx + 1] = 250;
                frame.data_mut()[idx + 2] = 250;
            }
        }
        frame
    }

    #[test]
    fn recognize_labels_and_persists_sightings() {
        let backend = stub_backend();
        let frame = face_frame();

        // Seed the gallery with features from the same crop the matcher
        // will produce, so the distance is ~0.
        let seed_features = {
            let mut guard = backend.lock().unwrap();
            let regions = detect_downscaled(&mut *guard, &frame, 0.5).unwrap();
            let side = guard.input_size();
            let crop = frame.cropped(&regions[0].region).resized(side, side);
            guard.extract_features(crop.data(), side).unwrap()
        };
        let mut gallery = Gallery::empty();
        gallery.insert("alice", seed_features);

        let matcher = FaceMatcher::new(backend, gallery, 0.5, 5.0);
        let store = Arc::new(Mutex::new(InMemoryRepository::new()));
        let repository: Arc<Mutex<dyn Repository>> = store.clone();

        let faces = matcher.recognize(&frame, &repository);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].label, "alice");
        assert!(faces[0].distance < 0.5);

        // The sighting was persisted, and a second pass persists again -
        // repeated detections are recorded by design.
        matcher.recognize(&frame, &repository);
        assert_eq!(store.lock().unwrap().face_count(), 2);
    }

    #[test]
    fn gallery_load_skips_faceless_references() {
        let dir = tempfile::tempdir().unwrap();

        // "alice.png": bright block the stub backend will find.
        let bright = image::RgbImage::from_fn(64, 64, |x, y| {
            if x < 16 && y < 16 {
                image::Rgb([250, 250, 250])
            } else {
                image::Rgb([20, 20, 20])
            }
        });
        bright.save(dir.path().join("alice.png")).unwrap();

        // "dark.png": nothing detectable.
        let dark = image::RgbImage::from_pixel(64, 64, image::Rgb([15, 15, 15]));
        dark.save(dir.path().join("dark.png")).unwrap();

        // Non-image files are ignored outright.
        std::fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();

        let gallery = Gallery::load_dir(dir.path(), &stub_backend(), 0.5).unwrap();
        assert_eq!(gallery.len(), 1);

        let query = gallery.entries[0].features.clone();
        assert_eq!(gallery.best_match(&query).unwrap().0, "alice");
    }

    #[test]
    fn missing_gallery_directory_is_a_configuration_error() {
        let err = Gallery::load_dir(Path::new("/nonexistent/gallery"), &stub_backend(), 0.5)
            .err()
            .expect("configuration error");
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn mismatched_feature_lengths_are_ignored() {
        let mut gallery = Gallery::empty();
        gallery.insert("short", vec![0.0]);
        gallery.insert("full", vec![0.0, 0.0, 3.0]);
        let (label, _) = matcher_with(gallery, 10.0).match_label(&[0.0, 0.0, 0.0]);
        assert_eq!(label, "full");
    }

    #[test]
    fn solid_frames_for_tests_have_timestamps() {
        let frame = solid_frame(4, 4, [0, 0, 0]);
        assert!(frame.captured_at() <= Local::now());
    }
}

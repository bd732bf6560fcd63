//! Face indexing: turns detector output into face markers.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Tuning;
use crate::embedding::{Embedding, Embeddings};
use crate::error::{FacesError, Result};
use crate::marker::{Area, Marker};
use crate::source::Source;
use crate::store::FaceStore;

/// One face found by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub area: Area,
    #[serde(default)]
    pub landmarks: Vec<Area>,
    /// Face size in pixels.
    #[serde(default)]
    pub size: i32,
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Face detector and embedding model.
pub trait Detector: Send + Sync {
    fn detect(&self, path: &Path) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexResult {
    pub added: usize,
    /// Overlapping an existing marker of the same file.
    pub duplicates: usize,
    /// No usable or a blacklisted embedding.
    pub skipped: usize,
    /// Area out of range.
    pub invalid: usize,
}

pub struct Indexer {
    store: Arc<FaceStore>,
    tuning: Tuning,
    detector: Arc<dyn Detector>,
}

impl Indexer {
    pub fn new(store: Arc<FaceStore>, tuning: Tuning, detector: Arc<dyn Detector>) -> Self {
        Self {
            store,
            tuning,
            detector,
        }
    }

    /// Detects faces in the file at `path` and stores them as markers of
    /// `file_uid`. Detector failures are logged and leave the file
    /// untouched.
    pub fn index_file(&self, file_uid: &str, path: &Path) -> Result<IndexResult> {
        let detections = match self.detector.detect(path) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("index: {} in {}", e, path.display());
                return Ok(IndexResult::default());
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.store.add_file(file_uid, &name)?;

        let result = self.add_detections(file_uid, detections)?;
        if result.added > 0 {
            tracing::info!("index: found {} faces in {}", result.added, name);
        }
        Ok(result)
    }

    /// Stores detections as face markers of a registered file.
    pub fn add_detections(&self, file_uid: &str, detections: Vec<Detection>) -> Result<IndexResult> {
        let mut result = IndexResult::default();
        let mut areas: Vec<Area> = self
            .store
            .file_markers(file_uid)?
            .into_iter()
            .filter(Marker::is_face)
            .map(|m| m.area)
            .collect();

        for d in detections {
            if d.embedding.is_empty() {
                result.skipped += 1;
                continue;
            }
            let embedding = Embedding::new(d.embedding);
            if self.tuning.blacklisted(&embedding) {
                tracing::debug!("index: skipped blacklisted face in {}", file_uid);
                result.skipped += 1;
                continue;
            }
            if areas
                .iter()
                .any(|a| a.overlap_percent(&d.area) > self.tuning.overlap_threshold)
            {
                result.duplicates += 1;
                continue;
            }

            let embeddings = Embeddings::from_vec(vec![embedding])?;
            let mut marker =
                Marker::new_face(file_uid, Source::Image, d.area, d.size, d.score, &embeddings)?;
            marker.landmarks = d.landmarks;

            match self.store.create_marker(&marker) {
                Ok(()) => {
                    areas.push(marker.area);
                    result.added += 1;
                }
                Err(FacesError::InvalidArea(msg)) => {
                    tracing::warn!("index: {} in {}", msg, file_uid);
                    result.invalid += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if result.added > 0 {
            self.store.flag_refresh(file_uid)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn detect(&self, _path: &Path) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl Detector for Broken {
        fn detect(&self, path: &Path) -> Result<Vec<Detection>> {
            Err(FacesError::Detector(format!("cannot decode {}", path.display())))
        }
    }

    fn detection(x: f32, e: f32) -> Detection {
        Detection {
            area: Area::new(x, 0.1, 0.2, 0.2),
            landmarks: Vec::new(),
            size: 120,
            score: 40,
            embedding: vec![e, 0.5],
        }
    }

    #[test]
    fn overlapping_and_invalid_detections() {
        let store = Arc::new(FaceStore::in_memory());
        let mut bad = detection(0.9, 0.3);
        bad.area.w = 0.0;
        let mut empty = detection(0.6, 0.0);
        empty.embedding.clear();
        let detector = Fixed(vec![
            detection(0.1, 0.1),
            detection(0.12, 0.2),
            detection(0.5, 0.2),
            bad,
            empty,
        ]);
        let indexer = Indexer::new(store.clone(), Tuning::default(), Arc::new(detector));

        let r = indexer.index_file("f1", &PathBuf::from("/photos/a.jpg")).unwrap();
        assert_eq!(
            r,
            IndexResult {
                added: 2,
                duplicates: 1,
                skipped: 1,
                invalid: 1
            }
        );
        assert!(store.has_file("f1").unwrap());
        assert_eq!(store.file_markers("f1").unwrap().len(), 2);
        assert_eq!(store.refresh_flags().unwrap(), vec!["f1".to_string()]);

        let again = indexer.index_file("f1", &PathBuf::from("/photos/a.jpg")).unwrap();
        assert_eq!(again.added, 0);
        assert_eq!(again.duplicates, 3);
    }

    #[test]
    fn blacklisted_embeddings_are_skipped() {
        let store = Arc::new(FaceStore::in_memory());
        let mut tuning = Tuning::default();
        tuning.blacklist = Embeddings::from_rows(vec![vec![0.1, 0.5]]).unwrap();
        let indexer = Indexer::new(store.clone(), tuning, Arc::new(Fixed(vec![detection(0.1, 0.1)])));
        let r = indexer.add_detections("f1", vec![detection(0.1, 0.1)]).unwrap();
        assert_eq!(r.skipped, 1);
        assert!(store.markers().unwrap().is_empty());
    }

    #[test]
    fn detector_failure_skips_file() {
        let store = Arc::new(FaceStore::in_memory());
        let indexer = Indexer::new(store.clone(), Tuning::default(), Arc::new(Broken));
        let r = indexer.index_file("f1", Path::new("missing.jpg")).unwrap();
        assert_eq!(r, IndexResult::default());
        assert!(!store.has_file("f1").unwrap());
    }
}

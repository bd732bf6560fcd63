//! Face recognition settings.
//!
//! Loaded from YAML. Every field has a default, so an empty or missing file
//! yields a working configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::embedding::{Embedding, Embeddings};
use crate::error::{FacesError, Result};

/// Top-level settings for the face pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacesConfig {
    /// Turns the whole pipeline off; runs return `FacesError::Disabled`.
    pub disabled: bool,

    /// Threads used for per-marker distance fan-out and neighbourhood
    /// queries. 0 picks the available parallelism.
    pub workers: usize,

    /// Markers loaded per page during matching.
    pub match_page_size: usize,

    /// Pause between pages, in milliseconds.
    pub match_page_pause_ms: u64,

    pub tuning: Tuning,
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            workers: 0,
            match_page_size: 500,
            match_page_pause_ms: 50,
            tuning: Tuning::default(),
        }
    }
}

impl FacesConfig {
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: FacesConfig = if data.trim().is_empty() {
            FacesConfig::default()
        } else {
            serde_yaml::from_str(data).map_err(|e| FacesError::Settings(e.to_string()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => Self::from_yaml(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(FacesError::Settings(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.match_page_size == 0 {
            return Err(FacesError::Settings("match_page_size must be positive".into()));
        }
        if self.tuning.cluster_core < 1 {
            return Err(FacesError::Settings("cluster_core must be at least 1".into()));
        }
        if self.tuning.cluster_dist.is_nan() || self.tuning.cluster_dist <= 0.0 {
            return Err(FacesError::Settings("cluster_dist must be positive".into()));
        }
        if self.tuning.overlap_threshold > 100 {
            return Err(FacesError::Settings("overlap_threshold is a percentage".into()));
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the available parallelism.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

/// Clustering and matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Minimum neighbours for a core point.
    pub cluster_core: usize,
    /// Neighbourhood radius for clustering.
    pub cluster_dist: f32,
    /// New markers needed before a clustering pass runs.
    pub sample_threshold: usize,
    /// Smallest cluster that becomes a face.
    pub cluster_min_size: usize,
    /// Minimum face size in pixels for clustering and manual faces.
    pub cluster_size_threshold: i32,
    /// Minimum detector score for clustering and manual faces.
    pub cluster_score_threshold: i32,
    /// Faces with fewer samples are unsuitable for matching.
    pub min_samples: usize,
    /// Radius given to a face built from a single embedding.
    pub single_sample_radius: f64,

    /// Known-bad embeddings. Faces near them are unsuitable.
    pub blacklist: Embeddings,
    pub blacklist_radius: f64,

    /// Child reference embeddings. Faces near them are unsuitable.
    pub children: Embeddings,
    pub children_radius: f64,

    /// Overlap, in percent, above which a detection duplicates a marker.
    pub overlap_threshold: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            cluster_core: 4,
            cluster_dist: 0.64,
            sample_threshold: 8,
            cluster_min_size: 10,
            cluster_size_threshold: 50,
            cluster_score_threshold: 15,
            min_samples: 1,
            single_sample_radius: 0.35,
            blacklist: Embeddings::new(),
            blacklist_radius: 0.86,
            children: Embeddings::new(),
            children_radius: 0.75,
            overlap_threshold: 41,
        }
    }
}

impl Tuning {
    /// Reports whether a face with this centroid and sample count should be
    /// kept out of matching.
    pub fn unsuitable(&self, centroid: &Embedding, samples: usize) -> bool {
        samples < self.min_samples
            || self.blacklist.contains(centroid, self.blacklist_radius)
            || self.children.contains(centroid, self.children_radius)
    }

    /// Reports whether an embedding is too close to a blacklisted one to be
    /// stored at all.
    pub fn blacklisted(&self, e: &Embedding) -> bool {
        self.blacklist.contains(e, self.blacklist_radius)
    }

    /// Quality gate for embeddings used to build faces.
    pub fn clusterable(&self, size: i32, score: i32) -> bool {
        size >= self.cluster_size_threshold && score >= self.cluster_score_threshold
    }
}

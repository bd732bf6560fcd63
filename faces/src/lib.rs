//! Face identity resolution.
//!
//! Face markers detected on files are grouped into faces by density-based
//! clustering, matched to the closest face on every run, and linked to
//! named subjects. Names given by people are authoritative: automatic
//! matching never overrides them, and naming one marker corrects every
//! automatically matched marker of the same face.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use facekit_faces::{FaceStore, Faces, FacesConfig, FacesOptions};
//!
//! let store = Arc::new(FaceStore::in_memory());
//! let faces = Faces::new(store, FacesConfig::default());
//! let report = faces.start(FacesOptions::default()).unwrap();
//! assert_eq!(report.new_faces, 0);
//! ```

pub mod cluster;
pub mod config;
pub mod embedding;
pub mod error;
pub mod face;
pub mod index;
pub mod keys;
pub mod link;
pub mod maintenance;
pub mod marker;
pub mod matching;
pub mod optimize;
pub mod people;
pub mod source;
pub mod store;
pub mod subject;
pub mod worker;

pub use config::{FacesConfig, Tuning};
pub use embedding::{Embedding, Embeddings};
pub use error::{FacesError, Partial, Result};
pub use face::Face;
pub use index::{Detection, Detector, IndexResult, Indexer};
pub use maintenance::MergeReport;
pub use marker::{Area, Marker, MarkerType, UNKNOWN_DIST};
pub use matching::MatchResult;
pub use optimize::OptimizeResult;
pub use people::MarkerForm;
pub use source::Source;
pub use store::{Change, FaceStore, FileRecord};
pub use subject::Subject;
pub use worker::{Faces, FacesOptions, RunContext, RunReport};

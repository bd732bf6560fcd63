//! Density-based clustering of embedding vectors.
//!
//! Works with any fixed-length `f32` embedding (faces, voices, text).
//!
//! # Usage
//!
//! ```
//! use facekit_clusters::{Dbscan, batch_euclidean_distance};
//!
//! let data = vec![vec![0.0, 0.0], vec![0.0, 0.1], vec![5.0, 5.0]];
//! let mut c = Dbscan::new(1, 1.0, 0, batch_euclidean_distance).unwrap();
//! c.learn(&data).unwrap();
//!
//! assert_eq!(c.guesses(), &[1, 1, 2]);
//! assert_eq!(c.sizes(), &[2, 1]);
//! ```
//!
//! # Design
//!
//! [`Dbscan::learn`] is batch-only. Each neighbourhood query is split into
//! contiguous index ranges that a short-lived worker pool scans in parallel;
//! the query returns only after every range has been scanned, so the order in
//! which workers finish never changes the result.

mod dbscan;
mod distance;
mod error;

pub use dbscan::{Dbscan, NOISE, UNASSIGNED};
pub use distance::{BatchDistanceFunc, batch_euclidean_distance, euclidean_distance, l2_normalize};
pub use error::ClusterError;

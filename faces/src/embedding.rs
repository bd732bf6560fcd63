//! Face embeddings and embedding sets.
//!
//! Embeddings are persisted as JSON arrays (a set is an array of arrays).
//! Distances use the clustering crate's Euclidean metric, so matching and
//! clustering agree on what "close" means.

use std::fmt;

use facekit_clusters::euclidean_distance;
use serde::{Deserialize, Serialize};

use crate::error::{FacesError, Result};

/// Added to the largest member distance when deriving a cluster radius.
const RADIUS_MARGIN: f64 = 0.01;

/// A single face embedding vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    /// Euclidean distance to another embedding, or `None` if the dimensions
    /// differ or either side is empty.
    pub fn distance(&self, other: &Embedding) -> Option<f64> {
        if self.0.is_empty() || self.0.len() != other.0.len() {
            return None;
        }
        Some(euclidean_distance(&self.0, &other.0))
    }

    /// Little-endian bytes of all components.
    pub(crate) fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// A set of embeddings sharing one dimension.
///
/// The empty set is valid and distinguishable from a set of zero-length
/// vectors, which is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embeddings(Vec<Embedding>);

impl Embeddings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set, checking that all members share one non-zero dimension.
    pub fn from_vec(items: Vec<Embedding>) -> Result<Self> {
        if let Some(first) = items.first() {
            let dim = first.dim();
            if dim == 0 {
                return Err(FacesError::Data("embedding has no components".into()));
            }
            if let Some((i, e)) = items.iter().enumerate().find(|(_, e)| e.dim() != dim) {
                return Err(FacesError::Data(format!(
                    "embedding {} has dimension {}, expected {}",
                    i,
                    e.dim(),
                    dim
                )));
            }
        }
        Ok(Self(items))
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        Self::from_vec(rows.into_iter().map(Embedding::new).collect())
    }

    /// Decodes a JSON array of arrays. An empty payload is the empty set.
    pub fn from_json(data: &str) -> Result<Self> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Self::new());
        }
        let rows: Vec<Vec<f32>> = serde_json::from_str(data)?;
        Self::from_rows(rows)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Shared dimension, 0 for the empty set.
    pub fn dim(&self) -> usize {
        self.0.first().map_or(0, Embedding::dim)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Embedding> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&Embedding> {
        self.0.first()
    }

    /// Adds an embedding, rejecting a dimension that differs from the set.
    pub fn push(&mut self, e: Embedding) -> Result<()> {
        if e.dim() == 0 {
            return Err(FacesError::Data("embedding has no components".into()));
        }
        if !self.0.is_empty() && e.dim() != self.dim() {
            return Err(FacesError::Data(format!(
                "embedding has dimension {}, expected {}",
                e.dim(),
                self.dim()
            )));
        }
        self.0.push(e);
        Ok(())
    }

    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        self.0.iter().map(|e| e.0.clone()).collect()
    }

    /// Smallest distance from any member to `e`. Members of another
    /// dimension are skipped.
    pub fn distance(&self, e: &Embedding) -> Option<f64> {
        self.0
            .iter()
            .filter_map(|m| m.distance(e))
            .min_by(f64::total_cmp)
    }

    /// Smallest distance between any pair drawn from the two sets.
    pub fn min_distance(&self, other: &Embeddings) -> Option<f64> {
        other
            .0
            .iter()
            .filter_map(|e| self.distance(e))
            .min_by(f64::total_cmp)
    }

    /// Reports whether `e` lies strictly within `radius` of any member.
    pub fn contains(&self, e: &Embedding, radius: f64) -> bool {
        self.distance(e).is_some_and(|d| d < radius)
    }

    /// Component-wise mean of the set and the radius needed to cover every
    /// member. A single sample gets `single_radius`.
    ///
    /// Returns `None` for the empty set.
    pub fn midpoint(&self, single_radius: f64) -> Option<(Embedding, f64)> {
        let first = self.0.first()?;
        if self.0.len() == 1 {
            return Some((first.clone(), single_radius));
        }

        let dim = first.dim();
        let mut sum = vec![0f64; dim];
        for e in &self.0 {
            for (acc, v) in sum.iter_mut().zip(e.as_slice()) {
                *acc += f64::from(*v);
            }
        }
        let n = self.0.len() as f64;
        let centroid = Embedding::new(sum.into_iter().map(|v| (v / n) as f32).collect());

        let max = self
            .0
            .iter()
            .filter_map(|e| e.distance(&centroid))
            .fold(0f64, f64::max);

        Some((centroid, max + RADIUS_MARGIN))
    }
}

impl<'de> Deserialize<'de> for Embeddings {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let rows = Vec::<Vec<f32>>::deserialize(d)?;
        Embeddings::from_rows(rows).map_err(serde::de::Error::custom)
    }
}

impl IntoIterator for Embeddings {
    type Item = Embedding;
    type IntoIter = std::vec::IntoIter<Embedding>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Embeddings {
    type Item = &'a Embedding;
    type IntoIter = std::slice::Iter<'a, Embedding>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Embeddings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}d", self.len(), self.dim())
    }
}

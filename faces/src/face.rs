use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Tuning;
use crate::embedding::{Embedding, Embeddings};
use crate::source::Source;

/// A persisted identity cluster.
///
/// The centroid and radius are fixed at creation; only the subject link and
/// timestamps change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub id: String,
    pub face_src: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subj_uid: Option<String>,
    pub embedding: Embedding,
    pub sample_radius: f64,
    pub samples: usize,
    #[serde(default)]
    pub unsuitable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Face {
    /// Builds a face from a set of embeddings. Returns `None` for the empty
    /// set. Faces failing the quality floor are still returned, flagged
    /// `unsuitable`.
    pub fn new(
        subj_uid: Option<&str>,
        src: Source,
        embeddings: &Embeddings,
        tuning: &Tuning,
    ) -> Option<Face> {
        let (centroid, radius) = embeddings.midpoint(tuning.single_sample_radius)?;
        Some(Self::from_centroid(
            subj_uid,
            src,
            centroid,
            radius,
            embeddings.len(),
            tuning,
        ))
    }

    pub fn from_centroid(
        subj_uid: Option<&str>,
        src: Source,
        centroid: Embedding,
        radius: f64,
        samples: usize,
        tuning: &Tuning,
    ) -> Face {
        let now = Utc::now();
        Face {
            id: face_id(&centroid),
            face_src: src,
            subj_uid: subj_uid.filter(|s| !s.is_empty()).map(str::to_string),
            unsuitable: tuning.unsuitable(&centroid, samples),
            embedding: centroid,
            sample_radius: radius.max(0.0),
            samples,
            created_at: now,
            updated_at: now,
        }
    }

    /// Tests marker embeddings against this face.
    ///
    /// Returns whether the closest embedding lies within the sample radius,
    /// and that distance (`-1.0` when nothing was comparable).
    pub fn match_embeddings(&self, embeddings: &Embeddings) -> (bool, f64) {
        match embeddings.distance(&self.embedding) {
            Some(d) => (d <= self.sample_radius, d),
            None => (false, -1.0),
        }
    }

    pub fn has_subject(&self) -> bool {
        self.subj_uid.is_some()
    }

    /// The centroid as a one-member set.
    pub fn embeddings(&self) -> Embeddings {
        Embeddings::from_vec(vec![self.embedding.clone()]).unwrap_or_default()
    }
}

/// Content-derived face id, so a recurring cluster maps to the same record.
pub fn face_id(centroid: &Embedding) -> String {
    let hash = blake3::hash(&centroid.to_le_bytes());
    hash.to_hex()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> Tuning {
        Tuning::default()
    }

    #[test]
    fn empty_set_makes_no_face() {
        assert!(Face::new(None, Source::Auto, &Embeddings::new(), &tuning()).is_none());
    }

    #[test]
    fn id_is_stable_for_same_centroid() {
        let e = Embeddings::from_rows(vec![vec![0.6, 0.8], vec![0.8, 0.6]]).unwrap();
        let a = Face::new(None, Source::Auto, &e, &tuning()).unwrap();
        let b = Face::new(Some("j1"), Source::Manual, &e, &tuning()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert_eq!(a.samples, 2);

        let other = Embeddings::from_rows(vec![vec![0.0, 1.0]]).unwrap();
        let c = Face::new(None, Source::Auto, &other, &tuning()).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn match_uses_radius() {
        let t = tuning();
        let face = Face::from_centroid(
            None,
            Source::Auto,
            Embedding::new(vec![0.0, 0.0]),
            0.8,
            3,
            &t,
        );

        let near = Embeddings::from_rows(vec![vec![0.0, 0.5]]).unwrap();
        assert_eq!(face.match_embeddings(&near), (true, 0.5));

        let far = Embeddings::from_rows(vec![vec![0.0, 0.9]]).unwrap();
        let (ok, d) = face.match_embeddings(&far);
        assert!(!ok);
        assert!((d - 0.9).abs() < 1e-6);

        let wrong_dim = Embeddings::from_rows(vec![vec![0.0, 0.0, 0.0]]).unwrap();
        assert_eq!(face.match_embeddings(&wrong_dim), (false, -1.0));
    }

    #[test]
    fn empty_subject_is_none() {
        let f = Face::from_centroid(
            Some(""),
            Source::Auto,
            Embedding::new(vec![1.0]),
            0.1,
            1,
            &tuning(),
        );
        assert!(!f.has_subject());
    }
}

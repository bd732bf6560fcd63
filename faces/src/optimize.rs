//! Cluster optimization: merges near-duplicate faces of one subject.

use std::collections::BTreeMap;

use crate::config::Tuning;
use crate::embedding::Embedding;
use crate::error::Result;
use crate::face::Face;
use crate::worker::Faces;

/// Upper bound on merge rounds per run.
const MAX_ROUNDS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeResult {
    /// Faces absorbed into a merged face.
    pub merged: usize,
}

/// Combines faces into one: the centroid is the sample-weighted mean, the
/// radius covers every member's own radius, and the source is the highest
/// among the members.
pub(crate) fn merge_faces(group: &[Face], tuning: &Tuning) -> Option<Face> {
    let first = group.first()?;
    let dim = first.embedding.dim();
    let total: usize = group.iter().map(|f| f.samples.max(1)).sum();

    let mut sum = vec![0f64; dim];
    for f in group {
        if f.embedding.dim() != dim {
            return None;
        }
        let w = f.samples.max(1) as f64;
        for (acc, v) in sum.iter_mut().zip(f.embedding.as_slice()) {
            *acc += f64::from(*v) * w;
        }
    }
    let centroid = Embedding::new(sum.into_iter().map(|v| (v / total as f64) as f32).collect());

    let radius = group
        .iter()
        .filter_map(|f| f.embedding.distance(&centroid).map(|d| d + f.sample_radius))
        .fold(0f64, f64::max);
    let src = group.iter().map(|f| f.face_src).max().unwrap_or(first.face_src);
    let samples = group.iter().map(|f| f.samples).sum();

    Some(Face::from_centroid(
        first.subj_uid.as_deref(),
        src,
        centroid,
        radius,
        samples,
        tuning,
    ))
}

/// Picks mergeable groups from faces of one subject, largest faces first.
/// Each group is an anchor plus the faces whose centroid lies within the
/// anchor's radius.
fn merge_groups(mut faces: Vec<Face>) -> Vec<Vec<Face>> {
    faces.sort_by(|a, b| b.samples.cmp(&a.samples).then_with(|| a.id.cmp(&b.id)));
    let mut groups = Vec::new();

    while !faces.is_empty() {
        let anchor = faces.remove(0);
        let (near, rest): (Vec<Face>, Vec<Face>) = faces.into_iter().partition(|f| {
            anchor
                .embedding
                .distance(&f.embedding)
                .is_some_and(|d| d <= anchor.sample_radius)
        });
        faces = rest;
        if !near.is_empty() {
            let mut group = Vec::with_capacity(near.len() + 1);
            group.push(anchor);
            group.extend(near);
            groups.push(group);
        }
    }
    groups
}

impl Faces {
    /// Merges faces of the same subject that cover each other, repeating
    /// until a round merges nothing.
    pub fn optimize(&self) -> Result<OptimizeResult> {
        let mut result = OptimizeResult::default();
        if self.disabled() {
            return Ok(result);
        }

        for _ in 0..MAX_ROUNDS {
            self.check_canceled()?;

            let mut by_subject: BTreeMap<String, Vec<Face>> = BTreeMap::new();
            for f in self.store.faces()? {
                if let Some(subj) = f.subj_uid.clone() {
                    by_subject.entry(subj).or_default().push(f);
                }
            }

            let mut merged = 0;
            for (subj, faces) in by_subject {
                if faces.len() < 2 {
                    continue;
                }
                for group in merge_groups(faces) {
                    let Some(face) = merge_faces(&group, self.tuning()) else {
                        tracing::warn!("faces: cannot merge clusters of {}, dimensions differ", subj);
                        continue;
                    };
                    let ids: Vec<String> = group.iter().map(|f| f.id.clone()).collect();
                    let moved = self.store.replace_faces(&ids, &face)?;
                    tracing::debug!(
                        "faces: merged {} clusters of {} into {}, {} markers moved",
                        ids.len(),
                        subj,
                        face.id,
                        moved
                    );
                    merged += ids.len();
                }
            }

            if merged == 0 {
                break;
            }
            result.merged += merged;
        }

        Ok(result)
    }
}

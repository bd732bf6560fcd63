//! The matching pass: links face markers to their closest face.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::Embeddings;
use crate::error::{FacesError, Partial, Result};
use crate::face::Face;
use crate::marker::{Marker, MarkerType};
use crate::worker::{Faces, FacesOptions};

/// Below this many candidate faces the distances are computed inline.
const PARALLEL_MIN_FACES: usize = 32;

/// Counters of one matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    /// Markers whose face or subject link changed.
    pub updated: usize,
    /// Markers linked to a face, ending up with a subject.
    pub recognized: usize,
    /// Markers linked to a face without a subject.
    pub unknown: usize,
}

impl MatchResult {
    fn add(&mut self, other: MatchResult) {
        self.updated += other.updated;
        self.recognized += other.recognized;
        self.unknown += other.unknown;
    }
}

/// Picks the best matching face.
///
/// A later face replaces the current best only if it is strictly closer and
/// comes from the same source. Faces are expected in matching order, so a
/// face of a higher source found first is not displaced by a closer
/// automatic one.
pub(crate) fn select_best<'a>(faces: &'a [Face], results: &[(bool, f64)]) -> (Option<&'a Face>, f64) {
    let mut best: Option<&Face> = None;
    let mut dist = -1.0;
    for (f, &(ok, d)) in faces.iter().zip(results) {
        if !ok {
            continue;
        }
        let replace = match best {
            None => true,
            Some(b) => d < dist && f.face_src == b.face_src,
        };
        if replace {
            best = Some(f);
            dist = d;
        }
    }
    (best, dist)
}

impl Faces {
    /// Runs a matching pass over all face markers.
    ///
    /// Without `force`, nothing happens unless a face changed since the
    /// last pass or a marker was never matched, and markers matched after
    /// every face was created are skipped. Afterwards each face's subject is
    /// copied onto its automatically linked markers.
    pub fn match_markers(
        &self,
        opts: FacesOptions,
    ) -> std::result::Result<MatchResult, Partial<MatchResult>> {
        let mut result = MatchResult::default();
        let started = Utc::now();

        let run = opts.force
            || match self.store.should_run_match(self.ctx.last_match()) {
                Ok(run) => run,
                Err(e) => {
                    tracing::warn!("faces: {} (check for unmatched markers)", e);
                    true
                }
            };

        if run {
            if opts.force {
                tracing::info!("faces: updating all markers");
            }
            let faces = self
                .candidate_faces(opts.force)
                .map_err(|e| Partial::new(e, result))?;
            result.add(self.match_faces(&faces, opts.force, None)?);
            self.ctx.set_last_match(started);
        } else {
            tracing::debug!("faces: found no unmatched markers");
        }

        match self.store.match_face_markers() {
            Ok(n) => result.recognized += n,
            Err(e) => tracing::warn!("faces: {} (match markers with faces)", e),
        }

        Ok(result)
    }

    /// Faces eligible for matching, in matching order. Unsuitable faces
    /// are included only when forced.
    pub fn candidate_faces(&self, force: bool) -> Result<Vec<Face>> {
        Ok(self
            .store
            .faces()?
            .into_iter()
            .filter(|f| force || !f.unsuitable)
            .collect())
    }

    /// Matches face markers against `faces` page by page.
    ///
    /// With `matched_before` set, only markers not matched since then are
    /// loaded. The loop stops when the pages run out, or once more markers
    /// were processed than exist. Cancellation is checked before every
    /// marker and returns the counts gathered so far.
    pub fn match_faces(
        &self,
        faces: &[Face],
        force: bool,
        matched_before: Option<DateTime<Utc>>,
    ) -> std::result::Result<MatchResult, Partial<MatchResult>> {
        let mut result = MatchResult::default();
        let page_size = self.config.match_page_size;
        let pause = Duration::from_millis(self.config.match_page_pause_ms);

        let max = self
            .store
            .count_markers(MarkerType::Face)
            .map_err(|e| Partial::new(e, result))?;
        let mut processed = 0;
        let mut cursor: Option<String> = None;

        loop {
            let (markers, next) = self
                .store
                .face_markers_page(cursor.as_deref(), page_size, matched_before)
                .map_err(|e| Partial::new(e, result))?;

            for mut marker in markers {
                if self.canceled() {
                    return Err(Partial::new(FacesError::Canceled, result));
                }
                processed += 1;

                if !marker.matchable() {
                    continue;
                }
                if !force && already_matched(&marker, faces) {
                    continue;
                }

                match self.match_marker(&mut marker, faces) {
                    Ok(r) => result.add(r),
                    Err(e) => tracing::warn!("faces: {} (match marker {})", e, marker.uid),
                }
            }

            if processed > max {
                tracing::warn!(
                    "faces: processed {} markers, more than the {} that exist, stopping",
                    processed,
                    max
                );
                break;
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        Ok(result)
    }

    fn match_marker(&self, marker: &mut Marker, faces: &[Face]) -> Result<MatchResult> {
        let mut result = MatchResult::default();

        let embeddings = match marker.embeddings() {
            Ok(e) if !e.is_empty() => e,
            Ok(_) => return Ok(result),
            Err(e) => {
                tracing::warn!("markers: {} in marker {}", e, marker.uid);
                return Ok(result);
            }
        };

        let distances = self.face_distances(faces, &embeddings);
        let (best, dist) = select_best(faces, &distances);

        if marker.has_face(best, dist) {
            tracing::debug!(
                "faces: marker {} already has the best matching face {:?} with dist {}",
                marker.uid,
                marker.face_id,
                marker.face_dist
            );
            self.store.touch_marker(marker)?;
            return Ok(result);
        }

        let Some(face) = best else {
            if self.store.clear_face(marker)? {
                result.updated += 1;
            }
            return Ok(result);
        };

        if self.store.set_face(marker, face, dist)? {
            result.updated += 1;
        }
        if marker.subj_uid.is_some() {
            result.recognized += 1;
        } else {
            result.unknown += 1;
        }
        Ok(result)
    }

    /// Match results of `embeddings` against every face, in face order.
    ///
    /// Large face sets are split into contiguous chunks computed on scoped
    /// threads; results are joined before returning.
    pub(crate) fn face_distances(&self, faces: &[Face], embeddings: &Embeddings) -> Vec<(bool, f64)> {
        let workers = self.config.resolved_workers().min(faces.len().max(1));
        if workers <= 1 || faces.len() < PARALLEL_MIN_FACES {
            return faces.iter().map(|f| f.match_embeddings(embeddings)).collect();
        }

        let chunk = faces.len().div_ceil(workers);
        thread::scope(|scope| {
            let handles: Vec<_> = faces
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|f| f.match_embeddings(embeddings))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut out = Vec::with_capacity(faces.len());
            for h in handles {
                match h.join() {
                    Ok(part) => out.extend(part),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            out
        })
    }
}

/// Matched after every candidate face was created: nothing new to compare.
fn already_matched(marker: &Marker, faces: &[Face]) -> bool {
    marker
        .matched_at
        .is_some_and(|t| !faces.iter().any(|f| f.created_at > t))
}

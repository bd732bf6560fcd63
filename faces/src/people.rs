//! Manual corrections: naming markers and the cascade that follows.
//!
//! A marker named by a person becomes authoritative. Its subject is found
//! or created by name, the marker gets a face of its own if it has none,
//! and the face and its automatically matched markers follow the new
//! subject.

use serde::Deserialize;

use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::marker::{Marker, UNKNOWN_DIST};
use crate::source::Source;
use crate::store::Change;
use crate::subject::sanitize_name;
use crate::worker::Faces;

fn manual() -> Source {
    Source::Manual
}

/// User edits to a marker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkerForm {
    #[serde(default)]
    pub invalid: Option<bool>,
    #[serde(default)]
    pub review: Option<bool>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "manual")]
    pub subj_src: Source,
}

impl Default for MarkerForm {
    fn default() -> Self {
        Self {
            invalid: None,
            review: None,
            name: String::new(),
            subj_src: Source::Manual,
        }
    }
}

impl Faces {
    fn marker(&self, uid: &str) -> Result<Marker> {
        self.store
            .find_marker(uid)?
            .ok_or_else(|| FacesError::not_found("marker", uid))
    }

    /// Names a marker. Returns true if the name changed.
    ///
    /// Automatic sources cannot name markers, and a source below the
    /// marker's current subject source is ignored. The marker's subject is
    /// resolved by the new name, then the subject is synced to its face
    /// and related markers.
    pub fn set_marker_name(&self, uid: &str, name: &str, src: Source) -> Result<bool> {
        if src == Source::Auto {
            return Ok(false);
        }
        let marker = self.marker(uid)?;
        if src < marker.subj_src {
            tracing::debug!(
                "markers: {} keeps name {:?} set by {}",
                uid,
                marker.name,
                marker.subj_src
            );
            return Ok(false);
        }

        let name = sanitize_name(name);
        if name.is_empty() || marker.name == name {
            return Ok(false);
        }

        let subject = self
            .store
            .first_or_create_subject(&name, src)?
            .ok_or_else(|| FacesError::Data(format!("invalid subject name {name:?}")))?;

        let mut marker = self
            .store
            .update_marker(uid, |m| {
                m.name = subject.name.clone();
                m.subj_uid = Some(subject.uid.clone());
                m.subj_src = src;
                m.review = false;
                Change::Refresh
            })?
            .ok_or_else(|| FacesError::not_found("marker", uid))?;

        let related = self.sync_subject(&mut marker, true)?;
        tracing::info!(
            "markers: named {} {:?}, {} related markers updated",
            uid,
            subject.name,
            related
        );
        Ok(true)
    }

    /// Applies form edits. Returns the stored marker and whether anything
    /// changed.
    pub fn save_marker_form(&self, uid: &str, form: &MarkerForm) -> Result<(Marker, bool)> {
        let mut changed = false;
        let stored = self
            .store
            .update_marker(uid, |m| {
                if let Some(invalid) = form.invalid.filter(|v| *v != m.invalid) {
                    m.invalid = invalid;
                    changed = true;
                }
                if let Some(review) = form.review.filter(|v| *v != m.review) {
                    m.review = review;
                    changed = true;
                }
                if changed { Change::Refresh } else { Change::None }
            })?
            .ok_or_else(|| FacesError::not_found("marker", uid))?;

        if !form.name.trim().is_empty() && self.set_marker_name(uid, &form.name, form.subj_src)? {
            return Ok((self.marker(uid)?, true));
        }
        Ok((stored, changed))
    }

    /// Removes a marker's name, face and subject, recording `src` as the
    /// source of that decision.
    pub fn clear_marker_subject(&self, uid: &str, src: Source) -> Result<Marker> {
        self.store
            .update_marker(uid, |m| {
                m.name.clear();
                m.face_id = None;
                m.face_dist = UNKNOWN_DIST;
                m.subj_uid = None;
                m.subj_src = src;
                Change::Refresh
            })?
            .ok_or_else(|| FacesError::not_found("marker", uid))
    }

    /// Pushes an authoritative marker subject to the marker's face and,
    /// with `update_related`, to the face's automatically matched markers.
    /// Returns the number of related markers updated.
    pub(crate) fn sync_subject(&self, marker: &mut Marker, update_related: bool) -> Result<usize> {
        if !marker.is_face() || marker.subj_src == Source::Auto {
            return Ok(0);
        }
        if self.store.ensure_marker_subject(marker)?.is_none() {
            return Ok(0);
        }
        let Some(face) = self.marker_face(marker)? else {
            return Ok(0);
        };

        let face = if face.subj_uid != marker.subj_uid && face.face_src <= marker.subj_src {
            self.store
                .set_face_subject(&face.id, marker.subj_uid.as_deref())?
                .unwrap_or(face)
        } else {
            face
        };
        if !update_related || face.subj_uid != marker.subj_uid {
            return Ok(0);
        }

        let mut related = 0;
        for other in self.store.face_markers(&face.id)? {
            if other.uid == marker.uid
                || other.subj_src != Source::Auto
                || other.subj_uid == marker.subj_uid
            {
                continue;
            }
            let mut moved = false;
            self.store.update_marker(&other.uid, |m| {
                if m.face_id.as_deref() != Some(face.id.as_str()) || m.subj_src != Source::Auto {
                    return Change::None;
                }
                m.subj_uid = marker.subj_uid.clone();
                m.review = false;
                moved = true;
                Change::Refresh
            })?;
            if moved {
                related += 1;
            }
        }
        Ok(related)
    }

    /// The marker's face. An authoritative marker without one gets a face
    /// built from its own embeddings, if it meets the clustering quality
    /// thresholds; markers without a face are then matched against it.
    pub(crate) fn marker_face(&self, marker: &mut Marker) -> Result<Option<Face>> {
        if let Some(id) = marker.face_id.clone() {
            let face = self.store.find_face(&id)?;
            if face.is_none() {
                tracing::warn!("markers: {} links to missing face {}", marker.uid, id);
            }
            return Ok(face);
        }
        if marker.subj_src == Source::Auto {
            return Ok(None);
        }

        let tuning = self.tuning();
        if !tuning.clusterable(marker.size, marker.score) {
            tracing::debug!(
                "markers: skipped adding face for {} due to low quality (size {}, score {})",
                marker.uid,
                marker.size,
                marker.score
            );
            return Ok(None);
        }
        let embeddings = match marker.embeddings() {
            Ok(e) if !e.is_empty() => e,
            Ok(_) => {
                tracing::warn!("markers: {} has no face embeddings", marker.uid);
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!("markers: {} in marker {}", e, marker.uid);
                return Ok(None);
            }
        };
        let Some(candidate) =
            Face::new(marker.subj_uid.as_deref(), marker.subj_src, &embeddings, tuning)
        else {
            return Ok(None);
        };
        if candidate.unsuitable {
            tracing::info!(
                "markers: face {} of {} is unsuitable for clustering and matching",
                candidate.id,
                marker.uid
            );
        }

        let face = self.store.first_or_create_face(candidate)?;
        let dist = embeddings.distance(&face.embedding).unwrap_or(UNKNOWN_DIST);
        let face_id = face.id.clone();
        if let Some(stored) = self.store.update_marker(&marker.uid, |m| {
            if m.face_id.is_some() {
                return Change::None;
            }
            m.face_id = Some(face_id);
            m.face_dist = dist;
            Change::Refresh
        })? {
            *marker = stored;
        }

        if !face.unsuitable {
            match self.match_faceless_markers(&face) {
                Ok(0) => {}
                Ok(n) => tracing::debug!("markers: matched {} markers with face {}", n, face.id),
                Err(e) => tracing::warn!("markers: {} while matching with face {}", e, face.id),
            }
        }
        Ok(Some(face))
    }

    /// Links markers without a face to `face` where it matches. Returns
    /// the number of markers updated.
    pub fn match_faceless_markers(&self, face: &Face) -> Result<usize> {
        let mut updated = 0;
        for mut m in self.store.markers()? {
            if !m.matchable() || m.face_id.is_some() {
                continue;
            }
            let Ok(embeddings) = m.embeddings() else {
                continue;
            };
            let (ok, dist) = face.match_embeddings(&embeddings);
            if ok && self.store.set_face(&mut m, face, dist)? {
                updated += 1;
            }
        }
        Ok(updated)
    }
}

//! Marker to face to subject links.
//!
//! Each operation computes the new link fields from the marker as read,
//! then writes them in one atomic marker update. If the stored marker's
//! links changed in between, the write is dropped.

use chrono::Utc;

use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::marker::{Marker, UNKNOWN_DIST};
use crate::source::Source;
use crate::store::{Change, FaceStore};
use crate::subject::Subject;

type Links = (Option<String>, Option<String>, Source);

fn links(m: &Marker) -> Links {
    (m.face_id.clone(), m.subj_uid.clone(), m.subj_src)
}

impl FaceStore {
    /// Refreshes the match timestamp only.
    pub fn touch_marker(&self, marker: &mut Marker) -> Result<()> {
        let now = Utc::now();
        self.update_marker(&marker.uid, |m| {
            m.matched_at = Some(now);
            Change::Silent
        })?;
        marker.matched_at = Some(now);
        Ok(())
    }

    /// Links a marker to a face. Returns true if the marker's face or
    /// subject changed.
    ///
    /// A marker with an authoritative subject is never moved to a face of
    /// another subject. If such a marker lands on a face without a subject,
    /// the face takes the marker's subject. Otherwise the marker adopts the
    /// face's subject.
    pub fn set_face(&self, marker: &mut Marker, face: &Face, dist: f64) -> Result<bool> {
        if !marker.is_face() {
            return Err(FacesError::Data(format!(
                "marker {} is not a face marker",
                marker.uid
            )));
        }

        if marker.authoritative() && face.has_subject() && face.subj_uid != marker.subj_uid {
            tracing::debug!(
                "faces: marker {} keeps subject {:?}, face {} belongs to {:?}",
                marker.uid,
                marker.subj_uid,
                face.id,
                face.subj_uid
            );
            self.touch_marker(marker)?;
            return Ok(false);
        }

        let before = links(marker);
        let mut next = marker.clone();
        next.face_id = Some(face.id.clone());
        next.face_dist = if dist >= 0.0 {
            dist
        } else {
            next.embeddings()
                .ok()
                .and_then(|e| e.distance(&face.embedding))
                .unwrap_or(UNKNOWN_DIST)
        };
        if face.has_subject() {
            next.subj_uid = face.subj_uid.clone();
        }
        self.ensure_marker_subject(&mut next)?;

        // A face without a subject takes the subject of an authoritative
        // marker, but only once that marker's link is stored.
        let face_subj = if next.authoritative() && next.subj_uid != face.subj_uid {
            next.subj_uid.clone()
        } else {
            None
        };

        let updated = links(&next) != before;
        if !updated && face_subj.is_none() {
            self.touch_marker(marker)?;
            return Ok(false);
        }

        let now = Utc::now();
        let stored = {
            let _guard = self.lock();
            let stored = self.update_marker_locked(&marker.uid, |m| {
                if links(m) != before {
                    return Change::None;
                }
                m.face_id = next.face_id.clone();
                m.face_dist = next.face_dist;
                m.subj_uid = next.subj_uid.clone();
                m.subj_src = next.subj_src;
                m.review = false;
                m.matched_at = Some(now);
                if updated {
                    Change::Refresh
                } else {
                    Change::Silent
                }
            })?;
            if let (Some(m), Some(subj)) = (&stored, &face_subj) {
                if m.matched_at == Some(now) {
                    self.update_face_locked(&face.id, |f| {
                        if f.subj_uid != face.subj_uid {
                            return false;
                        }
                        f.subj_uid = Some(subj.clone());
                        true
                    })?;
                }
            }
            stored
        };

        match stored {
            Some(m) if m.matched_at == Some(now) => {
                *marker = m;
                Ok(updated)
            }
            Some(m) => {
                tracing::debug!("faces: marker {} changed while matching, skipped", m.uid);
                *marker = m;
                Ok(false)
            }
            None => Err(FacesError::not_found("marker", marker.uid.as_str())),
        }
    }

    /// Removes a marker's face link. The subject goes too unless it was set
    /// by an authoritative source. Returns true if a link was removed.
    pub fn clear_face(&self, marker: &mut Marker) -> Result<bool> {
        if marker.face_id.is_none() {
            self.touch_marker(marker)?;
            return Ok(false);
        }

        let before = links(marker);
        let now = Utc::now();
        let stored = self.update_marker(&marker.uid, |m| {
            if links(m) != before {
                return Change::None;
            }
            m.face_id = None;
            m.face_dist = UNKNOWN_DIST;
            m.matched_at = Some(now);
            if m.subj_src == Source::Auto {
                m.subj_uid = None;
            }
            Change::Refresh
        })?;

        match stored {
            Some(m) => {
                let cleared = m.matched_at == Some(now);
                *marker = m;
                Ok(cleared)
            }
            None => Err(FacesError::not_found("marker", marker.uid.as_str())),
        }
    }

    /// Resolves the marker's subject. A marker named by an authoritative
    /// source without a subject gets one, found or created by name.
    pub(crate) fn ensure_marker_subject(&self, m: &mut Marker) -> Result<Option<Subject>> {
        if m.subj_uid.is_none() && m.subj_src.is_authoritative() && !m.name.is_empty() {
            return match self.first_or_create_subject(&m.name, m.subj_src)? {
                Some(s) => {
                    m.subj_uid = Some(s.uid.clone());
                    Ok(Some(s))
                }
                None => {
                    tracing::warn!("markers: invalid subject name {:?} on {}", m.name, m.uid);
                    Ok(None)
                }
            };
        }
        match m.subj_uid.as_deref() {
            Some(uid) => self.find_subject(uid),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::embedding::{Embedding, Embeddings};
    use crate::marker::Area;

    fn marker(store: &FaceStore) -> Marker {
        let e = Embeddings::from_rows(vec![vec![0.0, 0.1]]).unwrap();
        let m = Marker::new_face("f1", Source::Image, Area::new(0.1, 0.1, 0.2, 0.2), 100, 30, &e)
            .unwrap();
        store.create_marker(&m).unwrap();
        m
    }

    fn face(store: &FaceStore, x: f32, subj: Option<&str>) -> Face {
        let f = Face::from_centroid(
            subj,
            Source::Auto,
            Embedding::new(vec![x, 0.0]),
            0.5,
            12,
            &Tuning::default(),
        );
        store.create_face(&f).unwrap();
        f
    }

    #[test]
    fn set_face_adopts_face_subject() {
        let store = FaceStore::in_memory();
        let mut m = marker(&store);
        let f = face(&store, 0.0, Some("j1"));

        assert!(store.set_face(&mut m, &f, 0.1).unwrap());
        assert_eq!(m.face_id.as_deref(), Some(f.id.as_str()));
        assert_eq!(m.subj_uid.as_deref(), Some("j1"));
        assert_eq!(m.subj_src, Source::Auto);
        assert!(m.matched_at.is_some());
        assert_eq!(store.refresh_flags().unwrap(), vec!["f1".to_string()]);

        assert!(!store.set_face(&mut m, &f, 0.1).unwrap(), "second call is a no-op");
    }

    #[test]
    fn authoritative_subject_wins_over_face() {
        let store = FaceStore::in_memory();
        let mut m = marker(&store);
        store
            .update_marker(&m.uid, |s| {
                s.subj_uid = Some("jmanual".into());
                s.subj_src = Source::Manual;
                Change::Silent
            })
            .unwrap();
        m = store.find_marker(&m.uid).unwrap().unwrap();

        let other = face(&store, 0.0, Some("jother"));
        assert!(!store.set_face(&mut m, &other, 0.1).unwrap());
        assert_eq!(m.subj_uid.as_deref(), Some("jmanual"));
        assert_eq!(m.face_id, None);

        let blank = face(&store, 1.0, None);
        assert!(store.set_face(&mut m, &blank, 0.2).unwrap());
        assert_eq!(m.subj_uid.as_deref(), Some("jmanual"));
        assert_eq!(
            store.find_face(&blank.id).unwrap().unwrap().subj_uid.as_deref(),
            Some("jmanual")
        );
    }

    #[test]
    fn unknown_distance_is_computed() {
        let store = FaceStore::in_memory();
        let mut m = marker(&store);
        let f = face(&store, 0.0, None);
        store.set_face(&mut m, &f, -1.0).unwrap();
        assert!((m.face_dist - 0.1).abs() < 1e-6);
    }

    #[test]
    fn clear_face_keeps_authoritative_subject() {
        let store = FaceStore::in_memory();
        let mut auto = marker(&store);
        let f = face(&store, 0.0, Some("j1"));
        store.set_face(&mut auto, &f, 0.1).unwrap();
        assert!(store.clear_face(&mut auto).unwrap());
        assert_eq!(auto.face_id, None);
        assert_eq!(auto.subj_uid, None);
        assert_eq!(auto.face_dist, UNKNOWN_DIST);

        let mut manual = marker(&store);
        store
            .update_marker(&manual.uid, |s| {
                s.face_id = Some(f.id.clone());
                s.subj_uid = Some("j2".into());
                s.subj_src = Source::Manual;
                Change::Silent
            })
            .unwrap();
        manual = store.find_marker(&manual.uid).unwrap().unwrap();
        assert!(store.clear_face(&mut manual).unwrap());
        assert_eq!(manual.face_id, None);
        assert_eq!(manual.subj_uid.as_deref(), Some("j2"));

        assert!(!store.clear_face(&mut manual).unwrap());
    }

    #[test]
    fn stale_marker_copy_does_not_clobber() {
        let store = FaceStore::in_memory();
        let mut stale = marker(&store);
        store
            .update_marker(&stale.uid, |s| {
                s.subj_uid = Some("jhuman".into());
                s.subj_src = Source::Manual;
                Change::Refresh
            })
            .unwrap();

        let f = face(&store, 0.0, Some("j1"));
        assert!(!store.set_face(&mut stale, &f, 0.1).unwrap());
        let stored = store.find_marker(&stale.uid).unwrap().unwrap();
        assert_eq!(stored.subj_uid.as_deref(), Some("jhuman"));
        assert_eq!(stored.face_id, None);
    }

    #[test]
    fn dropped_marker_write_leaves_face_subject() {
        let store = FaceStore::in_memory();
        let m = marker(&store);
        let mut named = store
            .update_marker(&m.uid, |s| {
                s.subj_uid = Some("jmanual".into());
                s.subj_src = Source::Manual;
                Change::Silent
            })
            .unwrap()
            .unwrap();
        let f = face(&store, 0.0, None);

        store
            .update_marker(&m.uid, |s| {
                s.subj_uid = None;
                s.name.clear();
                Change::Refresh
            })
            .unwrap();

        assert!(!store.set_face(&mut named, &f, 0.1).unwrap());
        assert_eq!(store.find_face(&f.id).unwrap().unwrap().subj_uid, None);
        let stored = store.find_marker(&m.uid).unwrap().unwrap();
        assert_eq!(stored.face_id, None);
        assert_eq!(stored.subj_uid, None);
    }

    #[test]
    fn linked_manual_marker_names_its_face() {
        let store = FaceStore::in_memory();
        let f = face(&store, 0.0, None);
        let m = marker(&store);
        let mut linked = store
            .update_marker(&m.uid, |s| {
                s.face_id = Some(f.id.clone());
                s.subj_uid = Some("jmanual".into());
                s.subj_src = Source::Manual;
                Change::Silent
            })
            .unwrap()
            .unwrap();

        assert!(!store.set_face(&mut linked, &f, 0.1).unwrap());
        assert_eq!(
            store.find_face(&f.id).unwrap().unwrap().subj_uid.as_deref(),
            Some("jmanual")
        );
    }

    #[test]
    fn named_marker_gets_subject() {
        let store = FaceStore::in_memory();
        let mut m = marker(&store);
        m.name = "Ada".into();
        m.subj_src = Source::Manual;
        let s = store.ensure_marker_subject(&mut m).unwrap().unwrap();
        assert_eq!(s.name, "Ada");
        assert_eq!(m.subj_uid.as_deref(), Some(s.uid.as_str()));
    }
}

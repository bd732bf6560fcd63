//! Bulk maintenance over the record store.
//!
//! Each operation holds the store's write lock for its whole scan and
//! applies its changes as one batch.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use facekit_kv::WriteBatch;
use serde::Serialize;

use crate::config::Tuning;
use crate::embedding::Embedding;
use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::keys::{
    FACE_PREFIX, FILE_PREFIX, SUBJECT_PREFIX, face_key, key_id, marker_key, refresh_key,
    subject_key,
};
use crate::marker::{Marker, UNKNOWN_DIST};
use crate::store::{FaceStore, FileRecord, encode};
use crate::subject::{Subject, sanitize_name};

/// Counts from merging one subject into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub faces: usize,
    pub markers: usize,
}

/// Adds a marker write, and optionally its file's refresh flag, to a batch.
pub(crate) fn stage_marker(batch: &mut WriteBatch, marker: &Marker, refresh: bool) -> Result<()> {
    batch.set(&marker_key(&marker.uid), encode(marker)?);
    if refresh {
        batch.set(
            &refresh_key(&marker.file_uid),
            Utc::now().to_rfc3339().into_bytes(),
        );
    }
    Ok(())
}

impl FaceStore {
    /// Deletes markers whose file is no longer registered.
    pub fn remove_orphan_markers(&self) -> Result<usize> {
        let _guard = self.lock();
        let files: HashSet<String> = self
            .scan_all::<FileRecord>(FILE_PREFIX)?
            .into_iter()
            .map(|f| f.uid)
            .collect();

        let mut batch = WriteBatch::new();
        for m in self.markers()? {
            if !files.contains(&m.file_uid) {
                batch.delete(&marker_key(&m.uid));
            }
        }
        let removed = batch.len();
        self.write_batch(batch)?;
        Ok(removed)
    }

    /// Drops marker links to faces or subjects that no longer exist.
    pub fn fix_marker_references(&self) -> Result<usize> {
        let _guard = self.lock();
        let faces = self.face_ids()?;
        let subjects = self.subject_uids()?;
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        let mut fixed = 0;
        for mut m in self.markers()? {
            let mut changed = false;
            if m.face_id.as_ref().is_some_and(|id| !faces.contains(id)) {
                m.face_id = None;
                m.face_dist = UNKNOWN_DIST;
                changed = true;
            }
            if m.subj_uid.as_ref().is_some_and(|uid| !subjects.contains(uid)) {
                m.subj_uid = None;
                changed = true;
            }
            if changed {
                m.updated_at = now;
                stage_marker(&mut batch, &m, true)?;
                fixed += 1;
            }
        }
        self.write_batch(batch)?;
        Ok(fixed)
    }

    /// Creates subjects for named markers that lost or never had one.
    pub fn create_marker_subjects(&self) -> Result<usize> {
        let _guard = self.lock();
        let mut created: HashMap<String, Subject> = HashMap::new();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        let mut affected = 0;
        for mut m in self.markers()? {
            if !m.is_face()
                || m.name.is_empty()
                || m.subj_uid.is_some()
                || !m.subj_src.is_authoritative()
            {
                continue;
            }
            let name = sanitize_name(&m.name);
            let subject = match created.get(&name) {
                Some(s) => s.clone(),
                None => match self.first_or_create_subject_locked(&name, m.subj_src)? {
                    Some(s) => {
                        created.insert(name, s.clone());
                        s
                    }
                    None => continue,
                },
            };
            m.subj_uid = Some(subject.uid);
            m.updated_at = now;
            stage_marker(&mut batch, &m, true)?;
            affected += 1;
        }
        self.write_batch(batch)?;
        Ok(affected)
    }

    /// Deletes faces no marker points to.
    pub fn delete_orphan_faces(&self) -> Result<usize> {
        let _guard = self.lock();
        let used: HashSet<String> = self
            .markers()?
            .into_iter()
            .filter_map(|m| m.face_id)
            .collect();

        let mut batch = WriteBatch::new();
        for id in self.face_ids()? {
            if !used.contains(&id) {
                batch.delete(&face_key(&id));
            }
        }
        let removed = batch.len();
        self.write_batch(batch)?;
        Ok(removed)
    }

    /// Deletes subjects referenced by neither a face nor a marker.
    pub fn delete_orphan_people(&self) -> Result<usize> {
        let _guard = self.lock();
        let mut used: HashSet<String> = self
            .markers()?
            .into_iter()
            .filter_map(|m| m.subj_uid)
            .collect();
        used.extend(
            self.scan_all::<Face>(FACE_PREFIX)?
                .into_iter()
                .filter_map(|f| f.subj_uid),
        );

        let mut batch = WriteBatch::new();
        for uid in self.subject_uids()? {
            if !used.contains(&uid) {
                batch.delete(&subject_key(&uid));
            }
        }
        let removed = batch.len();
        self.write_batch(batch)?;
        Ok(removed)
    }

    /// Copies each face's subject onto its markers that carry no
    /// authoritative subject of their own.
    pub fn match_face_markers(&self) -> Result<usize> {
        let _guard = self.lock();
        let subjects: HashMap<String, String> = self
            .scan_all::<Face>(FACE_PREFIX)?
            .into_iter()
            .filter_map(|f| f.subj_uid.map(|s| (f.id, s)))
            .collect();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        let mut updated = 0;
        for mut m in self.markers()? {
            if m.invalid || !m.is_face() || m.authoritative() {
                continue;
            }
            let Some(subj) = m.face_id.as_ref().and_then(|id| subjects.get(id)) else {
                continue;
            };
            if m.subj_uid.as_ref() == Some(subj) {
                continue;
            }
            m.subj_uid = Some(subj.clone());
            m.updated_at = now;
            stage_marker(&mut batch, &m, true)?;
            updated += 1;
        }
        self.write_batch(batch)?;
        Ok(updated)
    }

    /// Reports whether matching has anything to do: a face changed after
    /// `since`, or a valid face marker was never matched.
    pub fn should_run_match(&self, since: DateTime<Utc>) -> Result<bool> {
        let faces: Vec<Face> = self.scan_all(FACE_PREFIX)?;
        if faces.iter().any(|f| f.updated_at > since || f.created_at > since) {
            return Ok(true);
        }
        Ok(self
            .markers()?
            .iter()
            .any(|m| m.matchable() && m.matched_at.is_none()))
    }

    fn unclustered(&self, tuning: &Tuning) -> Result<Vec<Marker>> {
        Ok(self
            .markers()?
            .into_iter()
            .filter(|m| {
                m.matchable() && m.face_id.is_none() && tuning.clusterable(m.size, m.score)
            })
            .collect())
    }

    /// Face markers of clustering quality that have no face yet.
    pub fn count_new_face_markers(&self, tuning: &Tuning) -> Result<usize> {
        Ok(self.unclustered(tuning)?.len())
    }

    /// Embeddings of all markers counted by
    /// [`count_new_face_markers`](Self::count_new_face_markers). Markers
    /// with undecodable embeddings are logged and skipped, as are
    /// blacklisted embeddings.
    pub fn unclustered_embeddings(&self, tuning: &Tuning) -> Result<Vec<Embedding>> {
        let mut out = Vec::new();
        let mut dim = 0;
        for m in self.unclustered(tuning)? {
            let embeddings = match m.embeddings() {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("markers: {} in marker {}", e, m.uid);
                    continue;
                }
            };
            for e in embeddings {
                if dim == 0 {
                    dim = e.dim();
                } else if e.dim() != dim {
                    tracing::warn!(
                        "markers: marker {} has {}d embeddings, expected {}d",
                        m.uid,
                        e.dim(),
                        dim
                    );
                    continue;
                }
                if tuning.blacklisted(&e) {
                    continue;
                }
                out.push(e);
            }
        }
        Ok(out)
    }

    /// Repoints every face and marker of subject `from` to `into` and
    /// deletes `from`, all in one batch.
    pub fn merge_subjects(&self, from: &str, into: &str) -> Result<MergeReport> {
        let _guard = self.lock();
        self.merge_subjects_locked(from, into)
    }

    pub(crate) fn merge_subjects_locked(&self, from: &str, into: &str) -> Result<MergeReport> {
        if from == into {
            return Ok(MergeReport::default());
        }
        if self.find_subject(from)?.is_none() {
            return Err(FacesError::not_found("subject", from));
        }
        let target = self
            .find_subject(into)?
            .ok_or_else(|| FacesError::not_found("subject", into))?;
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        let mut report = MergeReport::default();

        for mut f in self.scan_all::<Face>(FACE_PREFIX)? {
            if f.subj_uid.as_deref() == Some(from) {
                f.subj_uid = Some(target.uid.clone());
                f.updated_at = now;
                batch.set(&face_key(&f.id), encode(&f)?);
                report.faces += 1;
            }
        }
        for mut m in self.markers()? {
            if m.subj_uid.as_deref() == Some(from) {
                m.subj_uid = Some(target.uid.clone());
                if !m.name.is_empty() {
                    m.name = target.name.clone();
                }
                m.updated_at = now;
                stage_marker(&mut batch, &m, true)?;
                report.markers += 1;
            }
        }
        batch.delete(&subject_key(from));
        self.write_batch(batch)?;

        tracing::info!(
            "faces: merged subject {} into {} ({} faces, {} markers)",
            from,
            target.name,
            report.faces,
            report.markers
        );
        Ok(report)
    }

    /// Renames a subject. If another subject already has that name, the
    /// subject is merged into it and the surviving subject is returned.
    pub fn rename_subject(&self, uid: &str, name: &str) -> Result<Subject> {
        let _guard = self.lock();
        self.rename_subject_locked(uid, name)
    }

    pub(crate) fn rename_subject_locked(&self, uid: &str, name: &str) -> Result<Subject> {
        let mut subject = self
            .find_subject(uid)?
            .ok_or_else(|| FacesError::not_found("subject", uid))?;
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(FacesError::Data("subject name is empty".into()));
        }

        if let Some(existing) = self.find_subject_by_name(&name)? {
            if existing.uid != subject.uid {
                self.merge_subjects_locked(&subject.uid, &existing.uid)?;
                return Ok(existing);
            }
        }

        if !subject.set_name(&name) {
            return Ok(subject);
        }

        let now = Utc::now();
        let mut batch = WriteBatch::new();
        batch.set(&subject_key(&subject.uid), encode(&subject)?);
        for mut m in self.markers()? {
            if m.subj_uid.as_deref() == Some(uid) && !m.name.is_empty() && m.name != subject.name {
                m.name = subject.name.clone();
                m.updated_at = now;
                stage_marker(&mut batch, &m, true)?;
            }
        }
        self.write_batch(batch)?;
        Ok(subject)
    }

    /// Replaces the faces `old` with `merged`: the old records are deleted,
    /// the merged face stored and every marker of an old face repointed
    /// with its distance recomputed. Returns the number of markers moved.
    pub fn replace_faces(&self, old: &[String], merged: &Face) -> Result<usize> {
        let _guard = self.lock();
        let old: HashSet<&str> = old.iter().map(String::as_str).collect();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        for id in &old {
            if *id != merged.id {
                batch.delete(&face_key(id));
            }
        }
        batch.set(&face_key(&merged.id), encode(merged)?);

        let mut moved = 0;
        for mut m in self.markers()? {
            if !m.face_id.as_deref().is_some_and(|id| old.contains(id)) {
                continue;
            }
            m.face_id = Some(merged.id.clone());
            m.face_dist = m
                .embeddings()
                .ok()
                .and_then(|e| e.distance(&merged.embedding))
                .unwrap_or(UNKNOWN_DIST);
            m.updated_at = now;
            stage_marker(&mut batch, &m, true)?;
            moved += 1;
        }
        self.write_batch(batch)?;
        Ok(moved)
    }

    fn face_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .kv_keys(FACE_PREFIX)?
            .into_iter()
            .map(|k| key_id(&k, FACE_PREFIX).to_string())
            .collect())
    }

    fn subject_uids(&self) -> Result<HashSet<String>> {
        Ok(self
            .kv_keys(SUBJECT_PREFIX)?
            .into_iter()
            .map(|k| key_id(&k, SUBJECT_PREFIX).to_string())
            .collect())
    }
}

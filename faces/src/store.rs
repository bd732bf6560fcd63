//! Record store for faces, subjects, markers and files.
//!
//! Records are JSON values in a [`KVStore`]. Reads go straight to the KV
//! store. Every mutation takes the store's write lock for the duration of
//! one read-modify-write, so concurrent updates to the same record never
//! interleave. Changes spanning several records are applied as one
//! [`WriteBatch`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use facekit_kv::{KVStore, MemoryStore, WriteBatch};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::keys::{
    FACE_PREFIX, FILE_PREFIX, MARKER_PREFIX, REFRESH_PREFIX, SUBJECT_PREFIX, face_key, file_key,
    key_id, marker_key, refresh_key, subject_key,
};
use crate::marker::{Marker, MarkerType};
use crate::source::Source;
use crate::subject::{Subject, slugify};

/// A file known to own markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    pub added_at: DateTime<Utc>,
}

/// What an update closure did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Nothing to write.
    None,
    /// Write the record without flagging its file.
    Silent,
    /// Write the record and flag its file for a metadata refresh.
    Refresh,
}

pub struct FaceStore {
    kv: Arc<dyn KVStore>,
    write: Mutex<()>,
}

impl std::fmt::Debug for FaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceStore").finish_non_exhaustive()
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| FacesError::Data(format!("{key}: {e}")))
}

/// Faces in matching order: higher source first, then more samples, then id.
pub(crate) fn sort_faces(faces: &mut [Face]) {
    faces.sort_by(|a, b| {
        b.face_src
            .cmp(&a.face_src)
            .then(b.samples.cmp(&a.samples))
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl FaceStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self {
            kv,
            write: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.write.lock()
    }

    pub(crate) fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(data) => decode(key, &data).map(Some),
            None => Ok(None),
        }
    }

    /// All records under `prefix`. Records that fail to decode are logged
    /// and skipped.
    pub(crate) fn scan_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (key, data) in self.kv.scan(prefix)? {
            match decode(&key, &data) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!("faces: skipping record: {}", e),
            }
        }
        Ok(out)
    }

    pub(crate) fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.kv.scan(prefix)?.into_iter().map(|(k, _)| k).collect())
    }

    pub(crate) fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.set(key, &encode(value)?)?;
        Ok(())
    }

    pub(crate) fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.kv.write(batch)?;
        Ok(())
    }

    // Files.

    pub fn add_file(&self, uid: &str, name: &str) -> Result<()> {
        let record = FileRecord {
            uid: uid.to_string(),
            name: name.to_string(),
            added_at: Utc::now(),
        };
        let _guard = self.lock();
        self.put(&file_key(uid), &record)
    }

    /// Unregisters a file. Its markers become orphans and are removed by
    /// the next cleanup.
    pub fn remove_file(&self, uid: &str) -> Result<bool> {
        let _guard = self.lock();
        let key = file_key(uid);
        if self.kv.get(&key)?.is_none() {
            return Ok(false);
        }
        self.kv.delete(&key)?;
        Ok(true)
    }

    pub fn has_file(&self, uid: &str) -> Result<bool> {
        Ok(self.kv.get(&file_key(uid))?.is_some())
    }

    pub fn files(&self) -> Result<Vec<FileRecord>> {
        self.scan_all(FILE_PREFIX)
    }

    pub fn flag_refresh(&self, file_uid: &str) -> Result<()> {
        self.kv
            .set(&refresh_key(file_uid), Utc::now().to_rfc3339().as_bytes())?;
        Ok(())
    }

    /// Files whose markers changed since their flags were last cleared.
    pub fn refresh_flags(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .scan(REFRESH_PREFIX)?
            .into_iter()
            .map(|(k, _)| key_id(&k, REFRESH_PREFIX).to_string())
            .collect())
    }

    /// Returns and clears all refresh flags.
    pub fn take_refresh_flags(&self) -> Result<Vec<String>> {
        let _guard = self.lock();
        let files = self.refresh_flags()?;
        let mut batch = WriteBatch::new();
        for f in &files {
            batch.delete(&refresh_key(f));
        }
        self.write_batch(batch)?;
        Ok(files)
    }

    // Faces.

    /// All faces in matching order.
    pub fn faces(&self) -> Result<Vec<Face>> {
        let mut faces: Vec<Face> = self.scan_all(FACE_PREFIX)?;
        sort_faces(&mut faces);
        Ok(faces)
    }

    pub fn find_face(&self, id: &str) -> Result<Option<Face>> {
        self.load(&face_key(id))
    }

    /// Persists a new face. Returns false if a face with the same id exists.
    pub fn create_face(&self, face: &Face) -> Result<bool> {
        let _guard = self.lock();
        let key = face_key(&face.id);
        if self.kv.get(&key)?.is_some() {
            return Ok(false);
        }
        self.put(&key, face)?;
        Ok(true)
    }

    /// Returns an existing face for the candidate, or persists it.
    ///
    /// A face with the candidate's id is returned as is. Otherwise the
    /// closest suitable face whose radius covers the candidate's centroid
    /// and whose subject does not conflict is reused. Unsuitable candidates
    /// never join a suitable face; they are stored flagged.
    pub fn first_or_create_face(&self, candidate: Face) -> Result<Face> {
        let _guard = self.lock();
        let key = face_key(&candidate.id);
        if let Some(existing) = self.load::<Face>(&key)? {
            return Ok(existing);
        }

        if !candidate.unsuitable {
            let closest = self
                .scan_all::<Face>(FACE_PREFIX)?
                .into_iter()
                .filter(|f| !f.unsuitable)
                .filter(|f| f.subj_uid.is_none() || f.subj_uid == candidate.subj_uid)
                .filter_map(|f| {
                    let d = f.embedding.distance(&candidate.embedding)?;
                    (d <= f.sample_radius).then_some((d, f))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0));
            if let Some((d, existing)) = closest {
                tracing::debug!(
                    "faces: candidate {} matches face {} at {:.4}",
                    candidate.id,
                    existing.id,
                    d
                );
                return Ok(existing);
            }
        }

        self.put(&key, &candidate)?;
        Ok(candidate)
    }

    /// Read-modify-write of one face. Returns the updated face, or `None` if
    /// it does not exist.
    pub fn update_face<F>(&self, id: &str, f: F) -> Result<Option<Face>>
    where
        F: FnOnce(&mut Face) -> bool,
    {
        let _guard = self.lock();
        self.update_face_locked(id, f)
    }

    pub(crate) fn update_face_locked<F>(&self, id: &str, f: F) -> Result<Option<Face>>
    where
        F: FnOnce(&mut Face) -> bool,
    {
        let key = face_key(id);
        let Some(mut face) = self.load::<Face>(&key)? else {
            return Ok(None);
        };
        if f(&mut face) {
            face.updated_at = Utc::now();
            self.put(&key, &face)?;
        }
        Ok(Some(face))
    }

    pub fn set_face_subject(&self, id: &str, subj_uid: Option<&str>) -> Result<Option<Face>> {
        self.update_face(id, |face| {
            let next = subj_uid.map(str::to_string);
            if face.subj_uid == next {
                return false;
            }
            face.subj_uid = next;
            true
        })
    }

    // Subjects.

    pub fn subjects(&self) -> Result<Vec<Subject>> {
        let mut subjects: Vec<Subject> = self.scan_all(SUBJECT_PREFIX)?;
        subjects.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.uid.cmp(&b.uid)));
        Ok(subjects)
    }

    pub fn find_subject(&self, uid: &str) -> Result<Option<Subject>> {
        self.load(&subject_key(uid))
    }

    /// Finds a subject whose name folds to the same slug.
    pub fn find_subject_by_name(&self, name: &str) -> Result<Option<Subject>> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Ok(None);
        }
        Ok(self
            .scan_all::<Subject>(SUBJECT_PREFIX)?
            .into_iter()
            .find(|s| s.slug == slug))
    }

    /// Returns the subject with this name, creating it if needed. `None` if
    /// the name is empty after sanitizing.
    pub fn first_or_create_subject(&self, name: &str, src: Source) -> Result<Option<Subject>> {
        let _guard = self.lock();
        self.first_or_create_subject_locked(name, src)
    }

    pub(crate) fn first_or_create_subject_locked(
        &self,
        name: &str,
        src: Source,
    ) -> Result<Option<Subject>> {
        let Some(candidate) = Subject::new(name, src) else {
            return Ok(None);
        };
        if let Some(existing) = self.find_subject_by_name(&candidate.name)? {
            return Ok(Some(existing));
        }
        self.put(&subject_key(&candidate.uid), &candidate)?;
        tracing::info!("faces: added subject {} ({})", candidate.name, candidate.uid);
        Ok(Some(candidate))
    }

    pub fn save_subject(&self, subject: &Subject) -> Result<()> {
        let _guard = self.lock();
        self.put(&subject_key(&subject.uid), subject)
    }

    // Markers.

    /// Persists a new marker. The area must be valid.
    pub fn create_marker(&self, marker: &Marker) -> Result<()> {
        marker.invalid_area()?;
        let _guard = self.lock();
        self.put(&marker_key(&marker.uid), marker)
    }

    pub fn find_marker(&self, uid: &str) -> Result<Option<Marker>> {
        self.load(&marker_key(uid))
    }

    pub fn markers(&self) -> Result<Vec<Marker>> {
        self.scan_all(MARKER_PREFIX)
    }

    pub fn file_markers(&self, file_uid: &str) -> Result<Vec<Marker>> {
        Ok(self
            .markers()?
            .into_iter()
            .filter(|m| m.file_uid == file_uid)
            .collect())
    }

    pub fn face_markers(&self, face_id: &str) -> Result<Vec<Marker>> {
        Ok(self
            .markers()?
            .into_iter()
            .filter(|m| m.face_id.as_deref() == Some(face_id))
            .collect())
    }

    pub fn count_markers(&self, marker_type: MarkerType) -> Result<usize> {
        Ok(self
            .markers()?
            .iter()
            .filter(|m| m.marker_type == marker_type)
            .count())
    }

    /// Read-modify-write of one marker, applied atomically. The closure
    /// reports what changed; a `Refresh` change also flags the marker's
    /// file in the same batch. Returns the stored marker afterwards, or
    /// `None` if it does not exist.
    pub fn update_marker<F>(&self, uid: &str, f: F) -> Result<Option<Marker>>
    where
        F: FnOnce(&mut Marker) -> Change,
    {
        let _guard = self.lock();
        self.update_marker_locked(uid, f)
    }

    pub(crate) fn update_marker_locked<F>(&self, uid: &str, f: F) -> Result<Option<Marker>>
    where
        F: FnOnce(&mut Marker) -> Change,
    {
        let key = marker_key(uid);
        let Some(mut marker) = self.load::<Marker>(&key)? else {
            return Ok(None);
        };
        let change = f(&mut marker);
        if change == Change::None {
            return Ok(Some(marker));
        }
        marker.invalid_area()?;
        marker.updated_at = Utc::now();

        let mut batch = WriteBatch::new();
        batch.set(&key, encode(&marker)?);
        if change == Change::Refresh {
            batch.set(
                &refresh_key(&marker.file_uid),
                Utc::now().to_rfc3339().into_bytes(),
            );
        }
        self.write_batch(batch)?;
        Ok(Some(marker))
    }

    /// Next page of face markers in uid order, starting after `after`.
    ///
    /// With `matched_before` set, only markers never matched or matched
    /// before that time are returned. The second value is the cursor for
    /// the following page; it advances past skipped markers too, so a page
    /// shorter than `limit` does not mean the scan is finished. The scan is
    /// finished when the returned cursor is `None`.
    pub fn face_markers_page(
        &self,
        after: Option<&str>,
        limit: usize,
        matched_before: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Marker>, Option<String>)> {
        let limit = limit.max(1);
        let mut cursor = after.map(marker_key);
        let mut out = Vec::new();

        loop {
            let rows = self
                .kv
                .scan_after(MARKER_PREFIX, cursor.as_deref(), limit)?;
            let exhausted = rows.len() < limit;

            for (key, data) in rows {
                cursor = Some(key.clone());
                let marker: Marker = match decode(&key, &data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("markers: skipping record: {}", e);
                        continue;
                    }
                };
                if !marker.is_face() {
                    continue;
                }
                if matched_before
                    .is_some_and(|before| marker.matched_at.is_some_and(|t| t >= before))
                {
                    continue;
                }
                out.push(marker);
                if out.len() >= limit {
                    let next = cursor.as_deref().map(|k| key_id(k, MARKER_PREFIX).to_string());
                    return Ok((out, next));
                }
            }

            if exhausted {
                return Ok((out, None));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::embedding::{Embedding, Embeddings};
    use crate::marker::Area;

    fn marker(file: &str) -> Marker {
        let e = Embeddings::from_rows(vec![vec![1.0, 0.0]]).unwrap();
        Marker::new_face(file, Source::Image, Area::new(0.1, 0.1, 0.2, 0.2), 100, 30, &e).unwrap()
    }

    fn face(x: f32, src: Source, samples: usize) -> Face {
        Face::from_centroid(
            None,
            src,
            Embedding::new(vec![x, 1.0]),
            0.4,
            samples,
            &Tuning::default(),
        )
    }

    #[test]
    fn create_face_is_idempotent() {
        let store = FaceStore::in_memory();
        let f = face(0.0, Source::Auto, 12);
        assert!(store.create_face(&f).unwrap());
        assert!(!store.create_face(&f).unwrap());

        let mut other = f.clone();
        other.subj_uid = Some("j1".into());
        let got = store.first_or_create_face(other).unwrap();
        assert_eq!(got.subj_uid, None, "existing record wins");
        assert_eq!(store.faces().unwrap().len(), 1);
    }

    #[test]
    fn close_candidates_share_one_face() {
        let store = FaceStore::in_memory();
        let first = store.first_or_create_face(face(0.0, Source::Manual, 1)).unwrap();
        let near = face(0.1, Source::Manual, 1);
        assert_ne!(near.id, first.id);

        let got = store.first_or_create_face(near).unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(store.faces().unwrap().len(), 1);

        let far = store.first_or_create_face(face(2.0, Source::Manual, 1)).unwrap();
        assert_ne!(far.id, first.id);
        assert_eq!(store.faces().unwrap().len(), 2);
    }

    #[test]
    fn close_candidate_of_other_subject_gets_own_face() {
        let store = FaceStore::in_memory();
        let mut jane = face(0.0, Source::Manual, 1);
        jane.subj_uid = Some("j1".into());
        store.create_face(&jane).unwrap();

        let mut john = face(0.1, Source::Manual, 1);
        john.subj_uid = Some("j2".into());
        let got = store.first_or_create_face(john.clone()).unwrap();
        assert_eq!(got.id, john.id);
        assert_eq!(store.faces().unwrap().len(), 2);
    }

    #[test]
    fn unsuitable_candidate_is_stored_flagged() {
        let store = FaceStore::in_memory();
        store.create_face(&face(0.0, Source::Auto, 12)).unwrap();

        let mut tuning = Tuning::default();
        tuning.children = Embeddings::from_rows(vec![vec![0.1, 1.0]]).unwrap();
        let child = Face::from_centroid(
            None,
            Source::Manual,
            Embedding::new(vec![0.1, 1.0]),
            0.4,
            1,
            &tuning,
        );
        assert!(child.unsuitable);

        let got = store.first_or_create_face(child.clone()).unwrap();
        assert_eq!(got.id, child.id);
        assert!(got.unsuitable);
        assert!(store.find_face(&child.id).unwrap().unwrap().unsuitable);
    }

    #[test]
    fn faces_sorted_for_matching() {
        let store = FaceStore::in_memory();
        store.create_face(&face(0.0, Source::Auto, 50)).unwrap();
        store.create_face(&face(1.0, Source::Manual, 1)).unwrap();
        store.create_face(&face(2.0, Source::Auto, 80)).unwrap();

        let faces = store.faces().unwrap();
        assert_eq!(faces[0].face_src, Source::Manual);
        assert_eq!(faces[1].samples, 80);
        assert_eq!(faces[2].samples, 50);
    }

    #[test]
    fn subjects_by_name() {
        let store = FaceStore::in_memory();
        let a = store.first_or_create_subject("Jane Doe", Source::Manual).unwrap().unwrap();
        let b = store.first_or_create_subject("  jane   DOE ", Source::Manual).unwrap().unwrap();
        assert_eq!(a.uid, b.uid);
        assert!(store.first_or_create_subject(" ", Source::Manual).unwrap().is_none());
        assert_eq!(store.find_subject_by_name("jane doe").unwrap().unwrap().uid, a.uid);
    }

    #[test]
    fn create_marker_checks_area() {
        let store = FaceStore::in_memory();
        let mut m = marker("f1");
        m.area = Area::new(0.9, 0.9, 1.5, 0.1);
        assert!(matches!(store.create_marker(&m), Err(FacesError::InvalidArea(_))));
        assert!(store.markers().unwrap().is_empty());
    }

    #[test]
    fn update_marker_flags_refresh() {
        let store = FaceStore::in_memory();
        let m = marker("f1");
        store.create_marker(&m).unwrap();

        store.update_marker(&m.uid, |m| {
            m.matched_at = Some(Utc::now());
            Change::Silent
        })
        .unwrap();
        assert!(store.refresh_flags().unwrap().is_empty());

        let updated = store
            .update_marker(&m.uid, |m| {
                m.review = true;
                Change::Refresh
            })
            .unwrap()
            .unwrap();
        assert!(updated.review);
        assert_eq!(store.take_refresh_flags().unwrap(), vec!["f1".to_string()]);
        assert!(store.refresh_flags().unwrap().is_empty());

        assert!(store.update_marker("missing", |_| Change::Refresh).unwrap().is_none());
    }

    #[test]
    fn markers_page_walks_all_face_markers() {
        let store = FaceStore::in_memory();
        let mut uids = Vec::new();
        for i in 0..7 {
            let mut m = marker("f1");
            if i == 3 {
                m.marker_type = MarkerType::Label;
            }
            store.create_marker(&m).unwrap();
            uids.push(m.uid);
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let (page, next) = store.face_markers_page(cursor.as_deref(), 2, None).unwrap();
            assert!(page.len() <= 2);
            seen.extend(page.into_iter().map(|m| m.uid));
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen.len(), 6);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn markers_page_filters_recently_matched() {
        let store = FaceStore::in_memory();
        let old = marker("f1");
        let mut fresh = marker("f1");
        let now = Utc::now();
        fresh.matched_at = Some(now);
        store.create_marker(&old).unwrap();
        store.create_marker(&fresh).unwrap();

        let (page, next) = store.face_markers_page(None, 10, Some(now)).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].uid, old.uid);
        assert!(next.is_none());
    }

    #[test]
    fn files_registry() {
        let store = FaceStore::in_memory();
        store.add_file("f1", "a.jpg").unwrap();
        assert!(store.has_file("f1").unwrap());
        assert!(store.remove_file("f1").unwrap());
        assert!(!store.remove_file("f1").unwrap());
        assert!(store.files().unwrap().is_empty());
    }
}

//! Face detections attached to files.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::Embeddings;
use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::source::Source;
use crate::subject::new_uid;

/// Distance value meaning "no distance known".
pub const UNKNOWN_DIST: f64 = -1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerType {
    #[default]
    Face,
    Label,
}

impl fmt::Display for MarkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerType::Face => f.write_str("face"),
            MarkerType::Label => f.write_str("label"),
        }
    }
}

/// A rectangle in coordinates relative to the image, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Area {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn surface(&self) -> f32 {
        self.w * self.h
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.x)
            && (0.0..=1.0).contains(&self.y)
            && self.w > 0.0
            && self.w <= 1.0
            && self.h > 0.0
            && self.h <= 1.0
    }

    /// Shared surface as a percentage of the smaller of the two areas.
    pub fn overlap_percent(&self, other: &Area) -> u32 {
        let w = (self.x + self.w).min(other.x + other.w) - self.x.max(other.x);
        let h = (self.y + self.h).min(other.y + other.h) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            return 0;
        }
        let smaller = self.surface().min(other.surface());
        if smaller <= 0.0 {
            return 0;
        }
        ((w * h / smaller) * 100.0).round() as u32
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={}% y={}% w={}% h={}%",
            (self.x * 100.0) as i32,
            (self.y * 100.0) as i32,
            (self.w * 100.0) as i32,
            (self.h * 100.0) as i32
        )
    }
}

/// A detected region on a file, linked to a face and subject once known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Marker {
    pub uid: String,
    pub file_uid: String,
    #[serde(rename = "type")]
    pub marker_type: MarkerType,
    pub marker_src: Source,
    /// Name given by a human. Empty unless set by a correction.
    pub name: String,
    pub review: bool,
    pub invalid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subj_uid: Option<String>,
    pub subj_src: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    /// Distance to the linked face; negative when unknown.
    pub face_dist: f64,
    pub area: Area,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub landmarks: Vec<Area>,
    pub size: i32,
    pub score: i32,
    /// Embeddings as stored, decoded on demand.
    pub embeddings_json: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            uid: String::new(),
            file_uid: String::new(),
            marker_type: MarkerType::Face,
            marker_src: Source::Auto,
            name: String::new(),
            review: false,
            invalid: false,
            subj_uid: None,
            subj_src: Source::Auto,
            face_id: None,
            face_dist: UNKNOWN_DIST,
            area: Area::default(),
            landmarks: Vec::new(),
            size: 0,
            score: 0,
            embeddings_json: String::new(),
            matched_at: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

impl Marker {
    pub fn new(file_uid: &str, marker_type: MarkerType, src: Source, area: Area) -> Self {
        let now = Utc::now();
        Self {
            uid: new_uid('m'),
            file_uid: file_uid.to_string(),
            marker_type,
            marker_src: src,
            area,
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    /// A face marker carrying detector output.
    pub fn new_face(
        file_uid: &str,
        src: Source,
        area: Area,
        size: i32,
        score: i32,
        embeddings: &Embeddings,
    ) -> Result<Self> {
        let mut m = Self::new(file_uid, MarkerType::Face, src, area);
        m.size = size;
        m.score = score;
        m.set_embeddings(embeddings)?;
        Ok(m)
    }

    pub fn is_face(&self) -> bool {
        self.marker_type == MarkerType::Face
    }

    pub fn has_embeddings(&self) -> bool {
        let s = self.embeddings_json.trim();
        !s.is_empty() && s != "[]"
    }

    /// Candidate for matching: a valid face marker with embeddings.
    pub fn matchable(&self) -> bool {
        !self.invalid && self.is_face() && self.has_embeddings()
    }

    /// The subject was set by a source matching must not override.
    pub fn authoritative(&self) -> bool {
        self.subj_src.is_authoritative() && self.subj_uid.is_some()
    }

    pub fn embeddings(&self) -> Result<Embeddings> {
        Embeddings::from_json(&self.embeddings_json)
    }

    pub fn set_embeddings(&mut self, e: &Embeddings) -> Result<()> {
        self.embeddings_json = if e.is_empty() {
            String::new()
        } else {
            e.to_json()?
        };
        Ok(())
    }

    pub fn invalid_area(&self) -> Result<()> {
        if !self.is_face() || self.area.is_valid() {
            return Ok(());
        }
        Err(FacesError::InvalidArea(format!(
            "{} for {} marker {}",
            self.area, self.marker_type, self.uid
        )))
    }

    /// Reports whether the marker already holds the best match, so the
    /// matching pass only has to refresh its timestamp.
    pub fn has_face(&self, best: Option<&Face>, dist: f64) -> bool {
        let Some(face_id) = self.face_id.as_deref() else {
            return false;
        };
        if self.subj_uid.is_none() {
            return false;
        }
        match best {
            None => true,
            Some(f) if f.id == face_id => true,
            Some(_) if self.face_dist < 0.0 => false,
            Some(_) if dist < 0.0 => true,
            Some(_) => self.face_dist <= dist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::embedding::Embedding;

    fn face(id_seed: f32) -> Face {
        Face::from_centroid(
            Some("j1"),
            Source::Auto,
            Embedding::new(vec![id_seed, 0.0]),
            0.5,
            3,
            &Tuning::default(),
        )
    }

    #[test]
    fn area_validation() {
        assert!(Area::new(0.1, 0.1, 0.2, 0.2).is_valid());
        assert!(!Area::new(-0.1, 0.1, 0.2, 0.2).is_valid());
        assert!(!Area::new(0.1, 0.1, 0.0, 0.2).is_valid());
        assert!(!Area::new(0.1, 1.1, 0.2, 0.2).is_valid());

        let mut m = Marker::new("f1", MarkerType::Face, Source::Image, Area::new(0.5, 0.5, 2.0, 0.1));
        assert!(matches!(m.invalid_area(), Err(FacesError::InvalidArea(_))));
        m.marker_type = MarkerType::Label;
        assert!(m.invalid_area().is_ok());
    }

    #[test]
    fn overlap() {
        let a = Area::new(0.0, 0.0, 0.2, 0.2);
        assert_eq!(a.overlap_percent(&a), 100);
        assert_eq!(a.overlap_percent(&Area::new(0.1, 0.0, 0.2, 0.2)), 50);
        assert_eq!(a.overlap_percent(&Area::new(0.5, 0.5, 0.2, 0.2)), 0);
        assert_eq!(a.overlap_percent(&Area::new(0.05, 0.05, 0.1, 0.1)), 100);
    }

    #[test]
    fn defaults_on_decode() {
        let m: Marker = serde_json::from_str(r#"{"uid":"m1","file_uid":"f1"}"#).unwrap();
        assert_eq!(m.face_dist, UNKNOWN_DIST);
        assert!(m.is_face());
        assert!(!m.has_embeddings());
        assert!(m.embeddings().unwrap().is_empty());
    }

    #[test]
    fn authoritative_needs_subject() {
        let mut m = Marker::default();
        m.subj_src = Source::Manual;
        assert!(!m.authoritative());
        m.subj_uid = Some("j1".into());
        assert!(m.authoritative());
        m.subj_src = Source::Auto;
        assert!(!m.authoritative());
    }

    #[test]
    fn has_face_rules() {
        let f1 = face(0.0);
        let f2 = face(1.0);

        let mut m = Marker::default();
        assert!(!m.has_face(None, -1.0));

        m.face_id = Some(f1.id.clone());
        assert!(!m.has_face(Some(&f1), 0.1), "no subject yet");

        m.subj_uid = Some("j1".into());
        assert!(m.has_face(None, -1.0));
        assert!(m.has_face(Some(&f1), 0.3));

        m.face_dist = UNKNOWN_DIST;
        assert!(!m.has_face(Some(&f2), 0.3));

        m.face_dist = 0.2;
        assert!(m.has_face(Some(&f2), 0.3));
        assert!(!m.has_face(Some(&f2), 0.1));
    }

    #[test]
    fn embeddings_round_trip_through_json_field() {
        let e = Embeddings::from_rows(vec![vec![0.1, 0.2]]).unwrap();
        let m = Marker::new_face("f1", Source::Image, Area::new(0.1, 0.1, 0.1, 0.1), 80, 30, &e)
            .unwrap();
        assert!(m.has_embeddings());
        assert_eq!(m.embeddings().unwrap(), e);
        assert!(m.uid.starts_with('m'));
    }
}

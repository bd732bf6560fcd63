//! Listing commands for faces, subjects and markers.

use clap::Args;
use facekit_faces::{Marker, Source};
use serde::Serialize;

use super::{open_store, output_result};
use crate::Cli;

#[derive(Args)]
pub struct FacesCommand {
    /// Only faces without a subject
    #[arg(long)]
    pub unknown: bool,
}

#[derive(Serialize)]
struct FaceRow {
    id: String,
    src: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    samples: usize,
    radius: f64,
    markers: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unsuitable: bool,
}

impl FacesCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        let mut rows = Vec::new();
        for face in store.faces()? {
            if self.unknown && face.has_subject() {
                continue;
            }
            let markers = store.face_markers(&face.id)?.len();
            rows.push(FaceRow {
                id: face.id,
                src: face.face_src,
                subject: face.subj_uid,
                samples: face.samples,
                radius: face.sample_radius,
                markers,
                unsuitable: face.unsuitable,
            });
        }
        output_result(cli, &rows)
    }
}

#[derive(Args)]
pub struct SubjectsCommand {}

impl SubjectsCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        output_result(cli, &store.subjects()?)
    }
}

#[derive(Args)]
pub struct MarkersCommand {
    /// Only markers of this file
    #[arg(long)]
    pub file: Option<String>,

    /// Only markers linked to this face
    #[arg(long)]
    pub face: Option<String>,
}

#[derive(Serialize)]
struct MarkerRow {
    uid: String,
    file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    subj_src: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    face: Option<String>,
    dist: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    invalid: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    review: bool,
}

impl From<Marker> for MarkerRow {
    fn from(m: Marker) -> Self {
        Self {
            uid: m.uid,
            file: m.file_uid,
            name: m.name,
            subject: m.subj_uid,
            subj_src: m.subj_src,
            face: m.face_id,
            dist: m.face_dist,
            invalid: m.invalid,
            review: m.review,
        }
    }
}

impl MarkersCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        let markers = match (&self.file, &self.face) {
            (Some(file), _) => store.file_markers(file)?,
            (None, Some(face)) => store.face_markers(face)?,
            (None, None) => store.markers()?,
        };
        let rows: Vec<MarkerRow> = markers
            .into_iter()
            .filter(|m| m.is_face())
            .filter(|m| self.face.is_none() || m.face_id == self.face)
            .map(MarkerRow::from)
            .collect();
        output_result(cli, &rows)
    }
}

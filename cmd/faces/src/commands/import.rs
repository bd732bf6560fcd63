//! Import command: registers files and stores their detections as markers.

use std::sync::Arc;

use clap::Args;
use facekit_faces::{Detection, Detector, IndexResult, Indexer};
use serde::{Deserialize, Serialize};

use super::{load_request, open_worker, output_result, print_success, print_verbose};
use crate::Cli;

#[derive(Args)]
pub struct ImportCommand {
    /// YAML or JSON file listing files and their detections
    pub file: String,
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    files: Vec<ImportFile>,
}

#[derive(Debug, Deserialize)]
struct ImportFile {
    uid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    faces: Vec<Detection>,
}

#[derive(Debug, Default, Serialize)]
struct ImportSummary {
    files: usize,
    #[serde(flatten)]
    totals: IndexResult,
}

/// Detections come precomputed in the request file.
struct Precomputed;

impl Detector for Precomputed {
    fn detect(&self, _path: &std::path::Path) -> facekit_faces::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

impl ImportCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let request: ImportRequest = load_request(&self.file)?;
        let faces = open_worker(cli)?;
        let indexer = Indexer::new(
            faces.store().clone(),
            faces.config().tuning.clone(),
            Arc::new(Precomputed),
        );

        let mut summary = ImportSummary::default();
        for file in request.files {
            let name = if file.name.is_empty() {
                file.uid.clone()
            } else {
                file.name
            };
            faces.store().add_file(&file.uid, &name)?;
            let r = indexer.add_detections(&file.uid, file.faces)?;
            print_verbose(
                cli,
                &format!("{}: {} added, {} duplicates", name, r.added, r.duplicates),
            );

            summary.files += 1;
            summary.totals.added += r.added;
            summary.totals.duplicates += r.duplicates;
            summary.totals.skipped += r.skipped;
            summary.totals.invalid += r.invalid;
        }

        print_success(&format!(
            "imported {} markers from {} files",
            summary.totals.added, summary.files
        ));
        output_result(cli, &summary)
    }
}

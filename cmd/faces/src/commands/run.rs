//! Run and clean commands.

use clap::Args;
use facekit_faces::FacesOptions;
use serde::Serialize;

use super::{open_store, open_worker, output_result, print_info, print_success, print_warning};
use crate::Cli;

#[derive(Args)]
pub struct RunCommand {
    /// Re-match every marker and cluster regardless of thresholds
    #[arg(long)]
    pub force: bool,

    /// Minimum number of new samples before clustering (0 = configured)
    #[arg(long, default_value_t = 0)]
    pub threshold: usize,
}

impl RunCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let faces = open_worker(cli)?;
        if faces.disabled() {
            print_warning("face recognition is disabled in the settings");
            return Ok(());
        }

        let opts = FacesOptions {
            force: self.force,
            threshold: self.threshold,
        };
        match faces.start(opts) {
            Ok(report) => {
                print_success(&format!(
                    "{} new faces, {} markers updated",
                    report.new_faces, report.updated_markers
                ));
                output_result(cli, &report)
            }
            Err(partial) => {
                print_warning("run interrupted, completed work is kept");
                output_result(cli, &partial.done)?;
                Err(partial.error.into())
            }
        }
    }
}

#[derive(Args)]
pub struct CleanCommand {}

#[derive(Debug, Default, Serialize)]
struct CleanReport {
    removed_markers: usize,
    removed_faces: usize,
    removed_subjects: usize,
    fixed_references: usize,
    refreshed_files: Vec<String>,
}

impl CleanCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        let report = CleanReport {
            removed_markers: store.remove_orphan_markers()?,
            removed_faces: store.delete_orphan_faces()?,
            removed_subjects: store.delete_orphan_people()?,
            fixed_references: store.fix_marker_references()?,
            refreshed_files: store.take_refresh_flags()?,
        };

        if report.refreshed_files.is_empty() {
            print_info("no files need refreshing");
        }
        output_result(cli, &report)
    }
}

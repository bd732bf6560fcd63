//! Commands that change names and subjects.

use clap::Args;
use facekit_faces::Source;

use super::{open_store, open_worker, output_result, print_info, print_success};
use crate::Cli;

#[derive(Args)]
pub struct NameCommand {
    /// Marker uid
    pub marker: String,

    /// Name of the person
    pub name: String,
}

impl NameCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let faces = open_worker(cli)?;
        if !faces.set_marker_name(&self.marker, &self.name, Source::Manual)? {
            print_info(&format!("marker {} unchanged", self.marker));
            return Ok(());
        }
        print_success(&format!("marker {} named {}", self.marker, self.name));
        if let Some(marker) = faces.store().find_marker(&self.marker)? {
            output_result(cli, &marker.subj_uid)?;
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct ClearCommand {
    /// Marker uid
    pub marker: String,
}

impl ClearCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let faces = open_worker(cli)?;
        let marker = faces.clear_marker_subject(&self.marker, Source::Manual)?;
        print_success(&format!("cleared name of marker {}", marker.uid));
        Ok(())
    }
}

#[derive(Args)]
pub struct RenameCommand {
    /// Subject uid
    pub subject: String,

    /// New name
    pub name: String,
}

impl RenameCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        let subject = store.rename_subject(&self.subject, &self.name)?;
        if subject.uid != self.subject {
            print_info(&format!("merged into existing subject {}", subject.uid));
        }
        output_result(cli, &subject)
    }
}

#[derive(Args)]
pub struct MergeCommand {
    /// Subject uid to merge and delete
    pub from: String,

    /// Subject uid to keep
    pub into: String,
}

impl MergeCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        let report = store.merge_subjects(&self.from, &self.into)?;
        print_success(&format!("merged {} into {}", self.from, self.into));
        output_result(cli, &report)
    }
}

#[derive(Args)]
pub struct RemoveFileCommand {
    /// File uid
    pub file: String,
}

impl RemoveFileCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = open_store(cli)?;
        if store.remove_file(&self.file)? {
            print_success(&format!("removed file {}", self.file));
        } else {
            print_info(&format!("file {} not registered", self.file));
        }
        Ok(())
    }
}

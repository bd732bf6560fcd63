//! CLI command implementations.

mod import;
mod list;
mod people;
mod run;
mod util;

pub use import::ImportCommand;
pub use list::{FacesCommand, MarkersCommand, SubjectsCommand};
pub use people::{ClearCommand, MergeCommand, NameCommand, RemoveFileCommand, RenameCommand};
pub use run::{CleanCommand, RunCommand};

pub(crate) use util::*;

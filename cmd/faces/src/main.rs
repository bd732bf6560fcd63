//! faces CLI - clusters face detections into identities and manages names.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    CleanCommand, ClearCommand, FacesCommand, ImportCommand, MarkersCommand, MergeCommand,
    NameCommand, RemoveFileCommand, RenameCommand, RunCommand, SubjectsCommand,
};

/// faces CLI - face identity resolution over a local store.
///
/// Detections are imported from YAML or JSON files, clustered into faces
/// and matched to named subjects. Data lives in a single redb file,
/// ~/.facekit/faces/faces.redb unless --db says otherwise.
#[derive(Parser)]
#[command(name = "faces")]
#[command(about = "Face clustering and identity resolution")]
#[command(version)]
pub struct Cli {
    /// Store file (default is ~/.facekit/faces/faces.redb)
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Settings file (default is ~/.facekit/faces/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import files and their face detections
    Import(ImportCommand),
    /// Run clustering and matching
    Run(RunCommand),
    /// Remove orphaned records and dangling links
    Clean(CleanCommand),
    /// List faces
    Faces(FacesCommand),
    /// List subjects
    Subjects(SubjectsCommand),
    /// List markers
    Markers(MarkersCommand),
    /// Name a marker
    Name(NameCommand),
    /// Remove a marker's name and subject
    Clear(ClearCommand),
    /// Rename a subject, merging it if the name is taken
    Rename(RenameCommand),
    /// Merge one subject into another
    Merge(MergeCommand),
    /// Unregister a file; its markers are removed by the next run
    RemoveFile(RemoveFileCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Import(cmd) => cmd.run(&cli),
        Commands::Run(cmd) => cmd.run(&cli),
        Commands::Clean(cmd) => cmd.run(&cli),
        Commands::Faces(cmd) => cmd.run(&cli),
        Commands::Subjects(cmd) => cmd.run(&cli),
        Commands::Markers(cmd) => cmd.run(&cli),
        Commands::Name(cmd) => cmd.run(&cli),
        Commands::Clear(cmd) => cmd.run(&cli),
        Commands::Rename(cmd) => cmd.run(&cli),
        Commands::Merge(cmd) => cmd.run(&cli),
        Commands::RemoveFile(cmd) => cmd.run(&cli),
    }
}

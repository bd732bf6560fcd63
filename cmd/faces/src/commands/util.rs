//! Utility functions for CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use facekit_faces::{FaceStore, Faces, FacesConfig};
use facekit_kv::{KVStore, RedbStore};

use crate::Cli;

const BASE_DIR: &str = ".facekit";
const APP_NAME: &str = "faces";

/// Directory holding the default store and settings files.
fn app_dir() -> anyhow::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(BASE_DIR).join(APP_NAME))
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory, use --db and --config"))
}

/// Loads the settings file. A missing file yields the defaults.
pub fn load_settings(cli: &Cli) -> anyhow::Result<FacesConfig> {
    let path = match cli.config.as_deref() {
        Some(p) => PathBuf::from(p),
        None => app_dir()?.join("config.yaml"),
    };
    Ok(FacesConfig::load(&path)?)
}

/// Opens the record store, creating its directory if needed.
pub fn open_store(cli: &Cli) -> anyhow::Result<Arc<FaceStore>> {
    let path = match cli.db.as_deref() {
        Some(p) => PathBuf::from(p),
        None => app_dir()?.join("faces.redb"),
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    print_verbose(cli, &format!("store: {}", path.display()));

    let kv: Arc<dyn KVStore> = Arc::new(RedbStore::open(&path)?);
    Ok(Arc::new(FaceStore::new(kv)))
}

/// Opens the store and builds a worker with the loaded settings.
pub fn open_worker(cli: &Cli) -> anyhow::Result<Faces> {
    let config = load_settings(cli)?;
    Ok(Faces::new(open_store(cli)?, config))
}

/// Loads a request from a YAML or JSON file.
pub fn load_request<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)?;
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("yaml");

    let result = match ext.to_lowercase().as_str() {
        "json" => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    Ok(result)
}

/// Outputs result as JSON or YAML.
pub fn output_result<T: serde::Serialize>(cli: &Cli, result: &T) -> anyhow::Result<()> {
    let output = if cli.json {
        serde_json::to_string_pretty(result)?
    } else {
        serde_yaml::to_string(result)?
    };

    match cli.output.as_deref() {
        Some(path) => std::fs::write(path, output)?,
        None => print!("{}", output),
    }

    Ok(())
}

/// Prints verbose output if enabled.
pub fn print_verbose(cli: &Cli, msg: &str) {
    if cli.verbose {
        eprintln!("[verbose] {}", msg);
    }
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints info message.
pub fn print_info(msg: &str) {
    eprintln!("\x1b[34mℹ\x1b[0m {}", msg);
}

/// Prints warning message.
pub fn print_warning(msg: &str) {
    eprintln!("\x1b[33m⚠\x1b[0m {}", msg);
}

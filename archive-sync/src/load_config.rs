/// `load_config` module: loads the optional YAML configuration file into the core's `SyncConfig`.
///
/// # Responsibilities
/// - Locate the configuration file: the `--config` flag wins, then the `ARCHIVE_SYNC_CONFIG`
///   environment variable (which may come from a `.env` file loaded by `main`).
/// - Parse YAML into [`SyncConfig`]; every key is optional and falls back to its default.
/// - Produce clear diagnostics: read and parse failures name the file and the cause.
///
/// # Errors
/// All errors in this module use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{Context, Result};
use archive_sync_core::SyncConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Environment variable naming a configuration file when `--config` is absent.
pub const CONFIG_ENV: &str = "ARCHIVE_SYNC_CONFIG";

pub fn resolve_config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// Loads a YAML config file. An empty file yields the defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(e).with_context(|| format!("Failed to read config file {:?}", path_ref));
        }
    };

    if config_content.trim().is_empty() {
        info!(config_path = ?path_ref, "Config file is empty, using defaults");
        return Ok(SyncConfig::default());
    }

    let config: SyncConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML {:?}: {e}", path_ref));
        }
    };

    config.trace_loaded();
    Ok(config)
}

/// [`load_config`] when a path is known, the defaults otherwise.
pub fn load_config_or_default(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => load_config(path),
        None => {
            info!("No config file given, using defaults");
            Ok(SyncConfig::default())
        }
    }
}

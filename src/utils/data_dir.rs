//! Per-user data directory: logs and the optional `config.toml`.
//!
//! Defaults to `~/.linkdrop/`, overridable with `--conf`.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Resolve the data directory, preferring `custom` when given.
pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(".linkdrop"))
            .ok_or_else(|| anyhow!("no home directory found, pass --conf")),
    }
}

pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir
        .join("logs")
        .join(crate::core::config::LOG_FILE_NAME)
}

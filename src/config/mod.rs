pub mod settings;

pub use settings::*;

use crate::error::{AppError, AppResult};
use std::path::{Path, PathBuf};

/// Get the remux config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| AppError::Config("Could not find config directory".into()))?
        .join("remux");

    Ok(config_dir)
}

/// Path of the known_hosts file the ssh transport records keys in
pub fn known_hosts_path(config_dir: &Path) -> PathBuf {
    config_dir.join("known_hosts")
}

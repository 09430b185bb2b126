//! Project and configuration paths

use std::path::{Path, PathBuf};

/// Application name used for platform directories
const APP_NAME: &str = "dact";

/// Project-local configuration file name
pub const PROJECT_CONFIG: &str = "dact.toml";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/dact/`
/// - macOS: `~/Library/Application Support/dact/`
/// - Windows: `%APPDATA%\dact\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the user configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Walk up from `start` until a directory holding `tools/` or `scenarios/` is found
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() {
        start.parent()?
    } else {
        start
    };
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|dir| dir.join("tools").is_dir() || dir.join("scenarios").is_dir())
        .map(Path::to_path_buf)
}

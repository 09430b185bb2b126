//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::{config_path, PROJECT_CONFIG};
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Engine limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where case artifacts go
    #[serde(default)]
    pub output: OutputConfig,
}

/// Engine settings
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Steps of one stage running at the same time
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,

    /// Timeout for steps whose tool declares none
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Bytes of stdout/stderr kept in memory per step
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// How long to wait for output readers after killing a timed out process
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel(),
            default_timeout_secs: None,
            max_output_bytes: default_max_output(),
            kill_grace_ms: default_kill_grace(),
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn default_max_parallel() -> usize {
    4
}
fn default_max_output() -> usize {
    1024 * 1024
}
fn default_kill_grace() -> u64 {
    500
}

/// Output directory configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Root for case work directories, relative to the project root
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Remove a case's previous artifacts before it runs
    #[serde(default = "default_clean")]
    pub clean: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            clean: default_clean(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_clean() -> bool {
    true
}

impl Config {
    /// Load configuration
    ///
    /// An explicit path must exist. Otherwise `dact.toml` in the project root
    /// is tried, then the user config file, then defaults.
    pub fn load(explicit: Option<&Path>, project_root: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let candidates = project_root
            .map(|root| root.join(PROJECT_CONFIG))
            .into_iter()
            .chain(config_path());
        for path in candidates {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    /// Parse one TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::ConfigParse(format!("{}: {}", path.display(), e)))
    }
}

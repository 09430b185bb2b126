//! Scenario and step definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::secs;
use crate::value::Mapping;

/// A directed graph of steps loaded from a `*.scenario.yml` file
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Fallback values for any step parameter
    #[serde(default)]
    pub default_params: Mapping,
    /// Exported to every spawned process and visible as `env.*`
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<Step>,
    /// Always attempted after the main run
    #[serde(default)]
    pub cleanup_steps: Vec<Step>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Scenario {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// One tool invocation inside a scenario
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Step {
    pub name: String,
    /// Tool name in the catalog
    pub tool: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Parameter templates or literals
    #[serde(default)]
    pub params: Mapping,
    /// Explicit dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expression that must be truthy for the step to run
    #[serde(default)]
    pub condition: Option<String>,
    /// Overrides the tool's retry count
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// Seconds between attempts
    #[serde(default)]
    pub retry_delay: Option<f64>,
    /// Keep running later stages when this step fails
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Per-attempt timeout in seconds, overrides the tool's
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl Step {
    /// A step invoking `tool` with no parameters
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            description: None,
            params: Mapping::new(),
            depends_on: Vec::new(),
            condition: None,
            retry_count: None,
            retry_delay: None,
            continue_on_failure: false,
            timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.and_then(secs)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay.and_then(secs).unwrap_or(Duration::ZERO)
    }
}

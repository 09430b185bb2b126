//! Tool descriptors
//!
//! A tool wraps one external program: the command template it renders, the
//! parameters it accepts and what to do with its results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::secs;
use crate::value::{Mapping, ParamType, Value};

/// A tool definition loaded from a `*.tool.yml` file
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Tool {
    /// Unique tool name referenced by steps
    pub name: String,
    /// Tool kind label, `shell` unless declared
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Declared parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParameter>,
    /// Command line with `{{ param }}` markers
    pub command_template: String,
    /// Regex that must match stdout or stderr for success
    #[serde(default)]
    pub success_pattern: Option<String>,
    /// Regex that fails the attempt when it matches stdout or stderr
    #[serde(default)]
    pub failure_pattern: Option<String>,
    /// Default timeout in seconds
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Default retry count
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub post_exec: PostExec,
    #[serde(default)]
    pub validation: ToolValidation,
}

fn default_kind() -> String {
    "shell".to_string()
}

impl Tool {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.and_then(secs)
    }

    /// First word of the command template, used for availability checks
    pub fn program(&self) -> Option<&str> {
        self.command_template
            .split_whitespace()
            .next()
            .filter(|word| !word.contains("{{"))
    }
}

/// A declared tool parameter
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ToolParameter {
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub help: Option<String>,
}

/// Operations that run after a tool command finishes
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PostExec {
    /// Output name to extraction call
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

/// How one named output is extracted
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutputSpec {
    /// `find_file(dir='out', pattern='*.bin')`
    Call(String),
    /// `{function: find_file, args: {dir: out}}`
    Structured {
        function: String,
        #[serde(default)]
        args: Mapping,
    },
}

/// Result checks applied to every execution of a tool
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ToolValidation {
    /// Expected exit code, 0 when absent
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout_contains: Vec<String>,
    #[serde(default)]
    pub stderr_not_contains: Vec<String>,
    /// Paths or glob patterns relative to the step work dir
    #[serde(default)]
    pub output_files_exist: Vec<String>,
}

impl ToolValidation {
    pub fn expected_exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.exit_code.is_none()
            && self.stdout_contains.is_empty()
            && self.stderr_not_contains.is_empty()
            && self.output_files_exist.is_empty()
    }
}

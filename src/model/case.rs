//! Test case definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::secs;
use crate::value::{Mapping, Value};

/// A file holding one or more cases
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CaseFile {
    /// Merged under every case's params
    #[serde(default)]
    pub common_params: Mapping,
    #[serde(default)]
    pub cases: Vec<Case>,
    /// Templates expanded into one case per data row
    #[serde(default)]
    pub data_driven_cases: Vec<DataDrivenCase>,
}

/// A case template instantiated once per row of a data file
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DataDrivenCase {
    pub template: Case,
    /// CSV, JSON or YAML file, relative to the case file
    pub data_source: String,
    /// Case parameter path (`a.b` nests) to row column
    #[serde(default)]
    pub parameter_mapping: BTreeMap<String, String>,
    /// Keep only rows whose columns equal these values
    #[serde(default)]
    pub data_filter: Option<Mapping>,
    /// Case name template; sees the row's columns, `index` and `data`
    #[serde(default)]
    pub name_template: Option<String>,
}

/// A named invocation of a scenario or a single tool
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Case {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Scenario to run
    #[serde(default)]
    pub scenario: Option<String>,
    /// Tool to run directly when no scenario is given
    #[serde(default)]
    pub tool: Option<String>,
    /// Scenario-level overrides; a key naming a step overrides that step's params
    #[serde(default)]
    pub params: Mapping,
    #[serde(default)]
    pub validation: Vec<CaseValidation>,
    /// Whole-case timeout in seconds
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Retry count for tool mode
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl Case {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.and_then(secs)
    }

    /// Parameter overrides addressed to one step
    pub fn step_overrides(&self, step: &str) -> Option<&Mapping> {
        match self.params.get(step) {
            Some(Value::Map(overrides)) => Some(overrides),
            _ => None,
        }
    }
}

/// Kinds of case-level checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValidationKind {
    ExitCode,
    StdoutContains,
    StderrNotContains,
    FileExists,
    FileNotExists,
    FileSize,
    FileContent,
    OutputEquals,
    OutputContains,
    OutputMatches,
    NumericRange,
    Performance,
    Custom,
    /// Unrecognized type name, reported as a failed check
    Unknown(String),
}

impl ValidationKind {
    pub fn as_str(&self) -> &str {
        match self {
            ValidationKind::ExitCode => "exit_code",
            ValidationKind::StdoutContains => "stdout_contains",
            ValidationKind::StderrNotContains => "stderr_not_contains",
            ValidationKind::FileExists => "file_exists",
            ValidationKind::FileNotExists => "file_not_exists",
            ValidationKind::FileSize => "file_size",
            ValidationKind::FileContent => "file_content",
            ValidationKind::OutputEquals => "output_equals",
            ValidationKind::OutputContains => "output_contains",
            ValidationKind::OutputMatches => "output_matches",
            ValidationKind::NumericRange => "numeric_range",
            ValidationKind::Performance => "performance",
            ValidationKind::Custom => "custom",
            ValidationKind::Unknown(name) => name,
        }
    }
}

impl From<String> for ValidationKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "exit_code" => ValidationKind::ExitCode,
            "stdout_contains" => ValidationKind::StdoutContains,
            "stderr_not_contains" => ValidationKind::StderrNotContains,
            "file_exists" => ValidationKind::FileExists,
            "file_not_exists" => ValidationKind::FileNotExists,
            "file_size" => ValidationKind::FileSize,
            "file_content" => ValidationKind::FileContent,
            "output_equals" => ValidationKind::OutputEquals,
            "output_contains" => ValidationKind::OutputContains,
            "output_matches" => ValidationKind::OutputMatches,
            "numeric_range" => ValidationKind::NumericRange,
            "performance" => ValidationKind::Performance,
            "custom" => ValidationKind::Custom,
            _ => ValidationKind::Unknown(name),
        }
    }
}

impl From<ValidationKind> for String {
    fn from(kind: ValidationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared expectation checked after a run
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaseValidation {
    #[serde(rename = "type")]
    pub kind: ValidationKind,
    /// Check this step's result instead of the scenario result
    #[serde(default)]
    pub step: Option<String>,
    /// File path, output name or metric depending on the kind
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Registry name of a custom validator
    #[serde(default)]
    pub custom_validator: Option<String>,
    /// Extra arguments for custom validators
    #[serde(default)]
    pub params: Mapping,
    #[serde(default)]
    pub description: Option<String>,
}

impl CaseValidation {
    pub fn new(kind: ValidationKind) -> Self {
        Self {
            kind,
            step: None,
            target: None,
            expected: None,
            pattern: None,
            tolerance: None,
            min_value: None,
            max_value: None,
            custom_validator: None,
            params: Mapping::new(),
            description: None,
        }
    }
}

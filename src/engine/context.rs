//! Run context and step results
//!
//! A [`RunContext`] belongs to exactly one scenario execution. Step results
//! are written once, after the step reaches a terminal state, and never
//! change afterwards.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::validation::ValidationResult;
use crate::common::{Error, Result};
use crate::template::{Namespace, Segment};
use crate::value::{Mapping, Value};

pub(crate) fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Lifecycle state of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    NonZeroExit { expected: i32, actual: Option<i32> },
    Timeout { after_secs: f64 },
    SpawnFailed { reason: String },
    FailurePattern { pattern: String },
    MissingSuccessPattern { pattern: String },
    Render { message: String },
    MissingParameter { param: String },
    ToolNotFound { tool: String },
    Extraction { message: String },
    ToolValidation { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::NonZeroExit {
                expected,
                actual: Some(code),
            } => write!(f, "exit code {} (expected {})", code, expected),
            FailureCause::NonZeroExit { actual: None, .. } => {
                write!(f, "terminated by signal")
            }
            FailureCause::Timeout { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureCause::SpawnFailed { reason } => write!(f, "failed to start: {}", reason),
            FailureCause::FailurePattern { pattern } => {
                write!(f, "output matched failure pattern '{}'", pattern)
            }
            FailureCause::MissingSuccessPattern { pattern } => {
                write!(f, "output did not match success pattern '{}'", pattern)
            }
            FailureCause::Render { message } => write!(f, "parameter rendering failed: {}", message),
            FailureCause::MissingParameter { param } => {
                write!(f, "missing required parameter '{}'", param)
            }
            FailureCause::ToolNotFound { tool } => write!(f, "tool '{}' not found", tool),
            FailureCause::Extraction { message } => write!(f, "{}", message),
            FailureCause::ToolValidation { message } => write!(f, "validation failed: {}", message),
        }
    }
}

/// Why a step did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    ConditionFalse,
    UpstreamFailure { step: String },
    RunAborted,
    ConfigurationError,
    /// The case ran out of time before the step's stage started
    CaseTimeout,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConditionFalse => f.write_str("condition false"),
            SkipReason::UpstreamFailure { step } => write!(f, "upstream failure ({})", step),
            SkipReason::RunAborted => f.write_str("run aborted"),
            SkipReason::ConfigurationError => f.write_str("configuration error"),
            SkipReason::CaseTimeout => f.write_str("case timed out"),
        }
    }
}

/// Terminal record of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(serialize_with = "serialize_secs")]
    pub execution_time: Duration,
    pub outputs: Mapping,
    pub attempt_count: u32,
    /// Rendered command line
    pub command: Option<String>,
    /// Rendered parameters
    pub params: Mapping,
    pub failure: Option<FailureCause>,
    pub skip_reason: Option<SkipReason>,
    pub output_errors: Vec<String>,
    pub validations: Vec<ValidationResult>,
    pub work_dir: Option<PathBuf>,
}

impl StepResult {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            execution_time: Duration::ZERO,
            outputs: Mapping::new(),
            attempt_count: 0,
            command: None,
            params: Mapping::new(),
            failure: None,
            skip_reason: None,
            output_errors: Vec::new(),
            validations: Vec::new(),
            work_dir: None,
        }
    }

    pub fn skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        let mut result = Self::new(name, StepStatus::Skipped);
        result.skip_reason = Some(reason);
        result
    }

    pub fn failed(name: impl Into<String>, cause: FailureCause) -> Self {
        let mut result = Self::new(name, StepStatus::Failed);
        result.failure = Some(cause);
        result
    }

    /// Mark a completed step as failed
    pub fn fail(&mut self, cause: FailureCause) {
        self.status = StepStatus::Failed;
        self.failure = Some(cause);
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn failed_status(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Skipped because something upstream failed
    pub fn skipped_for_failure(&self) -> bool {
        matches!(self.skip_reason, Some(SkipReason::UpstreamFailure { .. }))
    }

    /// Human readable reason for a non-success outcome
    pub fn reason(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.skip_reason.as_ref().map(ToString::to_string))
    }

    /// Template view: `outputs`, `status`, `exit_code`, `stdout`, `stderr`,
    /// `attempts`, `execution_time`, `params`
    pub fn as_value(&self) -> Value {
        let mut view = Mapping::new();
        view.insert("outputs".into(), Value::Map(self.outputs.clone()));
        view.insert("params".into(), Value::Map(self.params.clone()));
        for field in SCALAR_FIELDS {
            if let Some(value) = self.scalar(field) {
                view.insert(field.to_string(), value);
            }
        }
        Value::Map(view)
    }

    /// Resolve a path below `steps.<name>`, copying only the requested field
    pub fn lookup(&self, path: &[Segment]) -> Option<Value> {
        let Some((field, rest)) = path.split_first() else {
            return Some(self.as_value());
        };
        let map = match field.as_key()? {
            "outputs" => &self.outputs,
            "params" => &self.params,
            name if rest.is_empty() => return self.scalar(name),
            _ => return None,
        };
        if rest.is_empty() {
            Some(Value::Map(map.clone()))
        } else {
            map.resolve(rest)
        }
    }

    fn scalar(&self, field: &str) -> Option<Value> {
        let value = match field {
            "status" => Value::from(self.status.as_str()),
            "exit_code" => Value::from(self.exit_code),
            "stdout" => Value::from(self.stdout.as_str()),
            "stderr" => Value::from(self.stderr.as_str()),
            "attempts" => Value::from(i64::from(self.attempt_count)),
            "execution_time" => Value::Float(self.execution_time.as_secs_f64()),
            _ => return None,
        };
        Some(value)
    }
}

const SCALAR_FIELDS: [&str; 6] = [
    "status",
    "exit_code",
    "stdout",
    "stderr",
    "attempts",
    "execution_time",
];

/// State visible to templates during one scenario run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Scenario defaults overlaid by case parameters
    pub params: Mapping,
    steps: BTreeMap<String, StepResult>,
    pub env: BTreeMap<String, String>,
    pub case_name: Option<String>,
}

impl RunContext {
    pub fn new(params: Mapping, env: BTreeMap<String, String>) -> Self {
        Self {
            params,
            steps: BTreeMap::new(),
            env,
            case_name: None,
        }
    }

    pub fn with_case(mut self, name: impl Into<String>) -> Self {
        self.case_name = Some(name.into());
        self
    }

    /// Store a terminal step result; each step is recorded once
    pub fn record(&mut self, result: StepResult) -> Result<()> {
        if self.steps.contains_key(&result.name) {
            return Err(Error::Internal(format!(
                "step '{}' recorded twice",
                result.name
            )));
        }
        self.steps.insert(result.name.clone(), result);
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.values()
    }

    /// Take ownership of the recorded results
    pub fn into_results(self) -> BTreeMap<String, StepResult> {
        self.steps
    }
}

impl Namespace for RunContext {
    fn resolve(&self, path: &[Segment]) -> Option<Value> {
        let (root, rest) = path.split_first()?;
        match root.as_key()? {
            "steps" => {
                let (name, rest) = rest.split_first()?;
                self.steps.get(name.as_key()?)?.lookup(rest)
            }
            "env" => match rest {
                [] => Some(Value::Map(
                    self.env
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                )),
                [var] => self.env.get(var.as_key()?).map(|v| Value::from(v.as_str())),
                _ => None,
            },
            "params" if rest.is_empty() => Some(Value::Map(self.params.clone())),
            "params" => self.params.resolve(rest),
            "case" => match rest {
                [field] if field.as_key() == Some("name") => {
                    self.case_name.as_deref().map(Value::from)
                }
                _ => None,
            },
            _ => self.params.resolve(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::render;

    fn context() -> RunContext {
        let params = Mapping::from([("batch".to_string(), Value::from(4))]);
        let env = BTreeMap::from([("HOME".to_string(), "/home/test".to_string())]);
        let mut ctx = RunContext::new(params, env).with_case("smoke");
        let mut build = StepResult::new("build", StepStatus::Succeeded);
        build.exit_code = Some(0);
        build.attempt_count = 1;
        build
            .outputs
            .insert("binary".into(), Value::from("out/app"));
        ctx.record(build).unwrap();
        ctx
    }

    #[test]
    fn test_resolves_all_roots() {
        let ctx = context();
        let cases = [
            ("{{ steps.build.outputs.binary }}", Value::from("out/app")),
            ("{{ steps.build.status }}", Value::from("succeeded")),
            ("{{ steps.build.exit_code }}", Value::from(0)),
            ("{{ steps.build.attempts }}", Value::from(1)),
            ("{{ env.HOME }}", Value::from("/home/test")),
            ("{{ params.batch }}", Value::from(4)),
            ("{{ batch }}", Value::from(4)),
            ("{{ case.name }}", Value::from("smoke")),
        ];
        for (template, expected) in cases {
            assert_eq!(render(&Value::from(template), &ctx).unwrap(), expected, "{}", template);
        }
    }

    #[test]
    fn test_missing_output_is_unresolved() {
        let ctx = context();
        let err = render(&Value::from("{{ steps.build.outputs.nope }}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
        let err = render(&Value::from("{{ steps.ghost.status }}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn test_step_lookup_reads_single_fields() {
        let mut result = StepResult::new("train", StepStatus::Failed);
        result.stdout = "x".repeat(4096);
        result.exit_code = Some(2);
        result
            .outputs
            .insert("model".into(), Value::Map(Mapping::from([("path".to_string(), Value::from("m.bin"))])));
        let key = |k: &str| Segment::Key(k.to_string());

        assert_eq!(result.lookup(&[key("exit_code")]), Some(Value::from(2)));
        assert_eq!(result.lookup(&[key("status")]), Some(Value::from("failed")));
        assert_eq!(
            result.lookup(&[key("outputs"), key("model"), key("path")]),
            Some(Value::from("m.bin"))
        );
        assert!(matches!(result.lookup(&[key("outputs")]), Some(Value::Map(_))));
        assert_eq!(result.lookup(&[key("stdout")]).map(|v| v.render().len()), Some(4096));
        assert_eq!(result.lookup(&[key("status"), key("deeper")]), None);
        assert_eq!(result.lookup(&[key("unknown")]), None);
        assert_eq!(result.lookup(&[]), Some(result.as_value()));
    }

    #[test]
    fn test_results_are_write_once() {
        let mut ctx = context();
        let again = StepResult::new("build", StepStatus::Failed);
        assert!(ctx.record(again).is_err());
        assert!(ctx.step("build").unwrap().succeeded());
    }

    #[test]
    fn test_reasons() {
        let skipped = StepResult::skipped(
            "c",
            SkipReason::UpstreamFailure {
                step: "a".into(),
            },
        );
        assert!(skipped.skipped_for_failure());
        assert_eq!(skipped.reason().unwrap(), "upstream failure (a)");

        let failed = StepResult::failed(
            "a",
            FailureCause::NonZeroExit {
                expected: 0,
                actual: Some(2),
            },
        );
        assert_eq!(failed.reason().unwrap(), "exit code 2 (expected 0)");
    }
}

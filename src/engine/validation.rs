//! Validation engine
//!
//! Every check is evaluated on its own: one failing or erroring check never
//! prevents the others from running.

use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::context::StepResult;
use super::registry::FunctionRegistry;
use crate::common::Result;
use crate::model::{CaseValidation, ToolValidation, ValidationKind};
use crate::template::{values_equal, walk, Segment};
use crate::value::Value;

const PREVIEW_CHARS: usize = 200;

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub kind: String,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step the check was evaluated against, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ValidationResult {
    /// Label used in reports
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.kind)
    }
}

/// Pass/fail plus explanation, returned by checks and custom validators
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub message: String,
}

impl Verdict {
    pub fn new(passed: bool, message: impl Into<String>) -> Self {
        Self {
            passed,
            message: message.into(),
        }
    }

    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(true, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(false, message)
    }
}

/// Something checks can be evaluated against: a step or a whole scenario
pub trait ValidationSubject {
    fn exit_code(&self) -> Option<i32>;
    fn stdout(&self) -> Cow<'_, str>;
    fn stderr(&self) -> Cow<'_, str>;
    /// Named output; dotted names walk into nested values
    fn output(&self, name: &str) -> Option<Value>;
    fn work_dir(&self) -> Option<&Path>;
    fn metric(&self, name: &str) -> Option<f64>;
}

fn dotted(name: &str) -> Vec<Segment> {
    name.split('.')
        .map(|part| match part.parse::<usize>() {
            Ok(i) => Segment::Index(i),
            Err(_) => Segment::Key(part.to_string()),
        })
        .collect()
}

impl ValidationSubject for StepResult {
    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn stdout(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.stdout)
    }

    fn stderr(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.stderr)
    }

    fn output(&self, name: &str) -> Option<Value> {
        walk(&Value::Map(self.outputs.clone()), &dotted(name))
    }

    fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "execution_time" | "total_time" => Some(self.execution_time.as_secs_f64()),
            "attempts" => Some(f64::from(self.attempt_count)),
            "exit_code" => self.exit_code.map(f64::from),
            other => self.output(other).and_then(|v| v.as_number()),
        }
    }
}

/// A finished scenario seen as one unit
pub struct ScenarioSubject<'a> {
    /// Main steps in declaration order
    pub steps: &'a [StepResult],
    pub work_dir: &'a Path,
    pub duration: Duration,
}

impl ScenarioSubject<'_> {
    fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl ValidationSubject for ScenarioSubject<'_> {
    /// 0 when no step failed, otherwise the first failure's code (1 if none)
    fn exit_code(&self) -> Option<i32> {
        match self.steps.iter().find(|s| s.failed_status()) {
            None => Some(0),
            Some(failed) => Some(failed.exit_code.filter(|c| *c != 0).unwrap_or(1)),
        }
    }

    fn stdout(&self) -> Cow<'_, str> {
        Cow::Owned(self.steps.iter().map(|s| s.stdout.as_str()).collect())
    }

    fn stderr(&self) -> Cow<'_, str> {
        Cow::Owned(self.steps.iter().map(|s| s.stderr.as_str()).collect())
    }

    /// `step.output` addresses one step, a bare name the last step producing it
    fn output(&self, name: &str) -> Option<Value> {
        if let Some((step, rest)) = name.split_once('.') {
            if let Some(value) = self.step(step).and_then(|s| s.output(rest)) {
                return Some(value);
            }
        }
        self.steps.iter().rev().find_map(|s| s.output(name))
    }

    fn work_dir(&self) -> Option<&Path> {
        Some(self.work_dir)
    }

    fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "total_time" | "execution_time" => Some(self.duration.as_secs_f64()),
            "failed_steps" => Some(self.steps.iter().filter(|s| s.failed_status()).count() as f64),
            other => match other.split_once('.') {
                Some((step, metric)) => self.step(step).and_then(|s| s.metric(metric)),
                None => self.output(other).and_then(|v| v.as_number()),
            },
        }
    }
}

/// Convert tool-level rules into checks
pub fn tool_checks(rules: &ToolValidation) -> Vec<CaseValidation> {
    let mut checks = Vec::new();
    if let Some(code) = rules.exit_code {
        let mut check = CaseValidation::new(ValidationKind::ExitCode);
        check.expected = Some(Value::from(code));
        checks.push(check);
    }
    for text in &rules.stdout_contains {
        let mut check = CaseValidation::new(ValidationKind::StdoutContains);
        check.expected = Some(Value::from(text.as_str()));
        checks.push(check);
    }
    for text in &rules.stderr_not_contains {
        let mut check = CaseValidation::new(ValidationKind::StderrNotContains);
        check.expected = Some(Value::from(text.as_str()));
        checks.push(check);
    }
    for path in &rules.output_files_exist {
        let mut check = CaseValidation::new(ValidationKind::FileExists);
        check.target = Some(path.clone());
        checks.push(check);
    }
    checks
}

fn preview(text: &str) -> String {
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    if cut.len() < text.len() {
        format!("{}...", cut)
    } else {
        cut
    }
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Evaluates checks, dispatching custom ones through the registry
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    registry: Arc<FunctionRegistry>,
}

impl ValidationEngine {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    /// Evaluate every check against the subject
    pub fn validate(
        &self,
        checks: &[CaseValidation],
        subject: &dyn ValidationSubject,
    ) -> Vec<ValidationResult> {
        checks
            .iter()
            .map(|check| {
                let verdict = self.check(check, subject).unwrap_or_else(|e| {
                    Verdict::fail(format!("Validation execution failed: {}", e))
                });
                if verdict.passed {
                    tracing::debug!(kind = %check.kind, "Validation passed");
                } else {
                    tracing::info!(kind = %check.kind, "Validation failed: {}", verdict.message);
                }
                ValidationResult {
                    kind: check.kind.to_string(),
                    passed: verdict.passed,
                    message: verdict.message,
                    description: check.description.clone(),
                    step: check.step.clone(),
                }
            })
            .collect()
    }

    fn check(&self, check: &CaseValidation, subject: &dyn ValidationSubject) -> Result<Verdict> {
        Ok(match &check.kind {
            ValidationKind::ExitCode => {
                let expected = match &check.expected {
                    Some(v) => v.to_int()?,
                    None => 0,
                };
                let actual = subject.exit_code();
                Verdict::new(
                    actual.map(i64::from) == Some(expected),
                    format!(
                        "Expected exit code {}, got {}",
                        expected,
                        actual.map_or_else(|| "none".to_string(), |c| c.to_string())
                    ),
                )
            }
            ValidationKind::StdoutContains => {
                let Some(expected) = expected_text(check) else {
                    return Ok(Verdict::fail("Expected text not specified for stdout_contains"));
                };
                let stdout = subject.stdout();
                let passed = stdout.contains(&expected);
                let mut message = format!("Expected stdout to contain '{}'", expected);
                if !passed {
                    message.push_str(&format!(", but got: {}", preview(&stdout)));
                }
                Verdict::new(passed, message)
            }
            ValidationKind::StderrNotContains => {
                let Some(forbidden) = expected_text(check) else {
                    return Ok(Verdict::fail("Forbidden text not specified for stderr_not_contains"));
                };
                let stderr = subject.stderr();
                let passed = !stderr.contains(&forbidden);
                let mut message = format!("Expected stderr to not contain '{}'", forbidden);
                if !passed {
                    message.push_str(&format!(", but found it in: {}", preview(&stderr)));
                }
                Verdict::new(passed, message)
            }
            ValidationKind::FileExists => {
                let (target, path) = file_target(check, subject)?;
                let passed = exists(&path);
                let mut message = format!("Expected file '{}' to exist", target);
                if !passed {
                    if let Some(dir) = subject.work_dir() {
                        message.push_str(&format!(" in {}", dir.display()));
                    }
                }
                Verdict::new(passed, message)
            }
            ValidationKind::FileNotExists => {
                let (target, path) = file_target(check, subject)?;
                let passed = !exists(&path);
                let mut message = format!("Expected file '{}' to not exist", target);
                if !passed {
                    message.push_str(", but it exists");
                }
                Verdict::new(passed, message)
            }
            ValidationKind::FileSize => {
                let (target, path) = file_target(check, subject)?;
                let Ok(meta) = std::fs::metadata(&path) else {
                    return Ok(Verdict::fail(format!("File '{}' does not exist", target)));
                };
                let Some(expected) = &check.expected else {
                    return Ok(Verdict::fail("Expected size not specified for file_size"));
                };
                let expected = expected.to_float()?;
                let tolerance = check.tolerance.unwrap_or(0.0);
                let actual = meta.len() as f64;
                Verdict::new(
                    (actual - expected).abs() <= tolerance,
                    format!(
                        "Expected file size {} ± {}, got {}",
                        expected, tolerance, actual
                    ),
                )
            }
            ValidationKind::FileContent => {
                let (target, path) = file_target(check, subject)?;
                if !path.exists() {
                    return Ok(Verdict::fail(format!("File '{}' does not exist", target)));
                }
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        return Ok(Verdict::fail(format!(
                            "Failed to read file '{}': {}",
                            target, e
                        )))
                    }
                };
                if let Some(expected) = &check.expected {
                    let passed = content == expected.render();
                    let mut message = "Expected file content to match exactly".to_string();
                    if !passed {
                        message.push_str(&format!(
                            ", got content with length {}",
                            content.chars().count()
                        ));
                    }
                    Verdict::new(passed, message)
                } else if let Some(pattern) = &check.pattern {
                    let passed = compile(pattern)?.is_match(&content);
                    let mut message = format!("Expected file content to match pattern '{}'", pattern);
                    if !passed {
                        message.push_str(&format!(", content: {}", preview(&content)));
                    }
                    Verdict::new(passed, message)
                } else {
                    Verdict::fail("Neither expected content nor pattern specified for file_content")
                }
            }
            ValidationKind::OutputEquals => {
                let Some(target) = &check.target else {
                    return Ok(Verdict::fail("Output name not specified for output_equals"));
                };
                let actual = subject.output(target).unwrap_or_default();
                let expected = check.expected.clone().unwrap_or_default();
                Verdict::new(
                    values_equal(&actual, &expected),
                    format!(
                        "Expected output '{}' to equal '{}', got '{}'",
                        target, expected, actual
                    ),
                )
            }
            ValidationKind::OutputContains => {
                let Some(target) = &check.target else {
                    return Ok(Verdict::fail("Output name not specified for output_contains"));
                };
                let Some(expected) = expected_text(check) else {
                    return Ok(Verdict::fail("Expected text not specified for output_contains"));
                };
                let actual = subject.output(target).unwrap_or_default();
                let passed = match &actual {
                    Value::List(items) => items.iter().any(|i| i.render() == expected),
                    other => other.render().contains(&expected),
                };
                let mut message = format!("Expected output '{}' to contain '{}'", target, expected);
                if !passed {
                    message.push_str(&format!(", got '{}'", actual));
                }
                Verdict::new(passed, message)
            }
            ValidationKind::OutputMatches => {
                let Some(target) = &check.target else {
                    return Ok(Verdict::fail("Output name not specified for output_matches"));
                };
                let Some(pattern) = &check.pattern else {
                    return Ok(Verdict::fail("Pattern not specified for output_matches"));
                };
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        return Ok(Verdict::fail(format!(
                            "Invalid regex pattern '{}': {}",
                            pattern, e
                        )))
                    }
                };
                let actual = subject.output(target).unwrap_or_default().render();
                let passed = re.is_match(&actual);
                let mut message = format!(
                    "Expected output '{}' to match pattern '{}'",
                    target, pattern
                );
                if !passed {
                    message.push_str(&format!(", got '{}'", actual));
                }
                Verdict::new(passed, message)
            }
            ValidationKind::NumericRange => {
                let Some(target) = &check.target else {
                    return Ok(Verdict::fail("Output name not specified for numeric_range"));
                };
                let Some(actual) = subject.output(target) else {
                    return Ok(Verdict::fail(format!("Output variable '{}' not found", target)));
                };
                let Some(actual) = actual.as_number() else {
                    return Ok(Verdict::fail(format!(
                        "Output '{}' is not a numeric value",
                        target
                    )));
                };
                range_verdict(check, &format!("Value {}", actual), actual)
            }
            ValidationKind::Performance => {
                let Some(target) = &check.target else {
                    return Ok(Verdict::fail("Performance metric name not specified"));
                };
                let Some(actual) = subject.metric(target) else {
                    return Ok(Verdict::fail(format!(
                        "Performance metric '{}' not found",
                        target
                    )));
                };
                if let Some(expected) = &check.expected {
                    let expected = expected.to_float()?;
                    let tolerance = check.tolerance.unwrap_or(0.0);
                    Verdict::new(
                        (actual - expected).abs() <= tolerance,
                        format!(
                            "Expected {} to be {} ± {}, got {}",
                            target, expected, tolerance, actual
                        ),
                    )
                } else if check.min_value.is_some() || check.max_value.is_some() {
                    range_verdict(
                        check,
                        &format!("Performance metric {} = {}", target, actual),
                        actual,
                    )
                } else {
                    Verdict::fail(
                        "No performance criteria specified (expected, min_value, or max_value)",
                    )
                }
            }
            ValidationKind::Custom => {
                let Some(name) = &check.custom_validator else {
                    return Ok(Verdict::fail("Custom validator name not specified"));
                };
                let Some(validator) = self.registry.validator(name) else {
                    return Ok(Verdict::fail(format!(
                        "Custom validator '{}' not registered",
                        name
                    )));
                };
                match validator(check, subject) {
                    Ok(verdict) => verdict,
                    Err(e) => Verdict::fail(format!("Custom validator '{}' failed: {}", name, e)),
                }
            }
            ValidationKind::Unknown(name) => {
                Verdict::fail(format!("Unknown validation type: {}", name))
            }
        })
    }
}

fn expected_text(check: &CaseValidation) -> Option<String> {
    check
        .expected
        .as_ref()
        .filter(|v| !v.is_null())
        .map(Value::render)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        crate::common::Error::Config(format!("invalid regex pattern '{}': {}", pattern, e))
    })
}

fn file_target(check: &CaseValidation, subject: &dyn ValidationSubject) -> Result<(String, PathBuf)> {
    let target = check.target.clone().ok_or_else(|| {
        crate::common::Error::Config(format!("file path not specified for {}", check.kind))
    })?;
    let path = Path::new(&target);
    let path = match subject.work_dir() {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    };
    Ok((target, path))
}

fn exists(path: &Path) -> bool {
    let text = path.to_string_lossy();
    if !is_glob(&text) {
        return path.exists();
    }
    glob::glob(&text)
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false)
}

fn range_verdict(check: &CaseValidation, subject: &str, actual: f64) -> Verdict {
    let mut problems = Vec::new();
    if let Some(min) = check.min_value {
        if actual < min {
            problems.push(format!("below minimum {}", min));
        }
    }
    if let Some(max) = check.max_value {
        if actual > max {
            problems.push(format!("above maximum {}", max));
        }
    }
    if problems.is_empty() {
        Verdict::pass(format!("{} is within acceptable range", subject))
    } else {
        Verdict::fail(format!("{} is {}", subject, problems.join(" and ")))
    }
}

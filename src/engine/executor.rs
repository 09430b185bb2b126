//! Step executor
//!
//! Renders a tool's command from already-rendered step parameters and runs
//! it with the step's timeout and retry policy. The executor never decides
//! whether the run continues; it only reports what happened.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::context::{FailureCause, StepResult, StepStatus};
use super::process::{ProcessOutcome, ProcessRequest, ProcessRunner};
use crate::common::Error;
use crate::model::{Step, Tool};
use crate::template;
use crate::value::{Mapping, Value};

/// Engine-wide execution settings
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Used when neither step nor tool sets a timeout
    pub default_timeout: Option<Duration>,
    pub max_output_bytes: usize,
    pub write_logs: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: None,
            max_output_bytes: 1024 * 1024,
            write_logs: true,
        }
    }
}

/// Runs one step through a [`ProcessRunner`]
#[derive(Clone)]
pub struct StepExecutor {
    runner: Arc<dyn ProcessRunner>,
    settings: ExecutorSettings,
}

struct Patterns {
    success: Option<Regex>,
    failure: Option<Regex>,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: ExecutorSettings) -> Self {
        Self { runner, settings }
    }

    /// Apply tool defaults, check required parameters and coerce declared types
    pub fn prepare_params(tool: &Tool, mut params: Mapping) -> Result<Mapping, FailureCause> {
        for (name, spec) in &tool.parameters {
            let value = match params.remove(name) {
                Some(v) if !v.is_null() => v,
                _ => match &spec.default {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(FailureCause::MissingParameter {
                            param: name.clone(),
                        })
                    }
                    None => continue,
                },
            };
            let coerced = value.coerce(spec.kind).map_err(|e| FailureCause::Render {
                message: format!("parameter '{}': {}", name, e),
            })?;
            params.insert(name.clone(), coerced);
        }
        Ok(params)
    }

    /// Render the tool's command line. Parameters and `env.*` are in scope.
    pub fn render_command(
        tool: &Tool,
        params: &Mapping,
        env: &BTreeMap<String, String>,
    ) -> crate::common::Result<String> {
        let mut scope = params.clone();
        scope.insert(
            "env".into(),
            Value::Map(
                env.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect(),
            ),
        );
        let command = template::render_str(&tool.command_template, &scope)?;
        Ok(command.trim().to_string())
    }

    fn patterns(tool: &Tool) -> Result<Patterns, FailureCause> {
        let compile = |field: &str, pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| FailureCause::Render {
                    message: format!("invalid {} for tool '{}': {}", field, tool.name, e),
                })
        };
        Ok(Patterns {
            success: compile("success_pattern", &tool.success_pattern)?,
            failure: compile("failure_pattern", &tool.failure_pattern)?,
        })
    }

    /// Run the step to a terminal state.
    ///
    /// `params` are the step parameters after template rendering. `env` is the
    /// extra environment exported to the process.
    pub async fn execute(
        &self,
        step: &Step,
        tool: &Tool,
        params: Mapping,
        work_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> StepResult {
        let mut result = StepResult::new(&step.name, StepStatus::Running);
        result.work_dir = Some(work_dir.to_path_buf());

        let params = match Self::prepare_params(tool, params) {
            Ok(params) => params,
            Err(cause) => {
                result.fail(cause);
                return result;
            }
        };
        result.params = params;

        let command = match Self::render_command(tool, &result.params, env) {
            Ok(command) => command,
            Err(e) => {
                result.fail(FailureCause::Render {
                    message: e.to_string(),
                });
                return result;
            }
        };
        result.command = Some(command.clone());

        let patterns = match Self::patterns(tool) {
            Ok(p) => p,
            Err(cause) => {
                result.fail(cause);
                return result;
            }
        };

        let retries = step.retry_count.unwrap_or(tool.retry_count);
        let attempts = retries.saturating_add(1);
        let delay = step.retry_delay();
        let timeout = step
            .timeout()
            .or_else(|| tool.timeout())
            .or(self.settings.default_timeout);
        let mut request = ProcessRequest {
            command,
            work_dir: work_dir.to_path_buf(),
            env: env.clone(),
            timeout,
            max_output_bytes: self.settings.max_output_bytes,
            write_logs: self.settings.write_logs,
            attempt: 1,
        };
        let expected_exit = tool.validation.expected_exit_code();

        tracing::debug!(step = %step.name, command = %request.command, "Executing step");

        for attempt in 1..=attempts {
            result.attempt_count = attempt;
            request.attempt = attempt;
            let verdict = match self.runner.run(&request).await {
                Ok(outcome) => {
                    let verdict = judge(&outcome, expected_exit, &patterns, timeout);
                    result.exit_code = outcome.exit_code;
                    result.stdout = outcome.stdout;
                    result.stderr = outcome.stderr;
                    result.execution_time += outcome.duration;
                    verdict
                }
                Err(Error::ProcessSpawn { reason, .. }) => Err(FailureCause::SpawnFailed { reason }),
                Err(e) => Err(FailureCause::SpawnFailed {
                    reason: e.to_string(),
                }),
            };

            match verdict {
                Ok(()) => {
                    result.status = StepStatus::Succeeded;
                    result.failure = None;
                    return result;
                }
                Err(cause) if attempt < attempts => {
                    tracing::warn!(
                        step = %step.name,
                        attempt,
                        attempts,
                        "Attempt failed ({}), retrying",
                        cause
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(cause) => {
                    tracing::info!(step = %step.name, attempts, "Step failed: {}", cause);
                    result.fail(cause);
                }
            }
        }
        result
    }
}

/// Decide whether one attempt succeeded
fn judge(
    outcome: &ProcessOutcome,
    expected_exit: i32,
    patterns: &Patterns,
    timeout: Option<Duration>,
) -> Result<(), FailureCause> {
    if outcome.timed_out {
        return Err(FailureCause::Timeout {
            after_secs: timeout.unwrap_or(outcome.duration).as_secs_f64(),
        });
    }
    if outcome.exit_code != Some(expected_exit) {
        return Err(FailureCause::NonZeroExit {
            expected: expected_exit,
            actual: outcome.exit_code,
        });
    }
    let matches = |re: &Regex| re.is_match(&outcome.stdout) || re.is_match(&outcome.stderr);
    if let Some(re) = &patterns.failure {
        if matches(re) {
            return Err(FailureCause::FailurePattern {
                pattern: re.as_str().to_string(),
            });
        }
    }
    if let Some(re) = &patterns.success {
        if !matches(re) {
            return Err(FailureCause::MissingSuccessPattern {
                pattern: re.as_str().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockRunner;
    use crate::model::ToolParameter;
    use crate::value::ParamType;

    fn tool(template: &str) -> Tool {
        serde_yaml::from_str(&format!("name: t\ncommand_template: \"{}\"", template)).unwrap()
    }

    fn executor(mock: MockRunner) -> (StepExecutor, Arc<MockRunner>) {
        let mock = Arc::new(mock);
        let runner: Arc<dyn ProcessRunner> = mock.clone();
        (StepExecutor::new(runner, ExecutorSettings::default()), mock)
    }

    #[tokio::test]
    async fn test_retry_count_gives_n_plus_one_invocations() {
        let (exec, mock) = executor(MockRunner::new().respond("always-fails", ProcessOutcome::exit(1, "no")));
        let mut step = Step::new("s", "t");
        step.retry_count = Some(3);
        let dir = tempfile::tempdir().unwrap();
        let result = exec
            .execute(&step, &tool("always-fails"), Mapping::new(), dir.path(), &BTreeMap::new())
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempt_count, 4);
        assert_eq!(mock.invocations("always-fails"), 4);
        assert_eq!(
            result.failure,
            Some(FailureCause::NonZeroExit {
                expected: 0,
                actual: Some(1)
            })
        );
    }

    #[tokio::test]
    async fn test_retry_reuses_rendered_command() {
        let (exec, mock) = executor(MockRunner::new().respond_seq(
            "flaky",
            vec![ProcessOutcome::exit(2, ""), ProcessOutcome::success("ok")],
        ));
        let mut t = tool("flaky --n {{ n }}");
        t.retry_count = 1;
        let params = Mapping::from([("n".to_string(), Value::from(5))]);
        let dir = tempfile::tempdir().unwrap();
        let result = exec
            .execute(&Step::new("s", "t"), &t, params, dir.path(), &BTreeMap::new())
            .await;
        assert!(result.succeeded());
        assert_eq!(result.attempt_count, 2);
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command, "flaky --n 5");
        assert_eq!(calls[0].command, calls[1].command);
        assert_eq!((calls[0].attempt, calls[1].attempt), (1, 2));
    }

    #[tokio::test]
    async fn test_patterns_decide_success() {
        let (exec, _) = executor(
            MockRunner::new()
                .respond("noisy", ProcessOutcome::success("FATAL: disk"))
                .respond("quiet", ProcessOutcome::success("nothing")),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut noisy = tool("noisy");
        noisy.failure_pattern = Some("FATAL".into());
        let result = exec
            .execute(&Step::new("a", "t"), &noisy, Mapping::new(), dir.path(), &BTreeMap::new())
            .await;
        assert!(matches!(result.failure, Some(FailureCause::FailurePattern { .. })));

        let mut quiet = tool("quiet");
        quiet.success_pattern = Some("PASSED".into());
        let result = exec
            .execute(&Step::new("b", "t"), &quiet, Mapping::new(), dir.path(), &BTreeMap::new())
            .await;
        assert!(matches!(
            result.failure,
            Some(FailureCause::MissingSuccessPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_fails_attempt() {
        let slow = ProcessOutcome {
            duration: Duration::from_secs(30),
            ..ProcessOutcome::success("")
        };
        let (exec, _) = executor(MockRunner::new().respond("slow", slow));
        let mut step = Step::new("s", "t");
        step.timeout = Some(0.05);
        let dir = tempfile::tempdir().unwrap();
        let result = exec
            .execute(&step, &tool("slow"), Mapping::new(), dir.path(), &BTreeMap::new())
            .await;
        assert!(matches!(result.failure, Some(FailureCause::Timeout { .. })));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (exec, _) = executor(MockRunner::new().spawn_error("ghost", "No such file"));
        let dir = tempfile::tempdir().unwrap();
        let result = exec
            .execute(&Step::new("s", "t"), &tool("ghost"), Mapping::new(), dir.path(), &BTreeMap::new())
            .await;
        assert_eq!(
            result.failure,
            Some(FailureCause::SpawnFailed {
                reason: "No such file".into()
            })
        );
    }

    #[test]
    fn test_prepare_params() {
        let mut t = tool("run");
        t.parameters.insert(
            "batch".into(),
            ToolParameter {
                kind: ParamType::Int,
                default: Some(Value::from("8")),
                ..Default::default()
            },
        );
        t.parameters.insert(
            "model".into(),
            ToolParameter {
                kind: ParamType::Path,
                required: true,
                ..Default::default()
            },
        );

        let missing = StepExecutor::prepare_params(&t, Mapping::new()).unwrap_err();
        assert_eq!(
            missing,
            FailureCause::MissingParameter {
                param: "model".into()
            }
        );

        let params = Mapping::from([
            ("model".to_string(), Value::from("m.onnx")),
            ("extra".to_string(), Value::from(true)),
        ]);
        let prepared = StepExecutor::prepare_params(&t, params).unwrap();
        assert_eq!(prepared["batch"], Value::Int(8));
        assert_eq!(prepared["model"], Value::from("m.onnx"));
        assert_eq!(prepared["extra"], Value::Bool(true));
    }

    #[test]
    fn test_render_command_sees_env() {
        let t = tool("run --home {{ env.HOME }} --b {{ b }}");
        let params = Mapping::from([("b".to_string(), Value::from(2))]);
        let env = BTreeMap::from([("HOME".to_string(), "/root".to_string())]);
        assert_eq!(
            StepExecutor::render_command(&t, &params, &env).unwrap(),
            "run --home /root --b 2"
        );
    }
}

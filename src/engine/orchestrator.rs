//! Scenario orchestrator
//!
//! Drives one scenario through
//! `Initialized -> Resolving -> Executing -> Validating -> Completed`.
//! Stages run strictly in order; the steps of a stage run concurrently,
//! bounded by a semaphore shared by every run of this orchestrator.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::context::{serialize_secs, FailureCause, RunContext, SkipReason, StepResult};
use super::executor::{ExecutorSettings, StepExecutor};
use super::extractor::OutputExtractor;
use super::process::{ProcessRunner, ShellRunner};
use super::registry::FunctionRegistry;
use super::resolver::{self, ExecutionPlan};
use super::validation::{tool_checks, ScenarioSubject, ValidationEngine, ValidationResult};
use crate::common::config::EngineConfig;
use crate::common::{Error, Result};
use crate::model::{CaseValidation, Scenario, Step, Tool};
use crate::template::{self, Scope};
use crate::value::Mapping;

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initialized,
    Resolving,
    Executing,
    Validating,
    Completed,
}

/// Overall verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Inputs for one scenario run besides the scenario itself
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Root directory; each step gets `<work_dir>/<step name>`
    pub work_dir: PathBuf,
    /// Overrides for scenario default params
    pub params: Mapping,
    /// Per-step parameter overrides, highest precedence
    pub step_overrides: BTreeMap<String, Mapping>,
    /// Checks evaluated after the main steps
    pub validations: Vec<CaseValidation>,
    pub case_name: Option<String>,
    /// Run every step directly in `work_dir` (single-tool cases)
    pub single_dir: bool,
    /// Limit for the main steps; validation and cleanup still run once it passes
    pub timeout: Option<Duration>,
}

/// Everything that happened during one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub outcome: Outcome,
    /// Phases visited, in order
    pub phases: Vec<Phase>,
    pub stages: Vec<Vec<String>>,
    /// Main steps in declaration order
    pub steps: Vec<StepResult>,
    pub cleanup: Vec<StepResult>,
    pub validations: Vec<ValidationResult>,
    /// Configuration error that prevented execution, or the run timing out
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Initialized)
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    tools: BTreeMap<String, Tool>,
    runner: Option<Arc<dyn ProcessRunner>>,
    registry: Option<Arc<FunctionRegistry>>,
    settings: ExecutorSettings,
    max_parallel: usize,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            tools: BTreeMap::new(),
            runner: None,
            registry: None,
            settings: ExecutorSettings::default(),
            max_parallel: 4,
        }
    }
}

impl OrchestratorBuilder {
    /// Apply the `[engine]` configuration section
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.max_parallel = config.max_parallel_steps;
        self.settings.default_timeout = config.default_timeout();
        self.settings.max_output_bytes = config.max_output_bytes;
        if self.runner.is_none() {
            self.runner = Some(Arc::new(ShellRunner::new(config.kill_grace())));
        }
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools
            .extend(tools.into_iter().map(|t| (t.name.clone(), t)));
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    pub fn build(self) -> Orchestrator {
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ShellRunner::default()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(FunctionRegistry::with_builtins()));
        Orchestrator {
            tools: self.tools,
            executor: StepExecutor::new(runner, self.settings),
            extractor: OutputExtractor::new(Arc::clone(&registry)),
            validator: ValidationEngine::new(registry),
            pool: Arc::new(Semaphore::new(self.max_parallel.max(1))),
        }
    }
}

/// Runs scenarios against a tool catalog
pub struct Orchestrator {
    tools: BTreeMap<String, Tool>,
    executor: StepExecutor,
    extractor: OutputExtractor,
    validator: ValidationEngine,
    pool: Arc<Semaphore>,
}

/// A step whose parameters rendered and is ready to spawn
struct Prepared {
    step: Step,
    tool: Tool,
    params: Mapping,
    work_dir: PathBuf,
}

enum Decision {
    Run(Box<Prepared>),
    Done(StepResult),
}

#[derive(Default)]
struct StageRun {
    failed: bool,
    /// The run timeout passed before every stage finished
    expired: bool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn validator(&self) -> &ValidationEngine {
        &self.validator
    }

    /// Resolve a scenario and check every step's tool exists
    pub fn plan(&self, scenario: &Scenario) -> Result<ExecutionPlan> {
        let plan = resolver::resolve(&scenario.steps)?;
        for step in scenario.steps.iter().chain(&scenario.cleanup_steps) {
            if !self.tools.contains_key(&step.tool) {
                return Err(Error::ToolNotFound {
                    step: step.name.clone(),
                    tool: step.tool.clone(),
                });
            }
        }
        Ok(plan)
    }

    /// Run a scenario to completion
    pub async fn run_scenario(&self, scenario: &Scenario, request: RunRequest) -> ScenarioResult {
        let started = Instant::now();
        let deadline = request.timeout.map(|limit| tokio::time::Instant::now() + limit);
        let mut phases = vec![Phase::Initialized, Phase::Resolving];
        tracing::info!(scenario = %scenario.name, "Resolving scenario");

        let plan = match self.plan(scenario) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(scenario = %scenario.name, "Configuration error: {}", e);
                phases.push(Phase::Completed);
                return ScenarioResult {
                    scenario: scenario.name.clone(),
                    outcome: Outcome::Failure,
                    phases,
                    stages: Vec::new(),
                    steps: scenario
                        .steps
                        .iter()
                        .map(|s| StepResult::skipped(&s.name, SkipReason::ConfigurationError))
                        .collect(),
                    cleanup: Vec::new(),
                    validations: Vec::new(),
                    error: Some(e.to_string()),
                    duration: started.elapsed(),
                };
            }
        };

        let mut params = scenario.default_params.clone();
        params.extend(request.params.clone());
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(scenario.environment.clone());
        let mut ctx = RunContext::new(params, env);
        if let Some(case) = &request.case_name {
            ctx = ctx.with_case(case);
        }

        phases.push(Phase::Executing);
        let run = self
            .execute_stages(scenario, &plan, &request, &mut ctx, deadline)
            .await;
        let mut failed = run.failed;
        let error = match (run.expired, request.timeout) {
            (true, Some(limit)) => {
                tracing::warn!(scenario = %scenario.name, "Run timed out after {:?}", limit);
                failed = true;
                Some(format!("Case timed out after {}s", limit.as_secs_f64()))
            }
            _ => None,
        };

        phases.push(Phase::Validating);
        let mut results = ctx.clone().into_results();
        let steps: Vec<StepResult> = scenario
            .steps
            .iter()
            .filter_map(|s| results.remove(&s.name))
            .collect();
        let subject = ScenarioSubject {
            steps: &steps,
            work_dir: &request.work_dir,
            duration: started.elapsed(),
        };
        let validations = self.validate(&request.validations, &subject);
        if validations.iter().any(|v| !v.passed) {
            failed = true;
        }

        let cleanup = self.run_cleanup(scenario, &request, &ctx).await;

        phases.push(Phase::Completed);
        let outcome = if failed {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        tracing::info!(scenario = %scenario.name, outcome = ?outcome, "Scenario finished");
        ScenarioResult {
            scenario: scenario.name.clone(),
            outcome,
            phases,
            stages: plan.stages,
            steps,
            cleanup,
            validations,
            error,
            duration: started.elapsed(),
        }
    }

    /// Walk the stages until done, aborted or past the deadline
    async fn execute_stages(
        &self,
        scenario: &Scenario,
        plan: &ExecutionPlan,
        request: &RunRequest,
        ctx: &mut RunContext,
        deadline: Option<tokio::time::Instant>,
    ) -> StageRun {
        let mut run = StageRun::default();
        let mut aborted = false;
        let mut failed_steps = BTreeSet::new();

        for (index, stage) in plan.stages.iter().enumerate() {
            if !run.expired && deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                run.expired = true;
            }
            if run.expired || aborted {
                for name in stage {
                    let reason = if run.expired {
                        SkipReason::CaseTimeout
                    } else {
                        match plan.failed_ancestor(name, &failed_steps) {
                            Some(step) => SkipReason::UpstreamFailure { step },
                            None => SkipReason::RunAborted,
                        }
                    };
                    tracing::info!(step = %name, "Skipping step: {}", reason);
                    self.record(ctx, StepResult::skipped(name, reason));
                }
                continue;
            }

            tracing::info!(
                "Stage {}/{}: {}",
                index + 1,
                plan.stages.len(),
                stage.join(", ")
            );

            let mut in_flight = FuturesUnordered::new();
            let mut started = Vec::new();
            for name in stage {
                let Some(step) = scenario.step(name) else {
                    continue;
                };
                match self.prepare(scenario, step, plan, request, ctx) {
                    Decision::Done(result) => {
                        if result.failed_status() {
                            tracing::info!(step = %name, "Step failed: {}", result.reason().unwrap_or_default());
                        } else {
                            tracing::info!(step = %name, "Skipping step: {}", result.reason().unwrap_or_default());
                        }
                        self.record(ctx, result);
                    }
                    Decision::Run(prepared) => {
                        started.push((name.clone(), prepared.work_dir.clone()));
                        let pool = Arc::clone(&self.pool);
                        let env = ctx.env.clone();
                        in_flight.push(async move {
                            let result = match pool.acquire_owned().await {
                                Ok(_permit) => {
                                    tracing::info!(step = %prepared.step.name, tool = %prepared.tool.name, "Running step");
                                    self.executor
                                        .execute(
                                            &prepared.step,
                                            &prepared.tool,
                                            prepared.params.clone(),
                                            &prepared.work_dir,
                                            &env,
                                        )
                                        .await
                                }
                                Err(e) => StepResult::failed(
                                    &prepared.step.name,
                                    FailureCause::SpawnFailed {
                                        reason: e.to_string(),
                                    },
                                ),
                            };
                            (prepared, result)
                        });
                    }
                }
            }

            loop {
                let next = match deadline {
                    Some(at) => match tokio::time::timeout_at(at, in_flight.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            run.expired = true;
                            break;
                        }
                    },
                    None => in_flight.next().await,
                };
                let Some((prepared, result)) = next else {
                    break;
                };
                let result = self.finish(&prepared, result, ctx);
                self.record(ctx, result);
            }

            if run.expired {
                // dropping the futures kills their process groups
                drop(in_flight);
                let after_secs = request.timeout.unwrap_or_default().as_secs_f64();
                for (name, work_dir) in started {
                    if ctx.step(&name).is_some() {
                        continue;
                    }
                    tracing::warn!(step = %name, "Step cut off by run timeout");
                    let mut result = StepResult::failed(&name, FailureCause::Timeout { after_secs });
                    result.work_dir = Some(work_dir);
                    self.record(ctx, result);
                }
            }

            for name in stage {
                let Some(result) = ctx.step(name) else {
                    continue;
                };
                if !result.failed_status() {
                    continue;
                }
                run.failed = true;
                let optional = scenario
                    .step(name)
                    .map(|s| s.continue_on_failure)
                    .unwrap_or(false);
                if !optional {
                    failed_steps.insert(name.clone());
                    aborted = true;
                }
            }
            if aborted && !run.expired {
                tracing::warn!("Step failure in stage {}, skipping remaining stages", index + 1);
            }
        }
        run
    }

    fn record(&self, ctx: &mut RunContext, result: StepResult) {
        if let Err(e) = ctx.record(result) {
            tracing::error!("{}", e);
        }
    }

    /// Decide whether a step runs and render its parameters
    fn prepare(
        &self,
        scenario: &Scenario,
        step: &Step,
        plan: &ExecutionPlan,
        request: &RunRequest,
        ctx: &RunContext,
    ) -> Decision {
        for dep in plan.dependencies_of(&step.name) {
            let Some(result) = ctx.step(dep) else {
                continue;
            };
            let dep_optional = scenario
                .step(dep)
                .map(|s| s.continue_on_failure)
                .unwrap_or(false);
            if result.failed_status() && !dep_optional {
                return Decision::Done(StepResult::skipped(
                    &step.name,
                    SkipReason::UpstreamFailure { step: dep.clone() },
                ));
            }
            if let Some(SkipReason::UpstreamFailure { step: root }) = &result.skip_reason {
                return Decision::Done(StepResult::skipped(
                    &step.name,
                    SkipReason::UpstreamFailure { step: root.clone() },
                ));
            }
        }
        self.prepare_step(step, request, ctx)
    }

    /// Condition check plus parameter rendering, shared with cleanup steps
    fn prepare_step(&self, step: &Step, request: &RunRequest, ctx: &RunContext) -> Decision {
        if let Some(condition) = &step.condition {
            match template::evaluate_condition(condition, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return Decision::Done(StepResult::skipped(
                        &step.name,
                        SkipReason::ConditionFalse,
                    ))
                }
                Err(e) => {
                    return Decision::Done(StepResult::failed(
                        &step.name,
                        FailureCause::Render {
                            message: format!("condition: {}", e),
                        },
                    ))
                }
            }
        }

        let Some(tool) = self.tools.get(&step.tool) else {
            return Decision::Done(StepResult::failed(
                &step.name,
                FailureCause::ToolNotFound {
                    tool: step.tool.clone(),
                },
            ));
        };

        let mut raw = ctx.params.clone();
        raw.extend(step.params.clone());
        if let Some(overrides) = request.step_overrides.get(&step.name) {
            raw.extend(overrides.clone());
        }

        match template::render_mapping(&raw, ctx) {
            Ok(params) => Decision::Run(Box::new(Prepared {
                step: step.clone(),
                tool: tool.clone(),
                params,
                work_dir: if request.single_dir {
                    request.work_dir.clone()
                } else {
                    request.work_dir.join(&step.name)
                },
            })),
            Err(e) => Decision::Done(StepResult::failed(
                &step.name,
                FailureCause::Render {
                    message: e.to_string(),
                },
            )),
        }
    }

    /// Extract outputs and apply tool validation to a finished step
    fn finish(&self, prepared: &Prepared, mut result: StepResult, ctx: &RunContext) -> StepResult {
        let executed = result.attempt_count > 0 && result.failure.as_ref().map_or(true, |f| {
            !matches!(f, FailureCause::SpawnFailed { .. })
        });

        if result.succeeded() && !prepared.tool.post_exec.outputs.is_empty() {
            let extraction = self.extractor.extract(
                &prepared.tool.post_exec.outputs,
                &result,
                &prepared.work_dir,
                ctx,
            );
            result.outputs = extraction.outputs;
            result.output_errors = extraction.errors.iter().map(ToString::to_string).collect();
            if !result.output_errors.is_empty() && !prepared.step.continue_on_failure {
                let message = result.output_errors.join("; ");
                result.fail(FailureCause::Extraction { message });
            }
        }

        if executed && !prepared.tool.validation.is_empty() {
            let scope = Scope::with_locals(ctx, &result.params);
            let mut checks = tool_checks(&prepared.tool.validation);
            for check in &mut checks {
                if let Some(target) = &check.target {
                    match template::render_str(target, &scope) {
                        Ok(rendered) => check.target = Some(rendered),
                        Err(e) => tracing::warn!("Cannot render validation target '{}': {}", target, e),
                    }
                }
            }
            result.validations = self.validator.validate(&checks, &result);
            let failures: Vec<&str> = result
                .validations
                .iter()
                .filter(|v| !v.passed)
                .map(|v| v.message.as_str())
                .collect();
            if !failures.is_empty() && result.succeeded() {
                let message = failures.join("; ");
                result.fail(FailureCause::ToolValidation { message });
            }
        }

        match &result.failure {
            None => tracing::info!(
                step = %result.name,
                elapsed = ?result.execution_time,
                "Step succeeded"
            ),
            Some(cause) => tracing::info!(step = %result.name, "Step failed: {}", cause),
        }
        result
    }

    /// Evaluate case checks; `step` checks see that step's result
    pub fn validate(
        &self,
        checks: &[CaseValidation],
        scenario: &ScenarioSubject<'_>,
    ) -> Vec<ValidationResult> {
        checks
            .iter()
            .flat_map(|check| match &check.step {
                None => self.validator.validate(std::slice::from_ref(check), scenario),
                Some(name) => match scenario.steps.iter().find(|s| &s.name == name) {
                    Some(step) => self.validator.validate(std::slice::from_ref(check), step),
                    None => vec![ValidationResult {
                        kind: check.kind.to_string(),
                        passed: false,
                        message: format!("Step '{}' not found", name),
                        description: check.description.clone(),
                        step: Some(name.clone()),
                    }],
                },
            })
            .collect()
    }

    /// Cleanup steps run one by one and never change the verdict
    async fn run_cleanup(
        &self,
        scenario: &Scenario,
        request: &RunRequest,
        ctx: &RunContext,
    ) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(scenario.cleanup_steps.len());
        for step in &scenario.cleanup_steps {
            tracing::info!(step = %step.name, "Running cleanup step");
            let result = match self.prepare_step(step, request, ctx) {
                Decision::Done(result) => result,
                Decision::Run(prepared) => {
                    let result = match Arc::clone(&self.pool).acquire_owned().await {
                        Ok(_permit) => {
                            self.executor
                                .execute(
                                    &prepared.step,
                                    &prepared.tool,
                                    prepared.params.clone(),
                                    &prepared.work_dir,
                                    &ctx.env,
                                )
                                .await
                        }
                        Err(e) => StepResult::failed(
                            &step.name,
                            FailureCause::SpawnFailed {
                                reason: e.to_string(),
                            },
                        ),
                    };
                    self.finish(&prepared, result, ctx)
                }
            };
            if let Some(reason) = result.reason() {
                tracing::warn!(step = %step.name, "Cleanup step did not succeed: {}", reason);
            }
            results.push(result);
        }
        results
    }
}

//! Test case execution
//!
//! A case runs either a named scenario or a single tool. Its parameters are
//! merged over the case file's `common_params`; entries keyed by a step name
//! whose value is a map become per-step overrides.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::context::serialize_secs;
use super::orchestrator::{Orchestrator, Outcome, Phase, RunRequest, ScenarioResult};
use crate::common::{Error, Result};
use crate::model::{Case, Scenario, Step};
use crate::value::{Mapping, Value};

/// Where case work directories go
#[derive(Debug, Clone)]
pub struct CaseOptions {
    pub output_dir: PathBuf,
    /// Remove a case's work directory before running it
    pub clean: bool,
}

/// Outcome of one case
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub work_dir: PathBuf,
    /// Absent when the case never reached the orchestrator
    pub scenario: Option<ScenarioResult>,
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl CaseResult {
    /// A case that could not be built, reported as failed without running
    pub fn not_run(case: &Case, options: &CaseOptions, error: impl ToString) -> Self {
        Self::errored(case, options.output_dir.join(&case.name), error, Instant::now())
    }

    fn errored(case: &Case, work_dir: PathBuf, error: impl ToString, started: Instant) -> Self {
        Self {
            name: case.name.clone(),
            passed: false,
            work_dir,
            scenario: None,
            error: Some(error.to_string()),
            duration: started.elapsed(),
        }
    }
}

/// Build the scenario a case runs
pub fn case_scenario(case: &Case, scenarios: &BTreeMap<String, Scenario>) -> Result<Scenario> {
    match (&case.scenario, &case.tool) {
        (Some(name), _) => scenarios
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ScenarioNotFound(name.clone())),
        (None, Some(tool)) => {
            let mut step = Step::new(tool.as_str(), tool.as_str());
            step.retry_count = case.retry_count;
            Ok(Scenario {
                name: format!("{}-single", tool),
                description: case.description.clone(),
                version: "1.0".into(),
                default_params: Mapping::new(),
                environment: BTreeMap::new(),
                steps: vec![step],
                cleanup_steps: Vec::new(),
            })
        }
        (None, None) => Err(Error::Config(format!(
            "case '{}' names neither a scenario nor a tool",
            case.name
        ))),
    }
}

/// Split merged case params into run params and per-step overrides
pub fn split_params(
    scenario: &Scenario,
    common: &Mapping,
    case: &Case,
) -> (Mapping, BTreeMap<String, Mapping>) {
    let mut params = common.clone();
    params.extend(case.params.clone());
    let mut overrides = BTreeMap::new();
    for step in &scenario.steps {
        if let Some(Value::Map(map)) = params.get(&step.name) {
            overrides.insert(step.name.clone(), map.clone());
            params.remove(&step.name);
        }
    }
    (params, overrides)
}

/// Run one case under `options.output_dir/<case name>`
pub async fn run_case(
    orchestrator: &Orchestrator,
    scenarios: &BTreeMap<String, Scenario>,
    case: &Case,
    common_params: &Mapping,
    options: &CaseOptions,
) -> CaseResult {
    let started = Instant::now();
    let work_dir = options.output_dir.join(&case.name);
    tracing::info!(case = %case.name, "Running case");

    let scenario = match case_scenario(case, scenarios) {
        Ok(scenario) => scenario,
        Err(e) => return CaseResult::errored(case, work_dir, e, started),
    };
    if let Err(e) = prepare_work_dir(&work_dir, options.clean) {
        return CaseResult::errored(case, work_dir, e, started);
    }

    let (params, step_overrides) = split_params(&scenario, common_params, case);
    let request = RunRequest {
        work_dir: work_dir.clone(),
        params,
        step_overrides,
        validations: case.validation.clone(),
        case_name: Some(case.name.clone()),
        // a tool case writes where its case-level checks look
        single_dir: case.scenario.is_none(),
        timeout: case.timeout(),
    };

    let result = orchestrator.run_scenario(&scenario, request).await;

    debug_assert_eq!(result.phase(), Phase::Completed);
    CaseResult {
        name: case.name.clone(),
        passed: result.outcome == Outcome::Success,
        work_dir,
        error: result.error.clone(),
        scenario: Some(result),
        duration: started.elapsed(),
    }
}

fn prepare_work_dir(dir: &Path, clean: bool) -> Result<()> {
    if clean && dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| Error::FileRead {
            path: dir.display().to_string(),
            error: e.to_string(),
        })?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

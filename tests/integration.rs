//! End-to-end tests running real `sh` commands
//!
//! Each test lays out a small project (tools, scenarios, case file) in a
//! temporary directory, loads it like the CLI does, and runs the cases.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dact::common::config::Config;
use dact::engine::{run_case, CaseOptions, CaseResult, FailureCause, SkipReason, StepStatus};
use dact::loader::{self, Catalog, PlannedCase};
use dact::Orchestrator;

/// A project laid out in a temporary directory
struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, content: &str) -> &Self {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        self
    }

    fn output(&self) -> PathBuf {
        self.root().join("output")
    }

    /// Run every case of `cases/<file>`
    async fn run(&self, file: &str) -> BTreeMap<String, CaseResult> {
        let catalog = Catalog::load(self.root()).expect("catalog loads");
        let config = Config::default();
        let orchestrator = Orchestrator::builder()
            .config(&config.engine)
            .tools(catalog.tools.values().cloned())
            .build();
        let options = CaseOptions {
            output_dir: self.output(),
            clean: true,
        };
        let path = self.root().join("cases").join(file);
        let parsed = loader::load_case_file(&path).unwrap();
        let mut results = BTreeMap::new();
        for planned in loader::expand_cases(&parsed, path.parent().unwrap()) {
            let result = match &planned {
                PlannedCase::Ready(case) => {
                    run_case(
                        &orchestrator,
                        &catalog.scenarios,
                        case,
                        &parsed.common_params,
                        &options,
                    )
                    .await
                }
                PlannedCase::Broken { case, error } => CaseResult::not_run(case, &options, error),
            };
            results.insert(planned.case().name.clone(), result);
        }
        results
    }
}

fn step<'a>(result: &'a CaseResult, name: &str) -> &'a dact::engine::StepResult {
    result
        .scenario
        .as_ref()
        .and_then(|s| s.step(name))
        .unwrap_or_else(|| panic!("step '{}' missing", name))
}

#[tokio::test]
async fn test_failing_step_runs_retry_count_plus_one_times() {
    let project = Project::new();
    project
        .write(
            "tools/flaky.tool.yml",
            "name: flaky\ncommand_template: \"echo attempt >> attempts.txt; exit 3\"\n",
        )
        .write(
            "scenarios/retry.scenario.yml",
            "name: retry\nsteps:\n  - name: flaky\n    tool: flaky\n    retry_count: 2\n    retry_delay: 0.01\n",
        )
        .write("cases/retry.case.yml", "cases:\n  - name: retry\n    scenario: retry\n");

    let results = project.run("retry.case.yml").await;
    let result = &results["retry"];
    assert!(!result.passed);

    let flaky = step(result, "flaky");
    assert_eq!(flaky.attempt_count, 3);
    assert_eq!(flaky.exit_code, Some(3));
    assert!(matches!(
        flaky.failure,
        Some(FailureCause::NonZeroExit { expected: 0, actual: Some(3) })
    ));
    let attempts = fs::read_to_string(project.output().join("retry/flaky/attempts.txt")).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[tokio::test]
async fn test_false_condition_never_spawns_the_process() {
    let project = Project::new();
    project
        .write(
            "tools/touch.tool.yml",
            "name: touch\ncommand_template: \"touch {{ marker }}\"\n",
        )
        .write(
            "scenarios/gated.scenario.yml",
            r#"name: gated
default_params:
  enabled: false
steps:
  - name: gated
    tool: touch
    condition: "{{ enabled }}"
    params:
      marker: ran.txt
  - name: always
    tool: touch
    params:
      marker: always.txt
"#,
        )
        .write("cases/gated.case.yml", "cases:\n  - name: gated\n    scenario: gated\n");

    let results = project.run("gated.case.yml").await;
    let result = &results["gated"];
    assert!(result.passed);

    let gated = step(result, "gated");
    assert_eq!(gated.status, StepStatus::Skipped);
    assert_eq!(gated.skip_reason, Some(SkipReason::ConditionFalse));
    assert_eq!(gated.attempt_count, 0);
    assert!(!project.output().join("gated/gated/ran.txt").exists());
    assert!(project.output().join("gated/always/always.txt").exists());
}

#[tokio::test]
async fn test_output_reference_orders_reversed_declaration() {
    let project = Project::new();
    project
        .write(
            "tools/produce.tool.yml",
            r#"name: produce
command_template: "echo value=42"
post_exec:
  outputs:
    value: "regex_extract(pattern='value=(\\d+)')"
"#,
        )
        .write(
            "tools/consume.tool.yml",
            r#"name: consume
command_template: "echo got={{ input }}"
parameters:
  input:
    type: int
    required: true
"#,
        )
        .write(
            "scenarios/flow.scenario.yml",
            r#"name: flow
steps:
  - name: b
    tool: consume
    params:
      input: "{{ steps.a.outputs.value }}"
  - name: a
    tool: produce
"#,
        )
        .write("cases/flow.case.yml", "cases:\n  - name: flow\n    scenario: flow\n");

    let results = project.run("flow.case.yml").await;
    let result = &results["flow"];
    assert!(result.passed, "{:?}", result.error);

    let scenario = result.scenario.as_ref().unwrap();
    assert_eq!(scenario.stages, vec![vec!["a"], vec!["b"]]);
    let b = step(result, "b");
    assert_eq!(b.params["input"], dact::Value::Int(42));
    assert_eq!(b.stdout.trim(), "got=42");
    // logs land in the step work directory
    let log = fs::read_to_string(project.output().join("flow/b/stdout.log")).unwrap();
    assert_eq!(log.trim(), "got=42");
}

#[tokio::test]
async fn test_upstream_failure_skips_descendants_and_cleanup_still_runs() {
    let project = Project::new();
    project
        .write(
            "tools/sh.tool.yml",
            "name: sh\ncommand_template: \"{{ script }}\"\n",
        )
        .write(
            "scenarios/chain.scenario.yml",
            r#"name: chain
steps:
  - name: a
    tool: sh
    params: {script: "exit 1"}
  - name: b
    tool: sh
    depends_on: [a]
    params: {script: "touch b.txt"}
  - name: c
    tool: sh
    depends_on: [b]
    params: {script: "touch c.txt"}
cleanup_steps:
  - name: wipe
    tool: sh
    params: {script: "touch cleaned.txt"}
"#,
        )
        .write("cases/chain.case.yml", "cases:\n  - name: chain\n    scenario: chain\n");

    let results = project.run("chain.case.yml").await;
    let result = &results["chain"];
    assert!(!result.passed);

    assert_eq!(step(result, "a").status, StepStatus::Failed);
    for name in ["b", "c"] {
        let s = step(result, name);
        assert_eq!(s.status, StepStatus::Skipped);
        assert_eq!(s.skip_reason, Some(SkipReason::UpstreamFailure { step: "a".into() }));
    }
    assert!(!project.output().join("chain/b/b.txt").exists());

    let cleanup = &result.scenario.as_ref().unwrap().cleanup;
    assert_eq!(cleanup.len(), 1);
    assert!(cleanup[0].succeeded());
    assert!(project.output().join("chain/wipe/cleaned.txt").exists());
}

#[tokio::test]
async fn test_case_validations_report_each_check() {
    let project = Project::new();
    project
        .write(
            "tools/make.tool.yml",
            r#"name: make
command_template: "printf '%s' '{{ content }}' > {{ file }} && echo built {{ file }}"
parameters:
  file: {type: str, default: result.txt}
validation:
  output_files_exist: ["{{ file }}"]
"#,
        )
        .write(
            "cases/make.case.yml",
            r#"common_params:
  content: hello
cases:
  - name: make
    tool: make
    validation:
      - type: file_exists
        target: result.txt
      - type: file_size
        target: result.txt
        expected: 5
      - type: stdout_contains
        expected: "not in the output"
"#,
        );

    let results = project.run("make.case.yml").await;
    let result = &results["make"];
    let make = step(result, "make");
    assert!(make.succeeded(), "{:?}", make.reason());
    assert_eq!(make.validations.len(), 1);
    assert!(make.validations[0].passed);

    let validations = &result.scenario.as_ref().unwrap().validations;
    assert_eq!(validations.len(), 3);
    assert!(validations[0].passed, "{}", validations[0].message);
    assert!(validations[1].passed, "{}", validations[1].message);
    assert!(!validations[2].passed);
    assert!(!result.passed);
}

#[tokio::test]
async fn test_timeout_kills_the_process_group() {
    let project = Project::new();
    project
        .write(
            "tools/sleepy.tool.yml",
            "name: sleepy\ncommand_template: \"sleep 30 & sleep 30\"\ntimeout: 0.3\n",
        )
        .write("cases/sleepy.case.yml", "cases:\n  - name: sleepy\n    tool: sleepy\n");

    let started = Instant::now();
    let results = project.run("sleepy.case.yml").await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let sleepy = step(&results["sleepy"], "sleepy");
    assert!(matches!(sleepy.failure, Some(FailureCause::Timeout { .. })));
    assert_eq!(sleepy.exit_code, None);
}

#[tokio::test]
async fn test_environment_reaches_commands() {
    let project = Project::new();
    project
        .write(
            "tools/env.tool.yml",
            "name: env\ncommand_template: \"echo $GREETING {{ env.GREETING }}\"\n",
        )
        .write(
            "scenarios/env.scenario.yml",
            "name: env\nenvironment:\n  GREETING: hi\nsteps:\n  - name: env\n    tool: env\n",
        )
        .write("cases/env.case.yml", "cases:\n  - name: env\n    scenario: env\n");

    let results = project.run("env.case.yml").await;
    assert_eq!(step(&results["env"], "env").stdout.trim(), "hi hi");
}

#[tokio::test]
async fn test_tool_case_writes_where_case_checks_look() {
    let project = Project::new();
    project
        .write(
            "tools/mk.tool.yml",
            "name: mk\ncommand_template: \"mkdir -p reports && touch out.txt reports/summary.json\"\n",
        )
        .write(
            "cases/mk.case.yml",
            r#"cases:
  - name: c
    tool: mk
    validation:
      - type: file_exists
        target: out.txt
      - type: file_exists
        target: reports/summary.json
      - type: file_not_exists
        target: mk/out.txt
"#,
        );

    let results = project.run("mk.case.yml").await;
    let result = &results["c"];
    let validations = &result.scenario.as_ref().unwrap().validations;
    for v in validations {
        assert!(v.passed, "{}", v.message);
    }
    assert!(result.passed);
    assert!(project.output().join("c/out.txt").is_file());
    assert!(project.output().join("c/stdout.log").is_file());
    assert_eq!(step(result, "mk").work_dir.as_deref(), Some(project.output().join("c").as_path()));
}

#[tokio::test]
async fn test_case_timeout_still_reports_steps_and_cleans_up() {
    let project = Project::new();
    project
        .write(
            "tools/sh.tool.yml",
            "name: sh\ncommand_template: \"{{ script }}\"\n",
        )
        .write(
            "scenarios/hang.scenario.yml",
            r#"name: hang
steps:
  - name: prepare
    tool: sh
    params: {script: "echo ready > ready.txt"}
  - name: hang
    tool: sh
    depends_on: [prepare]
    params: {script: "(sleep 2; touch leaked.txt) & sleep 30"}
  - name: report
    tool: sh
    depends_on: [hang]
    params: {script: "touch report.txt"}
cleanup_steps:
  - name: cleanup
    tool: sh
    params: {script: "touch cleaned.txt"}
"#,
        )
        .write(
            "cases/hang.case.yml",
            "cases:\n  - name: hang\n    scenario: hang\n    timeout: 0.5\n",
        );

    let started = Instant::now();
    let results = project.run("hang.case.yml").await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let result = &results["hang"];
    assert!(!result.passed);
    assert!(result.error.as_deref().unwrap().contains("Case timed out after 0.5s"));
    assert!(step(result, "prepare").succeeded());
    assert!(matches!(
        step(result, "hang").failure,
        Some(FailureCause::Timeout { .. })
    ));
    assert_eq!(step(result, "report").skip_reason, Some(SkipReason::CaseTimeout));

    let scenario = result.scenario.as_ref().unwrap();
    assert_eq!(scenario.cleanup.len(), 1);
    assert!(scenario.cleanup[0].succeeded());
    assert!(project.output().join("hang/cleanup/cleaned.txt").exists());

    // the background child went down with its process group
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!project.output().join("hang/hang/leaked.txt").exists());
}

#[tokio::test]
async fn test_data_driven_cases_expand_from_csv() {
    let project = Project::new();
    project
        .write(
            "tools/emit.tool.yml",
            "name: emit\ncommand_template: \"echo {{ model }} {{ batch }} > run.txt\"\n",
        )
        .write(
            "cases/data/models.csv",
            "model,batch,enabled\nresnet,8,true\nbert,16,true\nvit,4,false\n",
        )
        .write(
            "cases/sweep.case.yml",
            r#"common_params:
  batch: 1
data_driven_cases:
  - template:
      name: sweep
      tool: emit
      validation:
        - type: file_content
          target: run.txt
          pattern: '^\w+ \d+'
    data_source: data/models.csv
    data_filter: {enabled: true}
    parameter_mapping:
      model: model
      batch: batch
    name_template: "sweep_{{ model }}"
"#,
        );

    let results = project.run("sweep.case.yml").await;
    assert_eq!(results.keys().collect::<Vec<_>>(), ["sweep_bert", "sweep_resnet"]);
    for (name, result) in &results {
        assert!(result.passed, "{}: {:?}", name, result.error);
    }
    let run = fs::read_to_string(project.output().join("sweep_bert/run.txt")).unwrap();
    assert_eq!(run.trim(), "bert 16");
    assert!(!project.output().join("sweep_vit").exists());
}

#[test]
fn test_case_file_with_unknown_block_is_rejected() {
    let project = Project::new();
    project.write(
        "cases/typo.case.yml",
        "cases: []\ndata_driven_case:\n  - template: {name: t, tool: echo}\n",
    );
    let err = loader::load_case_file(&project.root().join("cases/typo.case.yml")).unwrap_err();
    assert!(err.to_string().contains("data_driven_case"), "{}", err);
}

#[tokio::test]
async fn test_retried_step_keeps_every_attempt_in_logs() {
    let project = Project::new();
    project
        .write(
            "tools/flaky.tool.yml",
            "name: flaky\ncommand_template: \"echo try; exit 1\"\nretry_count: 2\n",
        )
        .write("cases/flaky.case.yml", "cases:\n  - name: flaky\n    tool: flaky\n");

    let results = project.run("flaky.case.yml").await;
    assert_eq!(step(&results["flaky"], "flaky").attempt_count, 3);
    let log = fs::read_to_string(project.output().join("flaky/stdout.log")).unwrap();
    assert_eq!(log, "try\n=== attempt 2 ===\ntry\n=== attempt 3 ===\ntry\n");
}

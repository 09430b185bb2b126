//! CLI command handling
//!
//! Loads the project catalog, dispatches commands, and prints colored
//! reports.

use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{logging, paths, Error, Result};
use crate::engine::{
    resolve, run_case, CaseOptions, CaseResult, Orchestrator, StepResult, StepStatus,
};
use crate::loader::{self, Availability, Catalog, PlannedCase};

/// Lines of step output shown for failed steps in verbose mode
const OUTPUT_TAIL_LINES: usize = 20;

/// Dispatch a CLI command; `Ok(false)` means at least one case failed
pub async fn dispatch(command: Commands) -> Result<bool> {
    match command {
        Commands::Run {
            path,
            verbose,
            config,
            max_parallel,
            tags,
            json,
        } => {
            let root = project_root(&path)?;
            let mut config = Config::load(config.as_deref(), Some(&root))?;
            if let Some(max) = max_parallel {
                config.engine.max_parallel_steps = max;
            }
            let output_dir = root.join(&config.output.dir);
            let _guard = logging::init_cli(verbose, Some(&output_dir));

            let catalog = Catalog::load(&root)?;
            let results = run_cases(&catalog, &config, &path, &tags, &output_dir, verbose).await?;

            if let Some(json) = json {
                let content = serde_json::to_string_pretty(&results)?;
                std::fs::write(&json, content).map_err(|e| Error::FileRead {
                    path: json.display().to_string(),
                    error: e.to_string(),
                })?;
            }
            Ok(print_summary(&results))
        }

        Commands::ListTools => {
            logging::init_cli(false, None);
            let catalog = Catalog::load(&project_root(Path::new("."))?)?;
            if catalog.tools.is_empty() {
                println!("No tools found");
            }
            for tool in catalog.tools.values() {
                let status = match Catalog::availability(tool) {
                    Availability::Found(path) => format!("{}", path.display()).green(),
                    Availability::Missing(program) => format!("{} not found", program).red(),
                    Availability::Unknown => "templated".yellow(),
                };
                println!("{:<24} {:<8} {}", tool.name.bold(), tool.kind, status);
                if let Some(desc) = &tool.description {
                    println!("  {}", desc.dimmed());
                }
            }
            Ok(true)
        }

        Commands::ListScenarios => {
            logging::init_cli(false, None);
            let catalog = Catalog::load(&project_root(Path::new("."))?)?;
            if catalog.scenarios.is_empty() {
                println!("No scenarios found");
            }
            for scenario in catalog.scenarios.values() {
                println!(
                    "{:<24} {} steps",
                    scenario.name.bold(),
                    scenario.steps.len()
                );
                if let Some(desc) = &scenario.description {
                    println!("  {}", desc.dimmed());
                }
            }
            Ok(true)
        }

        Commands::ShowScenario { name, mermaid } => {
            logging::init_cli(false, None);
            let catalog = Catalog::load(&project_root(Path::new("."))?)?;
            let scenario = catalog.scenario(&name)?;
            let plan = resolve(&scenario.steps)?;
            if mermaid {
                print!("{}", plan.mermaid());
            } else {
                println!("{} {}", "Scenario:".blue().bold(), scenario.name.bold());
                if let Some(desc) = &scenario.description {
                    println!("  {}", desc.dimmed());
                }
                print!("{}", plan);
                if !scenario.cleanup_steps.is_empty() {
                    let names: Vec<_> = scenario.cleanup_steps.iter().map(|s| s.name.as_str()).collect();
                    println!("Cleanup: {}", names.join(", "));
                }
            }
            Ok(true)
        }

        Commands::ListCases { file } => {
            logging::init_cli(false, None);
            let path = file.unwrap_or_else(|| PathBuf::from("."));
            for case_file in loader::case_files(&path)? {
                let parsed = loader::load_case_file(&case_file)?;
                println!("{}", case_file.display().to_string().cyan());
                for planned in loader::expand_cases(&parsed, case_dir(&case_file)) {
                    if let PlannedCase::Broken { case, error } = &planned {
                        println!("  {:<28} {}", case.name.bold(), error.as_str().red());
                        continue;
                    }
                    let case = planned.case();
                    let target = match (&case.scenario, &case.tool) {
                        (Some(s), _) => format!("scenario {}", s),
                        (None, Some(t)) => format!("tool {}", t),
                        (None, None) => "-".to_string(),
                    };
                    let tags = if case.tags.is_empty() {
                        String::new()
                    } else {
                        format!("[{}]", case.tags.join(", "))
                    };
                    println!("  {:<28} {:<28} {}", case.name.bold(), target, tags.dimmed());
                }
            }
            Ok(true)
        }
    }
}

fn case_dir(case_file: &Path) -> &Path {
    case_file.parent().unwrap_or(Path::new("."))
}

fn project_root(path: &Path) -> Result<PathBuf> {
    match paths::find_project_root(path) {
        Some(root) => Ok(root),
        None => std::env::current_dir().map_err(Error::from),
    }
}

async fn run_cases(
    catalog: &Catalog,
    config: &Config,
    path: &Path,
    tags: &[String],
    output_dir: &Path,
    verbose: bool,
) -> Result<Vec<CaseResult>> {
    let orchestrator = Orchestrator::builder()
        .config(&config.engine)
        .tools(catalog.tools.values().cloned())
        .build();
    let options = CaseOptions {
        output_dir: output_dir.to_path_buf(),
        clean: config.output.clean,
    };

    let files = loader::case_files(path)?;
    if files.is_empty() {
        println!("{}", format!("No .case.yml files found in {}", path.display()).yellow());
    }

    let mut results = Vec::new();
    for file in files {
        let parsed = loader::load_case_file(&file)?;
        for planned in loader::expand_cases(&parsed, case_dir(&file)) {
            let case = planned.case();
            if !tags.is_empty() && !case.tags.iter().any(|t| tags.contains(t)) {
                continue;
            }
            println!("\n{} {}", "Running Case:".blue().bold(), case.name.white().bold());
            if let Some(desc) = &case.description {
                println!("  {}", desc.dimmed());
            }
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
            print_case(&result, verbose);
            results.push(result);
        }
    }
    Ok(results)
}

fn print_case(result: &CaseResult, verbose: bool) {
    if let Some(scenario) = &result.scenario {
        for step in &scenario.steps {
            print_step(step, verbose);
        }
        if !scenario.cleanup.is_empty() {
            println!("  {}", "Cleanup:".cyan());
            for step in &scenario.cleanup {
                print_step(step, verbose);
            }
        }
        if !scenario.validations.is_empty() {
            println!("  {}", "Validations:".cyan());
            for v in &scenario.validations {
                let mark = if v.passed { "✓".green() } else { "✗".red() };
                println!("    {} {}: {}", mark, v.label(), v.message);
            }
        }
    }
    if let Some(error) = &result.error {
        println!("  {} {}", "Error:".red().bold(), error);
    }
    if result.passed {
        println!(
            "{} {} ({:.2}s)",
            "✓".green().bold(),
            "Case Passed".green().bold(),
            result.duration.as_secs_f64()
        );
    } else {
        println!(
            "{} {} ({:.2}s)",
            "✗".red().bold(),
            "Case Failed".red().bold(),
            result.duration.as_secs_f64()
        );
    }
}

fn print_step(step: &StepResult, verbose: bool) {
    let reason = step.reason().unwrap_or_default();
    match step.status {
        StepStatus::Succeeded => {
            let attempts = if step.attempt_count > 1 {
                format!(", {} attempts", step.attempt_count)
            } else {
                String::new()
            };
            println!(
                "  {} {} ({:.2}s{})",
                "✓".green(),
                step.name,
                step.execution_time.as_secs_f64(),
                attempts
            );
            if verbose {
                if let Some(command) = &step.command {
                    println!("    $ {}", command.dimmed());
                }
            }
        }
        StepStatus::Skipped => println!("  {} {} {}", "-".yellow(), step.name, reason.dimmed()),
        _ => {
            println!("  {} {}: {}", "✗".red(), step.name, reason);
            if verbose {
                if let Some(command) = &step.command {
                    println!("    $ {}", command.dimmed());
                }
                for line in tail(&step.stderr) {
                    println!("    {}", line.dimmed());
                }
            }
        }
    }
    for error in &step.output_errors {
        println!("    {} {}", "!".yellow(), error);
    }
}

fn tail(text: &str) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].to_vec()
}

/// Print totals; returns whether every case passed
fn print_summary(results: &[CaseResult]) -> bool {
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;
    let line = format!("{} passed, {} failed", passed, failed);
    if failed == 0 {
        println!("\n{}", line.green().bold());
    } else {
        println!("\n{}", line.red().bold());
        for result in results.iter().filter(|r| !r.passed) {
            println!("  {} {}", "✗".red(), result.name);
        }
    }
    failed == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let last = tail(&text);
        assert_eq!(last.len(), OUTPUT_TAIL_LINES);
        assert_eq!(last[0], "line 10");
        assert_eq!(tail("one"), vec!["one"]);
    }
}

//! Catalog loading
//!
//! A project keeps tools in `tools/**/*.tool.yml` and scenarios in
//! `scenarios/**/*.scenario.yml` (or `examples/scenarios`). Cases live in
//! `*.case.yml` files anywhere; data-driven templates in a case file expand
//! into one case per data row.

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::dataset;
use crate::model::{Case, CaseFile, DataDrivenCase, Scenario, Tool};
use crate::template;
use crate::value::{Mapping, Value};

const TOOL_DIRS: &[&str] = &["tools"];
const SCENARIO_DIRS: &[&str] = &["scenarios", "examples/scenarios"];
const TOOL_PATTERN: &str = "**/*.tool.yml";
const SCENARIO_PATTERN: &str = "**/*.scenario.yml";
const CASE_PATTERN: &str = "**/*.case.yml";

/// Tools and scenarios of one project
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub root: PathBuf,
    pub tools: BTreeMap<String, Tool>,
    pub scenarios: BTreeMap<String, Scenario>,
}

/// Whether a tool's program can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Found(PathBuf),
    Missing(String),
    /// The program name is itself templated
    Unknown,
}

impl Catalog {
    /// Load every tool and scenario under `root`
    pub fn load(root: &Path) -> Result<Self> {
        let mut catalog = Catalog {
            root: root.to_path_buf(),
            ..Default::default()
        };
        for dir in TOOL_DIRS {
            for path in find_files(&root.join(dir), TOOL_PATTERN)? {
                let tool: Tool = read_yaml(&path)?;
                insert_unique(&mut catalog.tools, tool.name.clone(), tool, "tool", &path)?;
            }
        }
        for dir in SCENARIO_DIRS {
            for path in find_files(&root.join(dir), SCENARIO_PATTERN)? {
                let scenario: Scenario = read_yaml(&path)?;
                insert_unique(
                    &mut catalog.scenarios,
                    scenario.name.clone(),
                    scenario,
                    "scenario",
                    &path,
                )?;
            }
        }
        tracing::debug!(
            tools = catalog.tools.len(),
            scenarios = catalog.scenarios.len(),
            "Loaded catalog from {}",
            root.display()
        );
        Ok(catalog)
    }

    pub fn scenario(&self, name: &str) -> Result<&Scenario> {
        self.scenarios
            .get(name)
            .ok_or_else(|| Error::ScenarioNotFound(name.to_string()))
    }

    /// Check a tool's program on `PATH`
    pub fn availability(tool: &Tool) -> Availability {
        match tool.program() {
            None => Availability::Unknown,
            Some(program) => match which::which(program) {
                Ok(path) => Availability::Found(path),
                Err(_) => Availability::Missing(program.to_string()),
            },
        }
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    name: String,
    item: T,
    what: &str,
    path: &Path,
) -> Result<()> {
    if map.contains_key(&name) {
        return Err(Error::Config(format!(
            "duplicate {} name '{}' in {}",
            what,
            name,
            path.display()
        )));
    }
    map.insert(name, item);
    Ok(())
}

/// Files matching `pattern` below `dir`, sorted; empty when `dir` is missing
fn find_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let full = dir.join(pattern);
    let full = full.to_string_lossy();
    let entries = glob::glob(&full).map_err(|e| Error::Config(format!("{}: {}", full, e)))?;
    let mut files: Vec<PathBuf> = entries.filter_map(|entry| entry.ok()).collect();
    files.sort();
    Ok(files)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    serde_yaml::from_str(&content).map_err(|e| Error::Yaml {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

/// Load one case file
pub fn load_case_file(path: &Path) -> Result<CaseFile> {
    read_yaml(path)
}

/// A case to run, or a data-driven template whose rows could not be loaded
#[derive(Debug, Clone)]
pub enum PlannedCase {
    Ready(Case),
    /// Named `<template>_data_load_error`; reported as a failed case
    Broken { case: Case, error: String },
}

impl PlannedCase {
    pub fn case(&self) -> &Case {
        match self {
            PlannedCase::Ready(case) | PlannedCase::Broken { case, .. } => case,
        }
    }
}

/// Explicit cases followed by every data-driven expansion.
///
/// Data sources resolve relative to `base_dir`, the case file's directory.
pub fn expand_cases(file: &CaseFile, base_dir: &Path) -> Vec<PlannedCase> {
    let mut planned: Vec<PlannedCase> = file.cases.iter().cloned().map(PlannedCase::Ready).collect();
    for dd in &file.data_driven_cases {
        match expand_data_driven(dd, base_dir) {
            Ok(cases) => planned.extend(cases.into_iter().map(PlannedCase::Ready)),
            Err(e) => {
                tracing::error!(template = %dd.template.name, "Data loading failed: {}", e);
                let mut case = dd.template.clone();
                case.name = format!("{}_data_load_error", dd.template.name);
                planned.push(PlannedCase::Broken {
                    case,
                    error: format!("Data loading failed: {}", e),
                });
            }
        }
    }
    planned
}

/// One case per data row that passes the filter
pub fn expand_data_driven(dd: &DataDrivenCase, base_dir: &Path) -> Result<Vec<Case>> {
    let source = base_dir.join(&dd.data_source);
    let rows = dataset::load_rows(&source)?;
    let cases = rows
        .into_iter()
        .filter(|row| row_matches(row, dd.data_filter.as_ref()))
        .enumerate()
        .map(|(index, row)| {
            let mut case = dd.template.clone();
            case.name = case_name(dd, index, &row);
            for (param, column) in &dd.parameter_mapping {
                if let Some(value) = row.get(column) {
                    insert_path(&mut case.params, param, value.clone());
                }
            }
            case
        })
        .collect();
    Ok(cases)
}

fn row_matches(row: &Mapping, filter: Option<&Mapping>) -> bool {
    filter.map_or(true, |filter| {
        filter
            .iter()
            .all(|(key, want)| template::values_equal(row.get(key).unwrap_or(&Value::Null), want))
    })
}

fn case_name(dd: &DataDrivenCase, index: usize, row: &Mapping) -> String {
    let fallback = || format!("{}_{}", dd.template.name, index);
    let Some(name_template) = &dd.name_template else {
        return fallback();
    };
    let mut scope = row.clone();
    scope.insert("index".into(), Value::from(index as u64));
    scope.insert("data".into(), Value::Map(row.clone()));
    match template::render_str(name_template, &scope) {
        Ok(name) if !name.trim().is_empty() => name,
        Ok(_) => fallback(),
        Err(e) => {
            tracing::warn!("Cannot render case name '{}': {}", name_template, e);
            fallback()
        }
    }
}

/// Set `a.b.c` inside nested maps, creating them as needed
fn insert_path(params: &mut Mapping, path: &str, value: Value) {
    let mut parts = path.split('.');
    let Some(last) = parts.next_back() else {
        return;
    };
    let mut current = params;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Map(Mapping::new()));
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::Map(Mapping::new());
        }
        let Value::Map(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// A case file, or every case file below a directory
pub fn case_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(Error::FileRead {
            path: path.display().to_string(),
            error: "no such file or directory".into(),
        });
    }
    find_files(path, CASE_PATTERN)
}

//! Dependency resolution
//!
//! Builds the step graph from explicit `depends_on` lists and the
//! `steps.<name>` references found in parameters and conditions, then layers
//! it with Kahn's algorithm. Each stage only depends on earlier stages.
//!
//! Resolution fails before anything runs when:
//! - two steps share a name
//! - a step references a step that is not declared
//! - the graph has a cycle (the error names one concrete cycle)

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::common::{Error, Result};
use crate::model::Step;
use crate::template;

/// Ordered stages plus the resolved dependency lists
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    /// Steps grouped by stage, declaration order within a stage
    pub stages: Vec<Vec<String>>,
    /// Step name to its direct dependencies, in declaration order
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn dependencies_of(&self, step: &str) -> &[String] {
        self.dependencies
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn stage_of(&self, step: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|s| s == step))
    }

    /// First step in `failed` that `step` depends on, directly or transitively
    pub fn failed_ancestor(&self, step: &str, failed: &BTreeSet<String>) -> Option<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies_of(step).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if failed.contains(current) {
                return Some(current.to_string());
            }
            stack.extend(self.dependencies_of(current).iter().map(String::as_str));
        }
        None
    }

    /// Mermaid `graph TD` rendering
    pub fn mermaid(&self) -> Mermaid<'_> {
        Mermaid(self)
    }
}

/// Human readable stages and dependencies
impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Execution plan ({} stages)", self.stages.len())?;
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "  Stage {}: {}", i + 1, stage.join(", "))?;
        }
        let with_deps: Vec<_> = self
            .stages
            .iter()
            .flatten()
            .filter(|s| !self.dependencies_of(s).is_empty())
            .collect();
        if !with_deps.is_empty() {
            writeln!(f, "Dependencies:")?;
            for step in with_deps {
                writeln!(f, "  {} <- {}", step, self.dependencies_of(step).join(", "))?;
            }
        }
        Ok(())
    }
}

/// [`ExecutionPlan`] as a Mermaid flowchart
pub struct Mermaid<'a>(&'a ExecutionPlan);

impl fmt::Display for Mermaid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&String> = self.0.stages.iter().flatten().collect();
        let ids: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        writeln!(f, "graph TD")?;
        for (i, name) in names.iter().enumerate() {
            writeln!(f, "    s{}[\"{}\"]", i, name.replace('"', "'"))?;
        }
        for name in &names {
            for dep in self.0.dependencies_of(name) {
                if let (Some(from), Some(to)) = (ids.get(dep.as_str()), ids.get(name.as_str())) {
                    writeln!(f, "    s{} --> s{}", from, to)?;
                }
            }
        }
        Ok(())
    }
}

/// Resolve a list of steps into an execution plan
pub fn resolve(steps: &[Step]) -> Result<ExecutionPlan> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.name.as_str(), i).is_some() {
            return Err(Error::DuplicateStep(step.name.clone()));
        }
    }

    // Direct dependencies per step as indices, sorted by declaration order
    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut names: BTreeSet<String> = step.depends_on.iter().cloned().collect();
        for value in step.params.values() {
            names.extend(template::step_references(value)?);
        }
        if let Some(condition) = &step.condition {
            names.extend(template::condition_references(condition)?);
        }
        let mut resolved = Vec::with_capacity(names.len());
        for name in &names {
            let &i = index
                .get(name.as_str())
                .ok_or_else(|| Error::unknown_step(&step.name, name))?;
            resolved.push(i);
        }
        resolved.sort_unstable();
        deps.push(resolved);
    }

    let stages = topological_levels(steps, &deps)?;
    let dependencies = steps
        .iter()
        .zip(&deps)
        .map(|(step, d)| {
            (
                step.name.clone(),
                d.iter().map(|&i| steps[i].name.clone()).collect(),
            )
        })
        .collect();

    Ok(ExecutionPlan {
        stages: stages
            .into_iter()
            .map(|stage| stage.into_iter().map(|i| steps[i].name.clone()).collect())
            .collect(),
        dependencies,
    })
}

fn topological_levels(steps: &[Step], deps: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, d) in deps.iter().enumerate() {
        for &dep in d {
            dependents[dep].push(i);
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;
    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(std::mem::replace(&mut current, next));
    }

    if placed < steps.len() {
        return Err(Error::Cycle {
            cycle: find_cycle(steps, deps, &in_degree),
        });
    }
    Ok(levels)
}

/// Walk unresolved dependencies until a step repeats; every unplaced step
/// still has at least one unplaced dependency so the walk always closes.
fn find_cycle(steps: &[Step], deps: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
    let remaining = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..steps.len()).find(|&i| remaining(i)) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = deps[current].iter().find(|&&d| remaining(d)) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| steps[i].name.clone())
                .collect();
            cycle.push(steps[next].name.clone());
            // dependency order -> execution order
            cycle.reverse();
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(|i| steps[i].name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn step(name: &str, depends_on: &[&str]) -> Step {
        let mut s = Step::new(name, "tool");
        s.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
        s
    }

    fn with_param(mut s: Step, key: &str, value: &str) -> Step {
        s.params.insert(key.into(), Value::from(value));
        s
    }

    fn assert_topological(plan: &ExecutionPlan) {
        for (i, stage) in plan.stages.iter().enumerate() {
            for step in stage {
                for dep in plan.dependencies_of(step) {
                    assert!(plan.stage_of(dep).unwrap() < i, "{} must precede {}", dep, step);
                }
            }
        }
    }

    #[test]
    fn test_parallel_and_sequential_stages() {
        let steps = vec![
            step("fetch", &[]),
            step("lint", &[]),
            step("build", &["fetch"]),
            step("test", &["build", "lint"]),
        ];
        let plan = resolve(&steps).unwrap();
        assert_eq!(
            plan.stages,
            vec![vec!["fetch", "lint"], vec!["build"], vec!["test"]]
        );
        assert_eq!(plan.dependencies_of("test"), ["build", "lint"]);
        assert_topological(&plan);
    }

    #[test]
    fn test_implicit_references_order_reversed_declaration() {
        let steps = vec![
            with_param(step("consume", &[]), "input", "{{ steps.produce.outputs.path }}"),
            step("produce", &[]),
        ];
        let plan = resolve(&steps).unwrap();
        assert_eq!(plan.stages, vec![vec!["produce"], vec!["consume"]]);
    }

    #[test]
    fn test_condition_references_add_edges() {
        let mut gated = step("deploy", &[]);
        gated.condition = Some("steps.check.exit_code == 0".into());
        let plan = resolve(&[gated, step("check", &[])]).unwrap();
        assert_eq!(plan.stages, vec![vec!["check"], vec!["deploy"]]);
    }

    #[test]
    fn test_cycle_is_named() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        match resolve(&steps) {
            Err(Error::Cycle { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = resolve(&[step("a", &["a"])]).unwrap_err();
        assert_eq!(err.to_string(), "Circular dependency detected: a -> a");
    }

    #[test]
    fn test_cycle_through_implicit_reference() {
        let steps = vec![
            with_param(step("a", &[]), "x", "{{ steps.b.outputs.y }}"),
            step("b", &["a"]),
            step("free", &[]),
        ];
        assert!(matches!(resolve(&steps), Err(Error::Cycle { .. })));
    }

    #[test]
    fn test_unknown_and_duplicate_steps() {
        match resolve(&[step("a", &["ghost"])]) {
            Err(Error::UnknownStepReference { step, missing }) => {
                assert_eq!((step.as_str(), missing.as_str()), ("a", "ghost"));
            }
            other => panic!("expected unknown step, got {:?}", other),
        }
        let implicit = with_param(step("a", &[]), "x", "{{ steps.nope.outputs.y }}");
        assert!(matches!(
            resolve(&[implicit]),
            Err(Error::UnknownStepReference { .. })
        ));
        assert!(matches!(
            resolve(&[step("a", &[]), step("a", &[])]),
            Err(Error::DuplicateStep(_))
        ));
    }

    #[test]
    fn test_malformed_reference_is_configuration_error() {
        let bad = with_param(step("a", &[]), "x", "{{ steps }}");
        let err = resolve(&[bad]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_failed_ancestor_is_transitive() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"]), step("d", &[])];
        let plan = resolve(&steps).unwrap();
        let failed = BTreeSet::from(["a".to_string()]);
        assert_eq!(plan.failed_ancestor("c", &failed), Some("a".to_string()));
        assert_eq!(plan.failed_ancestor("d", &failed), None);
    }

    #[test]
    fn test_rendering() {
        let plan = resolve(&[step("a", &[]), step("b", &["a"])]).unwrap();
        let summary = plan.to_string();
        assert!(summary.starts_with("Execution plan (2 stages)\n"));
        assert!(summary.contains("Stage 1: a"));
        assert!(summary.contains("b <- a"));
        let mermaid = plan.mermaid().to_string();
        assert_eq!(mermaid, "graph TD\n    s0[\"a\"]\n    s1[\"b\"]\n    s0 --> s1\n");

        let empty = ExecutionPlan::default();
        assert_eq!(empty.to_string(), "Execution plan (0 stages)\n");
        assert_eq!(empty.mermaid().to_string(), "graph TD\n");
    }
}

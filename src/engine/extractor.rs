//! Output extraction
//!
//! Turns the declared `post_exec.outputs` of a tool into named values by
//! calling registered functions after the step's process has finished.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use super::context::{RunContext, StepResult};
use super::registry::{ExtractionInput, FunctionRegistry};
use crate::common::{Error, Result};
use crate::model::OutputSpec;
use crate::template::{self, Scope};
use crate::value::{Mapping, Value};

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\w+)\s*\((.*)\)\s*$").expect("valid call regex"))
}

fn arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*(?:'([^']*)'|"([^"]*)")"#).expect("valid argument regex")
    })
}

/// Parse `name(key='value', other="value")` into a function name and arguments
pub fn parse_call(call: &str) -> Result<(String, Mapping)> {
    let caps = call_regex()
        .captures(call)
        .ok_or_else(|| Error::Config(format!("invalid output function call '{}'", call)))?;
    let name = caps[1].to_string();
    let body = caps.get(2).map_or("", |m| m.as_str());

    let mut args = Mapping::new();
    let mut consumed = 0;
    for arg in arg_regex().captures_iter(body) {
        let whole = arg.get(0).map_or(0..0, |m| m.range());
        let gap = body[consumed..whole.start].trim().trim_start_matches(',').trim();
        if !gap.is_empty() {
            return Err(Error::Config(format!(
                "invalid argument '{}' in output call '{}'",
                gap, call
            )));
        }
        consumed = whole.end;
        let value = arg
            .get(2)
            .or_else(|| arg.get(3))
            .map_or("", |m| m.as_str());
        args.insert(arg[1].to_string(), Value::from(value));
    }
    let rest = body[consumed..].trim().trim_start_matches(',').trim();
    if !rest.is_empty() {
        return Err(Error::Config(format!(
            "invalid argument '{}' in output call '{}'",
            rest, call
        )));
    }
    Ok((name, args))
}

impl OutputSpec {
    /// Function name and unrendered arguments
    pub fn call(&self) -> Result<(String, Mapping)> {
        match self {
            OutputSpec::Call(call) => parse_call(call),
            OutputSpec::Structured { function, args } => Ok((function.clone(), args.clone())),
        }
    }
}

/// Outputs that could be extracted plus the failures
#[derive(Debug, Default)]
pub struct Extraction {
    pub outputs: Mapping,
    pub errors: Vec<Error>,
}

/// Runs output declarations through a [`FunctionRegistry`]
#[derive(Debug, Clone)]
pub struct OutputExtractor {
    registry: Arc<FunctionRegistry>,
}

impl OutputExtractor {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    /// Extract every declared output. Failures never stop the remaining outputs.
    pub fn extract(
        &self,
        specs: &BTreeMap<String, OutputSpec>,
        result: &StepResult,
        work_dir: &Path,
        ctx: &RunContext,
    ) -> Extraction {
        let mut extraction = Extraction::default();
        for (name, spec) in specs {
            match self.extract_one(spec, result, work_dir, ctx) {
                Ok(value) => {
                    tracing::debug!(output = %name, value = %value, "Extracted output");
                    extraction.outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(step = %result.name, output = %name, "Output extraction failed: {}", e);
                    extraction.errors.push(Error::extraction(name, e));
                }
            }
        }
        extraction
    }

    fn extract_one(
        &self,
        spec: &OutputSpec,
        result: &StepResult,
        work_dir: &Path,
        ctx: &RunContext,
    ) -> Result<Value> {
        let (function, raw_args) = spec.call()?;
        let scope = Scope::with_locals(ctx, &result.params);
        let args = template::render_mapping(&raw_args, &scope)?;
        let extractor = self
            .registry
            .extractor(&function)
            .ok_or_else(|| Error::UnknownFunction(function.clone()))?;
        extractor(&ExtractionInput {
            args: &args,
            work_dir,
            stdout: &result.stdout,
            stderr: &result.stderr,
            exit_code: result.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::StepStatus;

    #[test]
    fn test_parse_call() {
        let (name, args) = parse_call(r#"find_file(dir='out', pattern="*.onnx")"#).unwrap();
        assert_eq!(name, "find_file");
        assert_eq!(args["dir"], Value::from("out"));
        assert_eq!(args["pattern"], Value::from("*.onnx"));

        let (name, args) = parse_call("check_done()").unwrap();
        assert_eq!(name, "check_done");
        assert!(args.is_empty());

        assert!(parse_call("not a call").is_err());
        assert!(parse_call("f(dir=out)").is_err());
    }

    #[test]
    fn test_extract_renders_args_and_collects_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build/model.onnx"), b"x").unwrap();

        let mut result = StepResult::new("convert", StepStatus::Succeeded);
        result.params.insert("out_dir".into(), Value::from("build"));
        result.stdout = "score: 7\n".into();

        let specs = BTreeMap::from([
            (
                "model".to_string(),
                OutputSpec::Call("find_file(dir='{{ out_dir }}', pattern='*.onnx')".into()),
            ),
            (
                "score".to_string(),
                OutputSpec::Structured {
                    function: "regex_extract".into(),
                    args: Mapping::from([("pattern".to_string(), Value::from(r"score: (\d+)"))]),
                },
            ),
            ("broken".to_string(), OutputSpec::Call("nonexistent(x='1')".into())),
        ]);

        let extractor = OutputExtractor::new(Arc::new(FunctionRegistry::with_builtins()));
        let extraction = extractor.extract(&specs, &result, dir.path(), &RunContext::default());
        assert!(extraction.outputs["model"].render().ends_with("build/model.onnx"));
        assert_eq!(extraction.outputs["score"], Value::from("7"));
        assert!(!extraction.outputs.contains_key("broken"));
        assert_eq!(extraction.errors.len(), 1);
        assert!(matches!(
            &extraction.errors[0],
            Error::OutputExtraction { output, .. } if output == "broken"
        ));
    }
}

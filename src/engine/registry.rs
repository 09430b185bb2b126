//! Registry of named extraction and validation functions
//!
//! Registries are plain values: build one, register what the run needs and
//! hand it to the orchestrator behind an `Arc`. Nothing is global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use regex::Regex;

use super::validation::{ValidationSubject, Verdict};
use crate::common::{Error, Result};
use crate::model::CaseValidation;
use crate::value::{Mapping, Value};

/// Everything an extraction function may look at
pub struct ExtractionInput<'a> {
    /// Rendered call arguments
    pub args: &'a Mapping,
    /// Step work directory; relative paths resolve against it
    pub work_dir: &'a Path,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: Option<i32>,
}

impl ExtractionInput<'_> {
    fn arg(&self, key: &str) -> Option<String> {
        self.args.get(key).filter(|v| !v.is_null()).map(Value::render)
    }

    fn required(&self, function: &str, key: &str) -> Result<String> {
        self.arg(key)
            .ok_or_else(|| Error::function(function, format!("missing argument '{}'", key)))
    }

    fn path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

pub type Extractor = Arc<dyn Fn(&ExtractionInput<'_>) -> Result<Value> + Send + Sync>;
pub type Validator =
    Arc<dyn Fn(&CaseValidation, &dyn ValidationSubject) -> Result<Verdict> + Send + Sync>;

/// Named functions available to output declarations and custom checks
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    extractors: HashMap<String, Extractor>,
    validators: HashMap<String, Validator>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in extractors
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_extractor("find_file", find_file);
        registry.register_extractor("find_latest_file", find_latest_file);
        registry.register_extractor("find_dir", find_dir);
        registry.register_extractor("file_exists", file_exists);
        registry.register_extractor("file_size", file_size);
        registry.register_extractor("read_file", read_file);
        registry.register_extractor("regex_extract", regex_extract);
        registry.register_extractor("find_onnx_file", find_onnx_file);
        registry.register_extractor("find_onnx_dir", find_onnx_dir);
        registry.register_extractor("check_file_exists", check_file_exists);
        registry
    }

    pub fn register_extractor<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&ExtractionInput<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.extractors.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_validator<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&CaseValidation, &dyn ValidationSubject) -> Result<Verdict> + Send + Sync + 'static,
    {
        self.validators.insert(name.to_string(), Arc::new(f));
    }

    pub fn extractor(&self, name: &str) -> Option<Extractor> {
        self.extractors.get(name).cloned()
    }

    pub fn validator(&self, name: &str) -> Option<Validator> {
        self.validators.get(name).cloned()
    }

    /// Registered extractor names, sorted
    pub fn extractor_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.extractors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("extractors", &self.extractor_names())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

// === Built-in extractors ===

const ONNX_PATTERN: &str = "**/*.onnx";

fn glob_in(function: &str, input: &ExtractionInput<'_>, default_pattern: &str) -> Result<Vec<PathBuf>> {
    let dir = input.path(&input.arg("dir").unwrap_or_else(|| ".".into()));
    let pattern = input.arg("pattern").unwrap_or_else(|| default_pattern.into());
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full)
        .map_err(|e| Error::function(function, format!("invalid pattern '{}': {}", pattern, e)))?;
    let mut found: Vec<PathBuf> = paths.filter_map(|entry| entry.ok()).collect();
    found.sort();
    Ok(found)
}

fn no_match(function: &str, input: &ExtractionInput<'_>, default_pattern: &str) -> Error {
    Error::function(
        function,
        format!(
            "no match for '{}' in '{}'",
            input.arg("pattern").unwrap_or_else(|| default_pattern.into()),
            input.arg("dir").unwrap_or_else(|| ".".into())
        ),
    )
}

fn path_value(path: &Path) -> Value {
    Value::String(path.display().to_string())
}

/// Most recently modified regular file among `paths`
fn newest(paths: Vec<PathBuf>) -> Option<PathBuf> {
    paths
        .into_iter()
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified)
        .map(|(_, p)| p)
}

fn find_file(input: &ExtractionInput<'_>) -> Result<Value> {
    glob_in("find_file", input, "*")?
        .into_iter()
        .find(|p| p.is_file())
        .map(|p| path_value(&p))
        .ok_or_else(|| no_match("find_file", input, "*"))
}

fn find_latest_file(input: &ExtractionInput<'_>) -> Result<Value> {
    newest(glob_in("find_latest_file", input, "*")?)
        .map(|p| path_value(&p))
        .ok_or_else(|| no_match("find_latest_file", input, "*"))
}

/// Newest model file; folder names generated per run are matched by `**`
fn find_onnx_file(input: &ExtractionInput<'_>) -> Result<Value> {
    newest(glob_in("find_onnx_file", input, ONNX_PATTERN)?)
        .map(|p| path_value(&p))
        .ok_or_else(|| no_match("find_onnx_file", input, ONNX_PATTERN))
}

fn find_onnx_dir(input: &ExtractionInput<'_>) -> Result<Value> {
    newest(glob_in("find_onnx_dir", input, ONNX_PATTERN)?)
        .and_then(|p| p.parent().map(path_value))
        .ok_or_else(|| no_match("find_onnx_dir", input, ONNX_PATTERN))
}

fn find_dir(input: &ExtractionInput<'_>) -> Result<Value> {
    glob_in("find_dir", input, "*")?
        .into_iter()
        .find(|p| p.is_dir())
        .map(|p| path_value(&p))
        .ok_or_else(|| no_match("find_dir", input, "*"))
}

fn file_exists(input: &ExtractionInput<'_>) -> Result<Value> {
    let path = input.path(&input.required("file_exists", "path")?);
    Ok(Value::Bool(path.exists()))
}

/// Like `file_exists`, but `path` may be a glob pattern
fn check_file_exists(input: &ExtractionInput<'_>) -> Result<Value> {
    let raw = input.required("check_file_exists", "path")?;
    let path = input.path(&raw);
    if path.exists() {
        return Ok(Value::Bool(true));
    }
    let matched = glob::glob(&path.to_string_lossy())
        .map_err(|e| Error::function("check_file_exists", format!("invalid pattern '{}': {}", raw, e)))?
        .any(|entry| entry.is_ok());
    Ok(Value::Bool(matched))
}

fn file_size(input: &ExtractionInput<'_>) -> Result<Value> {
    let path = input.path(&input.required("file_size", "path")?);
    let meta = std::fs::metadata(&path)
        .map_err(|e| Error::function("file_size", format!("{}: {}", path.display(), e)))?;
    Ok(Value::from(meta.len()))
}

fn read_file(input: &ExtractionInput<'_>) -> Result<Value> {
    let path = input.path(&input.required("read_file", "path")?);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::function("read_file", format!("{}: {}", path.display(), e)))?;
    Ok(Value::String(content.trim_end().to_string()))
}

fn regex_extract(input: &ExtractionInput<'_>) -> Result<Value> {
    let pattern = input.required("regex_extract", "pattern")?;
    let re = Regex::new(&pattern)
        .map_err(|e| Error::function("regex_extract", format!("invalid regex: {}", e)))?;
    let source = match input.arg("source").as_deref() {
        None | Some("stdout") => input.stdout,
        Some("stderr") => input.stderr,
        Some(other) => {
            return Err(Error::function(
                "regex_extract",
                format!("unknown source '{}', expected stdout or stderr", other),
            ))
        }
    };
    let group = match input.args.get("group") {
        Some(v) => usize::try_from(v.to_int()?)
            .map_err(|_| Error::function("regex_extract", "group must be non-negative"))?,
        None if re.captures_len() > 1 => 1,
        None => 0,
    };
    let captures = re
        .captures(source)
        .ok_or_else(|| Error::function("regex_extract", format!("'{}' did not match", pattern)))?;
    captures
        .get(group)
        .map(|m| Value::String(m.as_str().to_string()))
        .ok_or_else(|| Error::function("regex_extract", format!("group {} did not participate", group)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn call(registry: &FunctionRegistry, name: &str, dir: &Path, args: &[(&str, Value)]) -> Result<Value> {
        let args: Mapping = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let input = ExtractionInput {
            args: &args,
            work_dir: dir,
            stdout: "accuracy: 0.93\nlatency=12ms\n",
            stderr: "warning: slow\n",
            exit_code: Some(0),
        };
        let f = registry.extractor(name).expect("registered");
        f(&input)
    }

    #[test]
    fn test_builtins_are_registered() {
        let names = FunctionRegistry::with_builtins().extractor_names();
        for name in [
            "file_exists",
            "file_size",
            "find_dir",
            "find_file",
            "find_latest_file",
            "read_file",
            "regex_extract",
            "find_onnx_file",
            "find_onnx_dir",
            "check_file_exists",
        ] {
            assert!(names.contains(&name.to_string()), "{}", name);
        }
        assert!(FunctionRegistry::new().extractor("find_file").is_none());
    }

    #[test]
    fn test_file_functions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out/nested")).unwrap();
        fs::write(dir.path().join("out/a.bin"), b"1234").unwrap();
        fs::write(dir.path().join("out/nested/b.bin"), b"12").unwrap();
        fs::write(dir.path().join("out/notes.txt"), "hello\n").unwrap();
        let r = FunctionRegistry::with_builtins();

        let found = call(&r, "find_file", dir.path(), &[("dir", "out".into()), ("pattern", "*.bin".into())]).unwrap();
        assert!(found.render().ends_with("out/a.bin"));

        let latest = call(
            &r,
            "find_latest_file",
            dir.path(),
            &[("dir", "out".into()), ("pattern", "**/*.bin".into())],
        )
        .unwrap();
        assert!(latest.render().ends_with(".bin"));

        let nested = call(&r, "find_dir", dir.path(), &[("dir", "out".into()), ("pattern", "nest*".into())]).unwrap();
        assert!(nested.render().ends_with("nested"));

        assert_eq!(
            call(&r, "file_exists", dir.path(), &[("path", "out/a.bin".into())]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(&r, "file_exists", dir.path(), &[("path", "nope".into())]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            call(&r, "file_size", dir.path(), &[("path", "out/a.bin".into())]).unwrap(),
            Value::Int(4)
        );
        assert_eq!(
            call(&r, "read_file", dir.path(), &[("path", "out/notes.txt".into())]).unwrap(),
            Value::from("hello")
        );

        let err = call(&r, "find_file", dir.path(), &[("dir", "out".into()), ("pattern", "*.onnx".into())]).unwrap_err();
        assert!(err.to_string().contains("no match"));
        assert!(call(&r, "file_size", dir.path(), &[]).is_err());
    }

    #[test]
    fn test_find_onnx_picks_newest_model_in_generated_folders() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("Conv_testcase_1a2b/resources/Conv_testcase_1a2b.onnx");
        let new = dir.path().join("Conv_testcase_98bd3f/resources/Conv_testcase_98bd3f.onnx");
        for path in [&old, &new] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
        }
        fs::write(&old, b"old").unwrap();
        fs::write(&new, b"new").unwrap();
        let an_hour_ago = SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let r = FunctionRegistry::with_builtins();

        let file = call(&r, "find_onnx_file", dir.path(), &[]).unwrap();
        assert_eq!(file, path_value(&new));
        let folder = call(&r, "find_onnx_dir", dir.path(), &[]).unwrap();
        assert_eq!(folder, path_value(new.parent().unwrap()));

        let pinned = call(
            &r,
            "find_onnx_file",
            dir.path(),
            &[("pattern", "Conv_testcase_1a2b/**/*.onnx".into())],
        )
        .unwrap();
        assert_eq!(pinned, path_value(&old));

        let empty = tempfile::tempdir().unwrap();
        let err = call(&r, "find_onnx_dir", empty.path(), &[]).unwrap_err();
        assert!(err.to_string().contains("**/*.onnx"));
    }

    #[test]
    fn test_check_file_exists_accepts_patterns() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("reports")).unwrap();
        fs::write(dir.path().join("reports/run_7.json"), "{}").unwrap();
        let r = FunctionRegistry::with_builtins();
        let exists = |path: &str| call(&r, "check_file_exists", dir.path(), &[("path", path.into())]).unwrap();

        assert_eq!(exists("reports"), Value::Bool(true));
        assert_eq!(exists("reports/run_7.json"), Value::Bool(true));
        assert_eq!(exists("reports/run_*.json"), Value::Bool(true));
        assert_eq!(exists("reports/*.csv"), Value::Bool(false));
        assert_eq!(exists("missing.txt"), Value::Bool(false));
        assert!(call(&r, "check_file_exists", dir.path(), &[]).is_err());
    }

    #[test]
    fn test_regex_extract() {
        let dir = tempfile::tempdir().unwrap();
        let r = FunctionRegistry::with_builtins();
        assert_eq!(
            call(&r, "regex_extract", dir.path(), &[("pattern", r"accuracy: ([0-9.]+)".into())]).unwrap(),
            Value::from("0.93")
        );
        assert_eq!(
            call(
                &r,
                "regex_extract",
                dir.path(),
                &[("pattern", "warning: (\\w+)".into()), ("source", "stderr".into())]
            )
            .unwrap(),
            Value::from("slow")
        );
        assert_eq!(
            call(&r, "regex_extract", dir.path(), &[("pattern", "latency=\\d+ms".into())]).unwrap(),
            Value::from("latency=12ms")
        );
        assert!(call(&r, "regex_extract", dir.path(), &[("pattern", "missing".into())]).is_err());
    }
}

//! Row sources for data-driven cases
//!
//! The format follows the file extension: `.csv`, `.json`, `.yaml`/`.yml`.
//! CSV cells are typed on the way in. An empty cell is null; otherwise
//! integer, float and boolean parses are tried before falling back to text.
//! JSON and YAML documents hold a list of objects, or a single object.

use std::path::Path;

use crate::common::{Error, Result};
use crate::value::{Mapping, Value};

/// Load every row of a data file
pub fn load_rows(path: &Path) -> Result<Vec<Mapping>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let rows = match extension.as_deref() {
        Some("csv") => csv_rows(path)?,
        Some("json") => {
            let document: Value =
                serde_json::from_str(&read(path)?).map_err(|e| source_error(path, e))?;
            document_rows(path, document)?
        }
        Some("yaml" | "yml") => {
            let document: Value =
                serde_yaml::from_str(&read(path)?).map_err(|e| source_error(path, e))?;
            document_rows(path, document)?
        }
        _ => {
            return Err(source_error(
                path,
                "unsupported format, expected .csv, .json, .yaml or .yml",
            ))
        }
    };
    tracing::info!(rows = rows.len(), "Loaded data source {}", path.display());
    Ok(rows)
}

/// Type one CSV cell
pub fn cell_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Int(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        return Value::Float(float);
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn csv_rows(path: &Path) -> Result<Vec<Mapping>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| source_error(path, e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| source_error(path, e))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| source_error(path, e))?;
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(cell_value))
                .collect(),
        );
    }
    Ok(rows)
}

fn document_rows(path: &Path, document: Value) -> Result<Vec<Mapping>> {
    match document {
        Value::Map(row) => Ok(vec![row]),
        Value::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Map(row) => Ok(row),
                other => Err(source_error(
                    path,
                    format!("item {} is a {}, expected an object", i, other.type_name()),
                )),
            })
            .collect(),
        other => Err(source_error(
            path,
            format!("expected a list of objects, found {}", other.type_name()),
        )),
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| source_error(path, e))
}

fn source_error(path: &Path, error: impl ToString) -> Error {
    Error::DataSource {
        path: path.display().to_string(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_cell_values_are_typed() {
        assert_eq!(cell_value(""), Value::Null);
        assert_eq!(cell_value("42"), Value::Int(42));
        assert_eq!(cell_value("-3"), Value::Int(-3));
        assert_eq!(cell_value("0.5"), Value::Float(0.5));
        assert_eq!(cell_value("TRUE"), Value::Bool(true));
        assert_eq!(cell_value("false"), Value::Bool(false));
        assert_eq!(cell_value("resnet50"), Value::from("resnet50"));
    }

    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "models.csv",
            "model,batch,fp16,note\nresnet,8,true,\nbert,16,false,large\n",
        );
        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["model"], Value::from("resnet"));
        assert_eq!(rows[0]["batch"], Value::Int(8));
        assert_eq!(rows[0]["fp16"], Value::Bool(true));
        assert_eq!(rows[0]["note"], Value::Null);
        assert_eq!(rows[1]["note"], Value::from("large"));
    }

    #[test]
    fn test_json_and_yaml_rows() {
        let dir = tempfile::tempdir().unwrap();
        let json = write(dir.path(), "rows.json", r#"[{"a": 1}, {"a": 2.5}]"#);
        let rows = load_rows(&json).unwrap();
        assert_eq!(rows[1]["a"], Value::Float(2.5));

        let single = write(dir.path(), "one.yml", "model: bert\nbatch: 4\n");
        let rows = load_rows(&single).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["batch"], Value::Int(4));

        let bad = write(dir.path(), "bad.yaml", "- a: 1\n- just text\n");
        let err = load_rows(&bad).unwrap_err();
        assert!(err.to_string().contains("item 1"), "{}", err);
    }

    #[test]
    fn test_unsupported_and_missing_sources() {
        let dir = tempfile::tempdir().unwrap();
        let txt = write(dir.path(), "rows.txt", "a,b\n");
        assert!(matches!(load_rows(&txt), Err(Error::DataSource { .. })));
        let missing = dir.path().join("missing.csv");
        let err = load_rows(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.csv"));
    }
}

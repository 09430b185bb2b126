//! Runtime values
//!
//! Parameters, template results and captured step outputs all share one
//! tagged-union type. Conversions between variants are total: every
//! coercion either produces a value or a descriptive error, never a panic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::common::{Error, Result};

/// Ordered mapping of names to values
pub type Mapping = BTreeMap<String, Value>;

/// A dynamically typed runtime value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Mapping),
}

impl Value {
    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "mapping",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by conditions and the `bool` filter.
    ///
    /// Strings are false when empty or one of `false`, `0`, `no`, `off`,
    /// `none`, `null` (case-insensitive). Collections are false when empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => {
                let s = s.trim().to_ascii_lowercase();
                !matches!(
                    s.as_str(),
                    "" | "false" | "0" | "no" | "off" | "none" | "null"
                )
            }
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Integer view; floats truncate, numeric strings parse
    pub fn to_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .or_else(|_| trimmed.parse::<f64>().map(|f| f.trunc() as i64))
                    .map_err(|_| Error::Eval(format!("cannot convert '{}' to int", s)))
            }
            other => Err(Error::Eval(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        }
    }

    /// Float view; numeric strings parse
    pub fn to_float(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::Eval(format!("cannot convert '{}' to float", s))),
            other => Err(Error::Eval(format!(
                "cannot convert {} to float",
                other.type_name()
            ))),
        }
    }

    /// Numeric view without coercing booleans, used by comparisons
    pub(crate) fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Text rendering used when a value is interpolated into a string
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Coerce to a declared parameter type
    pub fn coerce(&self, kind: ParamType) -> Result<Value> {
        Ok(match kind {
            ParamType::Any => self.clone(),
            ParamType::Str | ParamType::Path => match self {
                Value::String(_) => self.clone(),
                other => Value::String(other.render()),
            },
            ParamType::Int => Value::Int(self.to_int()?),
            ParamType::Float => Value::Float(self.to_float()?),
            ParamType::Bool => Value::Bool(self.is_truthy()),
            ParamType::List => match self {
                Value::List(_) => self.clone(),
                Value::Null => Value::List(Vec::new()),
                other => Value::List(vec![other.clone()]),
            },
        })
    }

    /// Walk a single path segment
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            Value::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Convert into a JSON value for reporting
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() && x.abs() < 1e15 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::String(s) => f.write_str(s),
            Value::List(_) | Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Mapping> for Value {
    fn from(map: Mapping) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    #[serde(alias = "str", alias = "string")]
    Str,
    #[serde(alias = "integer")]
    Int,
    Float,
    #[serde(alias = "boolean")]
    Bool,
    Path,
    List,
    Any,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("false").is_truthy());
        assert!(!Value::from(" OFF ").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("yes").is_truthy());
        assert!(Value::from(2).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }

    #[test]
    fn test_numeric_coercions() {
        assert_eq!(Value::from("42").to_int().unwrap(), 42);
        assert_eq!(Value::from("4.9").to_int().unwrap(), 4);
        assert_eq!(Value::from(3).to_float().unwrap(), 3.0);
        assert!(Value::from("abc").to_int().is_err());
        assert!(Value::List(vec![]).to_float().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::from(true).to_string(), "true");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(
            Value::List(vec![Value::from(1), Value::from("a")]).to_string(),
            r#"[1,"a"]"#
        );
    }

    #[test]
    fn test_coerce_to_declared_type() {
        assert_eq!(Value::from("7").coerce(ParamType::Int).unwrap(), Value::Int(7));
        assert_eq!(
            Value::from(7).coerce(ParamType::Str).unwrap(),
            Value::from("7")
        );
        assert_eq!(
            Value::from("no").coerce(ParamType::Bool).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            Value::from("x").coerce(ParamType::List).unwrap(),
            Value::List(vec![Value::from("x")])
        );
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let v: Value = serde_yaml::from_str("{a: 1, b: [true, 2.5, text], c: ~}").unwrap();
        let Value::Map(map) = v else {
            panic!("expected mapping");
        };
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(
            map["b"],
            Value::List(vec![Value::Bool(true), Value::Float(2.5), Value::from("text")])
        );
        assert_eq!(map["c"], Value::Null);
    }
}

//! Parameter templating
//!
//! Strings may embed `{{ expression }}` markers. A string that is exactly one
//! marker evaluates to the typed value of the expression; any other string
//! renders each marker to text in place. Non-string values pass through and
//! collections render element-wise.

mod eval;
mod lexer;
mod parser;

use std::collections::BTreeSet;

pub use eval::{evaluate, values_equal, walk, Namespace, Scope};
pub use parser::{parse_expression, path_to_string, Expr, Segment};

use crate::common::{Error, Result};
use crate::value::{Mapping, Value};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone)]
enum Piece {
    Text(String),
    Marker { source: String, expr: Expr },
}

/// A parsed template string
#[derive(Debug, Clone)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    /// Split a string into literal text and parsed markers
    pub fn parse(source: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                pieces.push(Piece::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| Error::template_syntax(source, "unclosed '{{'"))?;
            let inner = after_open[..end].trim();
            pieces.push(Piece::Marker {
                source: inner.to_string(),
                expr: parse_expression(inner)?,
            });
            rest = &after_open[end + CLOSE.len()..];
        }
        if !rest.is_empty() {
            pieces.push(Piece::Text(rest.to_string()));
        }
        Ok(Self { pieces })
    }

    /// Whether the template contains any marker
    pub fn is_dynamic(&self) -> bool {
        self.pieces
            .iter()
            .any(|p| matches!(p, Piece::Marker { .. }))
    }

    /// Evaluate the template
    pub fn render(&self, ns: &dyn Namespace) -> Result<Value> {
        if let [Piece::Marker { expr, .. }] = self.pieces.as_slice() {
            return evaluate(expr, ns);
        }
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Marker { expr, .. } => out.push_str(&evaluate(expr, ns)?.render()),
            }
        }
        Ok(Value::String(out))
    }

    /// Names of steps referenced through `steps.<name>` paths
    pub fn step_references(&self) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        for piece in &self.pieces {
            if let Piece::Marker { source, expr } = piece {
                collect_step_refs(source, expr, &mut found)?;
            }
        }
        Ok(found)
    }
}

fn collect_step_refs(source: &str, expr: &Expr, found: &mut BTreeSet<String>) -> Result<()> {
    let mut malformed = false;
    expr.walk_paths(&mut |path| {
        if path.first().and_then(Segment::as_key) != Some("steps") {
            return;
        }
        match path.get(1).and_then(Segment::as_key) {
            Some(name) => {
                found.insert(name.to_string());
            }
            None => malformed = true,
        }
    });
    if malformed {
        return Err(Error::template_syntax(
            source,
            "'steps' reference must name a step",
        ));
    }
    Ok(())
}

/// Whether a string contains a template marker
pub fn has_markers(s: &str) -> bool {
    s.contains(OPEN)
}

/// Render a value, descending into lists and mappings
pub fn render(value: &Value, ns: &dyn Namespace) -> Result<Value> {
    match value {
        Value::String(s) if has_markers(s) => Template::parse(s)?.render(ns),
        Value::List(items) => items
            .iter()
            .map(|item| render(item, ns))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Map(map) => render_mapping(map, ns).map(Value::Map),
        other => Ok(other.clone()),
    }
}

/// Render every value of a mapping
pub fn render_mapping(params: &Mapping, ns: &dyn Namespace) -> Result<Mapping> {
    params
        .iter()
        .map(|(k, v)| Ok((k.clone(), render(v, ns)?)))
        .collect()
}

/// Render a string template to text
pub fn render_str(template: &str, ns: &dyn Namespace) -> Result<String> {
    Ok(Template::parse(template)?.render(ns)?.render())
}

/// Evaluate a step condition to a boolean.
///
/// Conditions with markers render like any template; a condition without
/// markers is parsed as a bare expression.
pub fn evaluate_condition(condition: &str, ns: &dyn Namespace) -> Result<bool> {
    let value = if has_markers(condition) {
        Template::parse(condition)?.render(ns)?
    } else {
        evaluate(&parse_expression(condition.trim())?, ns)?
    };
    Ok(value.is_truthy())
}

/// Step names referenced anywhere inside a parameter value
pub fn step_references(value: &Value) -> Result<BTreeSet<String>> {
    let mut found = BTreeSet::new();
    collect_value_refs(value, &mut found)?;
    Ok(found)
}

fn collect_value_refs(value: &Value, found: &mut BTreeSet<String>) -> Result<()> {
    match value {
        Value::String(s) if has_markers(s) => {
            found.extend(Template::parse(s)?.step_references()?);
        }
        Value::List(items) => {
            for item in items {
                collect_value_refs(item, found)?;
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                collect_value_refs(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Step names referenced by a condition
pub fn condition_references(condition: &str) -> Result<BTreeSet<String>> {
    if has_markers(condition) {
        return Template::parse(condition)?.step_references();
    }
    let source = condition.trim();
    let mut found = BTreeSet::new();
    collect_step_refs(source, &parse_expression(source)?, &mut found)?;
    Ok(found)
}

//! Expression evaluation
//!
//! Evaluation is read-only: names are looked up through a [`Namespace`] and
//! nothing the evaluator does can change what a later lookup returns.

use std::cmp::Ordering;

use super::parser::{path_to_string, BinaryOp, Expr, Segment, UnaryOp};
use crate::common::{Error, Result};
use crate::value::{Mapping, Value};

/// Source of named values for template evaluation
pub trait Namespace {
    /// Resolve a full path, `None` when any segment is undefined
    fn resolve(&self, path: &[Segment]) -> Option<Value>;
}

impl Namespace for Mapping {
    fn resolve(&self, path: &[Segment]) -> Option<Value> {
        let (first, rest) = path.split_first()?;
        let value = self.get(first.as_key()?)?;
        walk(value, rest)
    }
}

/// A namespace layered with step-local names that shadow the base
pub struct Scope<'a> {
    base: &'a dyn Namespace,
    locals: Option<&'a Mapping>,
}

impl<'a> Scope<'a> {
    pub fn new(base: &'a dyn Namespace) -> Self {
        Self { base, locals: None }
    }

    pub fn with_locals(base: &'a dyn Namespace, locals: &'a Mapping) -> Self {
        Self {
            base,
            locals: Some(locals),
        }
    }
}

impl Namespace for Scope<'_> {
    fn resolve(&self, path: &[Segment]) -> Option<Value> {
        self.locals
            .and_then(|locals| locals.resolve(path))
            .or_else(|| self.base.resolve(path))
    }
}

/// Follow the remaining segments of a path into a value
pub fn walk(value: &Value, path: &[Segment]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Map(map)) => map.get(key)?,
            (Segment::Index(i), Value::List(items)) => items.get(*i)?,
            (Segment::Key(key), Value::List(items)) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Evaluate an expression against a namespace
pub fn evaluate(expr: &Expr, ns: &dyn Namespace) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, ns))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Expr::Path(path) => ns
            .resolve(path)
            .ok_or_else(|| Error::unresolved(path_to_string(path))),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!evaluate(inner, ns)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => negate(evaluate(inner, ns)?),
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let left = evaluate(lhs, ns)?;
            if left.is_truthy() {
                Ok(left)
            } else {
                evaluate(rhs, ns)
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let left = evaluate(lhs, ns)?;
            if left.is_truthy() {
                evaluate(rhs, ns)
            } else {
                Ok(left)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = evaluate(lhs, ns)?;
            let right = evaluate(rhs, ns)?;
            binary(*op, left, right)
        }
        Expr::Filter { input, name, args } => apply_filter(input, name, args, ns),
    }
}

fn negate(value: Value) -> Result<Value> {
    match value {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| Error::Eval("integer overflow".into())),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => match other.as_number() {
            Some(n) => Ok(Value::Float(-n)),
            None => Err(Error::Eval(format!("cannot negate {}", other.type_name()))),
        },
    }
}

/// Equality is numeric between ints and floats, strict otherwise
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

/// Ordering coerces numeric strings, falls back to text comparison
fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| Error::Eval("cannot order NaN".into()));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(Error::Eval(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::List(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Map(map) => Ok(map.contains_key(&needle.render())),
        Value::String(s) => Ok(s.contains(&needle.render())),
        other => Err(Error::Eval(format!(
            "'in' requires a list, mapping or string, got {}",
            other.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(&left, &right)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(&left, &right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(&left, &right)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(&left, &right)? != Ordering::Less)),
        BinaryOp::In => Ok(Value::Bool(contains(&right, &left)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!contains(&right, &left)?)),
        BinaryOp::Concat => Ok(Value::String(left.render() + &right.render())),
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => arithmetic(op, &a, &b),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &left, &right)
        }
        BinaryOp::And | BinaryOp::Or => Err(Error::Internal(format!(
            "'{}' must be evaluated lazily",
            op
        ))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    let overflow = || Error::Eval(format!("integer overflow in '{}'", op));
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        return match op {
            BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Rem if b == 0 => Err(Error::Eval("modulo by zero".into())),
            BinaryOp::Rem => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
            BinaryOp::Div if b == 0 => Err(Error::Eval("division by zero".into())),
            _ => Ok(Value::Float(a as f64 / b as f64)),
        };
    }

    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(Error::Eval(format!(
            "unsupported operand types for '{}': {} and {}",
            op,
            left.type_name(),
            right.type_name()
        )));
    };
    match op {
        BinaryOp::Add => Ok(Value::Float(a + b)),
        BinaryOp::Sub => Ok(Value::Float(a - b)),
        BinaryOp::Mul => Ok(Value::Float(a * b)),
        BinaryOp::Div if b == 0.0 => Err(Error::Eval("division by zero".into())),
        BinaryOp::Div => Ok(Value::Float(a / b)),
        BinaryOp::Rem if b == 0.0 => Err(Error::Eval("modulo by zero".into())),
        _ => Ok(Value::Float(a % b)),
    }
}

fn expect_args(name: &str, args: &[Expr], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::Eval(format!(
            "filter '{}' takes {} argument(s), got {}",
            name,
            if min == max {
                min.to_string()
            } else {
                format!("{}-{}", min, max)
            },
            args.len()
        )));
    }
    Ok(())
}

fn apply_filter(input: &Expr, name: &str, args: &[Expr], ns: &dyn Namespace) -> Result<Value> {
    if name == "default" {
        expect_args(name, args, 1, 2)?;
        let falsy_counts = match args.get(1) {
            Some(flag) => evaluate(flag, ns)?.is_truthy(),
            None => false,
        };
        return match evaluate(input, ns) {
            Ok(value) if value.is_null() || (falsy_counts && !value.is_truthy()) => {
                evaluate(&args[0], ns)
            }
            Ok(value) => Ok(value),
            Err(Error::UnresolvedReference { .. }) => evaluate(&args[0], ns),
            Err(e) => Err(e),
        };
    }

    let value = evaluate(input, ns)?;
    match name {
        "int" => {
            expect_args(name, args, 0, 0)?;
            value.to_int().map(Value::Int)
        }
        "float" => {
            expect_args(name, args, 0, 0)?;
            value.to_float().map(Value::Float)
        }
        "string" => {
            expect_args(name, args, 0, 0)?;
            Ok(Value::String(value.render()))
        }
        "bool" => {
            expect_args(name, args, 0, 0)?;
            Ok(Value::Bool(value.is_truthy()))
        }
        "lower" => {
            expect_args(name, args, 0, 0)?;
            Ok(Value::String(value.render().to_lowercase()))
        }
        "upper" => {
            expect_args(name, args, 0, 0)?;
            Ok(Value::String(value.render().to_uppercase()))
        }
        "trim" => {
            expect_args(name, args, 0, 0)?;
            Ok(Value::String(value.render().trim().to_string()))
        }
        "length" => {
            expect_args(name, args, 0, 0)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => {
                    return Err(Error::Eval(format!(
                        "{} has no length",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::from(len as u64))
        }
        "join" => {
            expect_args(name, args, 0, 1)?;
            let sep = match args.first() {
                Some(arg) => evaluate(arg, ns)?.render(),
                None => String::new(),
            };
            match value {
                Value::List(items) => Ok(Value::String(
                    items.iter().map(Value::render).collect::<Vec<_>>().join(&sep),
                )),
                other => Ok(Value::String(other.render())),
            }
        }
        "replace" => {
            expect_args(name, args, 2, 2)?;
            let from = evaluate(&args[0], ns)?.render();
            let to = evaluate(&args[1], ns)?.render();
            Ok(Value::String(value.render().replace(&from, &to)))
        }
        other => Err(Error::Eval(format!("unknown filter '{}'", other))),
    }
}

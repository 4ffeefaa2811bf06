//! Tree-walking evaluator.
//!
//! Runtime faults (type mismatch, division by zero, out-of-range index,
//! unknown name) are reported as [`EvalError`]; callers deciding delivery
//! treat any fault as deny.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::env::Env;
use crate::value::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown name `{0}`")]
    UnknownName(String),

    #[error("unknown field `{field}` on {on}")]
    UnknownField { field: String, on: &'static str },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("{op} expects {expected}, got {got}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("integer divide by zero")]
    DivisionByZero,

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("integer overflow")]
    Overflow,

    #[error("{0} takes exactly one string argument")]
    BadHelperCall(&'static str),
}

pub fn evaluate(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Nil => Ok(Value::Nil),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(x) => Ok(Value::Float(*x)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),

        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownName(name.clone())),

        Expr::Field(base, field) => {
            let base = evaluate(base, env)?;
            match base {
                Value::Map(map) => map.get(field).cloned().ok_or(EvalError::UnknownField {
                    field: field.clone(),
                    on: "record",
                }),
                other => Err(EvalError::UnknownField {
                    field: field.clone(),
                    on: other.type_name(),
                }),
            }
        }

        Expr::Index(base, index) => {
            let base = evaluate(base, env)?;
            let index = evaluate(index, env)?;
            index_value(&base, &index)
        }

        Expr::Call(name, args) => call_helper(name, args, env),

        Expr::Unary(op, operand) => {
            let operand = evaluate(operand, env)?;
            match (op, operand) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(n)) => {
                    n.checked_neg().map(Value::Int).ok_or(EvalError::Overflow)
                }
                (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
                (UnaryOp::Not, other) => Err(EvalError::TypeMismatch {
                    op: "!",
                    expected: "bool",
                    got: other.type_name(),
                }),
                (UnaryOp::Neg, other) => Err(EvalError::TypeMismatch {
                    op: "-",
                    expected: "number",
                    got: other.type_name(),
                }),
            }
        }

        Expr::Binary(op, left, right) => binary(*op, left, right, env),

        Expr::Ternary(cond, then, otherwise) => match evaluate(cond, env)? {
            Value::Bool(true) => evaluate(then, env),
            Value::Bool(false) => evaluate(otherwise, env),
            other => Err(EvalError::TypeMismatch {
                op: "?:",
                expected: "bool condition",
                got: other.type_name(),
            }),
        },
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        // Tag maps behave like string maps: a missing key reads as the
        // empty string, not as a fault.
        (Value::Map(map), Value::Str(key)) => Ok(map
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::Str(String::new()))),
        (Value::StrList(items), Value::Int(i)) => list_get(items, *i).map(Value::Str),
        (Value::IntList(items), Value::Int(i)) => list_get(items, *i).map(Value::Int),
        (Value::FloatList(items), Value::Int(i)) => list_get(items, *i).map(Value::Float),
        (base, index) => Err(EvalError::TypeMismatch {
            op: "[]",
            expected: "map[string] or slice[int]",
            got: if matches!(base, Value::Map(_) | Value::StrList(_) | Value::IntList(_) | Value::FloatList(_)) {
                index.type_name()
            } else {
                base.type_name()
            },
        }),
    }
}

fn list_get<T: Clone>(items: &[T], index: i64) -> Result<T, EvalError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or(EvalError::IndexOutOfRange {
            index,
            len: items.len(),
        })
}

/// The five typed helpers parse string tag values; unparsable input yields
/// zero values rather than a fault, matching the tag accessors' contract.
fn call_helper(name: &str, args: &[Expr], env: &Env) -> Result<Value, EvalError> {
    let helper: fn(&str) -> Value = match name {
        "AsInt" => |s| Value::Int(s.trim().parse().unwrap_or(0)),
        "AsFloat" => |s| Value::Float(s.trim().parse().unwrap_or(0.0)),
        "AsStringSlice" => |s| Value::StrList(s.split(',').map(str::to_string).collect()),
        "AsIntSlice" => |s| {
            Value::IntList(
                s.split(',')
                    .map(|part| part.trim().parse().unwrap_or(0))
                    .collect(),
            )
        },
        "AsFloatSlice" => |s| {
            Value::FloatList(
                s.split(',')
                    .map(|part| part.trim().parse().unwrap_or(0.0))
                    .collect(),
            )
        },
        other => return Err(EvalError::UnknownFunction(other.to_string())),
    };

    let static_name: &'static str = match name {
        "AsInt" => "AsInt",
        "AsFloat" => "AsFloat",
        "AsStringSlice" => "AsStringSlice",
        "AsIntSlice" => "AsIntSlice",
        _ => "AsFloatSlice",
    };
    if args.len() != 1 {
        return Err(EvalError::BadHelperCall(static_name));
    }
    match evaluate(&args[0], env)? {
        Value::Str(s) => Ok(helper(&s)),
        _ => Err(EvalError::BadHelperCall(static_name)),
    }
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, env: &Env) -> Result<Value, EvalError> {
    // Short-circuit the connectives before touching the right side.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let lhs = expect_bool(evaluate(left, env)?, "&&/||")?;
        return match (op, lhs) {
            (BinaryOp::And, false) => Ok(Value::Bool(false)),
            (BinaryOp::Or, true) => Ok(Value::Bool(true)),
            _ => {
                let rhs = expect_bool(evaluate(right, env)?, "&&/||")?;
                Ok(Value::Bool(rhs))
            }
        };
    }

    let lhs = evaluate(left, env)?;
    let rhs = evaluate(right, env)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => arithmetic_add(&lhs, &rhs),
        BinaryOp::Sub => numeric(lhs, rhs, "-", i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => numeric(lhs, rhs, "*", i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => match (&lhs, &rhs) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            _ => numeric(lhs, rhs, "/", i64::checked_div, |a, b| a / b),
        },
        BinaryOp::Rem => match (&lhs, &rhs) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            _ => numeric(lhs, rhs, "%", i64::checked_rem, |a, b| a % b),
        },
        BinaryOp::StartsWith => string_op(&lhs, &rhs, "startsWith", |a, b| a.starts_with(b)),
        BinaryOp::EndsWith => string_op(&lhs, &rhs, "endsWith", |a, b| a.ends_with(b)),
        BinaryOp::Contains => string_op(&lhs, &rhs, "contains", |a, b| a.contains(b)),
        BinaryOp::In => membership(&lhs, &rhs),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn expect_bool(value: Value, op: &'static str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch {
            op,
            expected: "bool",
            got: other.type_name(),
        }),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
            (*a as f64) == *b
        }
        (a, b) => a == b,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, EvalError> {
    use std::cmp::Ordering;
    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (Value::Int(a), Value::Float(b)) => {
            (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (Value::Float(a), Value::Int(b)) => {
            a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
        }
        (a, b) => {
            return Err(EvalError::TypeMismatch {
                op: "comparison",
                expected: "two numbers or two strings",
                got: if matches!(a, Value::Int(_) | Value::Float(_) | Value::Str(_)) {
                    b.type_name()
                } else {
                    a.type_name()
                },
            })
        }
    };
    Ok(ordering)
}

fn arithmetic_add(lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        _ => numeric(lhs.clone(), rhs.clone(), "+", i64::checked_add, |a, b| a + b),
    }
}

fn numeric(
    lhs: Value,
    rhs: Value,
    op: &'static str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            int_op(*a, *b).map(Value::Int).ok_or(EvalError::Overflow)
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => Err(EvalError::TypeMismatch {
            op,
            expected: "numbers",
            got: if matches!(lhs, Value::Int(_) | Value::Float(_)) {
                rhs.type_name()
            } else {
                lhs.type_name()
            },
        }),
    }
}

fn string_op(
    lhs: &Value,
    rhs: &Value,
    op: &'static str,
    f: fn(&str, &str) -> bool,
) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(f(a, b))),
        _ => Err(EvalError::TypeMismatch {
            op,
            expected: "strings",
            got: if matches!(lhs, Value::Str(_)) {
                rhs.type_name()
            } else {
                lhs.type_name()
            },
        }),
    }
}

fn membership(lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let found = match (lhs, rhs) {
        (Value::Str(item), Value::StrList(items)) => items.iter().any(|i| i == item),
        (Value::Int(item), Value::IntList(items)) => items.contains(item),
        (Value::Float(item), Value::FloatList(items)) => items.contains(item),
        (Value::Str(key), Value::Map(map)) => map.contains_key(key),
        _ => {
            return Err(EvalError::TypeMismatch {
                op: "in",
                expected: "item in matching slice or key in map",
                got: rhs.type_name(),
            })
        }
    };
    Ok(Value::Bool(found))
}

//! Runtime values of the filter language.

use std::collections::BTreeMap;
use std::fmt;

/// A value produced while evaluating a filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    /// Nested records (Room, Source, Target) and tag maps.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::StrList(_) => "string-slice",
            Value::IntList(_) => "int-slice",
            Value::FloatList(_) => "float-slice",
            Value::Map(_) => "map",
        }
    }

    /// Weak conversion to an integer, the way tag updates convert results:
    /// ints pass, floats truncate, numeric strings parse, booleans widen.
    #[must_use]
    pub fn coerce_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Weak conversion to a float.
    #[must_use]
    pub fn coerce_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Weak conversion to a string. Lists and maps do not stringify.
    #[must_use]
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::StrList(items) => write!(f, "{}", items.join(",")),
            Value::IntList(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
            Value::FloatList(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
            Value::Map(_) => write!(f, "<map>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_int_coercion() {
        assert_eq!(Value::Int(7).coerce_int(), Some(7));
        assert_eq!(Value::Float(7.9).coerce_int(), Some(7));
        assert_eq!(Value::Str(" 42 ".into()).coerce_int(), Some(42));
        assert_eq!(Value::Str("x".into()).coerce_int(), None);
        assert_eq!(Value::StrList(vec![]).coerce_int(), None);
    }

    #[test]
    fn float_display_is_shortest_form() {
        assert_eq!(Value::Float(17.1).to_string(), "17.1");
        assert_eq!(Value::Float(0.0).to_string(), "0");
    }
}

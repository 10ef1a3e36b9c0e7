//! Runtime values of the configuration dialect.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value as Json;

use crate::ast::{Param, Stmt};
use crate::error::{Result, ScriptError};

/// A value a script can hold. Dicts preserve insertion order, matching the
/// JSON round-trip behaviour scripts rely on.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ScriptValue>),
    Dict(Vec<(String, ScriptValue)>),
    Function(ScriptFunction),
}

/// A user-defined function (its body plus parameter list).
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

impl ScriptValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::None => "NoneType",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Int(_) => "int",
            ScriptValue::Float(_) => "float",
            ScriptValue::Str(_) => "string",
            ScriptValue::List(_) => "list",
            ScriptValue::Dict(_) => "dict",
            ScriptValue::Function(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::None => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(n) => *n != 0,
            ScriptValue::Float(f) => *f != 0.0,
            ScriptValue::Str(s) => !s.is_empty(),
            ScriptValue::List(items) => !items.is_empty(),
            ScriptValue::Dict(entries) => !entries.is_empty(),
            ScriptValue::Function(_) => true,
        }
    }

    /// Structural equality. Functions are never equal to anything.
    pub fn eq_value(&self, other: &ScriptValue) -> bool {
        match (self, other) {
            (ScriptValue::None, ScriptValue::None) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Int(b)) => a == b,
            (ScriptValue::Float(a), ScriptValue::Float(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Float(b))
            | (ScriptValue::Float(b), ScriptValue::Int(a)) => (*a as f64) == *b,
            (ScriptValue::Str(a), ScriptValue::Str(b)) => a == b,
            (ScriptValue::List(a), ScriptValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_value(y))
            }
            (ScriptValue::Dict(a), ScriptValue::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k == k2 && v.eq_value(v2))
                    })
            }
            _ => false,
        }
    }

    /// Ordering for sorted()/min()/max() and `<` comparisons. Only
    /// number↔number, string↔string, and list↔list compare.
    pub fn compare(&self, other: &ScriptValue) -> Result<Ordering> {
        match (self, other) {
            (ScriptValue::Int(a), ScriptValue::Int(b)) => Ok(a.cmp(b)),
            (ScriptValue::Float(a), ScriptValue::Float(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| ScriptError::exec("cannot order NaN")),
            (ScriptValue::Int(a), ScriptValue::Float(b)) => (*a as f64)
                .partial_cmp(b)
                .ok_or_else(|| ScriptError::exec("cannot order NaN")),
            (ScriptValue::Float(a), ScriptValue::Int(b)) => a
                .partial_cmp(&(*b as f64))
                .ok_or_else(|| ScriptError::exec("cannot order NaN")),
            (ScriptValue::Str(a), ScriptValue::Str(b)) => Ok(a.cmp(b)),
            (ScriptValue::List(a), ScriptValue::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        other => return Ok(other),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => Err(ScriptError::exec(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// `str()` semantics: strings render bare, everything else like repr.
    pub fn to_display_string(&self) -> String {
        match self {
            ScriptValue::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn dict_get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Dict(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<Json> {
        Ok(match self {
            ScriptValue::None => Json::Null,
            ScriptValue::Bool(b) => Json::Bool(*b),
            ScriptValue::Int(n) => Json::Number((*n).into()),
            ScriptValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| ScriptError::exec("cannot encode non-finite float as JSON"))?,
            ScriptValue::Str(s) => Json::String(s.clone()),
            ScriptValue::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.to_json())
                    .collect::<Result<Vec<_>>>()?,
            ),
            ScriptValue::Dict(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json()?);
                }
                Json::Object(map)
            }
            ScriptValue::Function(f) => {
                return Err(ScriptError::exec(format!(
                    "cannot encode function '{}' as JSON",
                    f.name
                )))
            }
        })
    }

    pub fn from_json(json: &Json) -> ScriptValue {
        match json {
            Json::Null => ScriptValue::None,
            Json::Bool(b) => ScriptValue::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ScriptValue::Int(i)
                } else {
                    ScriptValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => ScriptValue::Str(s.clone()),
            Json::Array(items) => {
                ScriptValue::List(items.iter().map(ScriptValue::from_json).collect())
            }
            Json::Object(map) => ScriptValue::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for ScriptValue {
    /// repr()-style rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::None => write!(f, "None"),
            ScriptValue::Bool(true) => write!(f, "True"),
            ScriptValue::Bool(false) => write!(f, "False"),
            ScriptValue::Int(n) => write!(f, "{n}"),
            ScriptValue::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            ScriptValue::Str(s) => write!(f, "{s:?}"),
            ScriptValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ScriptValue::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
            ScriptValue::Function(func) => write!(f, "<function {}>", func.name),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::ast::FunctionDef;

/// Dictionary key: strings and integers only, totally ordered so dict
/// iteration is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::Int(*n),
            Key::Str(s) => Value::Str(s.clone()),
        }
    }

    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int(n) => Some(Key::Int(*n)),
            Value::Bool(b) => Some(Key::Int(i64::from(*b))),
            Value::Str(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A sandbox value. Expressive enough for the allowed stdlib: numbers,
/// strings, sequences, mappings, timestamps, plus user functions and
/// imported module handles (which persist in-process only).
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<Key, Value>),
    Timestamp(DateTime<Utc>),
    Module(&'static str),
    Function(Arc<FunctionDef>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Timestamp(_) => "timestamp",
            Value::Module(_) => "module",
            Value::Function(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            Value::Timestamp(_) | Value::Module(_) | Value::Function(_) => true,
        }
    }

    /// `str()` rendering: bare strings, Python-style containers.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_repr(),
        }
    }

    /// `repr()` rendering: strings quoted, containers recursive.
    pub fn to_repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) => format_float(*x),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_repr()).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dict(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.to_value().to_repr(), v.to_repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Timestamp(ts) => format!("'{}'", ts.to_rfc3339()),
            Value::Module(name) => format!("<module '{name}'>"),
            Value::Function(def) => format!("<function {}>", def.name),
        }
    }

    /// Approximate heap footprint, used for the memory budget.
    pub fn approx_bytes(&self) -> u64 {
        match self {
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) => 8,
            Value::Str(s) => 24 + s.len() as u64,
            Value::List(items) => {
                24 + items.iter().map(|v| 8 + v.approx_bytes()).sum::<u64>()
            }
            Value::Dict(map) => {
                24 + map
                    .iter()
                    .map(|(k, v)| {
                        let key_bytes = match k {
                            Key::Int(_) => 8,
                            Key::Str(s) => 24 + s.len() as u64,
                        };
                        key_bytes + 8 + v.approx_bytes()
                    })
                    .sum::<u64>()
            }
            Value::Timestamp(_) => 16,
            Value::Module(_) => 8,
            Value::Function(_) => 64,
        }
    }

    /// Value equality with int/float cross-comparison, like the source
    /// language.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => {
                i64::from(*a) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_value(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_value(vb))
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for comparisons and `sorted()`. `None` when the two types
    /// are not comparable.
    pub fn cmp_value(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_value(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// Bridge to JSON for the `json` module and the out-of-process wire
    /// format. Functions and modules do not cross this boundary.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::None => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(n) => Some(serde_json::Value::Number((*n).into())),
            Value::Float(x) => serde_json::Number::from_f64(*x).map(serde_json::Value::Number),
            Value::Str(s) => Some(serde_json::Value::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(|v| v.to_json())
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Dict(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.to_string(), v.to_json()?);
                }
                Some(serde_json::Value::Object(obj))
            }
            Value::Timestamp(ts) => Some(serde_json::Value::String(ts.to_rfc3339())),
            Value::Module(_) | Value::Function(_) => None,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Dict(
                obj.iter()
                    .map(|(k, v)| (Key::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if x == x.trunc() && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::List(vec![]).truthy());
        assert!(Value::Int(3).truthy());
        assert!(Value::Str("x".into()).truthy());
    }

    #[test]
    fn repr_matches_source_language() {
        assert_eq!(Value::None.to_repr(), "None");
        assert_eq!(Value::Bool(true).to_repr(), "True");
        assert_eq!(Value::Float(2.0).to_repr(), "2.0");
        assert_eq!(Value::Str("hi".into()).to_repr(), "'hi'");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("a".into())]).to_repr(),
            "[1, 'a']"
        );
    }

    #[test]
    fn display_of_string_is_bare() {
        assert_eq!(Value::Str("hi".into()).to_display(), "hi");
        assert_eq!(Value::Int(5050).to_display(), "5050");
    }

    #[test]
    fn cross_numeric_equality() {
        assert!(Value::Int(2).eq_value(&Value::Float(2.0)));
        assert!(!Value::Int(2).eq_value(&Value::Str("2".into())));
    }

    #[test]
    fn ordering_and_incomparable() {
        assert_eq!(
            Value::Int(1).cmp_value(&Value::Float(1.5)),
            Some(std::cmp::Ordering::Less)
        );
        assert!(Value::Int(1).cmp_value(&Value::Str("a".into())).is_none());
    }

    #[test]
    fn json_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(Key::Str("xs".into()), Value::List(vec![Value::Int(1)]));
        map.insert(Key::Str("name".into()), Value::Str("r".into()));
        let value = Value::Dict(map);
        let json = value.to_json().unwrap();
        let back = Value::from_json(&json);
        assert!(value.eq_value(&back));
    }

    #[test]
    fn function_values_do_not_cross_json() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![],
            body: vec![],
        };
        assert!(Value::Function(Arc::new(def)).to_json().is_none());
    }

    #[test]
    fn approx_bytes_grows_with_content() {
        let small = Value::Str("a".into());
        let big = Value::Str("a".repeat(1000));
        assert!(big.approx_bytes() > small.approx_bytes());
    }
}

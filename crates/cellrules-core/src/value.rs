//! Typed cell values and their raw string encoding

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CellKind;

/// Typed value of a cell
///
/// A cell's typed value is a pure function of its raw string and its
/// [`CellKind`]; see [`CellValue::from_raw`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Encode the value as the raw string stored in a cell
    ///
    /// Booleans encode as "1"/"0". Numbers use the shortest representation,
    /// so `42.0` encodes as "42".
    pub fn to_raw(&self) -> String {
        match self {
            CellValue::Bool(true) => "1".to_string(),
            CellValue::Bool(false) => "0".to_string(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }

    /// Decode a raw string according to the cell kind
    pub fn from_raw(raw: &str, kind: CellKind) -> Self {
        match kind {
            CellKind::Text => CellValue::Text(raw.to_string()),
            CellKind::Boolean | CellKind::Button => CellValue::Bool(raw == "1"),
            CellKind::Float => CellValue::Number(raw.trim().parse().unwrap_or(0.0)),
        }
    }

    /// Boolean view of the value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view of the value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a JSON value for structured argument maps
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

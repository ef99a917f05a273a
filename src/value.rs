//! Typed field values, field bindings and row maps.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A row as returned by the backing store: field name → value.
///
/// `BTreeMap` keeps fields sorted, which is what makes cache keys built from
/// a row independent of the order the caller listed the fields in.
pub type Row = BTreeMap<String, Value>;

/// Field/value predicate of a lookup. Same shape as a [`Row`].
pub type FieldVals = BTreeMap<String, Value>;

/// Sort columns of a paginated query, applied in the given sequence.
pub type OrderBy = Vec<(String, SortDirection)>;

/// Declared storage type of an entity field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    String,
    Binary,
    Float,
    Decimal,
    Bool,
}

/// Sort direction of an `ORDER BY` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// A single field value.
///
/// `Json` only appears at the DAO boundary for blob fields; rows handed to
/// the store or written to the cache carry the encoded `Binary` form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    String(String),
    Binary(Vec<u8>),
    Float(f64),
    Decimal(String),
    Bool(bool),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical, type-tagged text used for hashing into cache keys.
    ///
    /// Tags keep `Integer(1)`, `String("1")` and `Bool(true)` apart.
    pub fn cache_repr(&self) -> String {
        match self {
            Value::Null => "n".to_string(),
            Value::Integer(i) => format!("i:{}", i),
            Value::String(s) => format!("s:{}", s),
            Value::Binary(b) => format!("b:{}", hex::encode(b)),
            Value::Float(f) => format!("f:{}", f),
            Value::Decimal(d) => format!("d:{}", d),
            Value::Bool(b) => format!("t:{}", u8::from(*b)),
            Value::Json(j) => format!("j:{}", j),
        }
    }

    /// Total ordering used by in-process drivers for `ORDER BY`.
    ///
    /// NULL sorts first, like PostgreSQL's `NULLS FIRST` for ascending order.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.cache_repr().cmp(&b.cache_repr()),
            },
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::String(s) | Value::Decimal(s) => write!(f, "{}", s),
            Value::Binary(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl FieldType {
    /// Coerce `value` into this field type.
    ///
    /// NULL binds to every type.
    pub fn bind(self, field: &str, value: Value) -> Result<Value> {
        let mismatch = |v: &Value| {
            Error::ValidationError(format!(
                "field \"{}\" expects {:?}, got {:?}",
                field, self, v
            ))
        };

        let bound = match (self, value) {
            (_, Value::Null) => Value::Null,

            (FieldType::Integer, v @ Value::Integer(_)) => v,
            (FieldType::Integer, Value::Bool(b)) => Value::Integer(i64::from(b)),
            (FieldType::Integer, Value::Float(x))
                if x.fract() == 0.0 && x >= i64::MIN as f64 && x < i64::MAX as f64 =>
            {
                Value::Integer(x as i64)
            }
            (FieldType::Integer, v @ (Value::String(_) | Value::Decimal(_))) => {
                match v.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
                    Some(i) => Value::Integer(i),
                    None => return Err(mismatch(&v)),
                }
            }

            (FieldType::String, v @ Value::String(_)) => v,
            (FieldType::String, Value::Binary(b)) => match String::from_utf8(b) {
                Ok(s) => Value::String(s),
                Err(e) => return Err(mismatch(&Value::Binary(e.into_bytes()))),
            },
            (FieldType::String, v @ Value::Json(_)) => return Err(mismatch(&v)),
            (FieldType::String, v) => Value::String(v.to_string()),

            (FieldType::Binary, v @ Value::Binary(_)) => v,
            (FieldType::Binary, Value::String(s)) => Value::Binary(s.into_bytes()),
            (FieldType::Binary, Value::Json(j)) => Value::Binary(serde_json::to_vec(&j)?),

            (FieldType::Float, Value::Float(x)) => float(x),
            (FieldType::Float, Value::Integer(i)) => Value::Float(i as f64),
            (FieldType::Float, v @ (Value::String(_) | Value::Decimal(_))) => {
                match v.as_str().and_then(|s| s.trim().parse::<f64>().ok()) {
                    Some(x) => float(x),
                    None => return Err(mismatch(&v)),
                }
            }

            (FieldType::Decimal, Value::Integer(i)) => Value::Decimal(i.to_string()),
            (FieldType::Decimal, v @ (Value::Decimal(_) | Value::String(_))) => {
                match v.as_str().and_then(canonical_decimal) {
                    Some(d) => Value::Decimal(d),
                    None => return Err(mismatch(&v)),
                }
            }
            (FieldType::Decimal, Value::Float(x)) => match canonical_decimal(&x.to_string()) {
                Some(d) => Value::Decimal(d),
                None => return Err(mismatch(&Value::Float(x))),
            },

            (FieldType::Bool, v @ Value::Bool(_)) => v,
            (FieldType::Bool, Value::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Bool, Value::String(s)) => match s.as_str() {
                "1" | "true" | "t" => Value::Bool(true),
                "0" | "false" | "f" | "" => Value::Bool(false),
                _ => return Err(mismatch(&Value::String(s))),
            },

            (_, v) => return Err(mismatch(&v)),
        };

        Ok(bound)
    }
}

/// Floats compare equal across signed zeros, so they must also key equal.
fn float(x: f64) -> Value {
    Value::Float(if x == 0.0 { 0.0 } else { x })
}

/// Canonical spelling of a plain decimal literal: no `+`, no leading zeros,
/// no trailing fractional zeros, no sign on zero.
///
/// `None` unless `text` is `[+-]digits[.digits]` (either side may be empty,
/// not both).
fn canonical_decimal(text: &str) -> Option<String> {
    let text = text.trim();
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        digits => digits,
    };
    let frac_part = frac_part.trim_end_matches('0');

    let mut canonical = String::with_capacity(text.len());
    if negative && (int_part != "0" || !frac_part.is_empty()) {
        canonical.push('-');
    }
    canonical.push_str(int_part);
    if !frac_part.is_empty() {
        canonical.push('.');
        canonical.push_str(frac_part);
    }
    Some(canonical)
}

/// Build a [`FieldVals`] from `(field, value)` pairs.
///
/// ```
/// use entity_cache::value::{fieldvals, Value};
///
/// let f = fieldvals([("name", Value::from("alpha")), ("id", Value::from(1))]);
/// assert_eq!(f.keys().collect::<Vec<_>>(), vec!["id", "name"]);
/// ```
pub fn fieldvals<I, K, V>(pairs: I) -> FieldVals
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

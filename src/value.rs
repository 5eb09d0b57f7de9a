// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::RuleError;
use crate::region::{Footprint, Id, Relocate};
use crate::*;

use core::fmt;
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Result set returned by a catalog query, one `Vec` per row in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    pub columns: Vec<Rc<str>>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Row `idx` as a column name to value collection.
    pub fn row(&self, idx: usize) -> Option<Value> {
        let row = self.rows.get(idx)?;
        let map: BTreeMap<Rc<str>, Value> = self
            .columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect();
        Some(Value::KeyValue(Rc::new(map)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Int(i64),
    Double(f64),
    Bool(bool),
    String(Rc<str>),
    Path(Rc<str>),
    /// Seconds since the epoch.
    Time(i64),
    List(Rc<Vec<Value>>),
    Tuple(Rc<Vec<Value>>),
    /// Value built by a user-declared constructor.
    Cons {
        name: Rc<str>,
        args: Rc<Vec<Value>>,
    },

    // Host structures.
    KeyValue(Rc<BTreeMap<Rc<str>, Value>>),
    IntArray(Rc<Vec<i64>>),
    StrArray(Rc<Vec<Rc<str>>>),
    Rows(Rc<Rows>),
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Unit => serializer.serialize_none(),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::String(s) | Value::Path(s) => serializer.serialize_str(s.as_ref()),
            Value::Time(t) => serializer.serialize_i64(*t),
            Value::List(a) | Value::Tuple(a) => a.serialize(serializer),
            Value::Cons { name, args } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(name.as_ref(), args.as_ref())?;
                map.end()
            }
            Value::KeyValue(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields.iter() {
                    map.serialize_entry(k.as_ref(), v)?;
                }
                map.end()
            }
            Value::IntArray(a) => a.serialize(serializer),
            Value::StrArray(a) => a.serialize(serializer),
            Value::Rows(r) => {
                let rows: Vec<Value> = (0..r.rows.len()).filter_map(|i| r.row(i)).collect();
                rows.serialize(serializer)
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a value")
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Unit)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Bool(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match i64::try_from(v) {
            Ok(i) => Ok(Value::Int(i)),
            Err(_) => Ok(Value::Double(v as f64)),
        }
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Int(v))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Double(v))
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::String(s.into()))
    }

    fn visit_string<E>(self, s: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Value::String(s.into()))
    }

    fn visit_seq<V>(self, mut visitor: V) -> Result<Self::Value, V::Error>
    where
        V: SeqAccess<'de>,
    {
        let mut arr = vec![];
        while let Some(v) = visitor.next_element()? {
            arr.push(v);
        }
        Ok(Value::from(arr))
    }

    fn visit_map<V>(self, mut visitor: V) -> Result<Self::Value, V::Error>
    where
        V: MapAccess<'de>,
    {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = visitor.next_entry::<String, Value>()? {
            map.insert(Rc::from(key.as_str()), value);
        }
        Ok(Value::KeyValue(Rc::new(map)))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

fn join(f: &mut fmt::Formatter, items: impl Iterator<Item = String>, sep: &str) -> fmt::Result {
    for (idx, s) in items.enumerate() {
        if idx > 0 {
            f.write_str(sep)?;
        }
        f.write_str(&s)?;
    }
    Ok(())
}

/// Text form used by `str`, `writeLine` and string interpolation.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Unit => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) | Value::Path(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{t}"),
            Value::List(items) => {
                f.write_str("[")?;
                join(f, items.iter().map(|v| v.to_string()), ",")?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                join(f, items.iter().map(|v| v.to_string()), ",")?;
                f.write_str(")")
            }
            Value::Cons { name, args } => {
                write!(f, "{name}(")?;
                join(f, args.iter().map(|v| v.to_string()), ",")?;
                f.write_str(")")
            }
            Value::KeyValue(m) => join(f, m.iter().map(|(k, v)| format!("{k}={v}")), "++++"),
            Value::IntArray(a) => join(f, a.iter().map(|v| v.to_string()), ","),
            Value::StrArray(a) => join(f, a.iter().map(|v| v.to_string()), ","),
            Value::Rows(r) => write!(f, "<{} rows>", r.rows.len()),
        }
    }
}

impl Footprint for Value {
    fn footprint(&self) -> usize {
        let payload = match self {
            Value::String(s) | Value::Path(s) => s.len(),
            Value::List(a) | Value::Tuple(a) => a.iter().map(|v| v.footprint()).sum(),
            Value::Cons { name, args } => {
                name.len() + args.iter().map(|v| v.footprint()).sum::<usize>()
            }
            Value::KeyValue(m) => m.iter().map(|(k, v)| k.len() + v.footprint()).sum(),
            Value::IntArray(a) => a.len() * core::mem::size_of::<i64>(),
            Value::StrArray(a) => a.iter().map(|s| s.len()).sum(),
            Value::Rows(r) => r
                .rows
                .iter()
                .flat_map(|row| row.iter())
                .map(|v| v.footprint())
                .sum(),
            _ => 0,
        };
        core::mem::size_of::<Value>() + payload
    }
}

// Values own their payloads, so relocating one is a plain copy.
impl Relocate for Value {
    fn relocate(&self, _map: &mut dyn FnMut(Id<Self>) -> Result<Id<Self>>) -> Result<Self> {
        Ok(self.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::List(Rc::new(a))
    }
}

impl Value {
    pub fn from_json_str(json: &str) -> Result<Value> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_str(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse command-line input: JSON when it parses as such, a plain
    /// string otherwise.
    pub fn from_input(text: &str) -> Value {
        match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => Value::from(text),
        }
    }

    /// Name of the runtime type, as reported by the `type` builtin.
    pub fn type_name(&self) -> String {
        match self {
            Value::Unit => "unit".to_string(),
            Value::Int(_) => "integer".to_string(),
            Value::Double(_) => "double".to_string(),
            Value::Bool(_) => "boolean".to_string(),
            Value::String(_) => "string".to_string(),
            Value::Path(_) => "path".to_string(),
            Value::Time(_) => "time".to_string(),
            Value::List(items) => match items.first() {
                Some(v) => format!("list {}", v.type_name()),
                None => "list ?".to_string(),
            },
            Value::Tuple(items) => {
                let names: Vec<String> = items.iter().map(|v| v.type_name()).collect();
                format!("<{}>", names.join(" * "))
            }
            Value::Cons { name, .. } => name.to_string(),
            Value::KeyValue(_) => "KeyValPair_PI".to_string(),
            Value::IntArray(_) => "IntArray_PI".to_string(),
            Value::StrArray(_) => "StrArray_PI".to_string(),
            Value::Rows(_) => "GenQueryOut_PI".to_string(),
        }
    }

    fn type_error(&self, expected: &str) -> anyhow::Error {
        RuleError::UnsupportedOp(format!(
            "expected {expected}, got {} `{self}`",
            self.type_name()
        ))
        .into()
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(self.type_error("integer")),
        }
    }

    /// Numeric value, integers widened to double.
    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Double(d) => Ok(*d),
            _ => Err(self.type_error("double")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(self.type_error("boolean")),
        }
    }

    /// Text of a string or path.
    pub fn as_str(&self) -> Result<&Rc<str>> {
        match self {
            Value::String(s) | Value::Path(s) => Ok(s),
            _ => Err(self.type_error("string")),
        }
    }

    pub fn as_time(&self) -> Result<i64> {
        match self {
            Value::Time(t) => Ok(*t),
            _ => Err(self.type_error("time")),
        }
    }

    pub fn as_list(&self) -> Result<&Rc<Vec<Value>>> {
        match self {
            Value::List(items) => Ok(items),
            _ => Err(self.type_error("list")),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    /// Structural equality, with integers and doubles compared numerically.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a) | Value::Path(a), Value::String(b) | Value::Path(b)) => a == b,
            _ => self == other,
        }
    }

    /// Ordering used by the comparison operators.
    pub fn compare(&self, other: &Value) -> Result<core::cmp::Ordering> {
        use core::cmp::Ordering;
        Ok(match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (a, b) = (a.as_double()?, b.as_double()?);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a) | Value::Path(a), Value::String(b) | Value::Path(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => bail!(RuleError::UnsupportedOp(format!(
                "cannot compare {} with {}",
                self.type_name(),
                other.type_name()
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_input_maps_to_rule_values() -> Result<()> {
        let v = Value::from_json_str(r#"{"n": 5, "d": 1.5, "s": "x", "l": [1, 2]}"#)?;
        let Value::KeyValue(m) = v else {
            bail!("expected a key-value collection");
        };
        assert_eq!(m["n"], Value::Int(5));
        assert_eq!(m["d"], Value::Double(1.5));
        assert_eq!(m["s"], Value::from("x"));
        assert_eq!(m["l"], Value::from(vec![Value::Int(1), Value::Int(2)]));
        Ok(())
    }

    #[test]
    fn plain_input_is_a_string() {
        assert_eq!(Value::from_input("hello"), Value::from("hello"));
        assert_eq!(Value::from_input("7"), Value::Int(7));
    }

    #[test]
    fn mixed_numeric_comparison() -> Result<()> {
        assert!(Value::Int(2).loose_eq(&Value::Double(2.0)));
        assert_eq!(
            Value::Int(1).compare(&Value::Double(1.5))?,
            core::cmp::Ordering::Less
        );
        assert!(Value::from("a").compare(&Value::Int(1)).is_err());
        Ok(())
    }
}

//! Scalar-only record metadata.
//!
//! The index accepts strings, integers, floats and booleans as metadata
//! values. [`Metadata::from_json`] rejects anything else, while
//! [`Metadata::coerce`] turns arrays and objects into their JSON text and drops
//! nulls so callers holding loosely typed values can still insert them.

use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MetadataValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(MetadataValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    /// Strict conversion: any non-scalar value fails with `MetadataType`.
    pub fn from_json(raw: &Map<String, Value>) -> Result<Self, IndexError> {
        let mut metadata = Self::new();
        for (key, value) in raw {
            let scalar = scalar(value).ok_or_else(|| IndexError::MetadataType {
                key: key.clone(),
                found: kind_of(value).to_string(),
            })?;
            metadata.0.insert(key.clone(), scalar);
        }
        Ok(metadata)
    }

    /// Lossy conversion: arrays and objects become JSON text, nulls are dropped.
    pub fn coerce(raw: &Map<String, Value>) -> Self {
        let mut metadata = Self::new();
        for (key, value) in raw {
            let coerced = match value {
                Value::Null => None,
                Value::Array(_) | Value::Object(_) => Some(MetadataValue::Str(value.to_string())),
                other => scalar(other),
            };
            if let Some(coerced) = coerced {
                metadata.0.insert(key.clone(), coerced);
            }
        }
        metadata
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(key, value)| {
                let json = match value {
                    MetadataValue::Bool(flag) => Value::Bool(*flag),
                    MetadataValue::Int(number) => Value::from(*number),
                    MetadataValue::Float(number) => Value::from(*number),
                    MetadataValue::Str(text) => Value::String(text.clone()),
                };
                (key.clone(), json)
            })
            .collect()
    }
}

impl FromIterator<(String, MetadataValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetadataValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn scalar(value: &Value) -> Option<MetadataValue> {
    match value {
        Value::Bool(flag) => Some(MetadataValue::Bool(*flag)),
        Value::String(text) => Some(MetadataValue::Str(text.clone())),
        Value::Number(number) => number
            .as_i64()
            .map(MetadataValue::Int)
            .or_else(|| number.as_f64().map(MetadataValue::Float)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

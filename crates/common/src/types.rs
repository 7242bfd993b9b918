//! Common data types for media cluster components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A scalar application metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SimpleValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl From<&str> for SimpleValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for SimpleValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for SimpleValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for SimpleValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for SimpleValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

/// Opaque application metadata attached to workers and resources.
///
/// A `BTreeMap` keeps serialization order stable, which keeps state
/// comparisons and logs deterministic.
pub type SimpleMap = BTreeMap<String, SimpleValue>;

/// Generate a new random identifier for a worker or resource.
///
/// Ids are UUID v4 in simple (hyphen-free) form, safe to embed in bus topics.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

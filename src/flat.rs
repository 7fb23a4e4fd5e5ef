// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;
use std::collections::btree_map::Iter;
use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// A single flat-format value. The flat wire format only distinguishes
/// strings, numbers and booleans.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for FlatValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlatValue::Text(s) => write!(f, "{s}"),
            FlatValue::Number(n) => write!(f, "{n}"),
            FlatValue::Integer(i) => write!(f, "{i}"),
            FlatValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl Serialize for FlatValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FlatValue::Text(s) => serializer.serialize_str(s),
            FlatValue::Number(n) => serializer.serialize_f64(*n),
            FlatValue::Integer(i) => serializer.serialize_i64(*i),
            FlatValue::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

/// The produced openEHR flat composition: fully-resolved path -> value.
///
/// Keys are `/`-delimited path segments with occurrence indices rendered
/// as `segment:N` and attribute qualifiers as `segment|qualifier`. This
/// format is a stable wire contract consumed by the downstream flat-format
/// unmarshaller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatRecord {
    entries: BTreeMap<String, FlatValue>,
}

impl FlatRecord {
    pub fn new() -> FlatRecord {
        FlatRecord {
            entries: BTreeMap::new(),
        }
    }

    /// Writes an entry, applying the temporal-context boundary policy:
    /// a context start-time keeps the earliest value ever written, a
    /// context end-time keeps the latest. Everything else overwrites.
    pub fn insert(&mut self, path: &str, value: FlatValue) {
        if let FlatValue::Text(new) = &value {
            if is_context_start(path) {
                if let Some(FlatValue::Text(existing)) = self.entries.get(path) {
                    if !is_before(new, existing) {
                        return;
                    }
                }
            } else if is_context_end(path) {
                if let Some(FlatValue::Text(existing)) = self.entries.get(path) {
                    if is_before(new, existing) {
                        return;
                    }
                }
            }
        }
        self.entries.insert(path.to_string(), value);
    }

    pub fn insert_text(&mut self, path: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        self.insert(path, FlatValue::Text(value.to_string()));
    }

    pub fn get(&self, path: &str) -> Option<&FlatValue> {
        self.entries.get(path)
    }

    pub fn get_text(&self, path: &str) -> Option<&str> {
        match self.entries.get(path) {
            Some(FlatValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, FlatValue> {
        self.entries.iter()
    }

    /// All paths matching a pattern produced by
    /// [`crate::paths::simplified_flat_regex`].
    pub fn matching_paths(&self, pattern: &regex::Regex) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .map(String::as_str)
            .collect()
    }

    pub fn to_json_str(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Serialize for FlatRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in self.entries.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'a> IntoIterator for &'a FlatRecord {
    type Item = (&'a String, &'a FlatValue);
    type IntoIter = Iter<'a, String, FlatValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn is_context_start(path: &str) -> bool {
    path.contains("/context/") && path.ends_with("start_time")
}

fn is_context_end(path: &str) -> bool {
    path.ends_with("_end_time") || path.ends_with("/end_time")
}

/// Chronological comparison with a lexicographic fallback for values that
/// do not parse as timestamps.
fn is_before(a: &str, b: &str) -> bool {
    match (parse_temporal(a), parse_temporal(b)) {
        (Some(ta), Some(tb)) => ta < tb,
        _ => a < b,
    }
}

fn parse_temporal(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

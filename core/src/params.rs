//! Request parameters and their flattened, percent-escaped form.
//!
//! # Design
//! `Parameters` keeps insertion order so the flattened query string (and the
//! multipart part order) is deterministic: arrays expand to `key[]`, nested
//! maps to `key[child]`, and scalars end the recursion with one pair each.
//! A `ParamValue::Part` anywhere in the map switches the whole request to
//! multipart encoding.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::multipart::MultipartData;

/// Everything except RFC 3986 unreserved characters, so delimiters such as
/// `[]:/?&=;+!@#$()',*` never leak into a key or value unescaped.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
    List(Vec<ParamValue>),
    Map(Parameters),
    Part(MultipartData),
}

impl ParamValue {
    fn contains_part(&self) -> bool {
        match self {
            ParamValue::Part(_) => true,
            ParamValue::List(items) => items.iter().any(ParamValue::contains_part),
            ParamValue::Map(map) => map.has_multipart_data(),
            _ => false,
        }
    }
}

/// Insertion-ordered map from parameter name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: Vec<(String, ParamValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any value, at any depth, is a `MultipartData`.
    pub fn has_multipart_data(&self) -> bool {
        self.entries.iter().any(|(_, v)| v.contains_part())
    }

    /// Flatten nested lists and maps into bracket-notated leaf pairs, in
    /// traversal order.
    pub fn flatten(&self) -> Vec<(String, Leaf<'_>)> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            flatten_value(key.clone(), value, &mut out);
        }
        out
    }

    /// The `k=v&k=v` form used for query strings and form bodies.
    ///
    /// Returns `None` if a `MultipartData` value is present, since it has no
    /// textual form.
    pub fn to_query_string(&self) -> Option<String> {
        let pairs = self
            .flatten()
            .into_iter()
            .map(|(key, leaf)| match leaf {
                Leaf::Text(value) => Some(format!("{}={}", escape(&key), escape(&value))),
                Leaf::Part(_) => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(pairs.join("&"))
    }

    /// Build parameters from a JSON object; other JSON values yield `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(
                map.into_iter()
                    .map(|(k, v)| (k, ParamValue::from(v)))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// A flattened leaf: either text or a multipart payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf<'a> {
    Text(String),
    Part(&'a MultipartData),
}

fn flatten_value<'a>(key: String, value: &'a ParamValue, out: &mut Vec<(String, Leaf<'a>)>) {
    match value {
        ParamValue::List(items) => {
            let label = format!("{key}[]");
            for item in items {
                flatten_value(label.clone(), item, out);
            }
        }
        ParamValue::Map(map) => {
            for (child, nested) in map.iter() {
                flatten_value(format!("{key}[{child}]"), nested, out);
            }
        }
        ParamValue::Text(s) => out.push((key, Leaf::Text(s.clone()))),
        ParamValue::Number(n) => out.push((key, Leaf::Text(n.to_string()))),
        ParamValue::Bool(b) => out.push((key, Leaf::Text(b.to_string()))),
        ParamValue::Part(part) => out.push((key, Leaf::Part(part))),
    }
}

/// Percent-escape one query component.
pub fn escape(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_COMPONENT).to_string()
}

impl FromIterator<(String, ParamValue)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl<K: Into<String>, V: Into<ParamValue>, const N: usize> From<[(K, V); N]> for Parameters {
    fn from(entries: [(K, V); N]) -> Self {
        let mut params = Parameters::new();
        for (k, v) in entries {
            params.insert(k, v);
        }
        params
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Number(n.into())
    }
}

impl From<i32> for ParamValue {
    fn from(n: i32) -> Self {
        ParamValue::Number(n.into())
    }
}

impl From<u64> for ParamValue {
    fn from(n: u64) -> Self {
        ParamValue::Number(n.into())
    }
}

/// Non-finite floats have no JSON form and become text.
impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(ParamValue::Number)
            .unwrap_or_else(|| ParamValue::Text(n.to_string()))
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(items: Vec<T>) -> Self {
        ParamValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Parameters> for ParamValue {
    fn from(map: Parameters) -> Self {
        ParamValue::Map(map)
    }
}

impl From<MultipartData> for ParamValue {
    fn from(part: MultipartData) -> Self {
        ParamValue::Part(part)
    }
}

/// JSON `null` becomes an empty string.
impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ParamValue::Text(String::new()),
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) => ParamValue::Number(n),
            Value::String(s) => ParamValue::Text(s),
            Value::Array(items) => ParamValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => ParamValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ParamValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::Text(s) => serializer.serialize_str(s),
            ParamValue::Number(n) => n.serialize(serializer),
            ParamValue::Bool(b) => serializer.serialize_bool(*b),
            ParamValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ParamValue::Map(map) => map.serialize(serializer),
            ParamValue::Part(part) => Err(S::Error::custom(format!(
                "multipart data `{}` cannot be encoded as JSON",
                part.name
            ))),
        }
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

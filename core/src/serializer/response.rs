//! Validates responses and turns bodies into application values.
//!
//! # Design
//! A `ResponseSerializer` is two injected functions. The built-ins are
//! `json()` (status and body-shape validation) and `string()` (status only),
//! and either function can be swapped independently or both supplied through
//! `custom`, so callers are never limited to tweaking a built-in.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::IgnoredAny;
use serde::Deserialize;

use crate::error::{HttpError, Result};
use crate::http::HttpResponse;

pub type ValidateFn = Arc<dyn Fn(&HttpResponse, &[u8]) -> Result<()> + Send + Sync>;
pub type DeserializeFn = Arc<dyn Fn(&[u8], u16) -> Payload + Send + Sync>;

/// The value a completed request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No body, or a body the deserializer could not turn into a value.
    Empty,
    Json(serde_json::Value),
    Text(String),
    /// Final location of a downloaded file.
    File(PathBuf),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&PathBuf> {
        match self {
            Payload::File(path) => Some(path),
            _ => None,
        }
    }
}

/// Built-in response serializer selection for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseEncoding {
    #[default]
    Json,
    Text,
}

#[derive(Clone)]
pub struct ResponseSerializer {
    name: &'static str,
    validate: ValidateFn,
    deserialize: DeserializeFn,
}

impl fmt::Debug for ResponseSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSerializer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Default for ResponseSerializer {
    fn default() -> Self {
        Self::json()
    }
}

impl ResponseSerializer {
    /// Fails on a non-2xx status, or on a body that is not JSON. An empty body
    /// is not JSON; use `string()` for HEAD or 204 responses.
    pub fn json() -> Self {
        Self {
            name: "json",
            validate: Arc::new(validate_json),
            deserialize: Arc::new(deserialize_json),
        }
    }

    /// Status-only validation; the body is decoded as UTF-8 text.
    pub fn string() -> Self {
        Self {
            name: "string",
            validate: Arc::new(validate_status),
            deserialize: Arc::new(|body: &[u8], _status: u16| {
                Payload::Text(String::from_utf8_lossy(body).into_owned())
            }),
        }
    }

    pub fn custom<V, D>(validate: V, deserialize: D) -> Self
    where
        V: Fn(&HttpResponse, &[u8]) -> Result<()> + Send + Sync + 'static,
        D: Fn(&[u8], u16) -> Payload + Send + Sync + 'static,
    {
        Self {
            name: "custom",
            validate: Arc::new(validate),
            deserialize: Arc::new(deserialize),
        }
    }

    pub fn from_encoding(encoding: ResponseEncoding) -> Self {
        match encoding {
            ResponseEncoding::Json => Self::json(),
            ResponseEncoding::Text => Self::string(),
        }
    }

    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: Fn(&HttpResponse, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.validate = Arc::new(validate);
        self
    }

    pub fn with_deserializer<D>(mut self, deserialize: D) -> Self
    where
        D: Fn(&[u8], u16) -> Payload + Send + Sync + 'static,
    {
        self.deserialize = Arc::new(deserialize);
        self
    }

    pub fn validate(&self, response: &HttpResponse, body: &[u8]) -> Result<()> {
        (self.validate)(response, body)
    }

    pub fn deserialize(&self, body: &[u8], status: u16) -> Payload {
        (self.deserialize)(body, status)
    }
}

/// Reject any status outside `[200, 300)`.
pub fn validate_status(response: &HttpResponse, body: &[u8]) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(HttpError::bad_status(response, body))
    }
}

fn validate_json(response: &HttpResponse, body: &[u8]) -> Result<()> {
    validate_status(response, body)?;
    serde_json::from_slice::<IgnoredAny>(body)
        .map(|_| ())
        .map_err(|e| HttpError::bad_body(response, e.to_string()))
}

fn deserialize_json(body: &[u8], _status: u16) -> Payload {
    if body.is_empty() {
        return Payload::Empty;
    }
    serde_json::from_slice(body)
        .map(Payload::Json)
        .unwrap_or(Payload::Empty)
}

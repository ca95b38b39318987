//! Error types for the HTTP layer.
//!
//! # Design
//! Every failure reaches the caller through the verb's `Result`; nothing is
//! thrown across the transport boundary. `BadStatus` and `BadBody` carry the
//! response head so callers can inspect what the server actually sent. The
//! numeric `code()` keeps the distinguished values callers match on.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;

use crate::http::HttpResponse;

/// Boxed error type used at collaborator seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Code reported by `HttpError::BadBody`.
pub const BAD_SERVER_RESPONSE: i64 = -1011;

/// Code reported for cancelled tasks, including refused auth challenges.
pub const CANCELLED: i64 = -999;

/// Code for every other failure without a more specific code.
pub const UNKNOWN: i64 = -1;

/// Network-level failures reported by a `Transport`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("task was cancelled")]
    Cancelled,
}

/// Errors returned by `Http` verbs and the serializers.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The transport failed before a usable response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The authorization module refused access; no request was sent.
    #[error("authorization failed: {0}")]
    Authorization(#[source] BoxError),

    /// The status code was outside `[200, 300)`.
    #[error("HTTP {status}: {}", reason_phrase(.status))]
    BadStatus {
        status: u16,
        response: Box<HttpResponse>,
        body: Bytes,
    },

    /// The body could not be parsed by the response serializer.
    #[error("invalid response received, can't parse body: {reason}")]
    BadBody {
        response: Box<HttpResponse>,
        reason: String,
    },

    /// Moving a finished download into place failed.
    #[error("could not store download at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Parameters could not be encoded for the chosen serializer.
    #[error("could not serialize request: {0}")]
    Serialization(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HttpError {
    pub fn bad_status(response: &HttpResponse, body: &[u8]) -> Self {
        HttpError::BadStatus {
            status: response.status,
            response: Box::new(response.clone()),
            body: Bytes::copy_from_slice(body),
        }
    }

    pub fn bad_body(response: &HttpResponse, reason: impl Into<String>) -> Self {
        HttpError::BadBody {
            response: Box::new(response.clone()),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            HttpError::BadStatus { status, .. } => i64::from(*status),
            HttpError::BadBody { .. } => BAD_SERVER_RESPONSE,
            HttpError::Transport(TransportError::Cancelled) => CANCELLED,
            _ => UNKNOWN,
        }
    }

    /// The offending response, for status and body errors.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            HttpError::BadStatus { response, .. } | HttpError::BadBody { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HttpError::Transport(TransportError::Cancelled))
    }
}

fn reason_phrase(status: &u16) -> &'static str {
    reqwest::StatusCode::from_u16(*status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown status")
}

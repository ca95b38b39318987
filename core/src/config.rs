//! Configuration for building an `Http` instance.
//!
//! Values come from code, from any serde source (`HttpConfig` is
//! `Deserialize` with defaults for every field) or from `COURIER_*`
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HttpError, Result};
use crate::serializer::{RequestEncoding, RequestSerializer, ResponseEncoding};

pub const ENV_BASE_URL: &str = "COURIER_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "COURIER_TIMEOUT_SECS";
pub const ENV_DOWNLOAD_DIR: &str = "COURIER_DOWNLOAD_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub download_dir: Option<PathBuf>,
    pub request_encoding: RequestEncoding,
    pub response_encoding: ResponseEncoding,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: RequestSerializer::DEFAULT_TIMEOUT.as_secs(),
            download_dir: None,
            request_encoding: RequestEncoding::default(),
            response_encoding: ResponseEncoding::default(),
        }
    }
}

impl HttpConfig {
    /// Defaults overridden by whichever `COURIER_*` variables are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            config.base_url = Some(base_url);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            config.timeout_secs = raw.trim().parse().map_err(|_| {
                HttpError::Config(format!("{ENV_TIMEOUT_SECS} must be whole seconds, got {raw:?}"))
            })?;
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR) {
            config.download_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_serializer(&self) -> RequestSerializer {
        RequestSerializer::new(self.request_encoding).with_timeout(self.timeout())
    }
}

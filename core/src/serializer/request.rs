//! Builds wire-level requests from method, URL, parameters and headers.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{HttpError, Result};
use crate::http::{HttpMethod, HttpRequest};
use crate::multipart;
use crate::params::Parameters;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body encoding used for POST and PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEncoding {
    FormUrlEncoded,
    #[default]
    Json,
}

#[derive(Debug, Clone)]
pub struct RequestSerializer {
    encoding: RequestEncoding,
    timeout: Duration,
}

impl Default for RequestSerializer {
    fn default() -> Self {
        Self::new(RequestEncoding::default())
    }
}

impl RequestSerializer {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(encoding: RequestEncoding) -> Self {
        Self {
            encoding,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn form() -> Self {
        Self::new(RequestEncoding::FormUrlEncoded)
    }

    pub fn json() -> Self {
        Self::new(RequestEncoding::Json)
    }

    /// Timeout copied onto every built request for the transport to enforce.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn encoding(&self) -> RequestEncoding {
        self.encoding
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a request with parameters in the query string (GET, HEAD,
    /// DELETE) or in a form/JSON body (POST, PUT).
    pub fn build_request(
        &self,
        url: &Url,
        method: HttpMethod,
        parameters: Option<&Parameters>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<HttpRequest> {
        let mut request = HttpRequest::new(method, url.as_str(), self.timeout);
        request.add_headers(headers);

        if method.encodes_in_url() {
            if let Some(params) = parameters {
                let query = query_string(params)?;
                if !query.is_empty() {
                    request.url = append_query(url, &query);
                }
            }
            return Ok(request);
        }

        match self.encoding {
            RequestEncoding::FormUrlEncoded => {
                request.set_header_if_absent("Content-Type", FORM_CONTENT_TYPE);
                if let Some(params) = parameters {
                    set_body(&mut request, query_string(params)?.into_bytes());
                }
            }
            RequestEncoding::Json => {
                request.set_header_if_absent("Content-Type", JSON_CONTENT_TYPE);
                if let Some(params) = parameters {
                    let body = serde_json::to_vec(params)
                        .map_err(|e| HttpError::Serialization(e.to_string()))?;
                    set_body(&mut request, body);
                }
            }
        }
        Ok(request)
    }

    /// Build a `multipart/form-data` request with a fresh boundary. Every
    /// parameter becomes one part.
    pub fn build_multipart_request(
        &self,
        url: &Url,
        method: HttpMethod,
        parameters: Option<&Parameters>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<HttpRequest> {
        let mut request = HttpRequest::new(method, url.as_str(), self.timeout);
        request.add_headers(headers);

        let empty = Parameters::new();
        let boundary = multipart::generate_boundary();
        let body = multipart::encode_body(parameters.unwrap_or(&empty), &boundary);

        request.set_header("Content-Type", format!("multipart/form-data; boundary={boundary}"));
        set_body(&mut request, body);
        Ok(request)
    }
}

fn query_string(params: &Parameters) -> Result<String> {
    params.to_query_string().ok_or_else(|| {
        HttpError::Serialization("multipart data requires a multipart request".to_string())
    })
}

fn append_query(url: &Url, query: &str) -> String {
    let mut base = url.clone();
    let fragment = base.fragment().map(str::to_string);
    base.set_fragment(None);

    let separator = if base.query().is_some() { '&' } else { '?' };
    let mut target = format!("{base}{separator}{query}");
    if let Some(fragment) = fragment {
        target.push('#');
        target.push_str(&fragment);
    }
    target
}

fn set_body(request: &mut HttpRequest, body: Vec<u8>) {
    request.set_header("Content-Length", body.len().to_string());
    request.body = Some(body);
}

//! HTTP transport types shared by the serializers, the registry and the
//! transport collaborator.
//!
//! # Design
//! Requests and responses are plain data. The serializers build an
//! `HttpRequest`, a `Transport` executes it, and the response head comes back
//! as an `HttpResponse` with the body delivered separately so it can be
//! accumulated by the task's delegate. All fields use owned types so values
//! can move freely across transport-managed threads.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Delete,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }

    /// Whether parameters travel in the query string rather than the body.
    pub fn encodes_in_url(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request described as plain data.
///
/// Built by `RequestSerializer` and handed to the transport unchanged.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace any existing value for `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn set_header_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if self.header(name).is_none() {
            self.headers.push((name.to_string(), value.into()));
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub(crate) fn add_headers(&mut self, fields: Option<&HashMap<String, String>>) {
        if let Some(fields) = fields {
            for (name, value) in fields {
                self.set_header(name, value.clone());
            }
        }
    }
}

/// The head of an HTTP response: status, final URL and headers.
///
/// The body is accumulated by the task delegate and passed next to this
/// value wherever both are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn new(status: u16, url: impl Into<String>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Filename the server suggests for a downloaded body.
    ///
    /// Taken from `Content-Disposition: ...; filename="..."` when present,
    /// otherwise from the last path segment of the response URL. Directory
    /// components are stripped so the name can never escape the destination
    /// directory.
    pub fn suggested_filename(&self) -> String {
        let from_disposition = self
            .header("content-disposition")
            .and_then(disposition_filename);
        let from_url = url::Url::parse(&self.url).ok().and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .filter(|segment| !segment.is_empty())
        });

        from_disposition
            .or(from_url)
            .and_then(|name| {
                Path::new(&name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "download".to_string())
    }
}

fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|param| {
        let (key, raw) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// User/password pair answered to basic authentication challenges.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Merge two optional field maps; entries in `extra` win.
pub fn merge_headers(
    base: Option<&HashMap<String, String>>,
    extra: Option<&HashMap<String, String>>,
) -> Option<HashMap<String, String>> {
    match (base, extra) {
        (None, None) => None,
        (base, extra) => {
            let mut merged = base.cloned().unwrap_or_default();
            if let Some(extra) = extra {
                merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(merged)
        }
    }
}

//! `multipart/form-data` payloads and body encoding.

use std::io;
use std::path::Path;

use bytes::Bytes;
use uuid::Uuid;

use crate::params::{Leaf, Parameters};

/// A binary payload placed in a parameter map. Its presence forces the whole
/// request to multipart encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartData {
    pub name: String,
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl MultipartData {
    pub fn new(
        data: impl Into<Bytes>,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a local file; both `name` and `filename` become its last path
    /// component.
    pub fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> io::Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let data = std::fs::read(path)?;
        Ok(Self::new(data, file_name.clone(), file_name, mime_type))
    }
}

/// A fresh boundary token, unique per request.
pub fn generate_boundary() -> String {
    format!("courier-boundary-{}", Uuid::new_v4().simple())
}

/// Escape a `Content-Disposition` parameter value the way browsers do for
/// `multipart/form-data`: `"`, CR and LF are percent-encoded.
fn disposition_value(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Encode every flattened parameter as one MIME part.
///
/// Scalars become plain form fields under their (bracket-notated) key;
/// `MultipartData` leaves carry `filename` and `Content-Type`.
pub fn encode_body(parameters: &Parameters, boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();

    for (key, leaf) in parameters.flatten() {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match leaf {
            Leaf::Text(value) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        disposition_value(&key)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Leaf::Part(part) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                        disposition_value(&key),
                        disposition_value(&part.filename)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", part.mime_type).as_bytes());
                body.extend_from_slice(&part.data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

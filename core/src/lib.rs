//! Asynchronous HTTP client core with pluggable transport, serializers and
//! authorization.
//!
//! # Overview
//! `Http` resolves paths against a base URL, encodes parameters through a
//! `RequestSerializer`, and hands the resulting `HttpRequest` to an injected
//! `Transport`. Transport events are routed through a per-instance
//! `TaskRegistry` to one delegate per task, which accumulates the body,
//! reports progress, moves downloads into place and finally resolves the
//! caller's future through the `ResponseSerializer`.
//!
//! # Design
//! - Requests and responses are plain data (`http` module), so serializers
//!   and delegates are testable without a network.
//! - The network lives behind the `Transport` trait. `ReqwestTransport` is
//!   the production implementation; tests script their own.
//! - An optional `AuthzModule` gates every request and gets one chance to
//!   refresh access after a 401.
//! - Every verb returns `Result<Payload, HttpError>`; progress callbacks are
//!   the only other way results leave the crate.

pub mod authz;
pub mod client;
pub mod config;
pub mod error;
pub mod fs;
pub mod http;
pub mod multipart;
pub mod params;
pub mod registry;
pub mod serializer;
pub mod transport;

pub use authz::AuthzModule;
pub use client::{DownloadOptions, Http, HttpBuilder, RequestOptions, UploadOptions};
pub use config::HttpConfig;
pub use error::{BoxError, HttpError, Result, TransportError};
pub use fs::{FileSystem, LocalFileSystem};
pub use http::{Credential, HttpMethod, HttpRequest, HttpResponse};
pub use multipart::MultipartData;
pub use params::{ParamValue, Parameters};
pub use registry::{ProgressFn, TaskRegistry};
pub use serializer::{Payload, RequestEncoding, RequestSerializer, ResponseEncoding, ResponseSerializer};
pub use transport::{
    AuthChallenge, ChallengeDisposition, Progress, ReqwestTransport, TaskEvents, TaskId, TaskKind,
    Transport, TransportTask, UploadSource,
};

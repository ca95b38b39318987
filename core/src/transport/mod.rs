//! Contract between the core and the network transport.
//!
//! # Design
//! A transport runs concurrent tasks (data, upload, download) on its own
//! threads or runtime and reports each task's lifecycle through `TaskEvents`.
//! Tasks are created suspended and started with `resume`, so the core can
//! register the task's delegate before any event for it can fire. For one
//! task, events arrive in this order: redirect/challenge hooks, zero or more
//! data/progress events, then exactly one `completed`, including after
//! `cancel`.

mod reqwest_0_12;

pub use reqwest_0_12::ReqwestTransport;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;

use crate::error::TransportError;
use crate::http::{Credential, HttpRequest, HttpResponse};

/// Opaque identifier a transport assigns to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Produces a fresh body stream each time the transport needs one (first
/// send, redirect, challenge retry, 401 replay).
pub type StreamFactory = Arc<dyn Fn() -> BodyStream + Send + Sync>;

/// Where an upload's body comes from.
#[derive(Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
    Stream(StreamFactory),
}

impl UploadSource {
    pub fn stream<F>(factory: F) -> Self
    where
        F: Fn() -> BodyStream + Send + Sync + 'static,
    {
        UploadSource::Stream(Arc::new(factory))
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            UploadSource::File(path) => f.debug_tuple("File").field(path).finish(),
            UploadSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Send `request.body` and deliver the response body as data events.
    Data,
    /// Send the upload source as the body; report send progress.
    Upload(UploadSource),
    /// Write the response body to a temporary file; report write progress.
    Download,
}

#[derive(Debug)]
pub struct TransportTask {
    pub request: HttpRequest,
    pub kind: TaskKind,
}

/// One progress event: bytes moved by this event, bytes moved so far, and the
/// expected total when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes: u64,
    pub total: u64,
    pub expected: Option<u64>,
}

/// An authentication challenge (`WWW-Authenticate`) raised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub realm: Option<String>,
    pub previous_failures: u32,
}

impl AuthChallenge {
    /// Parse the challenge from a 401 response, if it carries one.
    pub fn from_response(response: &HttpResponse, previous_failures: u32) -> Option<Self> {
        if response.status != 401 {
            return None;
        }
        let header = response.header("www-authenticate")?.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        let realm = rest.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_string())
        });
        Some(Self {
            scheme: scheme.to_string(),
            realm,
            previous_failures,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential(Credential),
    /// Let the response through unanswered.
    PerformDefault,
    /// Give up; the task completes as cancelled.
    Cancel,
}

/// Lifecycle hooks a transport invokes for its tasks.
pub trait TaskEvents: Send + Sync {
    /// Return the request to follow, or `None` to stop and deliver the
    /// redirect response itself.
    fn will_redirect(
        &self,
        task: TaskId,
        response: &HttpResponse,
        proposed: HttpRequest,
    ) -> Option<HttpRequest>;

    fn challenge(&self, task: TaskId, challenge: &AuthChallenge) -> ChallengeDisposition;

    fn need_body_stream(&self, task: TaskId) -> Option<BodyStream>;

    fn data_received(&self, task: TaskId, chunk: &[u8]);

    fn progress(&self, task: TaskId, progress: Progress);

    /// The body was written to `location`, which the transport removes after
    /// this call returns unless it was moved.
    fn download_finished(&self, task: TaskId, response: &HttpResponse, location: &Path);

    fn completed(&self, task: TaskId, outcome: Result<HttpResponse, TransportError>);
}

/// The network collaborator.
pub trait Transport: Send + Sync {
    /// Create a suspended task. No event fires for it before `resume`.
    fn create_task(
        &self,
        task: TransportTask,
        events: Arc<dyn TaskEvents>,
    ) -> Result<TaskId, TransportError>;

    fn resume(&self, task: TaskId);

    /// Abort the task. `completed` still fires exactly once for it.
    fn cancel(&self, task: TaskId);
}

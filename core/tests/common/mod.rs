//! Shared fixtures: a scripted in-process transport and test modules.
//!
//! `StubTransport` answers each resumed task with the next scripted `Step`,
//! firing every event from its own thread the way a real transport would.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::{
    AuthChallenge, AuthzModule, BoxError, ChallengeDisposition, FileSystem, HttpRequest,
    HttpResponse, LocalFileSystem, Parameters, Progress, TaskEvents, TaskId, TaskKind, Transport,
    TransportError, TransportTask, UploadSource,
};
use futures::TryStreamExt;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Fail(String),
    Timeout,
    /// Answer a basic challenge; only the given user/password pass.
    BasicChallenge { user: String, password: String },
    /// Never complete until cancelled.
    Hang,
}

impl Step {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Step::Reply {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Step::Reply {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn file(name: &str, body: &str) -> Self {
        Step::Reply {
            status: 200,
            headers: vec![(
                "Content-Disposition".into(),
                format!("attachment; filename=\"{name}\""),
            )],
            body: body.as_bytes().to_vec(),
        }
    }
}

/// What the stub saw for one resumed task.
#[derive(Debug, Clone)]
pub struct Sent {
    pub request: HttpRequest,
    /// Body actually transmitted: the request body or the upload source.
    pub body: Vec<u8>,
    pub upload: bool,
}

#[derive(Default)]
pub struct StubTransport {
    next_id: AtomicU64,
    script: Mutex<VecDeque<Step>>,
    created: Mutex<HashMap<TaskId, (TransportTask, Arc<dyn TaskEvents>)>>,
    hanging: Mutex<HashMap<TaskId, Arc<dyn TaskEvents>>>,
    sent: Mutex<Vec<Sent>>,
    cancelled: Mutex<Vec<TaskId>>,
}

impl StubTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn hanging(&self) -> usize {
        self.hanging.lock().unwrap().len()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::json(200, serde_json::json!({})))
    }
}

impl Transport for StubTransport {
    fn create_task(
        &self,
        task: TransportTask,
        events: Arc<dyn TaskEvents>,
    ) -> Result<TaskId, TransportError> {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created.lock().unwrap().insert(id, (task, events));
        Ok(id)
    }

    fn resume(&self, id: TaskId) {
        let Some((task, events)) = self.created.lock().unwrap().remove(&id) else {
            return;
        };
        let step = self.next_step();
        let (body, upload) = transmitted_body(id, &task, events.as_ref());
        self.sent.lock().unwrap().push(Sent {
            request: task.request.clone(),
            body,
            upload,
        });

        if matches!(step, Step::Hang) {
            self.hanging.lock().unwrap().insert(id, events);
            return;
        }
        std::thread::spawn(move || play(id, task, step, events.as_ref()));
    }

    fn cancel(&self, id: TaskId) {
        self.cancelled.lock().unwrap().push(id);
        let events = self
            .hanging
            .lock()
            .unwrap()
            .remove(&id)
            .or_else(|| self.created.lock().unwrap().remove(&id).map(|(_, events)| events));
        if let Some(events) = events {
            std::thread::spawn(move || events.completed(id, Err(TransportError::Cancelled)));
        }
    }
}

/// Collect the body the task would put on the wire, reporting upload
/// progress in two halves.
fn transmitted_body(id: TaskId, task: &TransportTask, events: &dyn TaskEvents) -> (Vec<u8>, bool) {
    let bytes = match &task.kind {
        TaskKind::Upload(UploadSource::Bytes(bytes)) => bytes.to_vec(),
        TaskKind::Upload(UploadSource::File(path)) => std::fs::read(path).unwrap_or_default(),
        TaskKind::Upload(UploadSource::Stream(_)) => match events.need_body_stream(id) {
            Some(stream) => futures::executor::block_on(stream.try_collect::<Vec<_>>())
                .map(|chunks| chunks.concat())
                .unwrap_or_default(),
            None => Vec::new(),
        },
        _ => return (task.request.body.clone().unwrap_or_default(), false),
    };

    let expected = Some(bytes.len() as u64);
    let half = (bytes.len() / 2) as u64;
    events.progress(id, Progress { bytes: half, total: half, expected });
    events.progress(
        id,
        Progress {
            bytes: bytes.len() as u64 - half,
            total: bytes.len() as u64,
            expected,
        },
    );
    (bytes, true)
}

fn play(id: TaskId, task: TransportTask, step: Step, events: &dyn TaskEvents) {
    let url = task.request.url.clone();
    let (status, headers, body) = match step {
        Step::Reply { status, headers, body } => (status, headers, body),
        Step::Fail(reason) => return events.completed(id, Err(TransportError::Request(reason))),
        Step::Timeout => return events.completed(id, Err(TransportError::Timeout)),
        Step::BasicChallenge { user, password } => match answer_challenge(id, &user, &password, events) {
            Some(status) => (status, Vec::new(), Vec::new()),
            None => return events.completed(id, Err(TransportError::Cancelled)),
        },
        Step::Hang => unreachable!("hanging tasks are parked in resume"),
    };

    let response = HttpResponse { status, url, headers };
    if matches!(task.kind, TaskKind::Download) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&body).unwrap();
        let total = body.len() as u64;
        events.progress(id, Progress { bytes: total, total, expected: Some(total) });
        events.download_finished(id, &response, file.path());
    } else {
        let (first, second) = body.split_at(body.len() / 2);
        for chunk in [first, second] {
            if !chunk.is_empty() {
                events.data_received(id, chunk);
            }
        }
    }
    events.completed(id, Ok(response));
}

/// Returns the final status, or `None` when the challenge was cancelled.
fn answer_challenge(id: TaskId, user: &str, password: &str, events: &dyn TaskEvents) -> Option<u16> {
    let mut previous_failures = 0;
    loop {
        let challenge = AuthChallenge {
            scheme: "Basic".into(),
            realm: Some("stub".into()),
            previous_failures,
        };
        match events.challenge(id, &challenge) {
            ChallengeDisposition::UseCredential(c) if c.user == user && c.password == password => {
                return Some(200)
            }
            ChallengeDisposition::UseCredential(_) => previous_failures += 1,
            ChallengeDisposition::Cancel => return None,
            ChallengeDisposition::PerformDefault => return Some(401),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization module
// ---------------------------------------------------------------------------

/// Hands out `stale-token` first and `fresh-token` once access has been
/// requested again. Optionally refuses access from a given call on.
pub struct TokenAuthz {
    calls: AtomicUsize,
    refuse_from_call: Option<usize>,
}

impl TokenAuthz {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            refuse_from_call: None,
        })
    }

    pub fn refusing_from(call: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            refuse_from_call: Some(call),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthzModule for TokenAuthz {
    async fn request_access(&self) -> Result<(), BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.refuse_from_call {
            Some(from) if call >= from => Err("access revoked".into()),
            _ => Ok(()),
        }
    }

    fn authorization_fields(
        &self,
        _url: &str,
        _parameters: Option<&Parameters>,
    ) -> Option<HashMap<String, String>> {
        let token = if self.calls() >= 2 { "fresh-token" } else { "stale-token" };
        Some(HashMap::from([(
            "Authorization".to_string(),
            format!("Bearer {token}"),
        )]))
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Local disk with a fixed default download directory.
pub struct ScopedFileSystem {
    pub default_dir: PathBuf,
}

impl FileSystem for ScopedFileSystem {
    fn move_item(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        LocalFileSystem.move_item(from, to)
    }

    fn default_download_dir(&self) -> Option<PathBuf> {
        Some(self.default_dir.clone())
    }

    fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        LocalFileSystem.create_dir_all(path)
    }
}

//! `Transport` backed by reqwest on the ambient tokio runtime.
//!
//! # Design
//! Each resumed task runs as one spawned future raced against a cancel
//! signal, and whichever finishes first produces the single `completed`
//! event. reqwest is built without its own redirect policy so every hop goes
//! through `TaskEvents::will_redirect`; basic challenges are answered through
//! `TaskEvents::challenge` by re-sending with `basic_auth`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::{stream, Stream, TryStreamExt};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use super::{
    AuthChallenge, BodyStream, ChallengeDisposition, Progress, TaskEvents, TaskId, TaskKind,
    Transport, TransportTask, UploadSource,
};
use crate::error::TransportError;
use crate::http::{Credential, HttpMethod, HttpRequest, HttpResponse};

const MAX_REDIRECTS: usize = 10;
const UPLOAD_CHUNK: usize = 64 * 1024;

enum Slot {
    Created(TransportTask, Arc<dyn TaskEvents>),
    Running(oneshot::Sender<()>),
}

type Slots = Arc<Mutex<HashMap<TaskId, Slot>>>;

/// Runs tasks with a shared `reqwest::Client`. Must be resumed from within a
/// tokio runtime.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    next_id: Arc<AtomicU64>,
    slots: Slots,
    temp_dir: PathBuf,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(transport_error)?;
        Ok(Self::with_client(client))
    }

    /// Use a preconfigured client. It should not follow redirects itself,
    /// otherwise the redirect hook never sees them.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: Arc::new(AtomicU64::new(0)),
            slots: Arc::default(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Directory for in-progress downloads.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

impl Transport for ReqwestTransport {
    fn create_task(
        &self,
        task: TransportTask,
        events: Arc<dyn TaskEvents>,
    ) -> Result<TaskId, TransportError> {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.slots).insert(id, Slot::Created(task, events));
        Ok(id)
    }

    fn resume(&self, id: TaskId) {
        let mut slots = lock(&self.slots);
        let (task, events) = match slots.remove(&id) {
            Some(Slot::Created(task, events)) => (task, events),
            Some(running) => {
                slots.insert(id, running);
                return;
            }
            None => {
                warn!("{id}: resume for an unknown task");
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                drop(slots);
                events.completed(id, Err(TransportError::Request(err.to_string())));
                return;
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        slots.insert(id, Slot::Running(cancel_tx));
        drop(slots);

        let client = self.client.clone();
        let slots = self.slots.clone();
        let temp_dir = self.temp_dir.clone();
        runtime.spawn(async move {
            let outcome = tokio::select! {
                outcome = run(&client, id, task, events.clone(), &temp_dir) => outcome,
                _ = cancel_rx => Err(TransportError::Cancelled),
            };
            lock(&slots).remove(&id);
            events.completed(id, outcome);
        });
    }

    fn cancel(&self, id: TaskId) {
        let slot = lock(&self.slots).remove(&id);
        match slot {
            Some(Slot::Running(cancel)) => {
                debug!("{id}: cancelling");
                let _ = cancel.send(());
            }
            Some(Slot::Created(_, events)) => events.completed(id, Err(TransportError::Cancelled)),
            None => debug!("{id}: cancel after completion"),
        }
    }
}

async fn run(
    client: &reqwest::Client,
    id: TaskId,
    task: TransportTask,
    events: Arc<dyn TaskEvents>,
    temp_dir: &Path,
) -> Result<HttpResponse, TransportError> {
    let TransportTask { mut request, kind } = task;
    let mut send_upload = matches!(kind, TaskKind::Upload(_));
    let mut redirects = 0;
    let mut failures = 0;
    let mut credential: Option<Credential> = None;

    loop {
        let mut builder = client
            .request(reqwest_method(request.method), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(credential) = &credential {
            builder = builder.basic_auth(&credential.user, Some(&credential.password));
        }
        let body = match &kind {
            TaskKind::Upload(source) if send_upload => Some(upload_body(id, source, &events).await?),
            _ => request.body.clone().map(reqwest::Body::from),
        };
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(transport_error)?;
        let head = response_head(&response);

        if redirects < MAX_REDIRECTS {
            if let Some(proposed) = redirect_request(&request, &head) {
                if let Some(next) = events.will_redirect(id, &head, proposed) {
                    if next.method != request.method {
                        send_upload = false;
                    }
                    request = next;
                    redirects += 1;
                    continue;
                }
            }
        }

        if let Some(challenge) = AuthChallenge::from_response(&head, failures) {
            match events.challenge(id, &challenge) {
                ChallengeDisposition::UseCredential(answer)
                    if challenge.scheme.eq_ignore_ascii_case("basic") =>
                {
                    credential = Some(answer);
                    failures += 1;
                    continue;
                }
                ChallengeDisposition::Cancel => return Err(TransportError::Cancelled),
                _ => {}
            }
        }

        if matches!(kind, TaskKind::Download) {
            download(id, response, &head, events.as_ref(), temp_dir).await?;
        } else {
            while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
                events.data_received(id, &chunk);
            }
        }
        return Ok(head);
    }
}

async fn upload_body(
    id: TaskId,
    source: &UploadSource,
    events: &Arc<dyn TaskEvents>,
) -> Result<reqwest::Body, TransportError> {
    let (chunks, expected) = match source {
        UploadSource::Bytes(bytes) => (chunked(bytes.clone()), Some(bytes.len() as u64)),
        UploadSource::File(path) => {
            let bytes = Bytes::from(tokio::fs::read(path).await?);
            let len = bytes.len() as u64;
            (chunked(bytes), Some(len))
        }
        UploadSource::Stream(_) => {
            let stream = events.need_body_stream(id).ok_or_else(|| {
                TransportError::Request(format!("{id}: no body stream available"))
            })?;
            (stream, None)
        }
    };
    Ok(reqwest::Body::wrap_stream(with_progress(
        id,
        chunks,
        expected,
        events.clone(),
    )))
}

fn chunked(bytes: Bytes) -> BodyStream {
    let chunks: Vec<io::Result<Bytes>> = (0..bytes.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| Ok(bytes.slice(start..(start + UPLOAD_CHUNK).min(bytes.len()))))
        .collect();
    Box::pin(stream::iter(chunks))
}

fn with_progress(
    id: TaskId,
    chunks: BodyStream,
    expected: Option<u64>,
    events: Arc<dyn TaskEvents>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
    let mut total = 0u64;
    chunks.inspect_ok(move |chunk| {
        let bytes = chunk.len() as u64;
        total += bytes;
        events.progress(
            id,
            Progress {
                bytes,
                total,
                expected,
            },
        );
    })
}

async fn download(
    id: TaskId,
    mut response: reqwest::Response,
    head: &HttpResponse,
    events: &dyn TaskEvents,
    temp_dir: &Path,
) -> Result<(), TransportError> {
    let (file, path) = tempfile::Builder::new()
        .prefix("courier-")
        .suffix(".download")
        .tempfile_in(temp_dir)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    let expected = response.content_length();
    let mut total = 0u64;

    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        file.write_all(&chunk).await?;
        let bytes = chunk.len() as u64;
        total += bytes;
        events.progress(
            id,
            Progress {
                bytes,
                total,
                expected,
            },
        );
    }
    file.flush().await?;
    drop(file);

    events.download_finished(id, head, &path);
    // Dropping `path` deletes the temporary file unless it was moved away.
    Ok(())
}

fn redirect_request(current: &HttpRequest, head: &HttpResponse) -> Option<HttpRequest> {
    if !matches!(head.status, 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    let location = head.header("location")?;
    let target = url::Url::parse(&current.url).ok()?.join(location).ok()?;

    let mut next = current.clone();
    next.url = target.to_string();
    let becomes_get = match head.status {
        303 => current.method != HttpMethod::Head,
        301 | 302 => current.method == HttpMethod::Post,
        _ => false,
    };
    if becomes_get {
        next.method = HttpMethod::Get;
        next.body = None;
        next.remove_header("Content-Type");
        next.remove_header("Content-Length");
    }
    Some(next)
}

fn response_head(response: &reqwest::Response) -> HttpResponse {
    HttpResponse {
        status: response.status().as_u16(),
        url: response.url().to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(err.to_string())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

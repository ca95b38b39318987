//! Per-task delegates and the registry that routes transport events to them.
//!
//! # Design
//! The registry is owned by one `Http` instance and maps each live `TaskId`
//! to exactly one `TaskDelegate`. The map lock is held only to insert, look
//! up or remove an entry; work on a delegate happens under that delegate's
//! own lock, and user callbacks (progress, completion) run with no lock held.
//! An entry is removed after its completion has been processed and before
//! the awaiting caller is woken, so no entry outlives its task.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::{HttpError, Result, TransportError};
use crate::fs::FileSystem;
use crate::http::{Credential, HttpRequest, HttpResponse};
use crate::serializer::response::validate_status;
use crate::serializer::{Payload, ResponseSerializer};
use crate::transport::{
    AuthChallenge, BodyStream, ChallengeDisposition, Progress, StreamFactory, TaskEvents, TaskId,
};

/// Progress callback: receives every upload/download progress event.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

pub(crate) type Completion = oneshot::Sender<Result<Payload>>;

enum Role {
    Data,
    Upload {
        progress: Option<ProgressFn>,
        body_stream: Option<StreamFactory>,
    },
    Download {
        progress: Option<ProgressFn>,
        destination_dir: Option<PathBuf>,
        filesystem: Arc<dyn FileSystem>,
        saved: Option<Result<PathBuf>>,
    },
}

/// State for one in-flight task.
pub(crate) struct TaskDelegate {
    data: BytesMut,
    completion: Option<Completion>,
    response_serializer: ResponseSerializer,
    credential: Option<Credential>,
    role: Role,
}

impl TaskDelegate {
    pub(crate) fn data(
        completion: Completion,
        response_serializer: ResponseSerializer,
        credential: Option<Credential>,
    ) -> Self {
        Self::with_role(completion, response_serializer, credential, Role::Data)
    }

    pub(crate) fn upload(
        completion: Completion,
        response_serializer: ResponseSerializer,
        credential: Option<Credential>,
        progress: Option<ProgressFn>,
        body_stream: Option<StreamFactory>,
    ) -> Self {
        let role = Role::Upload {
            progress,
            body_stream,
        };
        Self::with_role(completion, response_serializer, credential, role)
    }

    pub(crate) fn download(
        completion: Completion,
        credential: Option<Credential>,
        progress: Option<ProgressFn>,
        destination_dir: Option<PathBuf>,
        filesystem: Arc<dyn FileSystem>,
    ) -> Self {
        let role = Role::Download {
            progress,
            destination_dir,
            filesystem,
            saved: None,
        };
        Self::with_role(completion, ResponseSerializer::string(), credential, role)
    }

    fn with_role(
        completion: Completion,
        response_serializer: ResponseSerializer,
        credential: Option<Credential>,
        role: Role,
    ) -> Self {
        Self {
            data: BytesMut::new(),
            completion: Some(completion),
            response_serializer,
            credential,
            role,
        }
    }

    fn challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
        if challenge.previous_failures > 0 {
            return ChallengeDisposition::Cancel;
        }
        match &self.credential {
            Some(credential) => ChallengeDisposition::UseCredential(credential.clone()),
            None => ChallengeDisposition::PerformDefault,
        }
    }

    fn body_stream(&self) -> Option<BodyStream> {
        match &self.role {
            Role::Upload {
                body_stream: Some(factory),
                ..
            } => Some(factory()),
            _ => None,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        match self.role {
            Role::Data | Role::Upload { .. } => self.data.extend_from_slice(chunk),
            Role::Download { .. } => {}
        }
    }

    fn progress_callback(&self) -> Option<ProgressFn> {
        match &self.role {
            Role::Upload { progress, .. } | Role::Download { progress, .. } => progress.clone(),
            Role::Data => None,
        }
    }

    fn finish_download(&mut self, response: &HttpResponse, location: &Path) {
        let Role::Download {
            destination_dir,
            filesystem,
            saved,
            ..
        } = &mut self.role
        else {
            return;
        };

        let outcome = if response.is_success() {
            store_download(
                filesystem.as_ref(),
                destination_dir.as_deref(),
                &response.suggested_filename(),
                location,
            )
        } else {
            Err(HttpError::bad_status(response, &[]))
        };
        if let Err(err) = &outcome {
            warn!("download from {} not stored: {err}", response.url);
        }
        *saved = Some(outcome);
    }

    /// Turn the transport outcome into the caller's result.
    fn complete(
        &mut self,
        outcome: std::result::Result<HttpResponse, TransportError>,
    ) -> (Option<Completion>, Result<Payload>) {
        let result = match outcome {
            Err(err) => Err(HttpError::Transport(err)),
            Ok(response) => self.finish(&response),
        };
        (self.completion.take(), result)
    }

    fn finish(&mut self, response: &HttpResponse) -> Result<Payload> {
        if let Role::Download { saved, .. } = &mut self.role {
            return match saved.take() {
                Some(saved) => saved.map(Payload::File),
                None => {
                    validate_status(response, &[])?;
                    Err(HttpError::bad_body(response, "download finished without a file"))
                }
            };
        }

        let body = std::mem::take(&mut self.data).freeze();
        self.response_serializer.validate(response, &body)?;
        Ok(self.response_serializer.deserialize(&body, response.status))
    }
}

fn store_download(
    filesystem: &dyn FileSystem,
    destination_dir: Option<&Path>,
    filename: &str,
    location: &Path,
) -> Result<PathBuf> {
    let dir = destination_dir
        .map(Path::to_path_buf)
        .or_else(|| filesystem.default_download_dir())
        .ok_or_else(|| HttpError::Filesystem {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::NotFound, "no default download directory"),
        })?;

    filesystem
        .create_dir_all(&dir)
        .map_err(|source| HttpError::Filesystem {
            path: dir.clone(),
            source,
        })?;

    let destination = dir.join(filename);
    filesystem
        .move_item(location, &destination)
        .map_err(|source| HttpError::Filesystem {
            path: destination.clone(),
            source,
        })?;
    Ok(destination)
}

/// Maps live task identifiers to their delegates.
#[derive(Default)]
pub struct TaskRegistry {
    delegates: Mutex<HashMap<TaskId, Arc<Mutex<TaskDelegate>>>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, task: TaskId, delegate: TaskDelegate) {
        let previous = lock(&self.delegates).insert(task, Arc::new(Mutex::new(delegate)));
        if previous.is_some() {
            warn!("{task} was registered twice; the earlier delegate is dropped");
        }
    }

    pub fn contains(&self, task: TaskId) -> bool {
        lock(&self.delegates).contains_key(&task)
    }

    pub fn len(&self) -> usize {
        lock(&self.delegates).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, task: TaskId) -> Option<Arc<Mutex<TaskDelegate>>> {
        lock(&self.delegates).get(&task).cloned()
    }

    fn remove(&self, task: TaskId) {
        lock(&self.delegates).remove(&task);
    }
}

impl TaskEvents for TaskRegistry {
    fn will_redirect(
        &self,
        task: TaskId,
        response: &HttpResponse,
        proposed: HttpRequest,
    ) -> Option<HttpRequest> {
        debug!("{task}: {} redirects to {}", response.status, proposed.url);
        Some(proposed)
    }

    fn challenge(&self, task: TaskId, challenge: &AuthChallenge) -> ChallengeDisposition {
        match self.get(task) {
            Some(delegate) => lock(&delegate).challenge(challenge),
            None => ChallengeDisposition::PerformDefault,
        }
    }

    fn need_body_stream(&self, task: TaskId) -> Option<BodyStream> {
        self.get(task).and_then(|delegate| lock(&delegate).body_stream())
    }

    fn data_received(&self, task: TaskId, chunk: &[u8]) {
        match self.get(task) {
            Some(delegate) => lock(&delegate).append(chunk),
            None => warn!("{task}: dropping {} bytes for an unknown task", chunk.len()),
        }
    }

    fn progress(&self, task: TaskId, progress: Progress) {
        let callback = self
            .get(task)
            .and_then(|delegate| lock(&delegate).progress_callback());
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
                warn!("{task}: progress callback panicked; the transfer continues");
            }
        }
    }

    fn download_finished(&self, task: TaskId, response: &HttpResponse, location: &Path) {
        if let Some(delegate) = self.get(task) {
            lock(&delegate).finish_download(response, location);
        }
    }

    fn completed(&self, task: TaskId, outcome: std::result::Result<HttpResponse, TransportError>) {
        let Some(delegate) = self.get(task) else {
            warn!("{task}: completion for an unknown task");
            return;
        };

        let (completion, result) = lock(&delegate).complete(outcome);
        self.remove(task);
        debug!("{task}: completed ({})", if result.is_ok() { "ok" } else { "error" });

        if let Some(completion) = completion {
            if completion.send(result).is_err() {
                debug!("{task}: caller stopped waiting before completion");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn ok(status: u16) -> std::result::Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(status, "http://localhost/files/report.txt"))
    }

    fn data_delegate() -> (TaskDelegate, oneshot::Receiver<Result<Payload>>) {
        let (tx, rx) = oneshot::channel();
        (TaskDelegate::data(tx, ResponseSerializer::json(), None), rx)
    }

    #[test]
    fn data_events_accumulate_and_complete() {
        let registry = TaskRegistry::new();
        let (delegate, mut rx) = data_delegate();
        let id = TaskId::new(1);
        registry.insert(id, delegate);

        registry.data_received(id, b"{\"key\":");
        registry.data_received(id, b"\"value\"}");
        assert!(registry.contains(id));
        registry.completed(id, ok(200));

        assert!(registry.is_empty());
        let payload = rx.try_recv().unwrap().unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"key": "value"})));
    }

    #[test]
    fn transport_error_is_surfaced_unchanged() {
        let registry = TaskRegistry::new();
        let (delegate, mut rx) = data_delegate();
        registry.insert(TaskId::new(7), delegate);

        registry.completed(TaskId::new(7), Err(TransportError::Timeout));
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Transport(TransportError::Timeout)));
        assert!(registry.is_empty());
    }

    #[test]
    fn events_for_unknown_tasks_are_ignored() {
        let registry = TaskRegistry::new();
        let id = TaskId::new(42);
        registry.data_received(id, b"x");
        registry.progress(id, Progress { bytes: 1, total: 1, expected: None });
        registry.completed(id, ok(200));
        assert!(registry.need_body_stream(id).is_none());
        assert_eq!(
            registry.challenge(id, &AuthChallenge { scheme: "Basic".into(), realm: None, previous_failures: 0 }),
            ChallengeDisposition::PerformDefault
        );
    }

    #[test]
    fn challenge_uses_credential_once_then_cancels() {
        let registry = TaskRegistry::new();
        let (tx, _rx) = oneshot::channel();
        let credential = Credential::new("john", "pass");
        registry.insert(
            TaskId::new(1),
            TaskDelegate::data(tx, ResponseSerializer::json(), Some(credential.clone())),
        );

        let mut challenge = AuthChallenge {
            scheme: "Basic".into(),
            realm: None,
            previous_failures: 0,
        };
        assert_eq!(
            registry.challenge(TaskId::new(1), &challenge),
            ChallengeDisposition::UseCredential(credential)
        );
        challenge.previous_failures = 1;
        assert_eq!(registry.challenge(TaskId::new(1), &challenge), ChallengeDisposition::Cancel);
    }

    #[test]
    fn progress_reaches_upload_callback_and_survives_panics() {
        let registry = TaskRegistry::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_cb = seen.clone();
        let progress: ProgressFn = Arc::new(move |p: Progress| {
            seen_in_cb.store(p.total, Ordering::SeqCst);
            if p.total > 10 {
                panic!("callback bug");
            }
        });

        let (tx, mut rx) = oneshot::channel();
        let id = TaskId::new(3);
        registry.insert(
            id,
            TaskDelegate::upload(tx, ResponseSerializer::json(), None, Some(progress), None),
        );

        registry.progress(id, Progress { bytes: 5, total: 5, expected: Some(20) });
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        registry.progress(id, Progress { bytes: 15, total: 20, expected: Some(20) });
        assert_eq!(seen.load(Ordering::SeqCst), 20);

        registry.data_received(id, b"{}");
        registry.completed(id, ok(201));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn download_is_moved_to_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let location = tmp.path().join("incoming.tmp");
        std::fs::write(&location, "contents").unwrap();
        let dest = tmp.path().join("out");

        let registry = TaskRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        let id = TaskId::new(9);
        registry.insert(
            id,
            TaskDelegate::download(tx, None, None, Some(dest.clone()), Arc::new(LocalFileSystem)),
        );

        let response = HttpResponse::new(200, "http://localhost/files/report.txt");
        registry.download_finished(id, &response, &location);
        registry.completed(id, Ok(response));

        let payload = rx.try_recv().unwrap().unwrap();
        let expected = dest.join("report.txt");
        assert_eq!(payload, Payload::File(expected.clone()));
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "contents");
        assert!(!location.exists());
    }

    #[test]
    fn failed_move_fails_the_request() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        let id = TaskId::new(10);
        registry.insert(
            id,
            TaskDelegate::download(tx, None, None, Some(tmp.path().to_path_buf()), Arc::new(LocalFileSystem)),
        );

        let response = HttpResponse::new(200, "http://localhost/files/report.txt");
        registry.download_finished(id, &response, &tmp.path().join("never-written"));
        registry.completed(id, Ok(response));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Filesystem { .. }));
    }

    #[test]
    fn download_with_bad_status_is_not_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let location = tmp.path().join("incoming.tmp");
        std::fs::write(&location, "not found page").unwrap();

        let registry = TaskRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        let id = TaskId::new(11);
        registry.insert(
            id,
            TaskDelegate::download(tx, None, None, Some(tmp.path().join("out")), Arc::new(LocalFileSystem)),
        );

        let response = HttpResponse::new(404, "http://localhost/files/missing.txt");
        registry.download_finished(id, &response, &location);
        registry.completed(id, Ok(response));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn concurrent_tasks_route_to_their_own_delegates() {
        let registry = Arc::new(TaskRegistry::new());
        let mut receivers = Vec::new();
        for n in 0..32u64 {
            let (delegate, rx) = data_delegate();
            registry.insert(TaskId::new(n), delegate);
            receivers.push((n, rx));
        }

        let handles: Vec<_> = (0..32u64)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = TaskId::new(n);
                    registry.data_received(id, format!("{{\"n\":{n}").as_bytes());
                    registry.data_received(id, b"}");
                    registry.completed(id, ok(200));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());
        for (n, mut rx) in receivers {
            let payload = rx.try_recv().unwrap().unwrap();
            assert_eq!(payload, Payload::Json(serde_json::json!({"n": n})));
        }
    }
}

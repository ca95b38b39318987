//! The `Http` orchestrator: verbs, uploads and downloads over a `Transport`.
//!
//! # Design
//! Every call follows the same path: resolve the URL against the base, ask
//! the authorization module for access, build the request with fresh
//! authorization fields, create a suspended transport task, register its
//! delegate, resume it and await the delegate's completion. If the result is
//! a 401 and an authorization module is configured, access is requested again
//! and the request is rebuilt and submitted exactly once more.
//!
//! Dropping a verb's future cancels its task; the registry entry is still
//! cleaned up by the transport's `completed` event.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use url::Url;

use crate::authz::AuthzModule;
use crate::config::HttpConfig;
use crate::error::{HttpError, Result, TransportError};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::http::{merge_headers, Credential, HttpMethod};
use crate::params::Parameters;
use crate::registry::{ProgressFn, TaskDelegate, TaskRegistry};
use crate::serializer::{Payload, RequestSerializer, ResponseSerializer};
use crate::transport::{Progress, TaskEvents, TaskId, TaskKind, Transport, TransportTask, UploadSource};

/// Per-call options for the plain verbs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub parameters: Option<Parameters>,
    pub headers: Option<HashMap<String, String>>,
    pub credential: Option<Credential>,
    /// Overrides the instance's response serializer for this call.
    pub response_serializer: Option<ResponseSerializer>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn response_serializer(mut self, serializer: ResponseSerializer) -> Self {
        self.response_serializer = Some(serializer);
        self
    }
}

impl From<Parameters> for RequestOptions {
    fn from(parameters: Parameters) -> Self {
        Self::new().parameters(parameters)
    }
}

/// Options for `Http::upload`. The method defaults to POST.
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub method: Option<HttpMethod>,
    pub parameters: Option<Parameters>,
    pub credential: Option<Credential>,
    pub response_serializer: Option<ResponseSerializer>,
    pub progress: Option<ProgressFn>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn response_serializer(mut self, serializer: ResponseSerializer) -> Self {
        self.response_serializer = Some(serializer);
        self
    }

    pub fn progress(mut self, progress: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

/// Options for `Http::download`. The method defaults to GET.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub method: Option<HttpMethod>,
    pub parameters: Option<Parameters>,
    pub credential: Option<Credential>,
    /// Where the file lands; falls back to the instance's download directory,
    /// then to the filesystem's default.
    pub destination_dir: Option<PathBuf>,
    pub progress: Option<ProgressFn>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_dir = Some(dir.into());
        self
    }

    pub fn progress(mut self, progress: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

enum Operation {
    Data,
    Upload {
        source: UploadSource,
        progress: Option<ProgressFn>,
    },
    Download {
        destination_dir: Option<PathBuf>,
        progress: Option<ProgressFn>,
    },
}

struct Call {
    method: HttpMethod,
    url: Url,
    parameters: Option<Parameters>,
    headers: Option<HashMap<String, String>>,
    credential: Option<Credential>,
    response_serializer: ResponseSerializer,
    operation: Operation,
}

/// Asynchronous HTTP client over an injected `Transport`.
pub struct Http {
    base_url: Option<Url>,
    transport: Arc<dyn Transport>,
    registry: Arc<TaskRegistry>,
    request_serializer: RequestSerializer,
    response_serializer: ResponseSerializer,
    authz: Option<Arc<dyn AuthzModule>>,
    filesystem: Arc<dyn FileSystem>,
    download_dir: Option<PathBuf>,
}

impl fmt::Debug for Http {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("request_serializer", &self.request_serializer)
            .field("response_serializer", &self.response_serializer)
            .field("authz", &self.authz.is_some())
            .field("in_flight", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Http {
    /// Client without a base URL; every path must be absolute.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        HttpBuilder::new(transport).assemble(None)
    }

    pub fn builder(transport: Arc<dyn Transport>) -> HttpBuilder {
        HttpBuilder::new(transport)
    }

    pub fn from_config(config: &HttpConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut builder = HttpBuilder::new(transport)
            .request_serializer(config.request_serializer())
            .response_serializer(ResponseSerializer::from_encoding(config.response_encoding));
        if let Some(base_url) = &config.base_url {
            builder = builder.base_url(base_url.clone());
        }
        if let Some(dir) = &config.download_dir {
            builder = builder.download_dir(dir.clone());
        }
        builder.build()
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Number of tasks submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub async fn get(&self, path: &str, options: impl Into<RequestOptions>) -> Result<Payload> {
        self.request(HttpMethod::Get, path, options.into()).await
    }

    pub async fn post(&self, path: &str, options: impl Into<RequestOptions>) -> Result<Payload> {
        self.request(HttpMethod::Post, path, options.into()).await
    }

    pub async fn put(&self, path: &str, options: impl Into<RequestOptions>) -> Result<Payload> {
        self.request(HttpMethod::Put, path, options.into()).await
    }

    pub async fn delete(&self, path: &str, options: impl Into<RequestOptions>) -> Result<Payload> {
        self.request(HttpMethod::Delete, path, options.into()).await
    }

    pub async fn head(&self, path: &str, options: impl Into<RequestOptions>) -> Result<Payload> {
        self.request(HttpMethod::Head, path, options.into()).await
    }

    /// Issue `method` against `path`. Parameters holding multipart data turn
    /// the call into a multipart upload.
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        options: RequestOptions,
    ) -> Result<Payload> {
        let call = Call {
            method,
            url: self.resolve_url(path)?,
            parameters: options.parameters,
            headers: options.headers,
            credential: options.credential,
            response_serializer: options
                .response_serializer
                .unwrap_or_else(|| self.response_serializer.clone()),
            operation: Operation::Data,
        };
        self.execute(&call).await
    }

    /// Send `source` as the request body, reporting send progress.
    pub async fn upload(
        &self,
        path: &str,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Payload> {
        let call = Call {
            method: options.method.unwrap_or(HttpMethod::Post),
            url: self.resolve_url(path)?,
            parameters: options.parameters,
            headers: None,
            credential: options.credential,
            response_serializer: options
                .response_serializer
                .unwrap_or_else(|| self.response_serializer.clone()),
            operation: Operation::Upload {
                source,
                progress: options.progress,
            },
        };
        self.execute(&call).await
    }

    /// Fetch `path` into a file and resolve to `Payload::File` with its
    /// final location.
    pub async fn download(&self, path: &str, options: DownloadOptions) -> Result<Payload> {
        let call = Call {
            method: options.method.unwrap_or(HttpMethod::Get),
            url: self.resolve_url(path)?,
            parameters: options.parameters,
            headers: None,
            credential: options.credential,
            response_serializer: ResponseSerializer::string(),
            operation: Operation::Download {
                destination_dir: options.destination_dir,
                progress: options.progress,
            },
        };
        self.execute(&call).await
    }

    /// Absolute `http(s)` URLs are used as given; anything else is appended
    /// to the base URL as a path.
    fn resolve_url(&self, path: &str) -> Result<Url> {
        match &self.base_url {
            Some(base) if !is_absolute(path) => {
                let mut base = base.clone();
                if !base.path().ends_with('/') {
                    let with_slash = format!("{}/", base.path());
                    base.set_path(&with_slash);
                }
                Ok(base.join(path.trim_start_matches('/'))?)
            }
            _ => Ok(Url::parse(path)?),
        }
    }

    async fn execute(&self, call: &Call) -> Result<Payload> {
        self.request_access().await?;
        match self.submit(call).await {
            Err(err) if err.is_unauthorized() && self.authz.is_some() => {
                warn!("{} {} answered 401; refreshing access and retrying once", call.method, call.url);
                self.request_access().await?;
                self.submit(call).await
            }
            outcome => outcome,
        }
    }

    async fn request_access(&self) -> Result<()> {
        if let Some(authz) = &self.authz {
            authz.request_access().await.map_err(|err| {
                warn!("authorization refused: {err}");
                HttpError::Authorization(err)
            })?;
        }
        Ok(())
    }

    async fn submit(&self, call: &Call) -> Result<Payload> {
        let authorization = self.authz.as_ref().and_then(|authz| {
            authz.authorization_fields(call.url.as_str(), call.parameters.as_ref())
        });
        let headers = merge_headers(call.headers.as_ref(), authorization.as_ref());
        let multipart = call
            .parameters
            .as_ref()
            .is_some_and(Parameters::has_multipart_data);

        let mut request = if multipart {
            self.request_serializer.build_multipart_request(
                &call.url,
                call.method,
                call.parameters.as_ref(),
                headers.as_ref(),
            )?
        } else {
            self.request_serializer.build_request(
                &call.url,
                call.method,
                call.parameters.as_ref(),
                headers.as_ref(),
            )?
        };

        let (completion, outcome) = oneshot::channel();
        let (kind, delegate) = match &call.operation {
            Operation::Data if multipart => {
                let body = request.body.take().unwrap_or_default();
                let delegate = TaskDelegate::upload(
                    completion,
                    call.response_serializer.clone(),
                    call.credential.clone(),
                    None,
                    None,
                );
                (TaskKind::Upload(UploadSource::Bytes(body.into())), delegate)
            }
            Operation::Data => {
                let delegate = TaskDelegate::data(
                    completion,
                    call.response_serializer.clone(),
                    call.credential.clone(),
                );
                (TaskKind::Data, delegate)
            }
            Operation::Upload { source, progress } => {
                request.body = None;
                request.remove_header("Content-Length");
                let body_stream = match source {
                    UploadSource::Stream(factory) => Some(factory.clone()),
                    _ => None,
                };
                let delegate = TaskDelegate::upload(
                    completion,
                    call.response_serializer.clone(),
                    call.credential.clone(),
                    progress.clone(),
                    body_stream,
                );
                (TaskKind::Upload(source.clone()), delegate)
            }
            Operation::Download {
                destination_dir,
                progress,
            } => {
                let delegate = TaskDelegate::download(
                    completion,
                    call.credential.clone(),
                    progress.clone(),
                    destination_dir.clone().or_else(|| self.download_dir.clone()),
                    self.filesystem.clone(),
                );
                (TaskKind::Download, delegate)
            }
        };

        let events: Arc<dyn TaskEvents> = self.registry.clone();
        let task = self
            .transport
            .create_task(TransportTask { request, kind }, events)?;
        self.registry.insert(task, delegate);
        debug!("{task}: {} {}", call.method, call.url);

        let guard = CancelOnDrop {
            transport: self.transport.as_ref(),
            task,
            armed: true,
        };
        self.transport.resume(task);
        let result = outcome.await;
        guard.disarm();

        result.unwrap_or(Err(HttpError::Transport(TransportError::Cancelled)))
    }
}

fn is_absolute(path: &str) -> bool {
    let scheme = path.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
    matches!(scheme.as_deref(), Some("http" | "https"))
}

/// Cancels the task if the awaiting future is dropped before completion.
struct CancelOnDrop<'a> {
    transport: &'a dyn Transport,
    task: TaskId,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("{}: caller went away, cancelling", self.task);
            self.transport.cancel(self.task);
        }
    }
}

pub struct HttpBuilder {
    transport: Arc<dyn Transport>,
    base_url: Option<String>,
    request_serializer: RequestSerializer,
    response_serializer: ResponseSerializer,
    authz: Option<Arc<dyn AuthzModule>>,
    filesystem: Arc<dyn FileSystem>,
    download_dir: Option<PathBuf>,
}

impl HttpBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: None,
            request_serializer: RequestSerializer::default(),
            response_serializer: ResponseSerializer::default(),
            authz: None,
            filesystem: Arc::new(LocalFileSystem),
            download_dir: None,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn request_serializer(mut self, serializer: RequestSerializer) -> Self {
        self.request_serializer = serializer;
        self
    }

    pub fn response_serializer(mut self, serializer: ResponseSerializer) -> Self {
        self.response_serializer = serializer;
        self
    }

    /// Timeout for every request; keeps the request serializer's encoding.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_serializer = self.request_serializer.with_timeout(timeout);
        self
    }

    pub fn authz(mut self, module: Arc<dyn AuthzModule>) -> Self {
        self.authz = Some(module);
        self
    }

    pub fn filesystem(mut self, filesystem: Arc<dyn FileSystem>) -> Self {
        self.filesystem = filesystem;
        self
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Http> {
        let base_url = self.base_url.as_deref().map(Url::parse).transpose()?;
        Ok(self.assemble(base_url))
    }

    fn assemble(self, base_url: Option<Url>) -> Http {
        Http {
            base_url,
            transport: self.transport,
            registry: Arc::new(TaskRegistry::new()),
            request_serializer: self.request_serializer,
            response_serializer: self.response_serializer,
            authz: self.authz,
            filesystem: self.filesystem,
            download_dir: self.download_dir,
        }
    }
}

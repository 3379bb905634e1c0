//! Request execution for every transfer mode.
//!
//! # Design
//! `TransferClient` keeps the split between building requests and parsing
//! responses: `build_*` turns a `RequestDescriptor` into an `HttpRequest`,
//! `parse_response` classifies an `HttpResponse`. Both are pure and tested
//! without I/O. The async operations sit on top and hand the built request
//! to the `HttpTransport`.
//!
//! Classification order for every buffered response:
//! 1. transport error → `Transport`
//! 2. status outside `100..=599` → `Transport`
//! 3. status outside `200..=299` → `ServerStatus`
//! 4. body does not decode → `Decode`
//! 5. otherwise the decoded value
//!
//! Each step returns; a failed step never falls through to the next.
//!
//! The client is cheap to clone and shared between tasks. Uploads get their
//! own `StreamBridge` per call. Downloads share one `DownloadController`, so
//! starting a download supersedes the one in flight.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::background::{BackgroundDownload, BackgroundEvent, BackgroundSession};
use crate::bridge::StreamBridge;
use crate::config::ClientConfig;
use crate::descriptor::RequestDescriptor;
use crate::download::{
    run_download, DownloadController, DownloadEvent, DownloadJob, DownloadPhase, DownloadState, DownloadStream,
    ResumeToken, TaskId,
};
use crate::endpoint::KeyNaming;
use crate::error::{NetworkError, TransferResult};
use crate::http::{HttpRequest, HttpResponse, RequestBody};
use crate::multipart::{MultipartDataField, MultipartEncoder, MultipartTextField};
use crate::naming::decode_json;
use crate::transport::HttpTransport;

const NO_RUNTIME: &str = "no tokio runtime available to drive the download";

struct ClientInner<T> {
    transport: T,
    config: ClientConfig,
    downloads: DownloadController,
    background: OnceLock<BackgroundSession>,
}

/// HTTP client executing fetches, uploads and downloads over `T`.
pub struct TransferClient<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for TransferClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TransferClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("config", &self.inner.config)
            .field("downloads", &self.inner.downloads.state())
            .finish_non_exhaustive()
    }
}

impl<T: HttpTransport> TransferClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                downloads: DownloadController::new(),
                background: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    // -- build / parse -------------------------------------------------------

    /// Request for a JSON fetch. The descriptor's body map, if any, is sent
    /// as `application/json` unless the caller set a content type.
    pub fn build_fetch_request(&self, descriptor: &RequestDescriptor) -> TransferResult<HttpRequest> {
        let url = descriptor.resolve_url()?;
        let mut request = HttpRequest::new(descriptor.method, url.to_string());
        request.headers = descriptor.header_pairs();
        request.timeout = self.inner.config.request_timeout;

        if let Some(body) = &descriptor.json_body {
            let bytes = serde_json::to_vec(&Value::Object(body.clone()))
                .map_err(|e| NetworkError::Decode(format!("could not encode request body: {e}")))?;
            if request.header("content-type").is_none() {
                request
                    .headers
                    .push(("content-type".to_string(), "application/json".to_string()));
            }
            request.body = RequestBody::Bytes(bytes.into());
        }
        Ok(request)
    }

    /// Request carrying a fully encoded multipart body.
    pub fn build_multipart_request(
        &self,
        descriptor: &RequestDescriptor,
        text_fields: &[MultipartTextField],
        data_field: &MultipartDataField,
    ) -> TransferResult<HttpRequest> {
        let url = descriptor.resolve_url()?;
        let encoder = match &descriptor.boundary {
            Some(boundary) => MultipartEncoder::with_boundary(boundary.clone()),
            None => MultipartEncoder::new(),
        };

        let mut request = HttpRequest::new(descriptor.method, url.to_string());
        request.headers = descriptor
            .header_pairs()
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
            .collect();
        request
            .headers
            .push(("content-type".to_string(), encoder.content_type()));
        request.body = RequestBody::Bytes(encoder.encode(text_fields, data_field));
        request.timeout = self.inner.config.request_timeout;
        Ok(request)
    }

    /// Classify a buffered response and decode its body into `R`.
    pub fn parse_response<R: DeserializeOwned>(
        &self,
        response: HttpResponse,
        naming: KeyNaming,
    ) -> TransferResult<R> {
        if !(100..=599).contains(&response.status) {
            return Err(NetworkError::Transport(format!(
                "invalid HTTP status {}",
                response.status
            )));
        }
        if !(200..=299).contains(&response.status) {
            return Err(NetworkError::ServerStatus {
                code: response.status,
                body: response.text(),
            });
        }
        decode_json(&response.body, naming).map_err(|e| {
            debug!(status = response.status, body = %response.text(), "response body did not decode");
            NetworkError::Decode(e.to_string())
        })
    }

    // -- buffered operations -------------------------------------------------

    /// Issue `descriptor` and decode the JSON response into `R`.
    pub async fn fetch<R: DeserializeOwned>(&self, descriptor: &RequestDescriptor) -> TransferResult<R> {
        let request = self.build_fetch_request(descriptor)?;
        debug!(method = %request.method, url = %request.url, "fetch");
        let response = self.execute(request).await?;
        self.parse_response(response, descriptor.endpoint.key_naming)
    }

    /// Send a multipart body and decode the JSON response into `R`.
    pub async fn multipart_upload<R: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        text_fields: &[MultipartTextField],
        data_field: &MultipartDataField,
    ) -> TransferResult<R> {
        let request = self.build_multipart_request(descriptor, text_fields, data_field)?;
        debug!(
            url = %request.url,
            fields = text_fields.len(),
            bytes = data_field.bytes.len(),
            "multipart upload"
        );
        let response = self.execute(request).await?;
        self.parse_response(response, descriptor.endpoint.key_naming)
    }

    async fn execute(&self, request: HttpRequest) -> TransferResult<HttpResponse> {
        self.inner.transport.execute(request).await.map_err(|e| {
            warn!(error = %e, "request failed without a response");
            NetworkError::from(e)
        })
    }

    // -- streamed upload -----------------------------------------------------

    /// Stream `source` as the request body, handing the transport at most
    /// `stream_buffer_size` bytes per readiness event.
    ///
    /// The result is produced only after both the body and the response have
    /// reached a terminal state. Bytes the transport never took are reported
    /// as `Transport`, as is expiry of `timeout`.
    pub async fn upload<R: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        source: impl Into<Bytes>,
        timeout: Duration,
    ) -> TransferResult<R> {
        let source: Bytes = source.into();
        let url = descriptor.resolve_url()?;
        let total = source.len() as u64;

        let bridge = StreamBridge::new(self.inner.config.stream_buffer_size);
        let mut failure = bridge.on_failure();
        let monitor = bridge.monitor();
        let (mut writer, body) = bridge.split();

        let mut request = HttpRequest::new(descriptor.method, url.to_string());
        request.headers = descriptor.header_pairs();
        if request.header("content-type").is_none() {
            request
                .headers
                .push(("content-type".to_string(), "application/octet-stream".to_string()));
        }
        request.body = RequestBody::Streamed(body);
        request.timeout = Some(timeout);
        debug!(url = %request.url, bytes = total, "streamed upload");

        let pump = async move {
            match writer.write_all(&source).await {
                Ok(()) => {
                    writer.finish();
                    Ok(())
                }
                Err(e) => {
                    writer.abort(e.clone());
                    Err(e)
                }
            }
        };
        let exchange = async { tokio::join!(pump, self.inner.transport.execute(request)) };
        let (pumped, response) = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(?timeout, delivered = monitor.delivered(), "upload timed out");
                return Err(NetworkError::Transport(format!(
                    "upload timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        if let Ok(err) = failure.try_recv() {
            debug!(error = %err, "upload stream closed early");
        }
        let response = response.map_err(|e| {
            warn!(error = %e, delivered = monitor.delivered(), total, "upload failed without a response");
            NetworkError::from(e)
        })?;

        let delivered = monitor.delivered();
        if pumped.is_err() || delivered < total {
            warn!(status = response.status, delivered, total, "upload ended with bytes undelivered");
            return Err(NetworkError::Transport(format!(
                "{} of {total} bytes undelivered (HTTP {})",
                total - delivered.min(total),
                response.status
            )));
        }
        self.parse_response(response, descriptor.endpoint.key_naming)
    }

    // -- downloads -----------------------------------------------------------

    /// Start downloading `descriptor` to a temp file. Supersedes any download
    /// already in flight on this client.
    pub fn download(&self, descriptor: &RequestDescriptor) -> DownloadStream {
        let task = self.inner.downloads.allocate();
        let job = self.download_job(descriptor, task);
        self.spawn_tracked(task, job)
    }

    /// Continue a failed download from its resume token.
    pub fn resume_download(&self, token: &ResumeToken) -> DownloadStream {
        let task = self.inner.downloads.allocate();
        let job = token.decode().map(|data| DownloadJob {
            task,
            url: data.url.clone(),
            headers: data.headers.clone(),
            timeout: self.inner.config.request_timeout,
            download_dir: self.inner.config.download_dir.clone(),
            resume: Some(data),
        });
        self.spawn_tracked(task, job)
    }

    /// What the controller is tracking right now.
    pub fn download_state(&self) -> DownloadState {
        self.inner.downloads.state()
    }

    /// Stop tracking the active download. It ends at its next chunk with a
    /// resume token for whatever reached disk.
    pub fn cancel_download(&self) -> Option<TaskId> {
        let cancelled = self.inner.downloads.cancel();
        if let Some(task) = cancelled {
            info!(%task, "download cancelled");
        }
        cancelled
    }

    fn download_job(&self, descriptor: &RequestDescriptor, task: TaskId) -> TransferResult<DownloadJob> {
        let url = descriptor.resolve_url()?;
        Ok(DownloadJob {
            task,
            url: url.to_string(),
            headers: descriptor.header_pairs(),
            timeout: self.inner.config.request_timeout,
            download_dir: self.inner.config.download_dir.clone(),
            resume: None,
        })
    }

    fn spawn_tracked(&self, task: TaskId, job: TransferResult<DownloadJob>) -> DownloadStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = DownloadStream::new(task, rx);
        let fail_now = |error: NetworkError| {
            warn!(%task, error = %error, "download not started");
            let _ = tx.send(DownloadEvent::Failed {
                error,
                resume_token: None,
            });
        };

        let job = match job {
            Ok(job) => job,
            Err(e) => {
                fail_now(e);
                return stream;
            }
        };
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                fail_now(NetworkError::Transport(NO_RUNTIME.to_string()));
                return stream;
            }
        };

        self.inner.downloads.begin(task);
        debug!(%task, url = %job.url, resume = job.resume.is_some(), "download started");
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let downloads = &inner.downloads;
            let progress_tx = tx.clone();
            let outcome = run_download(&inner.transport, job, |progress| {
                if !downloads.record_progress(task, progress) {
                    return false;
                }
                let _ = progress_tx.send(DownloadEvent::Progress(progress));
                true
            })
            .await;

            let event = match outcome {
                Ok(path) => {
                    downloads.finish(task, DownloadPhase::Completed);
                    DownloadEvent::Completed(path)
                }
                Err(failure) => {
                    downloads.finish(task, DownloadPhase::Failed);
                    DownloadEvent::Failed {
                        error: failure.error,
                        resume_token: failure.resume_token,
                    }
                }
            };
            let _ = tx.send(event);
        });
        stream
    }

    // -- background ----------------------------------------------------------

    /// The session background downloads run in, created on first use.
    pub fn background_session(&self) -> &BackgroundSession {
        self.inner
            .background
            .get_or_init(|| BackgroundSession::new(self.inner.config.background_identifier.clone()))
    }

    /// Download `descriptor` on a detached task. The outcome is delivered to
    /// the returned future, or recorded in the session if it was dropped.
    /// Background downloads are not resumable: a failure removes whatever
    /// reached disk.
    pub fn background_download(&self, descriptor: &RequestDescriptor) -> BackgroundDownload {
        let session = self.background_session();
        let task = self.inner.downloads.allocate();
        let job = self.download_job(descriptor, task);

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                return BackgroundDownload::failed(task, NetworkError::Transport(NO_RUNTIME.to_string()))
            }
        };
        let inner = self.inner.clone();
        session.spawn(&runtime, task, async move {
            let job = match job {
                Ok(job) => job,
                Err(e) => return BackgroundEvent::Failed(e),
            };
            match run_download(&inner.transport, job, |_| true).await {
                Ok(path) => BackgroundEvent::Completed(path),
                Err(failure) => BackgroundEvent::Failed(failure.discard_partial().await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::endpoint::EndpointConfig;
    use crate::error::TransportError;
    use crate::http::{HttpMethod, StreamingResponse};

    struct Offline;

    impl HttpTransport for Offline {
        async fn send(&self, _request: HttpRequest) -> Result<StreamingResponse, TransportError> {
            Err(TransportError::Connect("offline".into()))
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Item {
        item_id: u32,
        display_name: String,
    }

    fn client() -> TransferClient<Offline> {
        TransferClient::new(Offline, ClientConfig::default())
    }

    fn endpoint() -> EndpointConfig {
        EndpointConfig::https("api.example.com")
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn build_fetch_request_for_get() {
        let descriptor = RequestDescriptor::get(endpoint(), "/v1/items").with_query("page", "2");
        let req = client().build_fetch_request(&descriptor).unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.url, "https://api.example.com/v1/items?page=2");
        assert!(req.headers.is_empty());
        assert_eq!(req.body.as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn build_fetch_request_serializes_json_body() {
        let descriptor = RequestDescriptor::post(endpoint(), "/v1/items")
            .with_body_field("name", "widget")
            .with_body_field("count", 3);
        let req = client().build_fetch_request(&descriptor).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_slice(req.body.as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "widget", "count": 3}));
    }

    #[test]
    fn build_fetch_request_keeps_caller_content_type() {
        let descriptor = RequestDescriptor::put(endpoint(), "/v1/items/1")
            .with_header("Content-Type", "application/merge-patch+json")
            .with_body_field("name", "w");
        let req = client().build_fetch_request(&descriptor).unwrap();
        let content_types: Vec<_> = req
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(req.header("content-type"), Some("application/merge-patch+json"));
    }

    #[test]
    fn build_fetch_request_rejects_bad_host() {
        let descriptor = RequestDescriptor::get(EndpointConfig::https(""), "/v1/items");
        assert!(matches!(
            client().build_fetch_request(&descriptor),
            Err(NetworkError::InvalidUrl(_))
        ));
    }

    #[test]
    fn build_multipart_request_sets_boundary_header() {
        let descriptor = RequestDescriptor::post(endpoint(), "/v1/multipart")
            .with_header("content-type", "text/plain")
            .with_boundary("B1");
        let req = client()
            .build_multipart_request(
                &descriptor,
                &[MultipartTextField::new("title", "hello")],
                &MultipartDataField::new("file", vec![1u8, 2], "application/octet-stream"),
            )
            .unwrap();
        assert_eq!(req.header("content-type"), Some("multipart/form-data; boundary=B1"));
        assert_eq!(req.headers.len(), 1);
        let body = req.body.as_bytes().unwrap();
        assert!(body.starts_with(b"--B1\r\n"));
        assert!(body.ends_with(b"--B1--"));
    }

    #[test]
    fn parse_response_decodes_snake_case_keys() {
        let item: Item = client()
            .parse_response(
                response(200, r#"{"item_id":7,"display_name":"Seven"}"#),
                KeyNaming::SnakeCase,
            )
            .unwrap();
        assert_eq!(
            item,
            Item {
                item_id: 7,
                display_name: "Seven".into()
            }
        );
    }

    #[test]
    fn parse_response_server_error_keeps_body() {
        let err = client()
            .parse_response::<Item>(response(500, "oops"), KeyNaming::AsDeclared)
            .unwrap_err();
        assert_eq!(
            err,
            NetworkError::ServerStatus {
                code: 500,
                body: "oops".into()
            }
        );
    }

    #[test]
    fn parse_response_rejects_out_of_range_status() {
        let err = client()
            .parse_response::<Value>(response(42, "{}"), KeyNaming::AsDeclared)
            .unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));
    }

    #[test]
    fn parse_response_schema_mismatch_is_decode() {
        let err = client()
            .parse_response::<Item>(response(200, r#"{"itemId":"x"}"#), KeyNaming::AsDeclared)
            .unwrap_err();
        assert!(matches!(err, NetworkError::Decode(_)));
    }

    #[test]
    fn parse_response_empty_body_is_null() {
        client()
            .parse_response::<()>(response(204, ""), KeyNaming::AsDeclared)
            .unwrap();
        let none: Option<Item> = client()
            .parse_response(response(204, ""), KeyNaming::AsDeclared)
            .unwrap();
        assert!(none.is_none());
        assert!(matches!(
            client().parse_response::<Item>(response(204, ""), KeyNaming::AsDeclared),
            Err(NetworkError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fetch_maps_transport_failure() {
        let descriptor = RequestDescriptor::get(endpoint(), "/v1/items");
        let err = client().fetch::<Value>(&descriptor).await.unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn download_with_invalid_url_fails_without_tracking() {
        let client = client();
        let descriptor = RequestDescriptor::get(EndpointConfig::https("bad host"), "/file");
        let event = client.download(&descriptor).finished().await.unwrap();
        assert!(matches!(
            event,
            DownloadEvent::Failed {
                error: NetworkError::InvalidUrl(_),
                resume_token: None
            }
        ));
        assert!(client.download_state().active_task.is_none());
    }

    #[tokio::test]
    async fn corrupt_resume_token_is_decode_failure() {
        let event = client()
            .resume_download(&ResumeToken::from_bytes(&b"{"[..]))
            .finished()
            .await
            .unwrap();
        assert!(matches!(
            event,
            DownloadEvent::Failed {
                error: NetworkError::Decode(_),
                resume_token: None
            }
        ));
    }

    #[test]
    fn download_outside_runtime_fails_immediately() {
        let descriptor = RequestDescriptor::get(endpoint(), "/file");
        let mut stream = client().download(&descriptor);
        let event = futures_util::FutureExt::now_or_never(futures_util::StreamExt::next(&mut stream))
            .flatten()
            .unwrap();
        assert!(matches!(
            event,
            DownloadEvent::Failed {
                error: NetworkError::Transport(_),
                ..
            }
        ));
    }

    #[test]
    fn background_session_is_created_once() {
        let client = TransferClient::new(Offline, ClientConfig::default().with_background_identifier("app.bg"));
        let first = client.background_session() as *const BackgroundSession;
        let second = client.background_session() as *const BackgroundSession;
        assert_eq!(first, second);
        assert_eq!(client.background_session().identifier(), "app.bg");
    }
}

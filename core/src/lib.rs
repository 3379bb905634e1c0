//! Generic HTTP transfer client.
//!
//! # Overview
//! Callers describe a request declaratively with a `RequestDescriptor`
//! (endpoint, path, method, query, headers, JSON body) and execute it through
//! a `TransferClient` as a JSON fetch, a streamed upload, a multipart upload,
//! a resumable download or a background download.
//!
//! # Design
//! - Requests and responses are plain data (`HttpRequest`, `HttpResponse`).
//!   The client builds and classifies them; an `HttpTransport` does the I/O.
//!   `ReqwestTransport` is the default one.
//! - `build_*` / `parse_response` are pure, so URL resolution, body encoding
//!   and error classification are tested without a network.
//! - Streamed uploads go through a `StreamBridge`: the transport pulls the
//!   body and the producer writes only when the transport has asked for more.
//! - Downloads stream to a temp file and report `DownloadEvent`s. Failures
//!   after partial progress carry a `ResumeToken`.
//! - Every outcome is a `TransferResult`; see `NetworkError` for the classes.

pub mod background;
pub mod bridge;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod multipart;
pub mod naming;
pub mod transport;

pub use background::{BackgroundDownload, BackgroundEvent, BackgroundSession};
pub use bridge::{BridgeBody, BridgeMonitor, BridgeState, BridgeWriter, StreamBridge};
pub use client::TransferClient;
pub use config::ClientConfig;
pub use descriptor::RequestDescriptor;
pub use download::{DownloadEvent, DownloadPhase, DownloadState, DownloadStream, Progress, ResumeToken, TaskId};
pub use endpoint::{EndpointConfig, KeyNaming, Scheme};
pub use error::{NetworkError, TransferResult, TransportError};
pub use http::{HttpMethod, HttpRequest, HttpResponse, RequestBody, StreamingResponse};
pub use multipart::{MultipartDataField, MultipartEncoder, MultipartTextField};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use transport::HttpTransport;

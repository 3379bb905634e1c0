//! HTTP transport types exchanged with an `HttpTransport`.
//!
//! # Design
//! Requests and responses are plain data. The client builds `HttpRequest`
//! values and classifies `HttpResponse` values; the transport is the only
//! place that touches the network. Buffered bodies are `Bytes`; a streamed
//! upload hands the transport the consumer half of a `StreamBridge`, and a
//! download receives the body as a stream of chunks.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeBody;
use crate::error::TransportError;

/// A boxed, sendable stream.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an outgoing request.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Pulled lazily by the transport through a readiness-gated pipe.
    Streamed(BridgeBody),
}

impl RequestBody {
    /// Buffered body bytes, if the body is not streamed.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RequestBody::Empty => Some(&[] as &[u8]),
            RequestBody::Bytes(bytes) => Some(bytes),
            RequestBody::Streamed(_) => None,
        }
    }
}

/// An HTTP request described as data.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Per-call timeout; the transport maps expiry to `TransportError::Timeout`.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// An HTTP response with its body fully buffered.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An HTTP response whose body has not been read yet.
pub struct StreamingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Declared body length, when the server sent one.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl StreamingResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Read the whole body into memory.
    pub async fn collect(mut self) -> Result<HttpResponse, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(HttpResponse {
            status: self.status,
            headers: self.headers,
            body: buf.freeze(),
        })
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Bytes::new(),
        };
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.header("etag"), None);
    }

    #[test]
    fn method_renders_uppercase() {
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert_eq!(serde_json::to_string(&HttpMethod::Get).unwrap(), "\"GET\"");
    }

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let chunks = vec![Ok(Bytes::from_static(b"he")), Ok(Bytes::from_static(b"llo"))];
        let response = StreamingResponse {
            status: 200,
            headers: Vec::new(),
            content_length: Some(5),
            body: Box::pin(stream::iter(chunks)),
        };
        let collected = response.collect().await.unwrap();
        assert_eq!(&collected.body[..], b"hello");
    }

    #[tokio::test]
    async fn collect_surfaces_body_errors() {
        let chunks = vec![
            Ok(Bytes::from_static(b"he")),
            Err(TransportError::Body("reset".into())),
        ];
        let response = StreamingResponse {
            status: 200,
            headers: Vec::new(),
            content_length: None,
            body: Box::pin(stream::iter(chunks)),
        };
        assert_eq!(
            response.collect().await.unwrap_err(),
            TransportError::Body("reset".into())
        );
    }
}

//! The seam between the client and an underlying HTTP stack.
//!
//! Implementations own connection management, TLS and redirects. They report
//! failures that produced no response as `TransportError`; any response with
//! a status line, including 4xx/5xx, is returned as data.

use std::future::Future;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse, StreamingResponse};

/// Asynchronous HTTP transport.
pub trait HttpTransport: Send + Sync + 'static {
    /// Send `request` and return once the response head has arrived.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<StreamingResponse, TransportError>> + Send;

    /// Send `request` and buffer the whole response body.
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send {
        async move { self.send(request).await?.collect().await }
    }
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use futures_util::StreamExt;

    use super::*;
    use crate::http::{HttpMethod, RequestBody};

    /// Production transport backed by `reqwest`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            Ok(Self { client })
        }

        /// Wrap an already configured client.
        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<StreamingResponse, TransportError> {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            builder = match request.body {
                RequestBody::Empty => builder,
                RequestBody::Bytes(bytes) => builder.body(bytes),
                RequestBody::Streamed(body) => builder.body(reqwest::Body::wrap_stream(body)),
            };

            let response = builder.send().await.map_err(map_error)?;
            let status = response.status().as_u16();
            let content_length = response.content_length();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response.bytes_stream().map(|chunk| chunk.map_err(map_error));

            Ok(StreamingResponse {
                status,
                headers,
                content_length,
                body: Box::pin(body),
            })
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestTransport;

//! Error types for the transfer client.
//!
//! # Design
//! Every operation resolves to a `TransferResult`: success and each failure
//! class travel through the same channel. `ServerStatus` keeps the raw status
//! code and body text for diagnostics. `Decode` keeps only the decoder's
//! message; the offending bytes are logged and dropped.
//!
//! `TransportError` is what an `HttpTransport` implementation reports. It
//! always collapses into `NetworkError::Transport` once it crosses into the
//! client.

use thiserror::Error;

/// Result of one transfer operation.
pub type TransferResult<T> = Result<T, NetworkError>;

/// Failure classes surfaced by `TransferClient` operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// The descriptor could not produce a well-formed request target.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No usable response: connection failure, timeout, truncated body or
    /// bytes left undelivered by a streamed upload.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server answered with a status outside `200..=299`.
    #[error("HTTP {code}: {body}")]
    ServerStatus { code: u16, body: String },

    /// The status was successful but the body did not match the target type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A write was attempted after the upload stream was torn down.
    #[error("upload stream closed")]
    StreamClosed,
}

impl NetworkError {
    /// Whether a caller-driven retry could plausibly succeed.
    ///
    /// The client itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::Transport(_))
    }
}

/// Errors reported by an `HttpTransport`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    /// The response body stream failed after headers were received.
    #[error("body stream failed: {0}")]
    Body(String),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for NetworkError {
    fn from(err: TransportError) -> Self {
        NetworkError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(NetworkError::Transport("reset".into()).is_retryable());
        assert!(!NetworkError::InvalidUrl("".into()).is_retryable());
        assert!(!NetworkError::ServerStatus { code: 503, body: String::new() }.is_retryable());
        assert!(!NetworkError::Decode("eof".into()).is_retryable());
        assert!(!NetworkError::StreamClosed.is_retryable());
    }

    #[test]
    fn transport_error_collapses_into_transport() {
        let err: NetworkError = TransportError::Timeout.into();
        assert_eq!(err, NetworkError::Transport("request timed out".into()));
    }

    #[test]
    fn server_status_display_includes_body() {
        let err = NetworkError::ServerStatus { code: 500, body: "oops".into() };
        assert_eq!(err.to_string(), "HTTP 500: oops");
    }
}

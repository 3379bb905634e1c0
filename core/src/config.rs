//! Client-wide settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings shared by every request a `TransferClient` issues.
///
/// Deserializable so a host can load it alongside its own configuration;
/// missing fields fall back to `Default`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bytes a streamed upload hands over per readiness event.
    pub stream_buffer_size: usize,
    /// Directory download temp files are created in.
    pub download_dir: PathBuf,
    /// Identifier of the background session.
    pub background_identifier: String,
    /// Timeout for fetch, multipart and download calls. Streamed uploads take
    /// their own explicit timeout.
    #[serde(with = "optional_millis")]
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: 4096,
            download_dir: std::env::temp_dir(),
            background_identifier: "transfer-core.background".to_string(),
            request_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_background_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.background_identifier = identifier.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

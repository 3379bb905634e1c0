//! Endpoint configuration: where a descriptor is sent and how its response
//! keys are named.

use serde::{Deserialize, Serialize};

/// URL scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Strategy for mapping response JSON keys onto the decoded type's fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNaming {
    /// Rewrite `snake_case` wire keys to `lowerCamelCase` before decoding.
    SnakeCase,
    /// Use wire keys verbatim.
    #[default]
    AsDeclared,
}

/// Immutable endpoint a `RequestDescriptor` is resolved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub scheme: Scheme,
    pub host: String,
    /// Explicit port; `None` uses the scheme's default.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub key_naming: KeyNaming,
}

impl EndpointConfig {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: None,
            key_naming: KeyNaming::default(),
        }
    }

    pub fn https(host: impl Into<String>) -> Self {
        Self::new(Scheme::Https, host)
    }

    pub fn http(host: impl Into<String>) -> Self {
        Self::new(Scheme::Http, host)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_key_naming(mut self, key_naming: KeyNaming) -> Self {
        self.key_naming = key_naming;
        self
    }

    /// `scheme://host[:port]` without a trailing slash.
    pub fn origin(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{port}", self.scheme.as_str(), self.host),
            None => format!("{}://{}", self.scheme.as_str(), self.host),
        }
    }
}

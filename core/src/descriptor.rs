//! Declarative description of one request, independent of transport.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use url::Url;

use crate::endpoint::EndpointConfig;
use crate::error::{NetworkError, TransferResult};
use crate::http::HttpMethod;

/// Characters that would make `host` bleed into another URL component.
const HOST_DELIMITERS: &[char] = &['/', '?', '#', '@', '\\'];

/// One logical request: target, method, headers and an optional JSON body.
///
/// Query parameters are applied to the URL only for `GET`. Maps are ordered
/// so the resolved URL and header list are deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: HttpMethod,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub json_body: Option<Map<String, Value>>,
    pub endpoint: EndpointConfig,
    /// Fixed multipart boundary; a fresh one is generated when `None`.
    pub boundary: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, endpoint: EndpointConfig, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            json_body: None,
            endpoint,
            boundary: None,
        }
    }

    pub fn get(endpoint: EndpointConfig, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint, path)
    }

    pub fn post(endpoint: EndpointConfig, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, endpoint, path)
    }

    pub fn put(endpoint: EndpointConfig, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, endpoint, path)
    }

    pub fn delete(endpoint: EndpointConfig, path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, endpoint, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_json_body(mut self, body: Map<String, Value>) -> Self {
        self.json_body = Some(body);
        self
    }

    /// Set a single field of the JSON body, creating the body if needed.
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.json_body
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    /// Resolve endpoint, path and (for `GET`) query into a URL.
    pub fn resolve_url(&self) -> TransferResult<Url> {
        let host = self.endpoint.host.as_str();
        if host.trim().is_empty() {
            return Err(NetworkError::InvalidUrl("endpoint host is empty".to_string()));
        }
        if host.contains(HOST_DELIMITERS) || host.chars().any(char::is_whitespace) {
            return Err(NetworkError::InvalidUrl(format!("malformed host {host:?}")));
        }

        let origin = self.endpoint.origin();
        let mut url = Url::parse(&origin)
            .map_err(|e| NetworkError::InvalidUrl(format!("{origin}: {e}")))?;
        if url.host_str().is_none() {
            return Err(NetworkError::InvalidUrl(format!("{origin}: missing host")));
        }

        url.set_path(&self.path);
        if self.method == HttpMethod::Get && !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok(url)
    }

    /// Headers as an ordered list of pairs.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

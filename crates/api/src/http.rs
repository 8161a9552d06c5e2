//! HTTP transport port for the chart API, and its `reqwest` implementation.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Raw response as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Transport-level failure: no HTTP status was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HttpRequestError {
    pub message: String,
    pub is_timeout: bool,
}

impl HttpRequestError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_timeout: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_timeout: true,
        }
    }
}

/// Sends JSON POST requests.
#[async_trait]
pub trait HttpRequester: Send + Sync {
    async fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value, timeout: Duration) -> Result<HttpResponse, HttpRequestError>;
}

/// [`HttpRequester`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestRequester {
    http: Client,
}

impl ReqwestRequester {
    /// Builds a client that accepts PNG or JSON responses.
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("image/png, application/json"));
        let http = Client::builder()
            .default_headers(default_headers)
            .user_agent(concat!("chart-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpRequester for ReqwestRequester {
    async fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value, timeout: Duration) -> Result<HttpResponse, HttpRequestError> {
        let mut request = self.http.post(url).json(body).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                HttpRequestError::timeout("Chart-IMG request timed out")
            } else {
                debug!(error = %chart_worker_util::redact_sensitive(&error.to_string()), "chart_api_transport_error");
                HttpRequestError::network("Chart-IMG request failed")
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_ascii_lowercase(), value.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                HttpRequestError::timeout("Chart-IMG request timed out")
            } else {
                HttpRequestError::network("Chart-IMG response body could not be read")
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

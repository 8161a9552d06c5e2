//! Chart-IMG API client.
//!
//! This crate renders chart images through the Chart-IMG advanced chart
//! endpoint. It focuses on:
//!
//! - A transport port ([`HttpRequester`]) with a `reqwest` implementation
//! - Classifying responses into the step error taxonomy ([`classify`])
//! - Deterministic fixtures for `mock` and `record` modes ([`fixtures`])
//! - Validating the configured base URL for safety
//!
//! The primary entry point is [`ChartImgClient`], used through the
//! [`ChartRenderer`] trait so callers can substitute scripted renderers.

pub mod classify;
mod client;
pub mod fixtures;
pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use chart_worker_types::{ChartApiError, ChartImgAccount};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

pub use client::{ADVANCED_CHART_PATH, API_KEY_HEADER, ChartImgClient, ChartImgClientConfig, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
pub use http::{HttpRequestError, HttpRequester, HttpResponse, ReqwestRequester};

/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// One chart to render.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartImgRequest {
    pub chart_template_id: String,
    /// Fully qualified symbol, e.g. `BINANCE:BTCUSDT`.
    pub chart_img_symbol: String,
    pub timeframe: String,
    /// JSON body sent to the API.
    pub payload: Map<String, Value>,
}

impl ChartImgRequest {
    pub fn new(
        chart_template_id: impl Into<String>,
        chart_img_symbol: impl Into<String>,
        timeframe: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            chart_template_id: chart_template_id.into(),
            chart_img_symbol: chart_img_symbol.into(),
            timeframe: timeframe.into(),
            payload,
        }
    }
}

/// A rendered PNG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedChart {
    pub png: Vec<u8>,
    /// Set when the image came from a fixture rather than the API.
    pub fixture_path: Option<PathBuf>,
}

impl RenderedChart {
    pub fn live(png: Vec<u8>) -> Self {
        Self { png, fixture_path: None }
    }
}

/// Renders one chart with one account. Makes exactly one attempt.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, account: &ChartImgAccount, request: &ChartImgRequest) -> Result<RenderedChart, ChartApiError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BaseUrlError {
    #[error("invalid Chart-IMG base URL '{url}': {reason}")]
    Invalid { url: String, reason: String },
    #[error("Chart-IMG base URL must include a host")]
    MissingHost,
    #[error("Chart-IMG base URL must use https for non-localhost hosts; got '{0}://'")]
    InsecureScheme(String),
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
pub fn validate_base_url(base: &str) -> Result<Url, BaseUrlError> {
    let parsed = Url::parse(base.trim()).map_err(|error| BaseUrlError::Invalid {
        url: base.to_string(),
        reason: error.to_string(),
    })?;
    let host_name = parsed.host_str().ok_or(BaseUrlError::MissingHost)?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host_name.eq_ignore_ascii_case(allowed)) {
        return Ok(parsed);
    }
    if parsed.scheme() != "https" {
        return Err(BaseUrlError::InsecureScheme(parsed.scheme().to_string()));
    }
    Ok(parsed)
}

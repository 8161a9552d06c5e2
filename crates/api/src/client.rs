//! Chart-IMG client with live, fixture-backed and recording modes.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chart_worker_types::{ChartApiError, ChartImgAccount, ChartsApiMode, ErrorCode};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    ChartImgRequest, ChartRenderer, RenderedChart,
    classify::{classify_response, classify_transport_error},
    fixtures::{DEFAULT_FIXTURES_DIR, FixtureError, FixtureHit, FixtureStore},
    http::HttpRequester,
    validate_base_url, BaseUrlError,
};

/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.chart-img.com";
/// Path of the advanced chart rendering endpoint.
pub const ADVANCED_CHART_PATH: &str = "/v2/tradingview/advanced-chart";
/// Header carrying the account's API key.
pub const API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for [`ChartImgClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImgClientConfig {
    pub mode: ChartsApiMode,
    pub base_url: String,
    pub fixtures_dir: PathBuf,
    pub timeout: Duration,
}

impl Default for ChartImgClientConfig {
    fn default() -> Self {
        Self {
            mode: ChartsApiMode::Real,
            base_url: DEFAULT_BASE_URL.to_string(),
            fixtures_dir: PathBuf::from(DEFAULT_FIXTURES_DIR),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Renders charts through Chart-IMG, or through fixtures in `mock`/`record` mode.
///
/// - `real`: always calls the API.
/// - `mock`: serves fixtures only; a missing fixture is `CHART_API_MOCK_MISSING`.
/// - `record`: serves an existing fixture, otherwise calls the API and stores
///   the outcome as a new fixture.
#[derive(Clone)]
pub struct ChartImgClient {
    mode: ChartsApiMode,
    endpoint: String,
    fixtures: FixtureStore,
    timeout: Duration,
    http: Arc<dyn HttpRequester>,
}

impl ChartImgClient {
    /// Builds a client. The base URL is validated even in `mock` mode.
    pub fn new(config: ChartImgClientConfig, http: Arc<dyn HttpRequester>) -> Result<Self, BaseUrlError> {
        let base = validate_base_url(&config.base_url)?;
        let endpoint = format!("{}{ADVANCED_CHART_PATH}", base.as_str().trim_end_matches('/'));
        Ok(Self {
            mode: config.mode,
            endpoint,
            fixtures: FixtureStore::new(config.fixtures_dir),
            timeout: config.timeout,
            http,
        })
    }

    pub fn mode(&self) -> ChartsApiMode {
        self.mode
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fixtures(&self) -> &FixtureStore {
        &self.fixtures
    }

    async fn fetch_live(&self, account: &ChartImgAccount, request: &ChartImgRequest) -> Result<Vec<u8>, ChartApiError> {
        let body = Value::Object(request.payload.clone());
        let headers = [(API_KEY_HEADER, account.api_key.as_str())];
        debug!(
            account_id = %account.id,
            chart_template_id = %request.chart_template_id,
            chart_img_symbol = %request.chart_img_symbol,
            "chart_api_request"
        );
        match self.http.post_json(&self.endpoint, &headers, &body, self.timeout).await {
            Ok(response) => classify_response(response, request),
            Err(error) => Err(classify_transport_error(&error)),
        }
    }

    fn load_fixture(&self, request: &ChartImgRequest) -> Result<Option<RenderedChart>, ChartApiError> {
        match self.fixtures.load(request) {
            Ok(Some(FixtureHit::Image { png, path })) => Ok(Some(RenderedChart {
                png,
                fixture_path: Some(path),
            })),
            Ok(Some(FixtureHit::Error { error, path })) => {
                debug!(fixture_path = %path.display(), error_code = %error.code, "chart_api_fixture_error");
                Err(error)
            }
            Ok(None) => Ok(None),
            Err(error) => Err(fixture_read_failure(&error)),
        }
    }

    fn record(&self, request: &ChartImgRequest, outcome: &Result<Vec<u8>, ChartApiError>) {
        let written = match outcome {
            Ok(png) => self.fixtures.record_image(request, png),
            Err(error) => self.fixtures.record_error(request, error),
        };
        match written {
            Ok(path) => debug!(fixture_path = %path.display(), "chart_api_fixture_recorded"),
            Err(error) => warn!(error = %error, chart_template_id = %request.chart_template_id, "chart_api_fixture_record_failed"),
        }
    }
}

#[async_trait]
impl ChartRenderer for ChartImgClient {
    async fn render(&self, account: &ChartImgAccount, request: &ChartImgRequest) -> Result<RenderedChart, ChartApiError> {
        match self.mode {
            ChartsApiMode::Mock => match self.load_fixture(request)? {
                Some(chart) => Ok(chart),
                None => {
                    let error = self.fixtures.missing_error(request);
                    warn!(
                        error_code = %ErrorCode::ChartApiMockMissing,
                        fixture_stem = %crate::fixtures::fixture_stem(request),
                        fixtures_dir = %self.fixtures.dir().display(),
                        chart_template_id = %request.chart_template_id,
                        "chart_api_mock_missing"
                    );
                    Err(error)
                }
            },
            ChartsApiMode::Record => {
                if let Some(chart) = self.load_fixture(request)? {
                    return Ok(chart);
                }
                let outcome = self.fetch_live(account, request).await;
                self.record(request, &outcome);
                outcome.map(RenderedChart::live)
            }
            ChartsApiMode::Real => self.fetch_live(account, request).await.map(RenderedChart::live),
        }
    }
}

fn fixture_read_failure(error: &FixtureError) -> ChartApiError {
    let mut details = Map::new();
    details.insert("reason".into(), json!("fixture_io"));
    ChartApiError::new(ErrorCode::ChartApiFailed, format!("Chart-IMG fixture could not be read: {error}"), false).with_details(details)
}

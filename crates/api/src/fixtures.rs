//! Deterministic fixtures for the `mock` and `record` client modes.
//!
//! Layout inside the fixtures directory, with
//! `<stem> = <chartImgSymbol with ':' → '_'>__<timeframe>__<chartTemplateId>`:
//!
//! - `<stem>.png`: successful render.
//! - `<stem>__<status>_<SLUG>.json`: recorded failure, either
//!   `{"status": 429, "body": {...}}` or a bare body whose status comes from
//!   the file name.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chart_worker_types::{ChartApiError, ErrorCode};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::{ChartImgRequest, classify};

/// Default fixture directory, relative to the working directory.
pub const DEFAULT_FIXTURES_DIR: &str = "fixtures/chart-img/advanced-chart-v2";

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("fixture I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fixture serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FixtureError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a fixture lookup produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureHit {
    /// A valid PNG fixture.
    Image { png: Vec<u8>, path: PathBuf },
    /// A PNG fixture without the PNG signature, or a recorded error.
    Error { error: ChartApiError, path: PathBuf },
}

/// File stem shared by every fixture of one request.
pub fn fixture_stem(request: &ChartImgRequest) -> String {
    format!(
        "{}__{}__{}",
        request.chart_img_symbol.replace(':', "_"),
        request.timeframe,
        request.chart_template_id
    )
}

/// Uppercase alphanumerics with every other run collapsed to one `_`.
pub fn slugify_error(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    let mut last_was_separator = false;
    for c in message.to_uppercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_was_separator = false;
        } else if !last_was_separator {
            slug.push('_');
            last_was_separator = true;
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() { "ERROR".to_string() } else { slug.to_string() }
}

/// Leading digits of the last `__`-separated part of an error fixture name.
pub fn status_from_file_name(file_name: &str) -> Option<u16> {
    let (_, suffix) = file_name.rsplit_once("__")?;
    let suffix = suffix.strip_suffix(".json")?;
    let digits: String = suffix.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Fixture directory for one client.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    dir: PathBuf,
}

impl FixtureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Looks up the fixture for `request`. `Ok(None)` means nothing is recorded.
    pub fn load(&self, request: &ChartImgRequest) -> Result<Option<FixtureHit>, FixtureError> {
        let stem = fixture_stem(request);
        let png_path = self.dir.join(format!("{stem}.png"));
        match fs::read(&png_path) {
            Ok(png) if classify::is_png(&png) => return Ok(Some(FixtureHit::Image { png, path: png_path })),
            Ok(_) => {
                let mut details = Map::new();
                details.insert("fixturePath".into(), json!(png_path.display().to_string()));
                let error = ChartApiError::new(ErrorCode::ChartApiFailed, "Fixture PNG is invalid", false).with_details(details);
                return Ok(Some(FixtureHit::Error { error, path: png_path }));
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(FixtureError::io(&png_path, error)),
        }

        let Some(path) = self.find_error_fixture(&stem)? else {
            return Ok(None);
        };
        let error = self.load_error_fixture(&path, request)?;
        Ok(Some(FixtureHit::Error { error, path }))
    }

    /// Error describing a lookup that found nothing.
    pub fn missing_error(&self, request: &ChartImgRequest) -> ChartApiError {
        let mut details = Map::new();
        details.insert("fixtureStem".into(), json!(fixture_stem(request)));
        details.insert("fixturesDir".into(), json!(self.dir.display().to_string()));
        ChartApiError::new(ErrorCode::ChartApiMockMissing, "Chart-IMG fixture is missing", false).with_details(details)
    }

    /// Stores a successful render as `<stem>.png`.
    pub fn record_image(&self, request: &ChartImgRequest, png: &[u8]) -> Result<PathBuf, FixtureError> {
        self.ensure_dir()?;
        let path = self.dir.join(format!("{}.png", fixture_stem(request)));
        fs::write(&path, png).map_err(|error| FixtureError::io(&path, error))?;
        Ok(path)
    }

    /// Stores a failed call as `<stem>__<status>_<SLUG>.json`.
    pub fn record_error(&self, request: &ChartImgRequest, error: &ChartApiError) -> Result<PathBuf, FixtureError> {
        self.ensure_dir()?;
        let status = error.http_status.unwrap_or(0);
        let file_name = format!("{}__{}_{}.json", fixture_stem(request), status, slugify_error(&error.message));
        let path = self.dir.join(file_name);
        let body = error.details.as_ref().and_then(|details| details.get("response")).cloned().unwrap_or(Value::Null);
        let payload = json!({"status": error.http_status, "body": body});
        fs::write(&path, serde_json::to_string_pretty(&payload)?).map_err(|error| FixtureError::io(&path, error))?;
        Ok(path)
    }

    fn ensure_dir(&self) -> Result<(), FixtureError> {
        fs::create_dir_all(&self.dir).map_err(|error| FixtureError::io(&self.dir, error))
    }

    fn find_error_fixture(&self, stem: &str) -> Result<Option<PathBuf>, FixtureError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(FixtureError::io(&self.dir, error)),
        };

        let prefix = format!("{stem}__");
        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| FixtureError::io(&self.dir, error))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(&prefix) && file_name.ends_with(".json") {
                matches.push(file_name);
            }
        }
        matches.sort();
        Ok(matches.into_iter().next().map(|file_name| self.dir.join(file_name)))
    }

    fn load_error_fixture(&self, path: &Path, request: &ChartImgRequest) -> Result<ChartApiError, FixtureError> {
        let content = fs::read(path).map_err(|error| FixtureError::io(path, error))?;
        let payload: Option<Value> = serde_json::from_slice(&content).ok();

        let (status, body) = match payload {
            Some(Value::Object(mut object)) if object.contains_key("status") && object.contains_key("body") => {
                let status = match object.get("status") {
                    Some(Value::Number(number)) => number.as_u64().and_then(|status| u16::try_from(status).ok()),
                    Some(Value::String(text)) => text.parse().ok(),
                    _ => None,
                };
                (status, object.remove("body"))
            }
            other => (None, other),
        };
        let status = status.or_else(|| path.file_name().and_then(|name| status_from_file_name(&name.to_string_lossy())));
        let body = body.filter(|body| !body.is_null());

        Ok(classify::classify_error_body(status, body, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request() -> ChartImgRequest {
        ChartImgRequest::new("ctpl_price_v1", "BINANCE:BTCUSDT", "1h", Map::new())
    }

    #[test]
    fn stem_replaces_colons() {
        assert_eq!(fixture_stem(&request()), "BINANCE_BTCUSDT__1h__ctpl_price_v1");
    }

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slugify_error("Too many requests -- limit exceeded!"), "TOO_MANY_REQUESTS_LIMIT_EXCEEDED");
        assert_eq!(slugify_error("!!!"), "ERROR");
    }

    #[test]
    fn status_is_parsed_from_file_name() {
        assert_eq!(status_from_file_name("BINANCE_BTCUSDT__1h__tpl__429_LIMIT.json"), Some(429));
        assert_eq!(status_from_file_name("BINANCE_BTCUSDT__1h__tpl__LIMIT.json"), None);
        assert_eq!(status_from_file_name("BINANCE_BTCUSDT__1h__tpl__500.png"), None);
    }

    #[test]
    fn png_fixture_is_served() {
        let dir = tempdir().unwrap();
        let mut png = classify::PNG_SIGNATURE.to_vec();
        png.push(1);
        fs::write(dir.path().join("BINANCE_BTCUSDT__1h__ctpl_price_v1.png"), &png).unwrap();

        let hit = FixtureStore::new(dir.path()).load(&request()).unwrap().unwrap();
        assert!(matches!(hit, FixtureHit::Image { png: bytes, .. } if bytes == png));
    }

    #[test]
    fn invalid_png_fixture_is_a_permanent_failure() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("BINANCE_BTCUSDT__1h__ctpl_price_v1.png"), b"not a png").unwrap();

        let Some(FixtureHit::Error { error, .. }) = FixtureStore::new(dir.path()).load(&request()).unwrap() else {
            panic!("expected error fixture");
        };
        assert_eq!(error.message, "Fixture PNG is invalid");
        assert!(!error.retriable);
    }

    #[test]
    fn first_sorted_error_fixture_wins() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("BINANCE_BTCUSDT__1h__ctpl_price_v1__500_SERVER.json"),
            r#"{"message": "server"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("BINANCE_BTCUSDT__1h__ctpl_price_v1__429_LIMIT.json"),
            r#"{"status": 429, "body": {"message": "Limit Exceeded"}}"#,
        )
        .unwrap();

        let Some(FixtureHit::Error { error, path }) = FixtureStore::new(dir.path()).load(&request()).unwrap() else {
            panic!("expected error fixture");
        };
        assert!(path.ends_with("BINANCE_BTCUSDT__1h__ctpl_price_v1__429_LIMIT.json"));
        assert_eq!(error.code, ErrorCode::ChartApiLimitExceeded);
        assert_eq!(error.http_status, Some(429));
    }

    #[test]
    fn bare_body_takes_status_from_file_name() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("BINANCE_BTCUSDT__1h__ctpl_price_v1__500_SERVER.json"),
            r#"{"message": "server down"}"#,
        )
        .unwrap();

        let Some(FixtureHit::Error { error, .. }) = FixtureStore::new(dir.path()).load(&request()).unwrap() else {
            panic!("expected error fixture");
        };
        assert_eq!(error.http_status, Some(500));
        assert!(error.retriable);
        assert_eq!(error.message, "server down");
    }

    #[test]
    fn missing_directory_means_no_fixture() {
        let dir = tempdir().unwrap();
        let store = FixtureStore::new(dir.path().join("absent"));
        assert!(store.load(&request()).unwrap().is_none());

        let error = store.missing_error(&request());
        assert_eq!(error.code, ErrorCode::ChartApiMockMissing);
        assert_eq!(error.details.unwrap()["fixtureStem"], json!("BINANCE_BTCUSDT__1h__ctpl_price_v1"));
    }

    #[test]
    fn recorded_error_is_loadable() {
        let dir = tempdir().unwrap();
        let store = FixtureStore::new(dir.path().join("recorded"));
        let original = classify::classify_error_body(Some(429), Some(json!({"message": "Limit exceeded"})), &request());

        let path = store.record_error(&request(), &original).unwrap();
        assert!(path.ends_with("BINANCE_BTCUSDT__1h__ctpl_price_v1__429_LIMIT_EXCEEDED.json"));

        let Some(FixtureHit::Error { error, .. }) = store.load(&request()).unwrap() else {
            panic!("expected error fixture");
        };
        assert_eq!(error, original);
    }
}

//! Environment-driven worker settings.
//!
//! | variable | default |
//! |---|---|
//! | `CHARTS_BUCKET` | required; `gs://<bucket>` or a bare name |
//! | `CHARTS_API_MODE` | `real` |
//! | `CHARTS_DEFAULT_TIMEZONE` | `Etc/UTC` |
//! | `CHART_IMG_ACCOUNTS_JSON` | required; `[{"id", "apiKey", "dailyLimit"?}]` |
//! | `CHART_IMG_DAILY_LIMIT` | `50` |
//! | `CHART_IMG_BASE_URL` | `https://api.chart-img.com` |
//! | `CHARTS_FIXTURES_DIR` | `fixtures/chart-img/advanced-chart-v2` |
//! | `CHART_IMG_TIMEOUT_SECS` | `30` |
//! | `TDA_ENV`, then `ENV` | unset |

use std::{collections::HashSet, path::PathBuf, time::Duration};

use chart_worker_api::{ChartImgClientConfig, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, fixtures::DEFAULT_FIXTURES_DIR, validate_base_url};
use chart_worker_types::{ChartImgAccount, ChartsApiMode};
use chart_worker_util::GcsBucket;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::allocator::DEFAULT_DAILY_LIMIT;

pub const SERVICE_NAME: &str = "chart-worker";
pub const DEFAULT_TIMEZONE: &str = "Etc/UTC";

pub const CHARTS_BUCKET: &str = "CHARTS_BUCKET";
pub const CHARTS_API_MODE: &str = "CHARTS_API_MODE";
pub const CHARTS_DEFAULT_TIMEZONE: &str = "CHARTS_DEFAULT_TIMEZONE";
pub const CHART_IMG_ACCOUNTS_JSON: &str = "CHART_IMG_ACCOUNTS_JSON";
pub const CHART_IMG_DAILY_LIMIT: &str = "CHART_IMG_DAILY_LIMIT";
pub const CHART_IMG_BASE_URL: &str = "CHART_IMG_BASE_URL";
pub const CHARTS_FIXTURES_DIR: &str = "CHARTS_FIXTURES_DIR";
pub const CHART_IMG_TIMEOUT_SECS: &str = "CHART_IMG_TIMEOUT_SECS";

/// `UTC`, `Etc/<zone>`, or an `Area/City` IANA-shaped name.
static TIMEZONE_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(UTC|Etc/[A-Za-z0-9+\-_]+|[A-Z][A-Za-z_]+(/[A-Za-z0-9_+\-]+)+)$").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required env var: {name}")]
    Missing { name: &'static str },
    #[error("{message}")]
    Invalid { name: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }

    /// The variable at fault.
    pub fn variable(&self) -> &'static str {
        match self {
            Self::Missing { name } | Self::Invalid { name, .. } => name,
        }
    }
}

/// Resolved worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub charts_bucket: GcsBucket,
    pub charts_api_mode: ChartsApiMode,
    pub charts_default_timezone: String,
    /// Account pool in selection order.
    pub chart_img_accounts: Vec<ChartImgAccount>,
    pub chart_img_daily_limit: u32,
    pub chart_img_base_url: String,
    pub charts_fixtures_dir: PathBuf,
    pub chart_img_timeout: Duration,
    pub env: Option<String>,
    pub service: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        let bucket_raw = get(CHARTS_BUCKET).ok_or(ConfigError::Missing { name: CHARTS_BUCKET })?;
        let charts_bucket = GcsBucket::parse(&bucket_raw)
            .map_err(|_| ConfigError::invalid(CHARTS_BUCKET, "CHARTS_BUCKET must be a bucket name or gs://<bucket> (no path)"))?;

        let charts_api_mode = match get(CHARTS_API_MODE) {
            Some(raw) => raw
                .parse::<ChartsApiMode>()
                .map_err(|_| ConfigError::invalid(CHARTS_API_MODE, "CHARTS_API_MODE must be one of: real|mock|record"))?,
            None => ChartsApiMode::Real,
        };

        let charts_default_timezone = get(CHARTS_DEFAULT_TIMEZONE).unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        if !is_timezone_name(&charts_default_timezone) {
            return Err(ConfigError::invalid(
                CHARTS_DEFAULT_TIMEZONE,
                "CHARTS_DEFAULT_TIMEZONE must be an IANA timezone name (e.g. Etc/UTC)",
            ));
        }

        let accounts_raw = get(CHART_IMG_ACCOUNTS_JSON).ok_or(ConfigError::Missing { name: CHART_IMG_ACCOUNTS_JSON })?;
        let chart_img_accounts = parse_accounts_json(&accounts_raw)?;

        let chart_img_daily_limit = match get(CHART_IMG_DAILY_LIMIT) {
            Some(raw) => parse_positive(&raw).ok_or_else(|| {
                ConfigError::invalid(CHART_IMG_DAILY_LIMIT, "CHART_IMG_DAILY_LIMIT must be a positive integer")
            })?,
            None => DEFAULT_DAILY_LIMIT,
        };

        let chart_img_base_url = get(CHART_IMG_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        validate_base_url(&chart_img_base_url).map_err(|error| ConfigError::invalid(CHART_IMG_BASE_URL, error.to_string()))?;

        let charts_fixtures_dir = PathBuf::from(get(CHARTS_FIXTURES_DIR).unwrap_or_else(|| DEFAULT_FIXTURES_DIR.to_string()));

        let chart_img_timeout = match get(CHART_IMG_TIMEOUT_SECS) {
            Some(raw) => parse_positive(&raw).map(|secs| Duration::from_secs(u64::from(secs))).ok_or_else(|| {
                ConfigError::invalid(CHART_IMG_TIMEOUT_SECS, "CHART_IMG_TIMEOUT_SECS must be a positive integer")
            })?,
            None => DEFAULT_TIMEOUT,
        };

        let env = get("TDA_ENV").or_else(|| get("ENV"));
        if charts_api_mode == ChartsApiMode::Record && env.as_deref() == Some("prod") {
            return Err(ConfigError::invalid(CHARTS_API_MODE, "CHARTS_API_MODE=record is not allowed in prod"));
        }

        Ok(Self {
            charts_bucket,
            charts_api_mode,
            charts_default_timezone,
            chart_img_accounts,
            chart_img_daily_limit,
            chart_img_base_url,
            charts_fixtures_dir,
            chart_img_timeout,
            env,
            service: SERVICE_NAME.to_string(),
        })
    }

    /// Settings for the Chart-IMG client.
    pub fn client_config(&self) -> ChartImgClientConfig {
        ChartImgClientConfig {
            mode: self.charts_api_mode,
            base_url: self.chart_img_base_url.clone(),
            fixtures_dir: self.charts_fixtures_dir.clone(),
            timeout: self.chart_img_timeout,
        }
    }
}

/// Parses the account pool, keeping its order.
pub fn parse_accounts_json(raw: &str) -> Result<Vec<ChartImgAccount>, ConfigError> {
    let invalid = |message: String| ConfigError::invalid(CHART_IMG_ACCOUNTS_JSON, message);

    let data: Value = serde_json::from_str(raw).map_err(|_| invalid("CHART_IMG_ACCOUNTS_JSON must be a valid JSON array".into()))?;
    let items = data
        .as_array()
        .ok_or_else(|| invalid("CHART_IMG_ACCOUNTS_JSON must be a JSON array".into()))?;

    let mut seen = HashSet::new();
    let mut accounts = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let entry = item
            .as_object()
            .ok_or_else(|| invalid(format!("CHART_IMG_ACCOUNTS_JSON[{index}] must be an object with fields id/apiKey")))?;
        let non_blank = |field: &str| entry.get(field).and_then(Value::as_str).filter(|value| !value.trim().is_empty());

        let id = non_blank("id").ok_or_else(|| invalid(format!("CHART_IMG_ACCOUNTS_JSON[{index}].id must be a non-empty string")))?;
        let api_key =
            non_blank("apiKey").ok_or_else(|| invalid(format!("CHART_IMG_ACCOUNTS_JSON[{index}].apiKey must be a non-empty string")))?;
        if !seen.insert(id) {
            return Err(invalid(format!("Duplicate Chart-IMG account id: {id}")));
        }

        let mut account = ChartImgAccount::new(id, api_key);
        if let Some(limit) = entry.get("dailyLimit").filter(|limit| !limit.is_null()) {
            let limit = limit
                .as_u64()
                .and_then(|limit| u32::try_from(limit).ok())
                .filter(|limit| *limit > 0)
                .ok_or_else(|| invalid(format!("CHART_IMG_ACCOUNTS_JSON[{index}].dailyLimit must be a positive integer")))?;
            account = account.with_daily_limit(limit);
        }
        accounts.push(account);
    }

    if accounts.is_empty() {
        return Err(invalid("CHART_IMG_ACCOUNTS_JSON must contain at least 1 account".into()));
    }
    Ok(accounts)
}

fn is_timezone_name(name: &str) -> bool {
    TIMEZONE_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(name))
}

fn parse_positive(raw: &str) -> Option<u32> {
    raw.parse::<u32>().ok().filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ACCOUNTS: &str = r#"[{"id":"acc1","apiKey":"SECRET1"},{"id":"acc2","apiKey":"SECRET2","dailyLimit":5}]"#;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![(CHARTS_BUCKET, "gs://dummy-bucket"), (CHART_IMG_ACCOUNTS_JSON, ACCOUNTS)]
    }

    #[test]
    fn defaults_apply_to_minimal_environment() {
        let config = load(&minimal()).unwrap();

        assert_eq!(config.charts_bucket.uri(), "gs://dummy-bucket");
        assert_eq!(config.charts_api_mode, ChartsApiMode::Real);
        assert_eq!(config.charts_default_timezone, "Etc/UTC");
        assert_eq!(config.chart_img_daily_limit, 50);
        assert_eq!(config.chart_img_timeout, Duration::from_secs(30));
        assert_eq!(config.service, "chart-worker");
        assert_eq!(config.env, None);
        assert_eq!(config.chart_img_accounts.len(), 2);
        assert_eq!(config.chart_img_accounts[1].daily_limit, Some(5));
    }

    #[test]
    fn missing_required_variables_are_named() {
        let error = load(&[(CHART_IMG_ACCOUNTS_JSON, ACCOUNTS)]).unwrap_err();
        assert_eq!(error.to_string(), "Missing required env var: CHARTS_BUCKET");

        let error = load(&[(CHARTS_BUCKET, "bucket"), (CHART_IMG_ACCOUNTS_JSON, "  ")]).unwrap_err();
        assert_eq!(error.variable(), CHART_IMG_ACCOUNTS_JSON);
    }

    #[test]
    fn bucket_with_path_is_rejected() {
        let mut vars = minimal();
        vars[0] = (CHARTS_BUCKET, "gs://bucket/prefix");
        assert_eq!(
            load(&vars).unwrap_err().to_string(),
            "CHARTS_BUCKET must be a bucket name or gs://<bucket> (no path)"
        );
    }

    #[test]
    fn mode_and_timezone_are_validated() {
        let mut vars = minimal();
        vars.push((CHARTS_API_MODE, "replay"));
        assert_eq!(load(&vars).unwrap_err().to_string(), "CHARTS_API_MODE must be one of: real|mock|record");

        let mut vars = minimal();
        vars.push((CHARTS_DEFAULT_TIMEZONE, "not a zone"));
        assert_eq!(load(&vars).unwrap_err().variable(), CHARTS_DEFAULT_TIMEZONE);

        for zone in ["UTC", "Etc/GMT+3", "America/New_York", "America/Argentina/Buenos_Aires"] {
            let mut vars = minimal();
            vars.push((CHARTS_DEFAULT_TIMEZONE, zone));
            assert_eq!(load(&vars).unwrap().charts_default_timezone, zone);
        }
    }

    #[test]
    fn record_mode_is_refused_in_prod() {
        let mut vars = minimal();
        vars.push((CHARTS_API_MODE, "record"));
        vars.push(("TDA_ENV", "prod"));
        assert_eq!(load(&vars).unwrap_err().variable(), CHARTS_API_MODE);

        let mut vars = minimal();
        vars.push((CHARTS_API_MODE, "record"));
        vars.push(("ENV", "dev"));
        assert_eq!(load(&vars).unwrap().env.as_deref(), Some("dev"));
    }

    #[test]
    fn account_json_errors_point_at_the_entry() {
        let cases = [
            ("not-json", "CHART_IMG_ACCOUNTS_JSON must be a valid JSON array"),
            (r#"{"id":"a"}"#, "CHART_IMG_ACCOUNTS_JSON must be a JSON array"),
            ("[]", "CHART_IMG_ACCOUNTS_JSON must contain at least 1 account"),
            (r#"[{"id":"","apiKey":"k"}]"#, "CHART_IMG_ACCOUNTS_JSON[0].id must be a non-empty string"),
            (
                r#"[{"id":"a","apiKey":"k"},{"id":"b"}]"#,
                "CHART_IMG_ACCOUNTS_JSON[1].apiKey must be a non-empty string",
            ),
            (
                r#"[{"id":"a","apiKey":"k"},{"id":"a","apiKey":"j"}]"#,
                "Duplicate Chart-IMG account id: a",
            ),
            (
                r#"[{"id":"a","apiKey":"k","dailyLimit":0}]"#,
                "CHART_IMG_ACCOUNTS_JSON[0].dailyLimit must be a positive integer",
            ),
        ];
        for (raw, message) in cases {
            assert_eq!(parse_accounts_json(raw).unwrap_err().to_string(), message, "input: {raw}");
        }
    }

    #[test]
    fn insecure_base_url_is_rejected() {
        let mut vars = minimal();
        vars.push((CHART_IMG_BASE_URL, "http://api.chart-img.com"));
        assert_eq!(load(&vars).unwrap_err().variable(), CHART_IMG_BASE_URL);
    }

    #[test]
    fn reads_process_environment() {
        temp_env::with_vars(
            [
                (CHARTS_BUCKET, Some("env-bucket")),
                (CHART_IMG_ACCOUNTS_JSON, Some(ACCOUNTS)),
                (CHARTS_API_MODE, Some("mock")),
                (CHART_IMG_DAILY_LIMIT, Some("7")),
                ("TDA_ENV", None),
                ("ENV", Some("staging")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.charts_bucket.name(), "env-bucket");
                assert_eq!(config.charts_api_mode, ChartsApiMode::Mock);
                assert_eq!(config.chart_img_daily_limit, 7);
                assert_eq!(config.env.as_deref(), Some("staging"));
                assert_eq!(config.client_config().mode, ChartsApiMode::Mock);
            },
        );
    }
}

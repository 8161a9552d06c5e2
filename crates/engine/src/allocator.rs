//! Per-account daily quota bookkeeping for the Chart-IMG account pool.
//!
//! Each account has one usage document in `chart_img_accounts_usage/<id>`:
//!
//! ```json
//! {"usageToday": 3, "windowStart": "2025-12-18T00:00:00Z", "dailyLimit": 50}
//! ```
//!
//! `dailyLimit` is optional and overrides the account's configured limit. A
//! window whose `windowStart` is missing, unreadable, or on an earlier UTC day
//! counts as empty. Usage is incremented *before* the API call is made, so the
//! local counter never trails what the provider has seen.

use std::sync::Arc;

use chart_worker_types::{AccountUsage, ChartImgAccount};
use chart_worker_util::{
    Document, DocumentKey, DocumentSnapshot, DocumentStore, DocumentStoreError, FieldPath, FieldUpdates, RetryPolicy,
    retry_on_conflict,
    time::{format_rfc3339, parse_rfc3339, same_utc_day, utc_day_start},
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::ACCOUNT_USAGE_COLLECTION;

/// Daily quota applied when neither the usage document nor the account sets one.
pub const DEFAULT_DAILY_LIMIT: u32 = 50;

const USAGE_TODAY_FIELD: &str = "usageToday";
const WINDOW_START_FIELD: &str = "windowStart";
const DAILY_LIMIT_FIELD: &str = "dailyLimit";

/// Result of [`AccountAllocator::select`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSelection {
    /// The account one unit of quota was claimed on, if any.
    pub account: Option<ChartImgAccount>,
    /// Usage of the selected account after the claim.
    pub usage: Option<AccountUsage>,
    /// Ids of accounts found exhausted before a selection was made, in pool order.
    pub exhausted_accounts: Vec<String>,
}

/// Claims quota from the first account with remaining daily capacity.
#[derive(Clone)]
pub struct AccountAllocator {
    store: Arc<dyn DocumentStore>,
    default_daily_limit: u32,
    retry: RetryPolicy,
}

enum UsageClaim {
    Claimed(AccountUsage),
    Exhausted(AccountUsage),
}

impl AccountAllocator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            default_daily_limit: DEFAULT_DAILY_LIMIT,
            retry: RetryPolicy::conflicts(),
        }
    }

    pub fn with_default_daily_limit(mut self, default_daily_limit: u32) -> Self {
        self.default_daily_limit = default_daily_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Walks `pool` in order and claims one unit of quota from the first
    /// account that has capacity left today.
    ///
    /// An account whose usage write keeps conflicting is skipped in favour of
    /// the next one. Store failures other than conflicts propagate.
    pub async fn select(&self, pool: &[ChartImgAccount], now: DateTime<Utc>) -> Result<AccountSelection, DocumentStoreError> {
        let mut exhausted_accounts = Vec::new();

        for account in pool {
            match self.claim_unit(account, now).await {
                Ok(UsageClaim::Claimed(usage)) => {
                    debug!(
                        account_id = %account.id,
                        usage_today = usage.usage_today,
                        daily_limit = usage.daily_limit,
                        "chart_api_account_selected"
                    );
                    return Ok(AccountSelection {
                        account: Some(account.clone()),
                        usage: Some(usage),
                        exhausted_accounts,
                    });
                }
                Ok(UsageClaim::Exhausted(usage)) => {
                    debug!(
                        account_id = %account.id,
                        usage_today = usage.usage_today,
                        daily_limit = usage.daily_limit,
                        "chart_api_account_exhausted"
                    );
                    exhausted_accounts.push(account.id.clone());
                }
                Err(error) if error.is_conflict() => {
                    warn!(account_id = %account.id, error = %error, "chart_api_usage_claim_conflict");
                }
                Err(error) => return Err(error),
            }
        }

        if !exhausted_accounts.is_empty() {
            warn!(exhausted_accounts = ?exhausted_accounts, "chart_api_limit_exceeded");
        } else if !pool.is_empty() {
            warn!(accounts = pool.len(), "chart_api_accounts_contended");
        }
        Ok(AccountSelection {
            account: None,
            usage: None,
            exhausted_accounts,
        })
    }

    /// Forces an account's usage up to its daily limit.
    ///
    /// Used when the provider reports the account over quota while local
    /// bookkeeping still showed capacity. Persistent conflicts are logged and
    /// the computed usage is returned anyway.
    pub async fn mark_exhausted(&self, account: &ChartImgAccount, now: DateTime<Utc>) -> Result<AccountUsage, DocumentStoreError> {
        let key = usage_key(&account.id);
        let default_daily_limit = self.default_daily_limit;
        let (store, key_ref) = (&self.store, &key);

        let outcome = retry_on_conflict(self.retry, "mark_account_exhausted", move |_| async move {
            let snapshot = store.get(key_ref).await?;
            let window = UsageWindow::read(&snapshot, account, default_daily_limit, now);
            let usage = window.usage(&account.id, window.daily_limit);
            let updates = window_updates(&usage);
            if snapshot.exists() {
                store.update(key_ref, &updates, snapshot.precondition()).await?;
            } else {
                store.create(key_ref, usage_document(&usage)).await?;
            }
            Ok::<_, DocumentStoreError>(usage)
        })
        .await;

        match outcome {
            Ok(usage) => {
                info!(account_id = %account.id, daily_limit = usage.daily_limit, "usage_marked_exhausted");
                Ok(usage)
            }
            Err(error) if error.is_conflict() => {
                warn!(account_id = %account.id, error = %error, "usage_mark_exhausted_precondition_failed");
                let daily_limit = resolve_daily_limit(None, account, default_daily_limit);
                Ok(AccountUsage {
                    account_id: account.id.clone(),
                    usage_today: daily_limit,
                    daily_limit,
                    window_start: format_rfc3339(utc_day_start(now)),
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn claim_unit(&self, account: &ChartImgAccount, now: DateTime<Utc>) -> Result<UsageClaim, DocumentStoreError> {
        let key = usage_key(&account.id);
        let default_daily_limit = self.default_daily_limit;
        let max_attempts = self.retry.max_attempts;
        let (store, key_ref) = (&self.store, &key);

        retry_on_conflict(self.retry, "claim_account_usage", move |attempt| async move {
            let snapshot = store.get(key_ref).await?;
            let window = UsageWindow::read(&snapshot, account, default_daily_limit, now);

            if window.usage_today >= window.daily_limit {
                let usage = window.usage(&account.id, window.usage_today);
                if snapshot.exists() && window.is_stale() {
                    // Best effort: persist the rolled-over window for readers.
                    match store.update(key_ref, &window_updates(&usage), snapshot.precondition()).await {
                        Ok(_) => {}
                        Err(error) if error.is_conflict() && attempt < max_attempts => return Err(error),
                        Err(error) => debug!(account_id = %account.id, error = %error, "usage_window_refresh_skipped"),
                    }
                }
                return Ok(UsageClaim::Exhausted(usage));
            }

            let usage = window.usage(&account.id, window.usage_today + 1);
            if snapshot.exists() {
                store.update(key_ref, &window_updates(&usage), snapshot.precondition()).await?;
            } else {
                store.create(key_ref, usage_document(&usage)).await?;
            }
            Ok::<_, DocumentStoreError>(UsageClaim::Claimed(usage))
        })
        .await
    }
}

/// Key of an account's usage document.
pub fn usage_key(account_id: &str) -> DocumentKey {
    DocumentKey::new(ACCOUNT_USAGE_COLLECTION, account_id)
}

/// Usage as seen at one read, after the day-boundary reset.
#[derive(Debug, Clone, PartialEq)]
struct UsageWindow {
    usage_today: u32,
    daily_limit: u32,
    window_start: String,
    stored_usage_today: Option<u32>,
    stored_window_start: Option<String>,
}

impl UsageWindow {
    fn read(snapshot: &DocumentSnapshot, account: &ChartImgAccount, default_daily_limit: u32, now: DateTime<Utc>) -> Self {
        let data = snapshot.data.as_ref();
        let stored_usage_today = data.and_then(|doc| as_count(doc.get(USAGE_TODAY_FIELD)));
        let stored_window_start = data
            .and_then(|doc| doc.get(WINDOW_START_FIELD))
            .and_then(Value::as_str)
            .map(str::to_string);
        let stored_limit = data.and_then(|doc| as_count(doc.get(DAILY_LIMIT_FIELD)));

        let current_window = stored_window_start
            .as_deref()
            .and_then(parse_rfc3339)
            .is_some_and(|start| same_utc_day(start, now));

        let (usage_today, window_start) = match (&stored_window_start, current_window) {
            (Some(start), true) => (stored_usage_today.unwrap_or(0), start.clone()),
            _ => (0, format_rfc3339(utc_day_start(now))),
        };

        Self {
            usage_today,
            daily_limit: resolve_daily_limit(stored_limit, account, default_daily_limit),
            window_start,
            stored_usage_today,
            stored_window_start,
        }
    }

    /// True when the stored fields differ from the effective ones.
    fn is_stale(&self) -> bool {
        self.stored_usage_today != Some(self.usage_today) || self.stored_window_start.as_deref() != Some(self.window_start.as_str())
    }

    fn usage(&self, account_id: &str, usage_today: u32) -> AccountUsage {
        AccountUsage {
            account_id: account_id.to_string(),
            usage_today,
            daily_limit: self.daily_limit,
            window_start: self.window_start.clone(),
        }
    }
}

/// Document limit when positive, else the account's, else the default.
fn resolve_daily_limit(stored: Option<u32>, account: &ChartImgAccount, default_daily_limit: u32) -> u32 {
    stored
        .filter(|limit| *limit > 0)
        .or(account.daily_limit.filter(|limit| *limit > 0))
        .unwrap_or(default_daily_limit)
}

fn window_updates(usage: &AccountUsage) -> FieldUpdates {
    FieldUpdates::new()
        .set(FieldPath::dotted(WINDOW_START_FIELD), usage.window_start.clone())
        .set(FieldPath::dotted(USAGE_TODAY_FIELD), usage.usage_today)
}

fn usage_document(usage: &AccountUsage) -> Document {
    let mut document = Document::new();
    document.insert(WINDOW_START_FIELD.into(), json!(usage.window_start));
    document.insert(USAGE_TODAY_FIELD.into(), json!(usage.usage_today));
    document
}

/// Reads a non-negative counter written as an integer, float, or numeric string.
fn as_count(value: Option<&Value>) -> Option<u32> {
    let value = value?;
    if let Some(count) = value.as_u64() {
        return Some(u32::try_from(count).unwrap_or(u32::MAX));
    }
    if value.as_i64().is_some() {
        return Some(0);
    }
    if let Some(count) = value.as_f64().filter(|count| count.is_finite()) {
        return Some(count.clamp(0.0, f64::from(u32::MAX)) as u32);
    }
    value.as_str().and_then(|raw| raw.trim().parse().ok())
}

//! Resilient chart fetch: backoff for transient failures, account rotation for
//! quota failures.
//!
//! One logical request runs through this loop until it succeeds, fails
//! permanently, or spends its attempt budget:
//!
//! 1. ask the pool for an account; none left ends with `CHART_API_LIMIT_EXCEEDED`
//! 2. render once with that account
//! 3. a quota error marks the account exhausted and loops without sleeping
//! 4. a retriable error sleeps `base * 2^(attempt-1)` and loops
//! 5. anything else ends the loop
//!
//! Every render consumes one attempt, rotations included.

use std::sync::Arc;

use async_trait::async_trait;
use chart_worker_api::{ChartImgRequest, ChartRenderer, RenderedChart};
use chart_worker_types::{ChartApiError, ChartImgAccount};
use chart_worker_util::{Clock, DocumentStoreError, RetryPolicy};
use tracing::{debug, warn};

use crate::allocator::AccountAllocator;

/// Source of accounts for the fetch loop.
#[async_trait]
pub trait AccountPool: Send + Sync {
    /// Claims quota on the next usable account, or `None` when all are spent.
    async fn select_account(&self) -> Result<Option<ChartImgAccount>, DocumentStoreError>;

    /// Records that the provider reported `account` over quota.
    async fn mark_exhausted(&self, account: &ChartImgAccount) -> Result<(), DocumentStoreError>;
}

/// [`AccountPool`] backed by the usage documents of an [`AccountAllocator`].
#[derive(Clone)]
pub struct AllocatorPool {
    allocator: AccountAllocator,
    accounts: Vec<ChartImgAccount>,
    clock: Arc<dyn Clock>,
}

impl AllocatorPool {
    pub fn new(allocator: AccountAllocator, accounts: Vec<ChartImgAccount>, clock: Arc<dyn Clock>) -> Self {
        Self { allocator, accounts, clock }
    }

    pub fn accounts(&self) -> &[ChartImgAccount] {
        &self.accounts
    }
}

#[async_trait]
impl AccountPool for AllocatorPool {
    async fn select_account(&self) -> Result<Option<ChartImgAccount>, DocumentStoreError> {
        let selection = self.allocator.select(&self.accounts, self.clock.now()).await?;
        Ok(selection.account)
    }

    async fn mark_exhausted(&self, account: &ChartImgAccount) -> Result<(), DocumentStoreError> {
        self.allocator.mark_exhausted(account, self.clock.now()).await.map(|_| ())
    }
}

/// Result of [`fetch_with_retries`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub result: Result<RenderedChart, ChartApiError>,
    /// Renders issued, including quota rotations.
    pub attempts: u32,
    /// Accounts the provider reported over quota during this fetch.
    pub exhausted_accounts: Vec<String>,
}

/// Renders `request`, rotating accounts on quota errors and backing off on
/// transient ones.
///
/// The outer `Result` only carries usage-store failures; every chart API
/// outcome lands in [`FetchOutcome::result`].
pub async fn fetch_with_retries(
    renderer: &dyn ChartRenderer,
    pool: &dyn AccountPool,
    request: &ChartImgRequest,
    policy: RetryPolicy,
) -> Result<FetchOutcome, DocumentStoreError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    let mut exhausted_accounts = Vec::new();
    let mut last_error = None;

    while attempts < max_attempts {
        let Some(account) = pool.select_account().await? else {
            return Ok(FetchOutcome {
                result: Err(ChartApiError::no_accounts_available()),
                attempts,
                exhausted_accounts,
            });
        };
        attempts += 1;

        let error = match renderer.render(&account, request).await {
            Ok(chart) => {
                debug!(
                    chart_template_id = %request.chart_template_id,
                    account_id = %account.id,
                    attempt = attempts,
                    "chart_fetched"
                );
                return Ok(FetchOutcome {
                    result: Ok(chart),
                    attempts,
                    exhausted_accounts,
                });
            }
            Err(error) => error,
        };

        if error.is_limit_exceeded() {
            warn!(
                chart_template_id = %request.chart_template_id,
                account_id = %account.id,
                attempt = attempts,
                "chart_api_account_limit_reported"
            );
            pool.mark_exhausted(&account).await?;
            exhausted_accounts.push(account.id);
            last_error = Some(error);
            continue;
        }

        if !error.retriable || attempts >= max_attempts {
            return Ok(FetchOutcome {
                result: Err(error),
                attempts,
                exhausted_accounts,
            });
        }

        let delay = policy.delay_for(attempts);
        warn!(
            chart_template_id = %request.chart_template_id,
            account_id = %account.id,
            attempt = attempts,
            error_code = %error.code,
            http_status = ?error.http_status,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "chart_fetch_retry"
        );
        policy.backoff(attempts).await;
        last_error = Some(error);
    }

    Ok(FetchOutcome {
        result: Err(last_error.unwrap_or_else(ChartApiError::no_accounts_available)),
        attempts,
        exhausted_accounts,
    })
}

mod common;

use std::{collections::HashMap, sync::Arc};

use chart_worker_engine::{AccountAllocator, allocator::usage_key};
use chart_worker_types::ChartImgAccount;
use chart_worker_util::{RetryPolicy, document_store::InMemoryDocumentStore, time::parse_rfc3339};
use common::NOW;
use serde_json::json;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_selects_never_exceed_daily_limits() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let allocator = Arc::new(AccountAllocator::new(store.clone()).with_retry(RetryPolicy::immediate(32)));
    let pool = Arc::new(vec![
        ChartImgAccount::new("A", "key-a").with_daily_limit(3),
        ChartImgAccount::new("B", "key-b").with_daily_limit(3),
    ]);
    let now = parse_rfc3339(NOW).expect("timestamp");

    let mut selects = JoinSet::new();
    for _ in 0..16 {
        let (allocator, pool) = (allocator.clone(), pool.clone());
        selects.spawn(async move { allocator.select(&pool, now).await });
    }

    let mut selected: HashMap<String, u32> = HashMap::new();
    let mut none = 0;
    while let Some(joined) = selects.join_next().await {
        match joined.expect("task completes").expect("select completes").account {
            Some(account) => *selected.entry(account.id).or_default() += 1,
            None => none += 1,
        }
    }

    for id in ["A", "B"] {
        let count = selected.get(id).copied().unwrap_or_default();
        assert!(count <= 3, "{id} selected {count} times");
        let stored = store.snapshot(&usage_key(id)).map(|doc| doc["usageToday"].clone());
        let expected = (count > 0).then(|| json!(count));
        assert_eq!(stored, expected, "stored usage of {id} matches its selections");
    }
    assert_eq!(selected.values().sum::<u32>() + none, 16);
    assert!(none >= 10);
}

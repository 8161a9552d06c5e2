#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chart_worker_api::{ChartImgRequest, ChartRenderer, RenderedChart};
use chart_worker_engine::{ACCOUNT_USAGE_COLLECTION, CHART_TEMPLATES_COLLECTION, FLOW_RUNS_COLLECTION, StepRuntime, WorkerConfig};
use chart_worker_types::{ChartApiError, ChartImgAccount, ChartsApiMode, ErrorCode};
use chart_worker_util::{
    Document, DocumentKey, GcsBucket, RetryPolicy, document_store::InMemoryDocumentStore, object_store::InMemoryObjectStore, time::FixedClock,
};
use serde_json::{Value, json};

pub const BUCKET: &str = "charts-test";
pub const NOW: &str = "2025-12-18T12:00:00Z";
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\nscenario";

/// How the fake renderer answers for one account.
#[derive(Debug, Clone)]
pub enum Answer {
    Png,
    LimitExceeded,
    Fail { retriable: bool },
}

/// Renderer answering per account and recording every call.
#[derive(Default)]
pub struct ScriptedRenderer {
    answers: Mutex<HashMap<String, Answer>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedRenderer {
    pub fn answer(&self, account_id: &str, answer: Answer) {
        self.answers.lock().unwrap().insert(account_id.to_string(), answer);
    }

    /// `(account id, chart template id)` in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn accounts_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|(account, _)| account).collect()
    }
}

#[async_trait]
impl ChartRenderer for ScriptedRenderer {
    async fn render(&self, account: &ChartImgAccount, request: &ChartImgRequest) -> Result<RenderedChart, ChartApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((account.id.clone(), request.chart_template_id.clone()));
        let answer = self.answers.lock().unwrap().get(&account.id).cloned().unwrap_or(Answer::Png);
        match answer {
            Answer::Png => Ok(RenderedChart::live(PNG.to_vec())),
            Answer::LimitExceeded => Err(ChartApiError::new(ErrorCode::ChartApiLimitExceeded, "Limit Exceeded", false).with_status(429)),
            Answer::Fail { retriable } => Err(ChartApiError::new(ErrorCode::ChartApiFailed, "Chart-IMG request failed", retriable).with_status(500)),
        }
    }
}

pub struct Scenario {
    pub documents: Arc<InMemoryDocumentStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub renderer: Arc<ScriptedRenderer>,
    pub runtime: StepRuntime,
}

pub fn worker_config(accounts: Vec<ChartImgAccount>) -> WorkerConfig {
    WorkerConfig {
        charts_bucket: GcsBucket::parse(BUCKET).unwrap(),
        charts_api_mode: ChartsApiMode::Mock,
        charts_default_timezone: "Etc/UTC".into(),
        chart_img_accounts: accounts,
        chart_img_daily_limit: 50,
        chart_img_base_url: "https://api.chart-img.com".into(),
        charts_fixtures_dir: PathBuf::from("fixtures"),
        chart_img_timeout: Duration::from_secs(30),
        env: Some("test".into()),
        service: "chart-worker".into(),
    }
}

pub fn scenario(accounts: Vec<ChartImgAccount>) -> Scenario {
    scenario_with_fetch_budget(accounts, 3)
}

pub fn scenario_with_fetch_budget(accounts: Vec<ChartImgAccount>, fetch_attempts: u32) -> Scenario {
    let documents = Arc::new(InMemoryDocumentStore::new());
    let objects = Arc::new(InMemoryObjectStore::new(GcsBucket::parse(BUCKET).unwrap()));
    let renderer = Arc::new(ScriptedRenderer::default());
    let runtime = StepRuntime::new(worker_config(accounts), documents.clone(), objects.clone(), renderer.clone())
        .with_clock(Arc::new(FixedClock::at(NOW).unwrap()))
        .with_retry_policies(RetryPolicy::immediate(3), RetryPolicy::immediate(fetch_attempts));
    Scenario {
        documents,
        objects,
        renderer,
        runtime,
    }
}

pub fn as_document(value: Value) -> Document {
    value.as_object().cloned().expect("document must be a JSON object")
}

impl Scenario {
    pub fn seed_flow_run(&self, flow_run: &Value) {
        let run_id = flow_run["runId"].as_str().expect("runId");
        self.documents
            .insert(DocumentKey::new(FLOW_RUNS_COLLECTION, run_id), as_document(flow_run.clone()));
    }

    pub fn seed_template(&self, chart_template_id: &str) {
        self.documents.insert(
            DocumentKey::new(CHART_TEMPLATES_COLLECTION, chart_template_id),
            as_document(json!({
                "description": format!("{chart_template_id} chart"),
                "chartImgSymbolTemplate": "BINANCE:{symbol}",
                "request": {"theme": "dark", "width": 800, "height": 600}
            })),
        );
    }

    pub fn seed_usage(&self, account_id: &str, usage_today: u32, window_start: &str) {
        self.documents.insert(
            DocumentKey::new(ACCOUNT_USAGE_COLLECTION, account_id),
            as_document(json!({"usageToday": usage_today, "windowStart": window_start})),
        );
    }

    pub fn flow_run(&self, run_id: &str) -> Value {
        let document = self
            .documents
            .snapshot(&DocumentKey::new(FLOW_RUNS_COLLECTION, run_id))
            .expect("flow run stored");
        Value::Object(document)
    }

    pub fn usage(&self, account_id: &str) -> Option<Value> {
        self.documents
            .snapshot(&DocumentKey::new(ACCOUNT_USAGE_COLLECTION, account_id))
            .map(Value::Object)
    }

    pub fn object_json(&self, object_path: &str) -> Value {
        let object = self.objects.object(object_path).expect("object uploaded");
        serde_json::from_slice(&object.bytes).expect("object is JSON")
    }
}

/// A flow run with one chart export step `charts` over the given templates.
pub fn chart_flow_run(run_id: &str, template_ids: &[&str], min_images: Option<i64>) -> Value {
    let requests: Vec<Value> = template_ids.iter().map(|id| json!({"chartTemplateId": id})).collect();
    let mut inputs = json!({"requests": requests});
    if let Some(min_images) = min_images {
        inputs["minImages"] = json!(min_images);
    }
    json!({
        "runId": run_id,
        "flowKey": "scheduled_charts",
        "scope": {"symbol": "BTCUSDT"},
        "steps": {
            "charts": {"stepType": "CHART_EXPORT", "status": "READY", "timeframe": "1h", "inputs": inputs}
        }
    })
}

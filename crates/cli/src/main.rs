use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use chart_worker_api::{ChartImgClient, ReqwestRequester};
use chart_worker_engine::{
    CHART_TEMPLATES_COLLECTION, ConfigError, EventOutcome, FLOW_RUNS_COLLECTION, RunResult, RunStatus, StepRuntime, WorkerConfig,
    config::{CHART_IMG_ACCOUNTS_JSON, CHARTS_API_MODE, CHARTS_BUCKET, CHARTS_FIXTURES_DIR},
    handle_cloud_event,
    ingest::CloudEvent,
    run_chart_export_step,
};
use chart_worker_util::{
    DocumentKey, DocumentStore, ObjectStore,
    document_store::JsonFileDocumentStore,
    logging::init_tracing,
    object_store::{GcsObjectStore, LocalDirectoryObjectStore},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::info;

const DEFAULT_STATE_PATH: &str = ".chart-worker/state.json";
const DEFAULT_ARTIFACTS_DIR: &str = ".chart-worker/artifacts";

#[derive(Debug, Parser)]
#[command(name = "chart-worker", version, about = "Renders chart images for READY chart export steps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one chart export step from a flow run JSON file
    RunLocal(RunLocalArgs),
    /// Process one Firestore update CloudEvent from a JSON file
    HandleEvent(HandleEventArgs),
}

#[derive(Debug, Args)]
struct RunLocalArgs {
    #[arg(long)]
    flow_run_path: PathBuf,
    #[arg(long)]
    step_id: Option<String>,
    #[arg(long, value_parser = ["real", "mock", "record"])]
    charts_api_mode: Option<String>,
    #[arg(long)]
    charts_bucket: Option<String>,
    /// JSON array of `{id, apiKey, dailyLimit?}`
    #[arg(long)]
    accounts_config_path: Option<PathBuf>,
    /// JSON object of chart templates keyed by template id
    #[arg(long)]
    templates_path: Option<PathBuf>,
    #[arg(long)]
    fixtures_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputSummary::Text)]
    output_summary: OutputSummary,
    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Debug, Args)]
struct HandleEventArgs {
    #[arg(long)]
    event_path: PathBuf,
    #[arg(long, value_enum, default_value_t = OutputSummary::Json)]
    output_summary: OutputSummary,
    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Debug, Args)]
struct StorageArgs {
    /// JSON file backing the document store
    #[arg(long, default_value = DEFAULT_STATE_PATH)]
    state_path: PathBuf,
    /// Directory mirroring the charts bucket
    #[arg(long, default_value = DEFAULT_ARTIFACTS_DIR)]
    artifacts_dir: PathBuf,
    /// Upload to GCS with `GCS_ACCESS_TOKEN` instead of the artifacts directory
    #[arg(long)]
    upload_to_gcs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputSummary {
    None,
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::RunLocal(args) => run_local(args, |name| std::env::var(name).ok()).await,
        Command::HandleEvent(args) => handle_event(args, |name| std::env::var(name).ok()).await,
    };
    match outcome {
        Ok(code) => code,
        Err(error) => match error.downcast_ref::<ConfigError>() {
            Some(config_error) => {
                eprintln!("CONFIG_ERROR: {config_error}");
                ExitCode::from(2)
            }
            None => {
                eprintln!("ERROR: {error:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_local<E>(args: RunLocalArgs, env: E) -> Result<ExitCode>
where
    E: Fn(&str) -> Option<String>,
{
    // Flags take precedence over the environment.
    let mut overrides = HashMap::new();
    if let Some(path) = &args.accounts_config_path {
        let accounts = fs::read_to_string(path).with_context(|| format!("reading accounts config {}", path.display()))?;
        overrides.insert(CHART_IMG_ACCOUNTS_JSON, accounts);
    }
    let mode = args.charts_api_mode.clone().or_else(|| env(CHARTS_API_MODE)).unwrap_or_else(|| "mock".to_string());
    overrides.insert(CHARTS_API_MODE, mode);
    if let Some(bucket) = &args.charts_bucket {
        overrides.insert(CHARTS_BUCKET, bucket.clone());
    }
    if let Some(dir) = &args.fixtures_dir {
        overrides.insert(CHARTS_FIXTURES_DIR, dir.display().to_string());
    }

    info!(
        mode = "local",
        flow_run_path = %args.flow_run_path.display(),
        step_id = args.step_id.as_deref().unwrap_or_default(),
        charts_api_mode = overrides.get(CHARTS_API_MODE).map(String::as_str).unwrap_or_default(),
        "local_run_started"
    );

    let config = WorkerConfig::from_lookup(|name| overrides.get(name).cloned().or_else(|| env(name)))?;
    let flow_run = read_json(&args.flow_run_path).context("reading flow run")?;

    let documents = open_state(&args.storage.state_path)?;
    if let Some(run_id) = flow_run.get("runId").and_then(Value::as_str) {
        seed(&documents, DocumentKey::new(FLOW_RUNS_COLLECTION, run_id), &flow_run)?;
    }
    if let Some(path) = &args.templates_path {
        seed_templates(&documents, path)?;
    }

    let runtime = build_runtime(config, documents, &args.storage)?;
    let result = run_chart_export_step(&flow_run, args.step_id.as_deref(), &runtime).await?;
    print_summary(&result, args.output_summary)?;
    Ok(exit_code(&result))
}

async fn handle_event<E>(args: HandleEventArgs, env: E) -> Result<ExitCode>
where
    E: Fn(&str) -> Option<String>,
{
    let config = WorkerConfig::from_lookup(env)?;
    let event = CloudEvent::from_value(read_json(&args.event_path).context("reading event")?).context("decoding CloudEvent")?;

    let documents = open_state(&args.storage.state_path)?;
    let runtime = build_runtime(config, documents, &args.storage)?;
    let outcome = handle_cloud_event(&event, &runtime).await?;

    match (&outcome, args.output_summary) {
        (EventOutcome::Ran(result), summary) => {
            print_summary(result, summary)?;
            Ok(exit_code(result))
        }
        (_, OutputSummary::None) => Ok(ExitCode::SUCCESS),
        (other, _) => {
            println!("{}", serde_json::to_string(other)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_runtime(config: WorkerConfig, documents: Arc<JsonFileDocumentStore>, storage: &StorageArgs) -> Result<StepRuntime> {
    let objects: Arc<dyn ObjectStore> = if storage.upload_to_gcs {
        Arc::new(GcsObjectStore::from_env(config.charts_bucket.clone()).context("configuring GCS uploads")?)
    } else {
        Arc::new(LocalDirectoryObjectStore::new(&storage.artifacts_dir, config.charts_bucket.clone()))
    };
    let http = ReqwestRequester::new().context("building HTTP client")?;
    let client = ChartImgClient::new(config.client_config(), Arc::new(http))
        .map_err(|error| ConfigError::invalid(chart_worker_engine::config::CHART_IMG_BASE_URL, error.to_string()))?;
    let documents: Arc<dyn DocumentStore> = documents;
    Ok(StepRuntime::new(config, documents, objects, Arc::new(client)))
}

fn open_state(path: &Path) -> Result<Arc<JsonFileDocumentStore>> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = JsonFileDocumentStore::open(path).with_context(|| format!("opening state file {}", path.display()))?;
    Ok(Arc::new(store))
}

fn seed(documents: &JsonFileDocumentStore, key: DocumentKey, value: &Value) -> Result<()> {
    let document = value
        .as_object()
        .cloned()
        .with_context(|| format!("{}/{} must be a JSON object", key.collection, key.id))?;
    documents.insert(key, document)?;
    Ok(())
}

fn seed_templates(documents: &JsonFileDocumentStore, path: &Path) -> Result<()> {
    let templates = read_json(path).context("reading templates")?;
    let templates = templates.as_object().context("templates file must be an object keyed by template id")?;
    for (chart_template_id, template) in templates {
        seed(documents, DocumentKey::new(CHART_TEMPLATES_COLLECTION, chart_template_id), template)?;
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn text_summary(result: &RunResult) -> String {
    format!(
        "CHART_EXPORT {}: manifest={} items={} failures={}",
        result.status,
        result.outputs_manifest_gcs_uri.as_deref().unwrap_or("-"),
        result.items_count,
        result.failures_count
    )
}

fn print_summary(result: &RunResult, summary: OutputSummary) -> Result<()> {
    match summary {
        OutputSummary::None => {}
        OutputSummary::Text => println!("{}", text_summary(result)),
        OutputSummary::Json => println!("{}", serde_json::to_string(result)?),
    }
    Ok(())
}

fn exit_code(result: &RunResult) -> ExitCode {
    if result.status == RunStatus::Succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

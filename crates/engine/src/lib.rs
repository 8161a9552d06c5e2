//! # Chart Worker Engine
//!
//! Executes `CHART_EXPORT` steps of flow runs. One invocation picks (or is
//! told) a step, claims it, renders every requested chart through a pool of
//! quota-limited Chart-IMG accounts, publishes the PNGs and an outputs
//! manifest, and records a terminal status on the step.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chart_worker_engine::{StepRuntime, run_chart_export_step};
//! # async fn demo(runtime: StepRuntime, flow_run: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
//! let result = run_chart_export_step(&flow_run, None, &runtime).await?;
//! println!("{} -> {}", result.step_id.unwrap_or_default(), result.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`selection`**: picks the ready step whose dependencies succeeded
//! - **`lifecycle`**: claim and finalize writes with optimistic concurrency
//! - **`allocator`**: per-account daily quota bookkeeping
//! - **`orchestrator`**: chart fetches with backoff and account rotation
//! - **`templates`**: request validation and template resolution
//! - **`artifacts`**: PNG and manifest publication
//! - **`driver`**: the end-to-end step execution
//! - **`ingest`** / **`handler`**: document-update events in, runs out
//! - **`config`**: environment-driven worker settings

pub mod allocator;
pub mod artifacts;
pub mod config;
pub mod driver;
pub mod handler;
pub mod ingest;
pub mod lifecycle;
pub mod orchestrator;
pub mod selection;
pub mod templates;

pub use allocator::{AccountAllocator, AccountSelection};
pub use config::{ConfigError, WorkerConfig};
pub use driver::{DriverError, RunResult, RunStatus, StepRuntime, run_chart_export_step};
pub use handler::{EventOutcome, handle_cloud_event};
pub use lifecycle::{StepCoordinator, StepOutcome};
pub use orchestrator::{AccountPool, AllocatorPool, FetchOutcome, fetch_with_retries};
pub use selection::{BlockedStep, StepPick, UnmetDependency, pick_ready_chart_export_step};

/// Collection holding flow run documents.
pub const FLOW_RUNS_COLLECTION: &str = "flow_runs";
/// Collection holding chart templates, keyed by template id.
pub const CHART_TEMPLATES_COLLECTION: &str = "chart_templates";
/// Collection holding one usage document per Chart-IMG account.
pub const ACCOUNT_USAGE_COLLECTION: &str = "chart_img_accounts_usage";

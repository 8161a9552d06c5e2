//! Chart image and outputs manifest publication.
//!
//! Object layout inside the charts bucket:
//!
//! ```text
//! runs/<runId>/charts/<timeframe>/<templateId>/<YYYYMMDD-HHMMSS>_<symbolSlug>_<timeframe>_<templateId>.png
//! runs/<runId>/steps/<stepId>/charts/manifest.json
//! ```

use chart_worker_types::{ChartRequest, ErrorCode, MANIFEST_SCHEMA_VERSION, Manifest, ManifestFailure, ManifestItem, StepError};
use chart_worker_util::{
    ObjectStore,
    object_store::GCS_SCHEME,
    redact_sensitive,
    time::{filename_stamp, format_rfc3339, parse_rfc3339},
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

pub const PNG_CONTENT_TYPE: &str = "image/png";
pub const MANIFEST_CONTENT_TYPE: &str = "application/json";

/// A generation instant in both of the forms artifacts need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAt {
    pub rfc3339: String,
    pub filename_stamp: String,
}

impl GeneratedAt {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            rfc3339: format_rfc3339(instant),
            filename_stamp: filename_stamp(instant),
        }
    }
}

/// File-name safe form of a symbol: ASCII alphanumerics, `-` and `_` are kept,
/// everything else becomes `_`.
pub fn symbol_slug(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

pub fn png_object_path(run_id: &str, timeframe: &str, chart_template_id: &str, generated_at: &GeneratedAt, symbol_slug: &str) -> String {
    format!(
        "runs/{run_id}/charts/{timeframe}/{chart_template_id}/{}_{symbol_slug}_{timeframe}_{chart_template_id}.png",
        generated_at.filename_stamp
    )
}

pub fn manifest_object_path(run_id: &str, step_id: &str) -> String {
    format!("runs/{run_id}/steps/{step_id}/charts/manifest.json")
}

/// One rendered chart waiting to be uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct PngUpload {
    pub chart_template_id: String,
    pub kind: String,
    pub png: Vec<u8>,
    pub generated_at: GeneratedAt,
    pub symbol_slug: String,
    pub timeframe: String,
}

/// Uploaded items and the uploads that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PngUploadResult {
    pub items: Vec<ManifestItem>,
    pub failures: Vec<ManifestFailure>,
}

/// Uploads every PNG; a failed upload becomes a `GCS_WRITE_FAILED` failure entry.
pub async fn upload_pngs(store: &dyn ObjectStore, run_id: &str, uploads: &[PngUpload]) -> PngUploadResult {
    let mut result = PngUploadResult::default();

    for upload in uploads {
        let object_path = png_object_path(
            run_id,
            &upload.timeframe,
            &upload.chart_template_id,
            &upload.generated_at,
            &upload.symbol_slug,
        );
        match store.upload(&object_path, &upload.png, PNG_CONTENT_TYPE).await {
            Ok(png_gcs_uri) => result.items.push(ManifestItem {
                chart_template_id: upload.chart_template_id.clone(),
                kind: upload.kind.clone(),
                generated_at: upload.generated_at.rfc3339.clone(),
                png_gcs_uri,
            }),
            Err(error) => {
                let message = redact_sensitive(&error.to_string());
                warn!(
                    run_id,
                    chart_template_id = %upload.chart_template_id,
                    object_path = %object_path,
                    error = %message,
                    "png_upload_failed"
                );
                result.failures.push(ManifestFailure {
                    request: json!({"chartTemplateId": upload.chart_template_id}),
                    error: StepError::new(ErrorCode::GcsWriteFailed, "Failed to write PNG to GCS").with_details(json!({
                        "objectPath": object_path,
                        "error": message,
                    })),
                });
            }
        }
    }
    result
}

/// Run-level fields of a manifest.
#[derive(Debug, Clone, Copy)]
pub struct ManifestContext<'a> {
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub min_images: u32,
    pub requested: &'a [ChartRequest],
}

pub fn build_manifest(context: ManifestContext<'_>, created_at: DateTime<Utc>, items: Vec<ManifestItem>, failures: Vec<ManifestFailure>) -> Manifest {
    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        run_id: context.run_id.to_string(),
        step_id: context.step_id.to_string(),
        created_at: format_rfc3339(created_at),
        symbol: context.symbol.to_string(),
        timeframe: context.timeframe.to_string(),
        min_images: context.min_images,
        requested: context.requested.to_vec(),
        items,
        failures,
    }
}

/// Structural checks run before a manifest is published.
///
/// The first violation is reported as `VALIDATION_FAILED` with its JSON path
/// in `details.path`.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), StepError> {
    fn violation(message: &str, path: Vec<Value>) -> StepError {
        StepError::validation(message).with_details(json!({"path": path}))
    }

    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(violation(
            &format!("schemaVersion must be {MANIFEST_SCHEMA_VERSION}"),
            vec![json!("schemaVersion")],
        ));
    }
    let required = [
        ("runId", manifest.run_id.as_str()),
        ("stepId", manifest.step_id.as_str()),
        ("symbol", manifest.symbol.as_str()),
        ("timeframe", manifest.timeframe.as_str()),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(violation(&format!("{field} must be a non-empty string"), vec![json!(field)]));
    }
    if parse_rfc3339(&manifest.created_at).is_none() {
        return Err(violation("createdAt must be an RFC 3339 date-time", vec![json!("createdAt")]));
    }

    for (index, item) in manifest.items.iter().enumerate() {
        if item.chart_template_id.trim().is_empty() {
            return Err(violation("chartTemplateId must be a non-empty string", vec![json!("items"), json!(index), json!("chartTemplateId")]));
        }
        if item.kind.trim().is_empty() {
            return Err(violation("kind must be a non-empty string", vec![json!("items"), json!(index), json!("kind")]));
        }
        if parse_rfc3339(&item.generated_at).is_none() {
            return Err(violation("generatedAt must be an RFC 3339 date-time", vec![json!("items"), json!(index), json!("generatedAt")]));
        }
        let has_object = item
            .png_gcs_uri
            .strip_prefix(GCS_SCHEME)
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(bucket, path)| !bucket.is_empty() && !path.is_empty());
        if !has_object {
            return Err(violation("png_gcs_uri must be a gs://<bucket>/<path> URI", vec![json!("items"), json!(index), json!("png_gcs_uri")]));
        }
    }

    for (index, failure) in manifest.failures.iter().enumerate() {
        if !failure.request.is_object() {
            return Err(violation("request must be an object", vec![json!("failures"), json!(index), json!("request")]));
        }
        if failure.error.message.trim().is_empty() {
            return Err(violation("error.message must be a non-empty string", vec![json!("failures"), json!(index), json!("error"), json!("message")]));
        }
    }
    Ok(())
}

/// Publishes the manifest and returns its `gs://` URI.
pub async fn write_manifest(store: &dyn ObjectStore, manifest: &Manifest) -> Result<String, StepError> {
    let object_path = manifest_object_path(&manifest.run_id, &manifest.step_id);
    let write_failed = |error: String| {
        StepError::new(ErrorCode::ManifestWriteFailed, "Failed to write manifest to GCS").with_details(json!({
            "objectPath": object_path,
            "error": error,
        }))
    };

    let payload = serde_json::to_vec(manifest).map_err(|error| write_failed(error.to_string()))?;
    match store.upload(&object_path, &payload, MANIFEST_CONTENT_TYPE).await {
        Ok(uri) => {
            info!(
                run_id = %manifest.run_id,
                step_id = %manifest.step_id,
                manifest_gcs_uri = %uri,
                items = manifest.items.len(),
                failures = manifest.failures.len(),
                "manifest_written"
            );
            Ok(uri)
        }
        Err(error) => {
            let message = redact_sensitive(&error.to_string());
            warn!(run_id = %manifest.run_id, step_id = %manifest.step_id, error = %message, "manifest_write_failed");
            Err(write_failed(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chart_worker_util::{GcsBucket, object_store::InMemoryObjectStore};

    fn generated_at() -> GeneratedAt {
        GeneratedAt::new(parse_rfc3339("2025-12-18T12:34:56.789Z").unwrap())
    }

    fn upload(chart_template_id: &str) -> PngUpload {
        PngUpload {
            chart_template_id: chart_template_id.into(),
            kind: "Price action".into(),
            png: b"\x89PNG\r\n\x1a\nchart".to_vec(),
            generated_at: generated_at(),
            symbol_slug: "BTCUSDT".into(),
            timeframe: "1h".into(),
        }
    }

    fn store() -> InMemoryObjectStore {
        InMemoryObjectStore::new(GcsBucket::parse("gs://charts").unwrap())
    }

    fn manifest(items: Vec<ManifestItem>, failures: Vec<ManifestFailure>) -> Manifest {
        let requested = vec![ChartRequest::for_template("ctpl_price_v1")];
        let context = ManifestContext {
            run_id: "run-1",
            step_id: "charts:1h",
            symbol: "BTCUSDT",
            timeframe: "1h",
            min_images: 1,
            requested: &requested,
        };
        build_manifest(context, parse_rfc3339("2025-12-18T12:35:00Z").unwrap(), items, failures)
    }

    #[test]
    fn paths_follow_bucket_layout() {
        assert_eq!(generated_at().rfc3339, "2025-12-18T12:34:56Z");
        assert_eq!(
            png_object_path("run-1", "1h", "ctpl_price_v1", &generated_at(), "BTCUSDT"),
            "runs/run-1/charts/1h/ctpl_price_v1/20251218-123456_BTCUSDT_1h_ctpl_price_v1.png"
        );
        assert_eq!(manifest_object_path("run-1", "charts:1h"), "runs/run-1/steps/charts:1h/charts/manifest.json");
        assert_eq!(symbol_slug("BINANCE:BTC.USDT"), "BINANCE_BTC_USDT");
    }

    #[tokio::test]
    async fn uploads_pngs_and_reports_failures() {
        let store = store();
        store.fail_uploads_ending_with("_ctpl_broken.png");

        let result = upload_pngs(&store, "run-1", &[upload("ctpl_price_v1"), upload("ctpl_broken")]).await;

        assert_eq!(result.items.len(), 1);
        assert_eq!(
            result.items[0].png_gcs_uri,
            "gs://charts/runs/run-1/charts/1h/ctpl_price_v1/20251218-123456_BTCUSDT_1h_ctpl_price_v1.png"
        );
        assert_eq!(result.items[0].generated_at, "2025-12-18T12:34:56Z");
        let object = store
            .object("runs/run-1/charts/1h/ctpl_price_v1/20251218-123456_BTCUSDT_1h_ctpl_price_v1.png")
            .unwrap();
        assert_eq!(object.content_type, PNG_CONTENT_TYPE);

        let failure = &result.failures[0];
        assert_eq!(failure.request, json!({"chartTemplateId": "ctpl_broken"}));
        assert_eq!(failure.error.code, ErrorCode::GcsWriteFailed);
        assert_eq!(failure.error.message, "Failed to write PNG to GCS");
        assert_eq!(
            failure.error.details.as_ref().unwrap()["objectPath"],
            json!("runs/run-1/charts/1h/ctpl_broken/20251218-123456_BTCUSDT_1h_ctpl_broken.png")
        );
    }

    #[tokio::test]
    async fn manifest_is_written_as_json() {
        let store = store();
        let uploaded = upload_pngs(&store, "run-1", &[upload("ctpl_price_v1")]).await;
        let manifest = manifest(uploaded.items, Vec::new());
        validate_manifest(&manifest).unwrap();

        let uri = write_manifest(&store, &manifest).await.unwrap();

        assert_eq!(uri, "gs://charts/runs/run-1/steps/charts:1h/charts/manifest.json");
        let object = store.object("runs/run-1/steps/charts:1h/charts/manifest.json").unwrap();
        assert_eq!(object.content_type, MANIFEST_CONTENT_TYPE);
        let written: Value = serde_json::from_slice(&object.bytes).unwrap();
        assert_eq!(written["schemaVersion"], json!(1));
        assert_eq!(written["items"][0]["chartTemplateId"], json!("ctpl_price_v1"));
        assert!(written.get("failures").is_none());
    }

    #[tokio::test]
    async fn manifest_write_failure_is_reported() {
        let store = store();
        store.fail_uploads_ending_with("manifest.json");

        let error = write_manifest(&store, &manifest(Vec::new(), Vec::new())).await.unwrap_err();

        assert_eq!(error.code, ErrorCode::ManifestWriteFailed);
        assert_eq!(error.message, "Failed to write manifest to GCS");
        assert_eq!(
            error.details.unwrap()["objectPath"],
            json!("runs/run-1/steps/charts:1h/charts/manifest.json")
        );
    }

    #[test]
    fn validation_reports_first_violation_path() {
        let item = ManifestItem {
            chart_template_id: "ctpl_price_v1".into(),
            kind: "Price action".into(),
            generated_at: "2025-12-18T12:34:56Z".into(),
            png_gcs_uri: "https://example.com/chart.png".into(),
        };
        let error = validate_manifest(&manifest(vec![item], Vec::new())).unwrap_err();
        assert_eq!(error.code, ErrorCode::ValidationFailed);
        assert_eq!(error.details, Some(json!({"path": ["items", 0, "png_gcs_uri"]})));

        let mut bad_time = manifest(Vec::new(), Vec::new());
        bad_time.created_at = "yesterday".into();
        let error = validate_manifest(&bad_time).unwrap_err();
        assert_eq!(error.details, Some(json!({"path": ["createdAt"]})));
    }
}

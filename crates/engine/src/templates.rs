//! Turns a step's request list into concrete Chart-IMG requests.
//!
//! Templates live in the `chart_templates` collection:
//!
//! ```json
//! {
//!   "description": "Price action",
//!   "chartImgSymbolTemplate": "BINANCE:{symbol}",
//!   "request": {"theme": "dark", "studies": []}
//! }
//! ```
//!
//! Step-wide problems (bad `minImages`, duplicate template ids, malformed
//! scope symbol) reject the whole request list. Problems with one request are
//! collected as [`RequestFailure`]s and do not stop its siblings.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use chart_worker_api::ChartImgRequest;
use chart_worker_types::{ChartRequest, StepError};
use chart_worker_util::{DocumentStore, DocumentStoreError, DocumentKey};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::CHART_TEMPLATES_COLLECTION;

const SYMBOL_PLACEHOLDER: &str = "{symbol}";

/// Looks up chart templates by id.
#[async_trait]
pub trait ChartTemplateSource: Send + Sync {
    async fn get(&self, chart_template_id: &str) -> Result<Option<Map<String, Value>>, DocumentStoreError>;
}

/// Reads templates from the `chart_templates` collection of a document store.
#[derive(Clone)]
pub struct StoredTemplates {
    store: Arc<dyn DocumentStore>,
}

impl StoredTemplates {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChartTemplateSource for StoredTemplates {
    async fn get(&self, chart_template_id: &str) -> Result<Option<Map<String, Value>>, DocumentStoreError> {
        let key = DocumentKey::new(CHART_TEMPLATES_COLLECTION, chart_template_id);
        Ok(self.store.get(&key).await?.data)
    }
}

/// A validated template.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartTemplate {
    pub chart_template_id: String,
    pub description: String,
    pub chart_img_symbol_template: String,
    pub request: Map<String, Value>,
}

/// A request ready to be rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltChartRequest {
    /// Template description, reported as the manifest item kind.
    pub kind: String,
    pub request: ChartImgRequest,
}

/// A request that could not be built.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    /// Empty when the request carried no usable template id.
    pub chart_template_id: String,
    pub error: StepError,
}

/// Outcome of [`build_chart_requests`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltRequests {
    pub items: Vec<BuiltChartRequest>,
    pub failures: Vec<RequestFailure>,
}

/// Inputs shared by every request of a step.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub scope_symbol: &'a str,
    pub timeframe: &'a str,
    pub default_timezone: &'a str,
}

/// Checks `minImages` against the request count and rejects duplicate template ids.
pub fn validate_requests(requests: &[ChartRequest], min_images: Option<i64>) -> Result<(), StepError> {
    if let Some(min_images) = min_images {
        if min_images < 0 {
            return Err(StepError::validation("minImages must be a non-negative integer").with_details(json!({"minImages": min_images})));
        }
        if usize::try_from(min_images).is_ok_and(|min| min > requests.len()) {
            return Err(StepError::validation("minImages cannot exceed number of requests").with_details(json!({
                "minImages": min_images,
                "requestsCount": requests.len(),
            })));
        }
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for chart_template_id in requests.iter().filter_map(|request| request.chart_template_id.as_deref()) {
        if !seen.insert(chart_template_id) {
            duplicates.insert(chart_template_id);
        }
    }
    if !duplicates.is_empty() {
        return Err(StepError::validation("Duplicate chartTemplateId values in requests")
            .with_details(json!({"chartTemplateIds": duplicates.into_iter().collect::<Vec<_>>()})));
    }
    Ok(())
}

/// Requires a non-empty base symbol without `/` or inner whitespace.
pub fn validate_scope_symbol(scope_symbol: &str) -> Result<(), StepError> {
    let trimmed = scope_symbol.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.chars().any(char::is_whitespace) {
        return Err(StepError::validation("scope.symbol must be a non-empty base symbol without '/'")
            .with_details(json!({"scopeSymbol": scope_symbol})));
    }
    Ok(())
}

/// Validates a raw template document.
pub fn parse_chart_template(raw: &Map<String, Value>, chart_template_id: &str) -> Result<ChartTemplate, StepError> {
    let details = json!({"chartTemplateId": chart_template_id});
    let non_blank = |field: &str| {
        raw.get(field)
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    };

    let description = non_blank("description")
        .ok_or_else(|| StepError::validation("Template description must be a non-empty string").with_details(details.clone()))?;
    let chart_img_symbol_template = non_blank("chartImgSymbolTemplate")
        .ok_or_else(|| StepError::validation("chartImgSymbolTemplate is required").with_details(details.clone()))?;
    let request = raw
        .get("request")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| StepError::validation("Template request must be an object").with_details(details))?;

    Ok(ChartTemplate {
        chart_template_id: chart_template_id.to_string(),
        description,
        chart_img_symbol_template,
        request,
    })
}

/// Substitutes the scope symbol; `None` when the template has no placeholder.
pub fn render_chart_img_symbol(symbol_template: &str, scope_symbol: &str) -> Option<String> {
    symbol_template
        .contains(SYMBOL_PLACEHOLDER)
        .then(|| symbol_template.replace(SYMBOL_PLACEHOLDER, scope_symbol))
}

/// Validates the request list and resolves every request against its template.
///
/// Returns `Err` for step-wide validation failures. Template lookups that fail
/// with a store error propagate through the outer `Result` of the lookup.
pub async fn build_chart_requests(
    requests: &[ChartRequest],
    min_images: Option<i64>,
    context: RequestContext<'_>,
    templates: &dyn ChartTemplateSource,
) -> Result<Result<BuiltRequests, StepError>, DocumentStoreError> {
    if let Err(error) = validate_requests(requests, min_images).and_then(|()| validate_scope_symbol(context.scope_symbol)) {
        return Ok(Err(error));
    }

    let mut built = BuiltRequests::default();
    for request in requests {
        match build_one(request, context, templates).await? {
            Ok(item) => built.items.push(item),
            Err(failure) => {
                debug!(
                    chart_template_id = %failure.chart_template_id,
                    error_code = %failure.error.code,
                    message = %failure.error.message,
                    "chart_request_rejected"
                );
                built.failures.push(failure);
            }
        }
    }
    Ok(Ok(built))
}

async fn build_one(
    request: &ChartRequest,
    context: RequestContext<'_>,
    templates: &dyn ChartTemplateSource,
) -> Result<Result<BuiltChartRequest, RequestFailure>, DocumentStoreError> {
    let Some(chart_template_id) = request.template_id() else {
        return Ok(Err(RequestFailure {
            chart_template_id: String::new(),
            error: StepError::validation("chartTemplateId is required"),
        }));
    };
    let fail = |error: StepError| {
        Ok(Err(RequestFailure {
            chart_template_id: chart_template_id.to_string(),
            error,
        }))
    };

    let Some(raw) = templates.get(chart_template_id).await? else {
        return fail(StepError::validation("Chart template not found").with_details(json!({"chartTemplateId": chart_template_id})));
    };
    let template = match parse_chart_template(&raw, chart_template_id) {
        Ok(template) => template,
        Err(error) => return fail(error),
    };
    let Some(chart_img_symbol) = render_chart_img_symbol(&template.chart_img_symbol_template, context.scope_symbol) else {
        return fail(
            StepError::validation("chartImgSymbolTemplate must include {symbol}").with_details(json!({"chartTemplateId": chart_template_id})),
        );
    };

    let mut payload = template.request;
    payload.insert("symbol".into(), json!(chart_img_symbol));
    payload.insert("interval".into(), json!(context.timeframe));
    payload.insert("timezone".into(), json!(context.default_timezone));

    Ok(Ok(BuiltChartRequest {
        kind: template.description,
        request: ChartImgRequest::new(chart_template_id, chart_img_symbol, context.timeframe, payload),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chart_worker_types::ErrorCode;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTemplates(HashMap<String, Value>);

    impl FakeTemplates {
        fn with(mut self, id: &str, template: Value) -> Self {
            self.0.insert(id.to_string(), template);
            self
        }
    }

    #[async_trait]
    impl ChartTemplateSource for FakeTemplates {
        async fn get(&self, chart_template_id: &str) -> Result<Option<Map<String, Value>>, DocumentStoreError> {
            Ok(self.0.get(chart_template_id).and_then(Value::as_object).cloned())
        }
    }

    fn price_template() -> Value {
        json!({
            "description": "Price action",
            "chartImgSymbolTemplate": "BINANCE:{symbol}",
            "request": {"theme": "dark", "interval": "stale", "studies": [{"name": "Volume"}]}
        })
    }

    fn context() -> RequestContext<'static> {
        RequestContext {
            scope_symbol: "BTCUSDT",
            timeframe: "1h",
            default_timezone: "Etc/UTC",
        }
    }

    fn requests(ids: &[&str]) -> Vec<ChartRequest> {
        ids.iter().map(|id| ChartRequest::for_template(*id)).collect()
    }

    #[test]
    fn min_images_cannot_exceed_requests() {
        let error = validate_requests(&requests(&["a"]), Some(2)).unwrap_err();
        assert_eq!(error.message, "minImages cannot exceed number of requests");
        assert_eq!(error.details, Some(json!({"minImages": 2, "requestsCount": 1})));
        assert!(validate_requests(&requests(&["a"]), Some(1)).is_ok());
        assert!(validate_requests(&requests(&["a"]), None).is_ok());
    }

    #[test]
    fn duplicate_ids_are_reported_sorted() {
        let error = validate_requests(&requests(&["b", "a", "b", "a", "c"]), None).unwrap_err();
        assert_eq!(error.code, ErrorCode::ValidationFailed);
        assert_eq!(error.details, Some(json!({"chartTemplateIds": ["a", "b"]})));
    }

    #[test]
    fn scope_symbol_must_be_a_base_symbol() {
        assert!(validate_scope_symbol("BTCUSDT").is_ok());
        for bad in ["", "   ", "BTC/USDT", "BTC USDT"] {
            let error = validate_scope_symbol(bad).unwrap_err();
            assert_eq!(error.details, Some(json!({"scopeSymbol": bad})));
        }
    }

    #[test]
    fn template_fields_are_checked_in_order() {
        let missing_description = json!({"chartImgSymbolTemplate": "X:{symbol}", "request": {}});
        let error = parse_chart_template(missing_description.as_object().unwrap(), "t").unwrap_err();
        assert_eq!(error.message, "Template description must be a non-empty string");

        let missing_symbol = json!({"description": "d", "request": {}});
        let error = parse_chart_template(missing_symbol.as_object().unwrap(), "t").unwrap_err();
        assert_eq!(error.message, "chartImgSymbolTemplate is required");

        let bad_request = json!({"description": "d", "chartImgSymbolTemplate": "X:{symbol}", "request": []});
        let error = parse_chart_template(bad_request.as_object().unwrap(), "t").unwrap_err();
        assert_eq!(error.message, "Template request must be an object");
        assert_eq!(error.details, Some(json!({"chartTemplateId": "t"})));
    }

    #[tokio::test]
    async fn builds_payload_from_template() {
        let templates = FakeTemplates::default().with("ctpl_price_v1", price_template());

        let built = build_chart_requests(&requests(&["ctpl_price_v1"]), Some(1), context(), &templates)
            .await
            .unwrap()
            .unwrap();

        assert!(built.failures.is_empty());
        let item = &built.items[0];
        assert_eq!(item.kind, "Price action");
        assert_eq!(item.request.chart_img_symbol, "BINANCE:BTCUSDT");
        assert_eq!(item.request.timeframe, "1h");
        assert_eq!(
            Value::Object(item.request.payload.clone()),
            json!({
                "theme": "dark",
                "interval": "1h",
                "studies": [{"name": "Volume"}],
                "symbol": "BINANCE:BTCUSDT",
                "timezone": "Etc/UTC"
            })
        );
    }

    #[tokio::test]
    async fn per_request_problems_are_collected() {
        let templates = FakeTemplates::default()
            .with("ctpl_price_v1", price_template())
            .with(
                "no_placeholder",
                json!({"description": "d", "chartImgSymbolTemplate": "BINANCE:BTCUSDT", "request": {}}),
            );
        let mut list = requests(&["ctpl_price_v1", "missing", "no_placeholder"]);
        list.push(ChartRequest::default());

        let built = build_chart_requests(&list, None, context(), &templates).await.unwrap().unwrap();

        assert_eq!(built.items.len(), 1);
        let messages: Vec<(&str, &str)> = built
            .failures
            .iter()
            .map(|failure| (failure.chart_template_id.as_str(), failure.error.message.as_str()))
            .collect();
        assert_eq!(
            messages,
            vec![
                ("missing", "Chart template not found"),
                ("no_placeholder", "chartImgSymbolTemplate must include {symbol}"),
                ("", "chartTemplateId is required"),
            ]
        );
    }

    #[tokio::test]
    async fn step_wide_validation_short_circuits() {
        let templates = FakeTemplates::default();
        let context = RequestContext {
            scope_symbol: "BTC/USDT",
            ..context()
        };

        let error = build_chart_requests(&requests(&["a"]), None, context, &templates).await.unwrap().unwrap_err();
        assert_eq!(error.message, "scope.symbol must be a non-empty base symbol without '/'");
    }
}

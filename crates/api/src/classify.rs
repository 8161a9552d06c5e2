//! Maps chart API responses onto the step error taxonomy.
//!
//! | response | code | retriable |
//! |---|---|---|
//! | 200 + PNG body | success | |
//! | 200 + other body | `CHART_API_FAILED` | no |
//! | 429, or message contains "limit exceeded" | `CHART_API_LIMIT_EXCEEDED` | yes (by rotation) |
//! | 500, 504 | `CHART_API_FAILED` | yes |
//! | other statuses | `CHART_API_FAILED` | no |
//! | timeout / connection error | `CHART_API_FAILED` | yes |

use chart_worker_types::{ChartApiError, ErrorCode};
use serde_json::{Map, Value, json};

use crate::{ChartImgRequest, http::HttpRequestError, http::HttpResponse};

/// First eight bytes of every PNG file.
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Statuses worth retrying with backoff.
pub const RETRIABLE_STATUSES: &[u16] = &[500, 504];

pub fn is_png(bytes: &[u8]) -> bool {
    bytes.starts_with(PNG_SIGNATURE)
}

/// Parses a response body as JSON; empty or non-JSON bodies yield `None`.
pub fn parse_json_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body).ok()
}

/// Extracts a human-readable message from an error body.
///
/// Looks at `message`, then `error`, then `errors[]` (strings or objects with
/// `message`/`error`, joined by `"; "`), then a bare JSON string.
pub fn extract_error_message(body: Option<&Value>) -> Option<String> {
    fn non_blank(value: Option<&Value>) -> Option<String> {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    match body? {
        Value::Object(object) => {
            if let Some(message) = non_blank(object.get("message")).or_else(|| non_blank(object.get("error"))) {
                return Some(message);
            }
            let parts: Vec<String> = object
                .get("errors")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|item| match item {
                    Value::Object(entry) => non_blank(entry.get("message")).or_else(|| non_blank(entry.get("error"))),
                    other => non_blank(Some(other)),
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        other => non_blank(Some(other)),
    }
}

pub fn is_limit_exceeded(status: Option<u16>, message: Option<&str>) -> bool {
    status == Some(429) || message.is_some_and(|message| message.to_lowercase().contains("limit exceeded"))
}

/// Classifies a response that carried an HTTP status.
pub fn classify_response(response: HttpResponse, request: &ChartImgRequest) -> Result<Vec<u8>, ChartApiError> {
    if response.status == 200 {
        if is_png(&response.body) {
            return Ok(response.body);
        }
        let mut details = Map::new();
        details.insert("contentType".into(), json!(response.content_type()));
        return Err(ChartApiError::new(ErrorCode::ChartApiFailed, "Chart-IMG returned HTTP 200 with non-PNG body", false)
            .with_status(200)
            .with_details(details));
    }

    Err(classify_error_body(Some(response.status), parse_json_body(&response.body), request))
}

/// Builds the error for a failed status and its (parsed) body.
///
/// Shared by live responses and recorded error fixtures. A missing status is
/// treated as non-retriable.
pub fn classify_error_body(status: Option<u16>, body: Option<Value>, request: &ChartImgRequest) -> ChartApiError {
    let message = extract_error_message(body.as_ref());
    let details = error_details(body, request);

    let error = if is_limit_exceeded(status, message.as_deref()) {
        ChartApiError::new(
            ErrorCode::ChartApiLimitExceeded,
            message.unwrap_or_else(|| "Chart-IMG limit exceeded".to_string()),
            true,
        )
    } else {
        let retriable = status.is_some_and(|status| RETRIABLE_STATUSES.contains(&status));
        ChartApiError::new(
            ErrorCode::ChartApiFailed,
            message.unwrap_or_else(|| "Chart-IMG request failed".to_string()),
            retriable,
        )
    };

    let error = error.with_details(details);
    match status {
        Some(status) => error.with_status(status),
        None => error,
    }
}

/// Transport failures are always retriable.
pub fn classify_transport_error(error: &HttpRequestError) -> ChartApiError {
    let reason = if error.is_timeout { "timeout" } else { "network" };
    let mut details = Map::new();
    details.insert("reason".into(), json!(reason));
    ChartApiError::new(ErrorCode::ChartApiFailed, error.message.clone(), true).with_details(details)
}

fn error_details(body: Option<Value>, request: &ChartImgRequest) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("chartTemplateId".into(), json!(request.chart_template_id));
    details.insert("chartImgSymbol".into(), json!(request.chart_img_symbol));
    if let Some(body) = body {
        details.insert("response".into(), body);
    }
    details
}

//! Firestore "document updated" CloudEvents for the `flow_runs` collection.
//!
//! The event carries the updated document in Firestore's typed-value encoding
//! under `data.value.fields`; [`decode_firestore_fields`] turns it back into
//! plain JSON so the rest of the engine sees the same shape as a stored flow run.

use serde::Deserialize;
use serde_json::{Map, Number, Value};

const FLOW_RUNS_MARKER: &str = "/documents/flow_runs/";

/// The CloudEvent attributes the worker looks at.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Event payload; may arrive as an object or as a JSON-encoded string.
    #[serde(default)]
    pub data: Option<Value>,
}

impl CloudEvent {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A flow run extracted from an update event.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRunEvent {
    pub run_id: String,
    /// Decoded document fields; empty when the event carried none.
    pub flow_run: Map<String, Value>,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub subject: Option<String>,
}

/// Only document updates can move a step to `READY`.
pub fn is_firestore_update_event(event_type: Option<&str>) -> bool {
    event_type.is_some_and(|event_type| event_type.ends_with(".updated"))
}

/// Extracts the run id and decoded flow run, or `None` when the event does not
/// point at a `flow_runs` document.
pub fn parse_flow_run_event(event: &CloudEvent) -> Option<FlowRunEvent> {
    let data = normalize_event_data(event.data.as_ref()?)?;
    let doc_path = extract_doc_path(event.subject.as_deref(), Some(&data))?;
    let run_id = extract_run_id(&doc_path)?;

    let flow_run = data
        .get("value")
        .and_then(|value| value.get("fields"))
        .and_then(Value::as_object)
        .map(decode_firestore_fields)
        .unwrap_or_default();

    Some(FlowRunEvent {
        run_id,
        flow_run,
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        subject: event.subject.clone(),
    })
}

pub fn extract_run_id_from_subject(subject: Option<&str>) -> Option<String> {
    extract_doc_path(subject, None).and_then(|path| extract_run_id(&path))
}

/// Decodes every field of a Firestore `fields` map.
pub fn decode_firestore_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), decode_firestore_value(value)))
        .collect()
}

/// Decodes one Firestore typed value.
///
/// Unparseable integers and doubles are returned as sent. An object carrying
/// no known type tag is returned unchanged.
pub fn decode_firestore_value(value: &Value) -> Value {
    let Some(typed) = value.as_object() else {
        return value.clone();
    };

    if let Some(text) = typed.get("stringValue") {
        return text.clone();
    }
    if let Some(raw) = typed.get("integerValue") {
        return match raw {
            Value::String(text) => text.trim().parse::<i64>().map(Value::from).unwrap_or_else(|_| raw.clone()),
            other => other.clone(),
        };
    }
    if let Some(raw) = typed.get("doubleValue") {
        return match raw {
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| raw.clone()),
            other => other.clone(),
        };
    }
    if let Some(flag) = typed.get("booleanValue") {
        return Value::Bool(truthy(flag));
    }
    if typed.contains_key("nullValue") {
        return Value::Null;
    }
    for passthrough in ["timestampValue", "bytesValue", "referenceValue"] {
        if let Some(raw) = typed.get(passthrough) {
            return raw.clone();
        }
    }
    if let Some(map_value) = typed.get("mapValue") {
        let fields = map_value.get("fields").and_then(Value::as_object);
        return Value::Object(fields.map(decode_firestore_fields).unwrap_or_default());
    }
    if let Some(array_value) = typed.get("arrayValue") {
        let values = array_value.get("values").and_then(Value::as_array);
        return Value::Array(values.map(|items| items.iter().map(decode_firestore_value).collect()).unwrap_or_default());
    }
    value.clone()
}

fn truthy(flag: &Value) -> bool {
    match flag {
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Accepts an object payload or a JSON string that decodes to one.
fn normalize_event_data(data: &Value) -> Option<Value> {
    match data {
        Value::Object(_) => Some(data.clone()),
        Value::String(text) => serde_json::from_str::<Value>(text).ok().filter(Value::is_object),
        _ => None,
    }
}

fn extract_doc_path(subject: Option<&str>, data: Option<&Value>) -> Option<String> {
    if let Some(subject) = subject {
        if subject.contains(FLOW_RUNS_MARKER) {
            return Some(subject.to_string());
        }
        if subject.contains(&FLOW_RUNS_MARKER[1..]) {
            return Some(format!("/{subject}"));
        }
    }
    data?
        .get("value")?
        .get("name")?
        .as_str()
        .filter(|name| name.contains(FLOW_RUNS_MARKER))
        .map(str::to_string)
}

fn extract_run_id(doc_path: &str) -> Option<String> {
    let (_, tail) = doc_path.split_once(FLOW_RUNS_MARKER)?;
    let run_id = tail.split('/').next().unwrap_or_default();
    (!run_id.is_empty()).then(|| run_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(subject: &str, data: Value) -> CloudEvent {
        CloudEvent {
            id: Some("evt-1".into()),
            event_type: Some("google.cloud.firestore.document.v1.updated".into()),
            subject: Some(subject.into()),
            data: Some(data),
        }
    }

    fn typed_flow_run() -> Value {
        json!({
            "value": {
                "name": "projects/p/databases/(default)/documents/flow_runs/run-9",
                "fields": {
                    "runId": {"stringValue": "run-9"},
                    "steps": {"mapValue": {"fields": {
                        "charts:1h": {"mapValue": {"fields": {
                            "stepType": {"stringValue": "CHART_EXPORT"},
                            "status": {"stringValue": "READY"},
                            "inputs": {"mapValue": {"fields": {
                                "minImages": {"integerValue": "1"},
                                "requests": {"arrayValue": {"values": [
                                    {"mapValue": {"fields": {"chartTemplateId": {"stringValue": "ctpl_price_v1"}}}}
                                ]}}
                            }}}
                        }}}
                    }}}
                }
            }
        })
    }

    #[test]
    fn only_update_events_pass_the_filter() {
        assert!(is_firestore_update_event(Some("google.cloud.firestore.document.v1.updated")));
        assert!(!is_firestore_update_event(Some("google.cloud.firestore.document.v1.created")));
        assert!(!is_firestore_update_event(None));
    }

    #[test]
    fn decodes_typed_fields_into_plain_json() {
        let parsed = parse_flow_run_event(&event("documents/flow_runs/run-9", typed_flow_run())).unwrap();

        assert_eq!(parsed.run_id, "run-9");
        assert_eq!(parsed.event_id.as_deref(), Some("evt-1"));
        assert_eq!(
            Value::Object(parsed.flow_run),
            json!({
                "runId": "run-9",
                "steps": {"charts:1h": {
                    "stepType": "CHART_EXPORT",
                    "status": "READY",
                    "inputs": {"minImages": 1, "requests": [{"chartTemplateId": "ctpl_price_v1"}]}
                }}
            })
        );
    }

    #[test]
    fn data_may_arrive_as_a_json_string() {
        let data = Value::String(typed_flow_run().to_string());
        let parsed = parse_flow_run_event(&event("unrelated", data)).unwrap();
        assert_eq!(parsed.run_id, "run-9");
    }

    #[test]
    fn events_outside_flow_runs_are_rejected() {
        let data = json!({"value": {"name": "projects/p/databases/(default)/documents/other/x", "fields": {}}});
        assert!(parse_flow_run_event(&event("documents/other/x", data)).is_none());
        assert!(parse_flow_run_event(&event("documents/flow_runs/run-1", json!("not json"))).is_none());
        assert_eq!(
            extract_run_id_from_subject(Some("/documents/flow_runs/run-7/steps/x")),
            Some("run-7".to_string())
        );
        assert_eq!(extract_run_id_from_subject(Some("/documents/flow_runs/")), None);
    }

    #[test]
    fn scalar_values_decode_with_fallbacks() {
        assert_eq!(decode_firestore_value(&json!({"integerValue": "12"})), json!(12));
        assert_eq!(decode_firestore_value(&json!({"integerValue": "twelve"})), json!("twelve"));
        assert_eq!(decode_firestore_value(&json!({"doubleValue": 1.5})), json!(1.5));
        assert_eq!(decode_firestore_value(&json!({"booleanValue": true})), json!(true));
        assert_eq!(decode_firestore_value(&json!({"nullValue": null})), Value::Null);
        assert_eq!(
            decode_firestore_value(&json!({"timestampValue": "2025-12-18T00:00:00Z"})),
            json!("2025-12-18T00:00:00Z")
        );
        assert_eq!(decode_firestore_value(&json!({"mapValue": {}})), json!({}));
        assert_eq!(decode_firestore_value(&json!({"arrayValue": {}})), json!([]));
        assert_eq!(decode_firestore_value(&json!({"mystery": 1})), json!({"mystery": 1}));
    }
}

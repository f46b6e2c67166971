//! SMART envelope layer (C5): request wrapping, `control_child` routing,
//! `multipleRequest` batching, and response unwrapping.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::credentials::TerminalUuid;
use crate::error::{CoreError, Result};

/// A single SMART call: method name plus optional params.
#[derive(Debug, Clone)]
pub struct SmartRequest {
    pub method: String,
    pub params: Option<Value>,
}

impl SmartRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("method".into(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Wrap a single inner request (already `control_child`-wrapped if needed)
/// with the envelope fields every outbound SMART payload carries.
fn wrap_envelope(inner: &SmartRequest, terminal_uuid: &TerminalUuid) -> Value {
    let mut value = inner.to_value();
    let obj = value.as_object_mut().expect("to_value always returns an object");
    obj.insert("request_time_milis".into(), json!(now_millis() as u64));
    obj.insert("terminal_uuid".into(), json!(terminal_uuid.as_str()));
    value
}

/// Wrap `inner` as a `control_child` request targeting `child_id`.
fn wrap_control_child(inner: &SmartRequest, child_id: &str) -> SmartRequest {
    let mut request_data = serde_json::Map::new();
    request_data.insert("method".into(), Value::String(inner.method.clone()));
    if let Some(params) = &inner.params {
        request_data.insert("params".into(), params.clone());
    }

    SmartRequest::new(
        "control_child",
        Some(json!({
            "device_id": child_id,
            "requestData": Value::Object(request_data),
        })),
    )
}

/// Build the final JSON envelope to POST for a single SMART call,
/// resolving `control_child` wrapping when `child_id` is present.
pub fn build_single_request(
    request: &SmartRequest,
    child_id: Option<&str>,
    terminal_uuid: &TerminalUuid,
) -> Value {
    match child_id {
        Some(id) => wrap_envelope(&wrap_control_child(request, id), terminal_uuid),
        None => wrap_envelope(request, terminal_uuid),
    }
}

/// Build the final JSON envelope for a `multipleRequest` batch.
pub fn build_batch_request(requests: &[SmartRequest], terminal_uuid: &TerminalUuid) -> Value {
    let inner_list: Vec<Value> = requests.iter().map(SmartRequest::to_value).collect();
    let batch = SmartRequest::new("multipleRequest", Some(json!({ "requests": inner_list })));
    wrap_envelope(&batch, terminal_uuid)
}

fn error_code_of(value: &Value) -> Result<i64> {
    value
        .get("error_code")
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::Protocol("smart response missing error_code".into()))
}

/// Unwrap a non-batched response. When `child_id` was used, unwraps the
/// nested `responseData` and verifies its own `error_code` too.
pub fn unwrap_single_response(
    response: &Value,
    method: &str,
    child_id: Option<&str>,
) -> Result<Value> {
    let top_code = error_code_of(response)?;
    if top_code != 0 {
        return Err(CoreError::smart(top_code, method));
    }
    let top_result = response
        .get("result")
        .cloned()
        .ok_or_else(|| CoreError::Protocol("smart response missing result".into()))?;

    if child_id.is_none() {
        return Ok(top_result);
    }

    let response_data = top_result
        .get("responseData")
        .ok_or_else(|| CoreError::Protocol("control_child result missing responseData".into()))?;
    let inner_code = error_code_of(response_data)?;
    if inner_code != 0 {
        return Err(CoreError::smart(inner_code, method));
    }
    response_data
        .get("result")
        .cloned()
        .ok_or_else(|| CoreError::Protocol("control_child responseData missing result".into()))
}

/// Unwrap a `multipleRequest` batch response into `method -> result`,
/// surfacing the first per-entry failure as `CoreError::Smart`.
pub fn unwrap_batch_response(response: &Value) -> Result<HashMap<String, Value>> {
    let top_code = error_code_of(response)?;
    if top_code != 0 {
        return Err(CoreError::smart(top_code, "multipleRequest"));
    }
    let responses = response
        .get("result")
        .and_then(|r| r.get("responses"))
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Protocol("multipleRequest result missing responses".into()))?;

    let mut out = HashMap::with_capacity(responses.len());
    for entry in responses {
        let method = entry
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Protocol("batch entry missing method".into()))?
            .to_string();
        let code = error_code_of(entry)?;
        if code != 0 {
            return Err(CoreError::smart(code, method));
        }
        let result = entry
            .get("result")
            .cloned()
            .ok_or_else(|| CoreError::Protocol(format!("batch entry '{method}' missing result")))?;
        out.insert(method, result);
    }
    Ok(out)
}

/// Validate that at most one `childId` is supplied per SMART call. The
/// public API shape only ever carries zero or one; this guards the rare
/// caller that builds requests programmatically and accidentally passes a
/// list.
pub fn validate_single_child(child_ids: &[&str]) -> Result<Option<&str>> {
    match child_ids.len() {
        0 => Ok(None),
        1 => Ok(Some(child_ids[0])),
        _ => Err(CoreError::InvalidArgument(
            "only one childId is permitted per smart call".into(),
        )),
    }
}

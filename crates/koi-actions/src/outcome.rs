// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{json, Value};

/// A successful result.  `data` is merged into the outcome object when it is
/// itself an object, and stored under `"result"` otherwise.
pub fn success(data: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => json!({ "success": true }),
        other => json!({ "success": true, "result": other }),
    }
}

/// A user-caused action failure: not thrown, surfaced to the model as
/// negative feedback.  `fix` carries optional advice on how to proceed.
pub fn failure(error: impl Into<String>, fix: Option<&str>) -> Value {
    let mut value = json!({ "success": false, "error": error.into() });
    if let Some(fix) = fix {
        value["fix"] = Value::String(fix.to_string());
    }
    value
}

/// A permission denial.  Never thrown; `feedback` tells the model what it
/// could do instead.
pub fn denied(message: impl Into<String>, feedback: Option<&str>) -> Value {
    let mut value = json!({ "success": false, "denied": true, "message": message.into() });
    if let Some(feedback) = feedback {
        value["feedback"] = Value::String(feedback.to_string());
    }
    value
}

pub fn is_failure(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool) == Some(false)
}

pub fn is_denied(value: &Value) -> bool {
    value.get("denied").and_then(Value::as_bool) == Some(true)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

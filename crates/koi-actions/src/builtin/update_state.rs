// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Mutates the agent's user-defined state blob.  Either a single
/// `key`/`value` pair or a `data` object merged wholesale.
pub struct UpdateStateAction;

#[async_trait]
impl ActionDefinition for UpdateStateAction {
    fn intent(&self) -> &str {
        "update_state"
    }

    fn description(&self) -> &str {
        "Store a value in the agent's persistent state. Pass 'key' and \
         'value', or a 'data' object whose fields are merged in."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": { "description": "Value stored under 'key'" },
                "data": { "type": "object", "description": "Fields merged into the state" }
            }
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let mut state = cx.state.lock().unwrap();
        if let (Some(key), Some(value)) = (action.get_str("key"), action.get("value")) {
            state.insert(key.to_string(), value.clone());
            return Ok(ActionEffect::Value(success(json!({ "updated": key }))));
        }
        if let Some(Value::Object(data)) = action.get("data") {
            let keys: Vec<String> = data.keys().cloned().collect();
            for (k, v) in data {
                state.insert(k.clone(), v.clone());
            }
            return Ok(ActionEffect::Value(success(json!({ "updated": keys }))));
        }
        Ok(ActionEffect::Value(failure(
            "update_state requires 'key' + 'value' or a 'data' object",
            None,
        )))
    }
}

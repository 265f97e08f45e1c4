// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{ActionContext, ActionDefinition, ActionEffect, Permission};

/// Terminal action.  Delegates always surface the payload to their caller;
/// in CLI mode the loop records it and waits for the next user input
/// instead of exiting.
pub struct ReturnAction;

#[async_trait]
impl ActionDefinition for ReturnAction {
    fn intent(&self) -> &str {
        "return"
    }

    fn description(&self) -> &str {
        "Finish the current task and return a result. Put the payload in \
         'value'; plain fields are returned as-is when 'value' is absent."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "value": { "description": "The result payload" }
            }
        })
    }

    async fn execute(&self, action: &Action, _cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let payload = match action.get("value") {
            Some(v) => v.clone(),
            // No explicit value: everything the model put on the action is
            // the payload.
            None if !action.fields.is_empty() => Value::Object(action.fields.clone()),
            None => Value::Null,
        };
        Ok(ActionEffect::Return(payload))
    }
}

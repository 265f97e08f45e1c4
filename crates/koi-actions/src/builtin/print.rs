// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{success, ActionContext, ActionDefinition, ActionEffect, Permission};

pub struct PrintAction;

#[async_trait]
impl ActionDefinition for PrintAction {
    fn intent(&self) -> &str {
        "print"
    }

    fn description(&self) -> &str {
        "Show a message to the user. Use for status updates and final answers; \
         the message is displayed verbatim."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "The message to display" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        // Models alternate between `text` and `message`; accept both.
        let text = action
            .get_str("text")
            .or_else(|| action.get_str("message"))
            .unwrap_or_default();
        cx.prompter.print(text);
        Ok(ActionEffect::Value(success(json!({ "printed": true }))))
    }
}

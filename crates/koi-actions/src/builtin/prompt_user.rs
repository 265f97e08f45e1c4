// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Hands control back to the user and blocks until they answer.  The loop
/// flushes pending session commits before this runs and routes `/`-prefixed
/// answers through the slash-command handler afterwards.
pub struct PromptUserAction;

#[async_trait]
impl ActionDefinition for PromptUserAction {
    fn intent(&self) -> &str {
        "prompt_user"
    }

    fn description(&self) -> &str {
        "Wait for the user's next input. Use after completing a task or when \
         you need direction. The optional message is shown as the prompt."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Prompt text shown to the user" }
            }
        })
    }

    fn thinking_hint(&self, _action: &Action) -> Option<String> {
        Some("waiting for the user".to_string())
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let message = action.get_str("message").unwrap_or("> ");
        let input = cx.prompter.prompt_user(message).await?;
        Ok(ActionEffect::Value(success(json!({ "input": input }))))
    }
}

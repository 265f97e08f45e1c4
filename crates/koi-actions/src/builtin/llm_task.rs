// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// A one-shot model call with no tool access: summarisation, rewriting,
/// classification.  The direct-LLM leg of the resolution cascade also lands
/// here for simple free-text intents.
pub struct LlmTaskAction;

#[async_trait]
impl ActionDefinition for LlmTaskAction {
    fn intent(&self) -> &str {
        "llm_task"
    }

    fn description(&self) -> &str {
        "Run a single LLM completion for a self-contained task (summarise, \
         rewrite, classify). No tools are available to it; the completion \
         text is the result."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "The instruction" },
                "input": { "type": "string", "description": "Optional input text the task applies to" }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(task) = action.get_str("task").or_else(|| action.get_str("prompt")) else {
            return Ok(ActionEffect::Value(failure(
                "llm_task requires a 'task' instruction",
                None,
            )));
        };
        let prompt = match action.get_str("input") {
            Some(input) => format!("{task}\n\n---\n\n{input}"),
            None => task.to_string(),
        };
        debug!(len = prompt.len(), "llm_task");
        let text = cx.provider.complete_text(&prompt, "llm-task").await?;
        Ok(ActionEffect::Value(success(json!({ "result": text }))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    #[tokio::test]
    async fn completes_through_the_provider() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let action = Action::new("llm_task").with("task", json!("say hi"));
        let v = LlmTaskAction.execute(&action, &cx).await.unwrap().as_value();
        assert_eq!(v["success"], json!(true));
        assert!(v["result"].is_string());
    }

    #[tokio::test]
    async fn missing_task_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = LlmTaskAction
            .execute(&Action::new("llm_task"), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
    }
}

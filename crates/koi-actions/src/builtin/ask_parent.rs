// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{failure, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Delegate-side escape hatch: short-circuits the delegate's session and
/// asks the calling agent's model for an answer.  The caller merges the
/// answer into the delegate's args and re-invokes it.
pub struct AskParentAction;

#[async_trait]
impl ActionDefinition for AskParentAction {
    fn intent(&self) -> &str {
        "ask_parent"
    }

    fn description(&self) -> &str {
        "Ask the agent that delegated this task a clarifying question. Only \
         meaningful inside a delegated task; the session pauses until the \
         answer arrives in args.answer."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question for the caller" }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, action: &Action, _cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        match action.get_str("question") {
            Some(question) if !question.trim().is_empty() => Ok(ActionEffect::AskParent {
                question: question.to_string(),
            }),
            _ => Ok(ActionEffect::Value(failure(
                "ask_parent requires a non-empty 'question'",
                None,
            ))),
        }
    }
}

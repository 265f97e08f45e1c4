// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_llm::Action;
use koi_session::AccessLevel;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

pub struct EditFileAction;

#[async_trait]
impl ActionDefinition for EditFileAction {
    fn intent(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text span in an existing file. 'old_text' must \
         occur exactly once; include enough surrounding context to make it \
         unique. The edit is staged into the session changeset."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" },
                "old_text": { "type": "string", "description": "Exact text to replace" },
                "new_text": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("path").map(|p| format!("editing {p}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let (Some(path), Some(old_text), Some(new_text)) = (
            action.get_str("path"),
            action.get_str("old_text"),
            action.get_str("new_text"),
        ) else {
            let args_preview = Value::Object(action.fields.clone()).to_string();
            return Ok(ActionEffect::Value(failure(
                format!(
                    "edit_file requires 'path', 'old_text' and 'new_text'. Received: {args_preview}"
                ),
                None,
            )));
        };

        if let Some(deny) = cx
            .ensure_allowed(Path::new(path), AccessLevel::Write)
            .await?
        {
            return Ok(ActionEffect::Value(deny));
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ActionEffect::Value(failure(
                    format!("cannot read {path}: {e}"),
                    Some("use write_file to create a new file"),
                )))
            }
        };

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Ok(ActionEffect::Value(failure(
                format!("old_text not found in {path}"),
                Some("read the file again; the content may have changed"),
            )));
        }
        if occurrences > 1 {
            return Ok(ActionEffect::Value(failure(
                format!("old_text occurs {occurrences} times in {path}; it must be unique"),
                Some("include more surrounding context in old_text"),
            )));
        }

        debug!(path, "edit_file");
        cx.tracker.track_file(path, Some(content.clone()));
        let updated = content.replacen(old_text, new_text, 1);
        match tokio::fs::write(path, updated).await {
            Ok(()) => Ok(ActionEffect::Value(success(json!({ "path": path })))),
            Err(e) => Ok(ActionEffect::Value(failure(
                format!("write error: {e}"),
                None,
            ))),
        }
    }
}

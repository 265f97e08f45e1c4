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

pub struct WriteFileAction;

#[async_trait]
impl ActionDefinition for WriteFileAction {
    fn intent(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file to the local filesystem, overwriting any existing file \
         at the path. Prefer edit_file for changes to existing files. Parent \
         directories are created automatically. Every write is staged into \
         the session changeset and committed when control returns to the user."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" },
                "content": { "type": "string", "description": "Content to write" }
            },
            "required": ["path", "content"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("path").map(|p| format!("writing {p}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let args_preview = || Value::Object(action.fields.clone()).to_string();
        let Some(path) = action.get_str("path") else {
            return Ok(ActionEffect::Value(failure(
                format!("missing required parameter 'path'. Received: {}", args_preview()),
                None,
            )));
        };
        let Some(content) = action.get_str("content") else {
            return Ok(ActionEffect::Value(failure(
                format!("missing required parameter 'content'. Received: {}", args_preview()),
                None,
            )));
        };

        if let Some(deny) = cx
            .ensure_allowed(Path::new(path), AccessLevel::Write)
            .await?
        {
            return Ok(ActionEffect::Value(deny));
        }

        debug!(path, bytes = content.len(), "write_file");

        // Stage the pre-image before touching the file so the session
        // changeset can restore it.
        let old = tokio::fs::read_to_string(path).await.ok();
        cx.tracker.track_file(path, old);

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => Ok(ActionEffect::Value(success(json!({
                "path": path,
                "bytes": content.len(),
            })))),
            Err(e) => Ok(ActionEffect::Value(failure(
                format!("write error: {e}"),
                None,
            ))),
        }
    }
}

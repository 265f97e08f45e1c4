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

pub struct ReadFileAction;

#[async_trait]
impl ActionDefinition for ReadFileAction {
    fn intent(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the local filesystem and return its content. \
         Supports optional 'offset' (1-based start line) and 'limit' (line count)."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" },
                "offset": { "type": "integer", "description": "1-based first line to return" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("path").map(|p| format!("reading {p}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(path) = action.get_str("path") else {
            let args_preview = Value::Object(action.fields.clone()).to_string();
            return Ok(ActionEffect::Value(failure(
                format!("missing required parameter 'path'. Received: {args_preview}"),
                None,
            )));
        };

        if let Some(deny) = cx.ensure_allowed(Path::new(path), AccessLevel::Read).await? {
            return Ok(ActionEffect::Value(deny));
        }

        debug!(path, "read_file");
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ActionEffect::Value(failure(
                    format!("cannot read {path}: {e}"),
                    Some("check the path with the search action first"),
                )))
            }
        };

        let offset = action.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize;
        let limit = action.get("limit").and_then(Value::as_u64).map(|l| l as usize);
        let selected: String = match limit {
            Some(limit) => content
                .lines()
                .skip(offset.saturating_sub(1))
                .take(limit)
                .collect::<Vec<_>>()
                .join("\n"),
            None if offset > 1 => content
                .lines()
                .skip(offset - 1)
                .collect::<Vec<_>>()
                .join("\n"),
            None => content,
        };

        Ok(ActionEffect::Value(success(json!({
            "path": path,
            "content": selected,
        }))))
    }
}

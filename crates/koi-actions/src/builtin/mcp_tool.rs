// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Invoke a tool on a configured MCP server.  Transport failures surface as
/// soft failures carrying whatever diagnostics the client captured (for
/// stdio servers this includes the stderr tail), so the model can react.
pub struct McpToolAction;

#[async_trait]
impl ActionDefinition for McpToolAction {
    fn intent(&self) -> &str {
        "mcp_tool"
    }

    fn description(&self) -> &str {
        "Call a tool on one of the configured MCP servers. 'server' is the \
         configured server name, 'tool' the tool name, 'args' its arguments."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "server": { "type": "string", "description": "Configured MCP server name" },
                "tool": { "type": "string", "description": "Tool to invoke" },
                "args": { "type": "object", "description": "Tool arguments" }
            },
            "required": ["server", "tool"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("tool").map(|t| format!("calling tool {t}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let (Some(server), Some(tool)) = (action.get_str("server"), action.get_str("tool"))
        else {
            return Ok(ActionEffect::Value(failure(
                "mcp_tool requires 'server' and 'tool'",
                None,
            )));
        };
        let args = action
            .get("args")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        debug!(server, tool, "mcp_tool");
        match cx.mcp.call_tool(server, tool, args).await {
            Ok(result) => Ok(ActionEffect::Value(success(result))),
            Err(e) => Ok(ActionEffect::Value(failure(
                format!("MCP call failed: {e}"),
                Some("check the server configuration and whether the tool exists"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    #[tokio::test]
    async fn unknown_server_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let action = Action::new("mcp_tool")
            .with("server", json!("ghost"))
            .with("tool", json!("echo"));
        let v = McpToolAction.execute(&action, &cx).await.unwrap().as_value();
        assert!(is_failure(&v));
        assert!(v["error"].as_str().unwrap().contains("MCP call failed"));
    }

    #[tokio::test]
    async fn missing_arguments_fail_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = McpToolAction
            .execute(&Action::new("mcp_tool"), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use crate::{McpError, Result};

/// A parsed remote tool address: `mcp://<server>/<path>?<query>`.
///
/// The already-parsed wire form `{"type": "MCPAddress", "server": …,
/// "path": …}` is accepted as well, since delegation payloads carry
/// addresses in that shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpAddress {
    pub server: String,
    pub path: String,
    pub query: Option<String>,
}

impl McpAddress {
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix("mcp://")
            .ok_or_else(|| McpError::BadAddress(input.to_string()))?;
        if rest.is_empty() {
            return Err(McpError::BadAddress(input.to_string()));
        }
        let (server_and_path, query) = match rest.split_once('?') {
            Some((sp, q)) => (sp, Some(q.to_string())),
            None => (rest, None),
        };
        let (server, path) = match server_and_path.split_once('/') {
            Some((s, p)) => (s.to_string(), format!("/{p}")),
            None => (server_and_path.to_string(), "/".to_string()),
        };
        if server.is_empty() {
            return Err(McpError::BadAddress(input.to_string()));
        }
        Ok(Self {
            server,
            path,
            query,
        })
    }

    /// Accept either the string grammar or the pre-parsed object form.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("MCPAddress") => {
                let server = map
                    .get("server")
                    .and_then(Value::as_str)
                    .ok_or_else(|| McpError::BadAddress(value.to_string()))?;
                let path = map
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or("/");
                Ok(Self {
                    server: server.to_string(),
                    path: path.to_string(),
                    query: None,
                })
            }
            other => Err(McpError::BadAddress(other.to_string())),
        }
    }
}

impl std::fmt::Display for McpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mcp://{}{}", self.server, self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

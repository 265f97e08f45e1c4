// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use koi_config::McpServerConfig;

use crate::{McpAddress, McpError, McpToolInfo, PooledClient, Result, StdioClient, StdioServerSpec};

/// Owns every configured MCP server.  Agents borrow access by name; the
/// registry routes each call over the right transport (spawned subprocess
/// or pooled remote connection).
pub struct McpRegistry {
    stdio: HashMap<String, Arc<StdioClient>>,
    remote: HashMap<String, McpAddress>,
    pooled: Arc<PooledClient>,
}

impl McpRegistry {
    pub fn from_config(servers: &HashMap<String, McpServerConfig>) -> Result<Self> {
        let mut stdio = HashMap::new();
        let mut remote = HashMap::new();
        for (name, cfg) in servers {
            if let Some(command) = &cfg.command {
                let mut spec = StdioServerSpec::new(command.clone(), cfg.args.clone());
                spec.env = cfg.env.clone();
                stdio.insert(name.clone(), Arc::new(StdioClient::new(spec)));
            } else if let Some(address) = &cfg.address {
                remote.insert(name.clone(), McpAddress::parse(address)?);
            } else {
                warn!(server = %name, "MCP server entry has neither command nor address");
            }
        }
        Ok(Self {
            stdio,
            remote,
            pooled: Arc::new(PooledClient::default()),
        })
    }

    pub fn empty() -> Self {
        Self {
            stdio: HashMap::new(),
            remote: HashMap::new(),
            pooled: Arc::new(PooledClient::default()),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stdio
            .keys()
            .chain(self.remote.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.stdio.is_empty() && self.remote.is_empty()
    }

    /// True when any subprocess server has recorded a crash since its last
    /// successful handshake.
    pub fn has_error(&self) -> bool {
        self.stdio.values().any(|c| c.last_error().is_some())
    }

    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> Result<Value> {
        if let Some(client) = self.stdio.get(server) {
            return client.call_tool(tool, args).await;
        }
        if let Some(address) = self.remote.get(server) {
            return self.pooled.invoke_tool(address, tool, args, false).await;
        }
        Err(McpError::UnknownServer(server.to_string()))
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<McpToolInfo>> {
        if let Some(client) = self.stdio.get(server) {
            return client.list_tools().await;
        }
        if let Some(address) = self.remote.get(server) {
            return self.pooled.list_tools(address).await;
        }
        Err(McpError::UnknownServer(server.to_string()))
    }

    /// Aggregate the tool catalogue over the named servers, best-effort: an
    /// unreachable server contributes nothing rather than failing the batch.
    pub async fn catalogue(&self, allowed: &[String]) -> Vec<(String, McpToolInfo)> {
        let mut tools = Vec::new();
        for server in allowed {
            match self.list_tools(server).await {
                Ok(list) => {
                    for tool in list {
                        tools.push((server.clone(), tool));
                    }
                }
                Err(e) => debug!(server = %server, error = %e, "catalogue skip"),
            }
        }
        tools
    }

    pub async fn shutdown(&self) {
        for client in self.stdio.values() {
            client.disconnect().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

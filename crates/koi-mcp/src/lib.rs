// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! MCP tool transports.
//!
//! Two ways to reach a tool server: a long-lived subprocess speaking
//! newline-delimited JSON-RPC 2.0 over stdio ([`StdioClient`]) and a
//! connection-pooled remote client over WebSocket or HTTPS
//! ([`PooledClient`]).  The [`McpRegistry`] owns all configured servers and
//! hands agents access by name.

mod address;
mod client;
mod framing;
mod pool;
mod registry;
mod stdio;
mod transport;

pub use address::McpAddress;
pub use client::{LoadBalanceStrategy, PooledClient, RetryConfig};
pub use framing::FrameBuffer;
pub use pool::{ConnectionPool, PooledConnection, POOL_SIZE};
pub use registry::McpRegistry;
pub use stdio::{StdioClient, StdioServerSpec};
pub use transport::{select_transport, HttpTransport, SimTransport, Transport, WsTransport};

/// Fixed protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("server process exited (code {exit_code:?}); stderr:\n{stderr}")]
    Crashed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("not connected")]
    NotConnected,
    #[error("no connection available within the acquire window")]
    AcquireTimeout,
    #[error("invalid MCP address: {0}")]
    BadAddress(String),
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),
    #[error("{0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, McpError>;

/// One tool exposed by a server, as reported by `tools/list`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Bearer token lookup: `MCP_AUTH_<SANITISED_SERVER>` where the server name
/// is uppercased and every non-alphanumeric character becomes `_`.
pub fn auth_token_for(server: &str) -> Option<String> {
    let sanitised: String = server
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    std::env::var(format!("MCP_AUTH_{sanitised}"))
        .ok()
        .filter(|v| !v.is_empty())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::stdio::{dispatch_frame, Pending};
use crate::{McpError, McpToolInfo, Result, PROTOCOL_VERSION};

/// Per-request budget on remote transports.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One remote connection.  `send_request` speaks JSON-RPC; `ping` is the
/// heartbeat probe (WS ping frame or `GET /mcp/v1/ping`).
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn send_request(&self, method: &str, params: Value) -> Result<Value>;

    async fn ping(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let result = self.send_request("tools/list", json!({})).await?;
        Ok(result
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }

    async fn invoke_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.send_request("tools/call", json!({ "name": name, "arguments": args }))
            .await
    }
}

/// Pick a transport from the server string:
/// `localhost` / `*.local` → in-process simulation, `ws://` / `wss://` →
/// WebSocket, anything else → HTTPS.
pub async fn select_transport(server: &str, auth: Option<String>) -> Result<Box<dyn Transport>> {
    let host = server.split(':').next().unwrap_or(server);
    if host == "localhost" || host.ends_with(".local") {
        return Ok(Box::new(SimTransport::new()));
    }
    if server.starts_with("ws://") || server.starts_with("wss://") {
        return Ok(Box::new(WsTransport::connect(server, auth).await?));
    }
    Ok(Box::new(HttpTransport::new(
        format!("https://{server}"),
        auth,
    )))
}

// ─── Simulation ───────────────────────────────────────────────────────────────

/// Local stub used for `localhost` / `*.local` servers: answers the protocol
/// in-process with canned tools.  Lets the runtime (and its tests) exercise
/// the full pooled path without a network.
pub struct SimTransport {
    pub requests: AtomicUsize,
    pub pings: AtomicUsize,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn kind(&self) -> &'static str {
        "sim"
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match method {
            "initialize" => Ok(json!({ "protocolVersion": PROTOCOL_VERSION })),
            "tools/list" => Ok(json!({
                "tools": [
                    { "name": "echo", "description": "echo arguments back", "inputSchema": {"type": "object"} },
                ]
            })),
            "tools/call" => Ok(json!({
                "content": [{
                    "type": "text",
                    "text": params.get("arguments").cloned().unwrap_or(Value::Null).to_string(),
                }]
            })),
            other => Err(McpError::Rpc {
                code: -32601,
                message: format!("method not found: {other}"),
            }),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── WebSocket ────────────────────────────────────────────────────────────────

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    WsMessage,
>;

/// WebSocket transport: messages are `{id, method, params}` JSON texts; a
/// background reader resolves responses by id (the same frame routing the
/// stdio client uses).
pub struct WsTransport {
    sink: Mutex<WsSink>,
    pending: Pending,
    next_id: AtomicI64,
    reader: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(url: &str, auth: Option<String>) -> Result<Self> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = url
            .into_client_request()
            .map_err(McpError::Ws)?;
        if let Some(token) = auth {
            if let Ok(header) = format!("Bearer {token}").parse() {
                request.headers_mut().insert("Authorization", header);
            }
        }
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, mut source) = stream.split();

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(frame) => dispatch_frame(&reader_pending, frame),
                        Err(e) => warn!(error = %e, "undecodable ws frame"),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // Connection closed: fail whatever is still in flight.
            let waiters: Vec<_> = reader_pending.lock().unwrap().drain().collect();
            for (_, sender) in waiters {
                let _ = sender.send(Err(McpError::NotConnected));
            }
        });

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicI64::new(1),
            reader,
        })
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> &'static str {
        "ws"
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({ "id": id, "method": method, "params": params });
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if let Err(e) = self
            .sink
            .lock()
            .await
            .send(WsMessage::Text(frame.to_string().into()))
            .await
        {
            self.pending.lock().unwrap().remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::NotConnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Ping(Vec::new().into()))
            .await?;
        Ok(())
    }
}

// ─── HTTPS ────────────────────────────────────────────────────────────────────

/// HTTPS transport: JSON-RPC over `POST /mcp/v1/call`, health probe over
/// `GET /mcp/v1/ping`.  Streaming responses arrive as `data: <json>` lines.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
    auth: Option<String>,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(base: impl Into<String>, auth: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            auth,
            next_id: AtomicI64::new(1),
        }
    }

    fn authorise(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self
            .authorise(self.client.post(format!("{}/mcp/v1/call", self.base)))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "HTTP {} from {}",
                response.status(),
                self.base
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        parse_http_body(&text, content_type.as_deref())
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorise(self.client.get(format!("{}/mcp/v1/ping", self.base)))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(McpError::Protocol(format!(
                "ping returned {}",
                response.status()
            )))
        }
    }
}

/// Parse a JSON-RPC response body.  Plain `application/json` bodies are one
/// object; `text/event-stream` bodies carry `data: <json>` lines, of which
/// the first complete response (result or error) wins.
fn parse_http_body(body: &str, content_type: Option<&str>) -> Result<Value> {
    let is_stream = content_type
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let candidate = if is_stream {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter(|data| !data.is_empty() && *data != "[DONE]")
            .find_map(|data| serde_json::from_str::<Value>(data).ok())
            .ok_or_else(|| McpError::Protocol("no JSON-RPC message in event stream".into()))?
    } else {
        serde_json::from_str::<Value>(body)?
    };

    if let Some(error) = candidate.get("error") {
        return Err(McpError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    debug!("http response parsed");
    Ok(candidate.get("result").cloned().unwrap_or(Value::Null))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

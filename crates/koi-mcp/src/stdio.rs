// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::{FrameBuffer, McpError, McpToolInfo, Result, PROTOCOL_VERSION};

/// Budget for the full connect handshake (spawn → initialize → tools/list).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for a `tools/call` round-trip; tools may do real work.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Budget for every other request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Lines of child stderr retained for diagnostics.
const STDERR_RING_LINES: usize = 20;

/// How to spawn the server process.
#[derive(Debug, Clone)]
pub struct StdioServerSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the child; empty values are filtered out.  The
    /// parent environment is inherited.
    pub env: HashMap<String, String>,
}

impl StdioServerSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}

pub(crate) type Pending = Arc<StdMutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

struct Connection {
    stdin: ChildStdin,
    pending: Pending,
    reader: tokio::task::JoinHandle<()>,
    stderr_reader: tokio::task::JoinHandle<()>,
}

/// JSON-RPC 2.0 client for a spawned tool server.
///
/// `connect()` is idempotent and doubles as crash recovery: it tears down
/// any previous child, clears pending requests and the stderr buffer, and
/// redoes the handshake.  `call_tool` reconnects transparently when the
/// child has died since the last call.
pub struct StdioClient {
    spec: StdioServerSpec,
    conn: Mutex<Option<Connection>>,
    stderr_ring: Arc<StdMutex<VecDeque<String>>>,
    last_error: Arc<StdMutex<Option<String>>>,
    tools: StdMutex<Vec<McpToolInfo>>,
    initialized: Arc<AtomicBool>,
    next_id: AtomicI64,
}

impl StdioClient {
    pub fn new(spec: StdioServerSpec) -> Self {
        Self {
            spec,
            conn: Mutex::new(None),
            stderr_ring: Arc::new(StdMutex::new(VecDeque::new())),
            last_error: Arc::new(StdMutex::new(None)),
            tools: StdMutex::new(Vec::new()),
            initialized: Arc::new(AtomicBool::new(false)),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// The retained tail of the child's stderr.
    pub fn server_output(&self) -> String {
        self.stderr_ring
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn the child and complete the handshake.  Any prior (possibly
    /// crashed) connection is torn down first.
    pub async fn connect(&self) -> Result<()> {
        self.teardown().await;

        let outcome = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.connect_inner()).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout("initialize handshake".into())),
        };
        if outcome.is_err() {
            self.teardown().await;
        }
        outcome
    }

    async fn connect_inner(&self) -> Result<()> {
        let mut child = self.spawn_child()?;
        let stdin = child.stdin.take().ok_or(McpError::NotConnected)?;
        let stdout = child.stdout.take().ok_or(McpError::NotConnected)?;
        let stderr = child.stderr.take().ok_or(McpError::NotConnected)?;

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

        // Stderr ring: retain the last N lines for diagnostics.
        let ring = Arc::clone(&self.stderr_ring);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut ring = ring.lock().unwrap();
                if ring.len() >= STDERR_RING_LINES {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });

        // Reader: owns the child so it can collect the exit status at EOF.
        // `kill_on_drop(true)` on the command guarantees the process dies
        // when this task is aborted during teardown.
        let reader_pending = Arc::clone(&pending);
        let reader_ring = Arc::clone(&self.stderr_ring);
        let reader_last_error = Arc::clone(&self.last_error);
        let reader_initialized = Arc::clone(&self.initialized);
        let reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut framer = FrameBuffer::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for frame in framer.push(&chunk[..n]) {
                            dispatch_frame(&reader_pending, frame);
                        }
                    }
                }
            }
            // EOF: the child exited (or closed stdout).  Collect the exit
            // status and fail every in-flight request with the diagnostics.
            let exit_code = child.wait().await.ok().and_then(|s| s.code());
            reader_initialized.store(false, Ordering::SeqCst);
            let stderr_tail = reader_ring
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            let message =
                format!("server process exited (code {exit_code:?}); stderr:\n{stderr_tail}");
            warn!(%message, "mcp stdio server exited");
            *reader_last_error.lock().unwrap() = Some(message);
            let waiters: Vec<_> = reader_pending.lock().unwrap().drain().collect();
            for (_, sender) in waiters {
                let _ = sender.send(Err(McpError::Crashed {
                    exit_code,
                    stderr: stderr_tail.clone(),
                }));
            }
        });

        *self.conn.lock().await = Some(Connection {
            stdin,
            pending,
            reader,
            stderr_reader,
        });

        // initialize → notifications/initialized → tools/list
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "koi", "version": env!("CARGO_PKG_VERSION") }
        });
        self.request("initialize", params, REQUEST_TIMEOUT).await?;
        self.notify("notifications/initialized", json!({})).await?;

        let listed = self.request("tools/list", json!({}), REQUEST_TIMEOUT).await?;
        let tools: Vec<McpToolInfo> = listed
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        debug!(count = tools.len(), command = %self.spec.command, "mcp tools cached");
        *self.tools.lock().unwrap() = tools;

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.spec.env {
            if !value.is_empty() {
                cmd.env(key, value);
            }
        }
        Ok(cmd.spawn()?)
    }

    /// Best-effort cancel notification, then kill and clear all state.
    pub async fn disconnect(&self) {
        let _ = self.notify("notifications/cancelled", json!({})).await;
        self.teardown().await;
        self.tools.lock().unwrap().clear();
    }

    async fn teardown(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            // Aborting the reader drops the child; kill_on_drop reaps it.
            conn.reader.abort();
            conn.stderr_reader.abort();
            let waiters: Vec<_> = conn.pending.lock().unwrap().drain().collect();
            for (_, sender) in waiters {
                let _ = sender.send(Err(McpError::NotConnected));
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        self.stderr_ring.lock().unwrap().clear();
        *self.last_error.lock().unwrap() = None;
    }

    // ── Tool surface ──────────────────────────────────────────────────────────

    /// Cached tool definitions; connects first when not yet initialised.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        if !self.is_initialized() {
            self.connect().await?;
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    /// Invoke a tool.  Reconnects transparently when the child has crashed
    /// since the previous call.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        if !self.is_initialized() {
            self.connect().await?;
        }
        let params = json!({ "name": name, "arguments": args });
        let outcome = self
            .request("tools/call", params.clone(), CALL_TIMEOUT)
            .await;
        let result = match outcome {
            Ok(v) => v,
            Err(McpError::Crashed { .. }) | Err(McpError::NotConnected) | Err(McpError::Io(_)) => {
                warn!(tool = name, "stdio server gone, reconnecting");
                self.connect().await?;
                self.request("tools/call", params, CALL_TIMEOUT).await?
            }
            Err(e) => return Err(e),
        };

        let mut value = extract_content(&result);
        // Failed tool runs get the captured stderr attached so the model can
        // see installation hints and stack traces the server printed.
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            if let Value::Object(map) = &mut value {
                map.insert("serverOutput".into(), Value::String(self.server_output()));
            }
        }
        Ok(value)
    }

    // ── Wire helpers ──────────────────────────────────────────────────────────

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let rx = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(McpError::NotConnected)?;
            let (tx, rx) = oneshot::channel();
            conn.pending.lock().unwrap().insert(id, tx);
            let line = format!("{frame}\n");
            if let Err(e) = conn.stdin.write_all(line.as_bytes()).await {
                conn.pending.lock().unwrap().remove(&id);
                return Err(e.into());
            }
            let _ = conn.stdin.flush().await;
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::NotConnected),
            Err(_) => {
                if let Some(conn) = self.conn.lock().await.as_ref() {
                    conn.pending.lock().unwrap().remove(&id);
                }
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(McpError::NotConnected)?;
        conn.stdin
            .write_all(format!("{frame}\n").as_bytes())
            .await?;
        let _ = conn.stdin.flush().await;
        Ok(())
    }
}

/// Route one incoming frame: responses resolve their pending request by id;
/// everything else is a server-to-client notification and only logged.
/// Shared with the WebSocket transport, which speaks the same frames.
pub(crate) fn dispatch_frame(pending: &Pending, frame: Value) {
    let id = frame.get("id").and_then(Value::as_i64);
    match id.and_then(|id| pending.lock().unwrap().remove(&id)) {
        Some(sender) => {
            let outcome = if let Some(error) = frame.get("error") {
                Err(McpError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(frame.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = sender.send(outcome);
        }
        None => debug!(frame = %frame, "mcp notification"),
    }
}

/// Extract `content[].text` parts from a `tools/call` result.  A single text
/// part that parses as a JSON object is returned parsed; everything else is
/// joined under `{"result": …}`.
fn extract_content(result: &Value) -> Value {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if texts.len() == 1 {
        if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(texts[0]) {
            return parsed;
        }
    }
    json!({ "result": texts.join("\n") })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

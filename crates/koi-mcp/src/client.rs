// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{ConnectionPool, McpAddress, McpError, McpToolInfo, Result, POOL_SIZE};

/// How requests are spread over equivalent servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastLatency,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ServerHealth {
    successes: u64,
    failures: u64,
    total_latency_ms: u128,
}

impl ServerHealth {
    fn avg_latency_ms(&self) -> u128 {
        if self.successes == 0 {
            0
        } else {
            self.total_latency_ms / self.successes as u128
        }
    }
}

/// Address-based remote tool invocation with per-server connection pools,
/// exponential-backoff retries, opt-in failover through the discovery
/// registry, and pluggable load balancing.
pub struct PooledClient {
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
    retry: RetryConfig,
    strategy: LoadBalanceStrategy,
    rr_cursor: AtomicUsize,
    health: StdMutex<HashMap<String, ServerHealth>>,
    /// Discovery endpoint consulted for failover alternatives.
    registry_url: Option<String>,
    pool_capacity: usize,
}

impl PooledClient {
    pub fn new(retry: RetryConfig, strategy: LoadBalanceStrategy) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            retry,
            strategy,
            rr_cursor: AtomicUsize::new(0),
            health: StdMutex::new(HashMap::new()),
            registry_url: std::env::var("KOI_MCP_REGISTRY").ok().filter(|v| !v.is_empty()),
            pool_capacity: POOL_SIZE,
        }
    }

    pub fn with_registry(mut self, url: impl Into<String>) -> Self {
        self.registry_url = Some(url.into());
        self
    }

    #[cfg(test)]
    fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    // ── Public surface ────────────────────────────────────────────────────────

    pub async fn list_tools(&self, address: &McpAddress) -> Result<Vec<McpToolInfo>> {
        let result = self.send(address, "tools/list", json!({}), false).await?;
        Ok(result
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }

    pub async fn invoke_tool(
        &self,
        address: &McpAddress,
        name: &str,
        args: Value,
        failover: bool,
    ) -> Result<Value> {
        self.send(
            address,
            "tools/call",
            json!({ "name": name, "arguments": args }),
            failover,
        )
        .await
    }

    /// Send a request to the addressed server with retries.  When the server
    /// is exhausted and `failover` is set, alternatives from the discovery
    /// registry are tried in load-balanced order.
    pub async fn send(
        &self,
        address: &McpAddress,
        method: &str,
        params: Value,
        failover: bool,
    ) -> Result<Value> {
        match self.send_to_server(&address.server, method, params.clone()).await {
            Ok(value) => Ok(value),
            Err(primary_error) => {
                if !failover {
                    return Err(primary_error);
                }
                let mut alternatives = self.discover_alternatives(&address.server).await;
                while !alternatives.is_empty() {
                    let Some(next) = self.pick_server(&alternatives).cloned() else {
                        break;
                    };
                    alternatives.retain(|s| s != &next);
                    warn!(server = %next, "failing over");
                    if let Ok(value) = self.send_to_server(&next, method, params.clone()).await {
                        return Ok(value);
                    }
                }
                Err(primary_error)
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn pool_for(&self, server: &str) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(server) {
            return Arc::clone(pool);
        }
        let pool =
            ConnectionPool::initialize(server, crate::auth_token_for(server), self.pool_capacity)
                .await;
        let _ = pool.spawn_heartbeat();
        pools.insert(server.to_string(), Arc::clone(&pool));
        pool
    }

    async fn send_to_server(&self, server: &str, method: &str, params: Value) -> Result<Value> {
        let pool = self.pool_for(server).await;
        let mut last_error = McpError::NotConnected;
        for attempt in 1..=self.retry.max_retries {
            let conn = pool.acquire().await?;
            let started = Instant::now();
            let outcome = conn.transport.send_request(method, params.clone()).await;
            let elapsed = started.elapsed();
            pool.release(conn);
            match outcome {
                Ok(value) => {
                    self.record(server, true, elapsed);
                    return Ok(value);
                }
                Err(e) => {
                    self.record(server, false, elapsed);
                    warn!(server, method, attempt, error = %e, "request failed");
                    last_error = e;
                }
            }
            // Exponential backoff: retry_delay · 2^(attempt-1).
            let backoff = self.retry.retry_delay * 2u32.saturating_pow(attempt - 1);
            tokio::time::sleep(backoff).await;
        }
        Err(last_error)
    }

    /// Ask the discovery registry for equivalent servers.  Any failure means
    /// "no alternatives"; failover is strictly best-effort.
    async fn discover_alternatives(&self, exclude: &str) -> Vec<String> {
        let Some(base) = &self.registry_url else {
            return Vec::new();
        };
        let url = format!("{}/servers", base.trim_end_matches('/'));
        let response = match reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "registry discovery failed");
                return Vec::new();
            }
        };
        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        body.get("servers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter(|s| *s != exclude)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pick one of `candidates` according to the configured strategy.
    pub fn pick_server<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let i = self.rr_cursor.fetch_add(1, Ordering::SeqCst);
                candidates.get(i % candidates.len())
            }
            LoadBalanceStrategy::Random => {
                let i = rand::rng().random_range(0..candidates.len());
                candidates.get(i)
            }
            LoadBalanceStrategy::LeastLatency => {
                let health = self.health.lock().unwrap();
                candidates.iter().min_by_key(|server| {
                    health
                        .get(server.as_str())
                        .map(|h| h.avg_latency_ms())
                        .unwrap_or(0)
                })
            }
        }
    }

    fn record(&self, server: &str, success: bool, latency: Duration) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(server.to_string()).or_default();
        if success {
            entry.successes += 1;
            entry.total_latency_ms += latency.as_millis();
        } else {
            entry.failures += 1;
        }
    }

    /// (successes, failures, average latency ms) for a server, for status
    /// display.
    pub fn server_stats(&self, server: &str) -> Option<(u64, u64, u128)> {
        self.health
            .lock()
            .unwrap()
            .get(server)
            .map(|h| (h.successes, h.failures, h.avg_latency_ms()))
    }
}

impl Default for PooledClient {
    fn default() -> Self {
        Self::new(RetryConfig::default(), LoadBalanceStrategy::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

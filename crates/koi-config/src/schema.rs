// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named MCP server definitions.  An agent lists the servers it may use
    /// by name in its `mcp` field.
    ///
    /// ```yaml
    /// mcp_servers:
    ///   files:
    ///     command: mcp-fs-server
    ///     args: ["--root", "."]
    ///   search:
    ///     address: mcp://search.internal/tools
    /// ```
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// Agent definitions.  The surface-language transpiler normally produces
    /// these records; the manifest form accepts the same shape directly.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Team definitions: team name → member label → agent name.
    #[serde(default)]
    pub teams: Vec<TeamSpec>,
    /// Role definitions: role name → capability tokens.
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider identifier: "openai" | "anthropic" | "gemini" | "scripted"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    /// Defaults per provider: OPENAI_API_KEY / ANTHROPIC_API_KEY /
    /// GEMINI_API_KEY.
    pub api_key_env: Option<String>,
    /// Base URL override for proxies and local gateways.
    pub base_url: Option<String>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from the configured env var, falling back to the
    /// provider's conventional variable name.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.clone().unwrap_or_else(|| {
            match self.provider.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                "gemini" => "GEMINI_API_KEY",
                _ => "OPENAI_API_KEY",
            }
            .to_string()
        });
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

/// Knobs for the reactive loop and the playbook session's pathology
/// detectors.  The defaults match the documented runtime behaviour; they are
/// configurable so CI runs can tighten budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Consecutive-error count that triggers a pivot.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Maximum pivots before the loop gives up.
    #[serde(default = "default_max_pivots")]
    pub max_pivots: u32,
    /// Identical action keys in a row before force-termination.
    #[serde(default = "default_max_action_repeats")]
    pub max_action_repeats: u32,
    /// A-B-A-B oscillation detections before force-termination.
    #[serde(default = "default_max_oscillations")]
    pub max_oscillations: u32,
    /// Failures for one (intent, target) pair before force-termination.
    #[serde(default = "default_max_target_failures")]
    pub max_target_failures: u32,
    /// CLI mode: `return` means "task done, wait for the user" instead of
    /// terminating the loop.  Also settable via KOI_CLI_MODE=1.
    #[serde(default)]
    pub cli_mode: bool,
    /// Emit the hard-coded greeting on the first top-level CLI iteration
    /// instead of asking the model.
    #[serde(default = "default_true")]
    pub fast_greeting: bool,
}

fn default_max_consecutive_errors() -> u32 {
    10
}
fn default_max_pivots() -> u32 {
    3
}
fn default_max_action_repeats() -> u32 {
    5
}
fn default_max_oscillations() -> u32 {
    3
}
fn default_max_target_failures() -> u32 {
    5
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            max_pivots: default_max_pivots(),
            max_action_repeats: default_max_action_repeats(),
            max_oscillations: default_max_oscillations(),
            max_target_failures: default_max_target_failures(),
            cli_mode: false,
            fast_greeting: true,
        }
    }
}

impl RuntimeConfig {
    /// Apply environment overrides.  `KOI_CLI_MODE=1` switches the loop into
    /// CLI semantics regardless of the config file.
    pub fn with_env(mut self) -> Self {
        if std::env::var("KOI_CLI_MODE").map(|v| v == "1").unwrap_or(false) {
            self.cli_mode = true;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root of the tracked project.  Defaults to KOI_PROJECT_ROOT, then the
    /// current directory.
    pub project_root: Option<String>,
    /// Session identifier.  Defaults to KOI_SESSION_ID, then a fresh UUID.
    pub session_id: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            session_id: None,
        }
    }
}

impl SessionConfig {
    pub fn resolved_project_root(&self) -> std::path::PathBuf {
        if let Some(p) = &self.project_root {
            return std::path::PathBuf::from(shellexpand::tilde(p).into_owned());
        }
        if let Ok(p) = std::env::var("KOI_PROJECT_ROOT") {
            if !p.is_empty() {
                return std::path::PathBuf::from(p);
            }
        }
        std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."))
    }

    pub fn resolved_session_id(&self) -> Option<String> {
        self.session_id
            .clone()
            .or_else(|| std::env::var("KOI_SESSION_ID").ok().filter(|s| !s.is_empty()))
    }
}

/// Tiered context-memory windows.  The defaults are the tuned values; tests
/// shrink them to exercise promotion quickly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Number of most-recent turns kept in short-term (verbatim) form.
    #[serde(default = "default_short_term_window")]
    pub short_term_window: usize,
    /// Number of most-recent short+medium turns kept before long-term demotion.
    #[serde(default = "default_active_window")]
    pub active_window: usize,
    /// Long-term entries retained before spill into the latent pool.
    #[serde(default = "default_long_term_cap")]
    pub long_term_cap: usize,
}

fn default_short_term_window() -> usize {
    6
}
fn default_active_window() -> usize {
    20
}
fn default_long_term_cap() -> usize {
    40
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: default_short_term_window(),
            active_window: default_active_window(),
            long_term_cap: default_long_term_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Shell action timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// Web fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub web_fetch_timeout_secs: u64,
}

fn default_shell_timeout() -> u64 {
    300
}
fn default_fetch_timeout() -> u64 {
    15
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout(),
            web_fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

/// One MCP server entry: either a subprocess (stdio transport) or a remote
/// address (pooled transport).  Exactly one of `command` / `address` should
/// be set; when both are present the subprocess wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable spawned for the stdio transport.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child.  Empty values are dropped.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Remote address for the pooled transport, e.g. `mcp://host/tools`.
    pub address: Option<String>,
}

/// An agent definition as produced by the surface-language transpiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Role name; must exist in `roles`.
    pub role: Option<String>,
    /// Per-agent LLM override.
    pub llm: Option<LlmConfig>,
    /// Event name → playbook text.
    #[serde(default)]
    pub handlers: HashMap<String, String>,
    /// Declared skills (callable function names).
    #[serde(default)]
    pub skills: Vec<String>,
    /// Teams this agent uses for delegation lookups.
    #[serde(default)]
    pub uses_teams: Vec<String>,
    /// MCP server names this agent may call.
    #[serde(default)]
    pub mcp: Vec<String>,
    /// Initial user-defined state blob.
    #[serde(default)]
    pub state: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamSpec {
    pub name: String,
    /// Member label → agent name or MCP address.
    #[serde(default)]
    pub members: HashMap<String, String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

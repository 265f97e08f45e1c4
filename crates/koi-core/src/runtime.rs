// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use koi_actions::{builtin, ActionContext, ActionRegistry, Prompter};
use koi_config::Config;
use koi_llm::{AbortSignal, LlmProvider};
use koi_mcp::McpRegistry;
use koi_memory::{MemoryWindows, Summarizer, TruncatingSummarizer};
use koi_registry::{FileRegistry, Registry};
use koi_session::{FilePermissions, SessionCommit, SessionStore, SessionTracker};

use crate::{
    agent::{Agent, Role, Team, TeamMember},
    events::AgentEvent,
    while_action::{DoWhileAction, WhileAction},
};

/// Slash-command hook: the loop hands over any `prompt_user` answer that
/// starts with `/`.  `route` returns the text to re-feed as if the user had
/// answered normally, or `None` when the input is not a known command.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn route(&self, input: &str, agent: &Agent) -> anyhow::Result<Option<String>>;
}

/// Embedding-based router consulted for unresolvable intents when the
/// calling agent has no team.  Returns the chosen agent and the event to
/// invoke on it.
pub trait SemanticRouter: Send + Sync {
    fn top_candidate(&self, intent: &str, agents: &[Arc<Agent>]) -> Option<(Arc<Agent>, String)>;
}

/// The runtime handle threaded through the loop and every executor.  Built
/// once at startup from the config; replaces the original's process-wide
/// singletons.
pub struct RuntimeContext {
    pub config: Config,
    pub actions: ActionRegistry,
    pub tracker: Arc<SessionTracker>,
    pub store: Arc<SessionStore>,
    pub permissions: Arc<StdMutex<FilePermissions>>,
    pub kv: Arc<dyn Registry>,
    pub mcp: Arc<McpRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub prompter: Arc<dyn Prompter>,
    pub abort: AbortSignal,
    command_router: StdMutex<Option<Arc<dyn CommandRouter>>>,
    semantic_router: StdMutex<Option<Arc<dyn SemanticRouter>>>,
    agents: StdMutex<HashMap<String, Arc<Agent>>>,
    teams: StdMutex<HashMap<String, Arc<Team>>>,
    call_stack: Arc<StdMutex<Vec<String>>>,
    prompt_gate: Arc<tokio::sync::Mutex<()>>,
    events: StdMutex<Option<mpsc::Sender<AgentEvent>>>,
}

impl RuntimeContext {
    /// Assemble the runtime: session storage, KV store, MCP servers, the
    /// action registry, and all configured agents and teams.
    pub fn build(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        prompter: Arc<dyn Prompter>,
    ) -> anyhow::Result<Arc<Self>> {
        let project_root = config.session.resolved_project_root();
        let session_id = config
            .session
            .resolved_session_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session_dir = project_root.join(".koi").join("sessions").join(&session_id);

        let tracker = Arc::new(SessionTracker::open(&session_dir).context("opening session tracker")?);
        let store = Arc::new(SessionStore::open(&session_dir).context("opening session store")?);
        let kv_backend = Arc::new(
            FileRegistry::open(session_dir.join("registry.json")).context("opening registry")?,
        );
        kv_backend.spawn_autosave();
        let kv: Arc<dyn Registry> = kv_backend;
        let mcp = Arc::new(McpRegistry::from_config(&config.mcp_servers)?);

        let windows = MemoryWindows::new(
            config.memory.short_term_window,
            config.memory.active_window,
            config.memory.long_term_cap,
        );

        let mut agents = HashMap::new();
        for spec in config.agents.clone() {
            let role = match spec.role.as_deref() {
                Some(role_name) => {
                    let caps = config.roles.get(role_name).cloned().ok_or_else(|| {
                        anyhow::anyhow!("agent {} references unknown role {role_name}", spec.name)
                    })?;
                    Role::new(role_name, caps)
                }
                None => Role::unrestricted(),
            };
            let agent = Agent::from_spec(spec, role, windows);
            agents.insert(agent.name.clone(), agent);
        }

        let mut teams = HashMap::new();
        for spec in &config.teams {
            let mut members = HashMap::new();
            for (label, target) in &spec.members {
                let member = match agents.get(target) {
                    Some(agent) => TeamMember::Agent(Arc::clone(agent)),
                    None => TeamMember::Address(target.clone()),
                };
                members.insert(label.clone(), member);
            }
            teams.insert(spec.name.clone(), Team::new(spec.name.clone(), members));
        }

        debug!(
            session = %session_id,
            agents = agents.len(),
            teams = teams.len(),
            "runtime assembled"
        );

        Ok(Arc::new_cyclic(|weak: &Weak<RuntimeContext>| {
            let mut actions = ActionRegistry::new();
            builtin::register_defaults(&mut actions);
            actions.register(WhileAction::new(weak.clone()));
            actions.register(DoWhileAction::new(weak.clone()));

            RuntimeContext {
                config,
                actions,
                tracker,
                store,
                permissions: Arc::new(StdMutex::new(FilePermissions::new())),
                kv,
                mcp,
                provider,
                prompter,
                abort: AbortSignal::new(),
                command_router: StdMutex::new(None),
                semantic_router: StdMutex::new(None),
                agents: StdMutex::new(agents),
                teams: StdMutex::new(teams),
                call_stack: Arc::new(StdMutex::new(Vec::new())),
                prompt_gate: Arc::new(tokio::sync::Mutex::new(())),
                events: StdMutex::new(None),
            }
        }))
    }

    // ── Agents & teams ────────────────────────────────────────────────────────

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.lock().unwrap().get(name).cloned()
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        let mut list: Vec<Arc<Agent>> = self.agents.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn team(&self, name: &str) -> Option<Arc<Team>> {
        self.teams.lock().unwrap().get(name).cloned()
    }

    // ── Routers ───────────────────────────────────────────────────────────────

    pub fn set_command_router(&self, router: Arc<dyn CommandRouter>) {
        *self.command_router.lock().unwrap() = Some(router);
    }

    pub fn command_router(&self) -> Option<Arc<dyn CommandRouter>> {
        self.command_router.lock().unwrap().clone()
    }

    pub fn set_semantic_router(&self, router: Arc<dyn SemanticRouter>) {
        *self.semantic_router.lock().unwrap() = Some(router);
    }

    pub fn semantic_router(&self) -> Option<Arc<dyn SemanticRouter>> {
        self.semantic_router.lock().unwrap().clone()
    }

    // ── Call-stack guard ──────────────────────────────────────────────────────

    /// Push `agent:intent` onto the process-wide call stack; a signature
    /// already on the stack means infinite delegation and fails fast.
    pub fn enter_call(&self, agent: &str, intent: &str) -> anyhow::Result<CallGuard> {
        let signature = format!("{agent}:{intent}");
        let mut stack = self.call_stack.lock().unwrap();
        if stack.contains(&signature) {
            anyhow::bail!("recursive delegation detected: {signature} is already running");
        }
        stack.push(signature.clone());
        Ok(CallGuard {
            stack: Arc::clone(&self.call_stack),
            signature,
        })
    }

    // ── Executor context ──────────────────────────────────────────────────────

    pub fn action_context(&self, agent: &Agent) -> ActionContext {
        ActionContext {
            agent_name: agent.name.clone(),
            tracker: Arc::clone(&self.tracker),
            store: Arc::clone(&self.store),
            permissions: Arc::clone(&self.permissions),
            kv: Arc::clone(&self.kv),
            mcp: Arc::clone(&self.mcp),
            provider: Arc::clone(&self.provider),
            prompter: Arc::clone(&self.prompter),
            tools: self.config.tools.clone(),
            abort: self.abort.clone(),
            state: Arc::clone(&agent.state),
            prompt_gate: Arc::clone(&self.prompt_gate),
        }
    }

    // ── Events ────────────────────────────────────────────────────────────────

    pub fn set_event_sink(&self, sender: mpsc::Sender<AgentEvent>) {
        *self.events.lock().unwrap() = Some(sender);
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(sender) = &*self.events.lock().unwrap() {
            let _ = sender.try_send(event);
        }
    }

    // ── Commit flushing ───────────────────────────────────────────────────────

    /// Flush staged file changes as one changeset.  The summary comes from a
    /// fast model call over the pending diff, falling back to a counted
    /// message when the model is unavailable.
    pub async fn flush_commits(&self) -> Option<SessionCommit> {
        if !self.tracker.has_pending_changes() {
            return None;
        }
        let pending = self.tracker.pending_files();
        let mut diff = String::new();
        for path in &pending {
            if let Ok(d) = self.tracker.file_diff(path, false) {
                diff.push_str(&d);
                if diff.len() > 20_000 {
                    break;
                }
            }
        }
        let summary = match self
            .provider
            .complete_text(
                &format!(
                    "Summarise this change in one short sentence (imperative mood, no period):\n\n{diff}"
                ),
                "commit-summary",
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().lines().next().unwrap_or("").to_string(),
            _ => format!("Update {} file(s)", pending.len()),
        };

        match self.tracker.commit_changes(&summary) {
            Ok(commit) => {
                let _ = self.store.append_dialogue(json!({
                    "type": "commit",
                    "hash": commit.hash,
                    "summary": commit.summary,
                    "files": commit.changed_files,
                }));
                self.emit(AgentEvent::SessionCommitted {
                    hash: commit.hash.clone(),
                    files: commit.changed_files.len(),
                });
                Some(commit)
            }
            Err(e) => {
                warn!(error = %e, "commit flush failed");
                None
            }
        }
    }
}

/// RAII entry on the delegation call stack.
pub struct CallGuard {
    stack: Arc<StdMutex<Vec<String>>>,
    signature: String,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut stack = self.stack.lock().unwrap();
        if let Some(position) = stack.iter().rposition(|s| s == &self.signature) {
            stack.remove(position);
        }
    }
}

/// Model-backed promotion summariser with a deterministic fallback, so a
/// transport failure never blocks a promotion.
pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
    fallback: TruncatingSummarizer,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            fallback: TruncatingSummarizer,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn compress_paragraph(&self, text: &str) -> String {
        match self
            .provider
            .complete_text(
                &format!("Compress into one information-dense paragraph:\n\n{text}"),
                "memory-promotion",
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            _ => self.fallback.compress_paragraph(text).await,
        }
    }

    async fn compress_sentence(&self, text: &str) -> String {
        match self
            .provider
            .complete_text(
                &format!("Compress into a single short sentence:\n\n{text}"),
                "memory-promotion",
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            _ => self.fallback.compress_sentence(text).await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

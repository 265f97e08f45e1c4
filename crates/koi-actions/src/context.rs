// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use koi_config::ToolsConfig;
use koi_llm::{AbortSignal, LlmProvider};
use koi_mcp::McpRegistry;
use koi_registry::Registry;
use koi_session::{AccessLevel, FilePermissions, SessionStore, SessionTracker};

use crate::denied;

/// User's answer to a permission dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Yes,
    Always,
    No,
}

/// The user-interaction seam.  The CLI installs a real terminal
/// implementation; tests and headless runs install canned ones.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show a line of output.
    fn print(&self, text: &str);

    /// Blocking free-text prompt; resolves when the user answers.
    async fn prompt_user(&self, message: &str) -> anyhow::Result<String>;

    /// Blocking permission dialog for one `(directory, level)` pair.
    async fn confirm_permission(
        &self,
        dir: &Path,
        level: AccessLevel,
    ) -> anyhow::Result<PermissionReply>;
}

/// Headless prompter: swallows output, answers prompts with an empty line,
/// and grants every permission.  Used by delegate loops and tests.
#[derive(Default)]
pub struct SilentPrompter;

#[async_trait]
impl Prompter for SilentPrompter {
    fn print(&self, _text: &str) {}

    async fn prompt_user(&self, _message: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn confirm_permission(
        &self,
        _dir: &Path,
        _level: AccessLevel,
    ) -> anyhow::Result<PermissionReply> {
        Ok(PermissionReply::Yes)
    }
}

/// Runtime handles threaded through the loop into every executor.  Built
/// once per agent invocation; cloning shares all underlying state.
#[derive(Clone)]
pub struct ActionContext {
    pub agent_name: String,
    pub tracker: Arc<SessionTracker>,
    pub store: Arc<SessionStore>,
    pub permissions: Arc<StdMutex<FilePermissions>>,
    pub kv: Arc<dyn Registry>,
    pub mcp: Arc<McpRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub prompter: Arc<dyn Prompter>,
    pub tools: ToolsConfig,
    pub abort: AbortSignal,
    /// The agent's mutable user-defined state blob.
    pub state: Arc<StdMutex<Map<String, Value>>>,
    /// Serialises permission dialogs: concurrent actions queue here so two
    /// prompts never interleave.  tokio's mutex wakes waiters in FIFO order.
    pub prompt_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ActionContext {
    /// The directory a file-touching action needs access to: the parent for
    /// a file path, the path itself for a directory.
    pub fn permission_dir(path: &Path) -> PathBuf {
        if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    /// Gate a path behind the grant set, prompting the user when no grant
    /// covers it.  Returns `Ok(None)` when access is (now) allowed and
    /// `Ok(Some(denied-outcome))` when the user refused.
    pub async fn ensure_allowed(
        &self,
        path: &Path,
        level: AccessLevel,
    ) -> anyhow::Result<Option<Value>> {
        if self.permissions.lock().unwrap().is_allowed(path, level) {
            return Ok(None);
        }
        let dir = Self::permission_dir(path);

        // One dialog at a time, FIFO.
        let _gate = self.prompt_gate.lock().await;
        // Another queued action may have obtained the same grant while we
        // waited our turn.
        if self.permissions.lock().unwrap().is_allowed(path, level) {
            return Ok(None);
        }
        match self.prompter.confirm_permission(&dir, level).await? {
            PermissionReply::Yes | PermissionReply::Always => {
                self.permissions.lock().unwrap().allow(&dir, level);
                debug!(dir = %dir.display(), %level, "permission granted via prompt");
                Ok(None)
            }
            PermissionReply::No => Ok(Some(denied(
                format!("{level} access to {} was refused", dir.display()),
                Some("ask the user for an alternative location"),
            ))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

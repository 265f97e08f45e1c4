// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::{AbortSignal, ActionItem, Message};

/// One registered action as described to the model.
#[derive(Debug, Clone)]
pub struct ActionDescription {
    pub intent: String,
    pub description: String,
}

/// One remote tool as described to the model (from the MCP catalogue).
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Everything the provider needs to decide the next action batch.
#[derive(Clone)]
pub struct PlaybookRequest {
    /// Rendered playbook text for the event being handled.
    pub playbook: String,
    pub agent_name: String,
    /// Transcript in creation order, system prompt first.
    pub transcript: Vec<Message>,
    /// Registered actions available to this agent.
    pub actions: Vec<ActionDescription>,
    /// Names of agents reachable through delegation.
    pub delegation_targets: Vec<String>,
    /// Remote tool catalogue.
    pub mcp_tools: Vec<ToolDescriptor>,
    /// True on the first model call of a `handle()` invocation.
    pub is_first_call: bool,
    /// Next-step label computed from the previous action's result.
    pub thinking_hint: Option<String>,
    pub is_delegate: bool,
    pub abort: AbortSignal,
}

/// The LLM collaborator.  Concrete adapters (OpenAI / Anthropic / Gemini
/// HTTP bodies) live outside this repository; the runtime depends only on
/// this trait and ships deterministic implementations for tests and the
/// offline mode.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Decide the next action or batch for the reactive loop.
    async fn next_actions(&self, req: PlaybookRequest) -> anyhow::Result<Vec<ActionItem>>;

    /// One-shot prompt that must come back as a JSON object.  Used for
    /// `ask_parent` answers and structured routing decisions.
    async fn call_json(&self, prompt: &str) -> anyhow::Result<Value>;

    /// One-shot free-text completion.  `label` names the call site for
    /// logging (e.g. "commit-summary", "memory-promotion").
    async fn complete_text(&self, prompt: &str, label: &str) -> anyhow::Result<String>;

    /// Embedding vector for semantic lookup.  Providers without an embedding
    /// endpoint return an empty vector.
    async fn get_embedding(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(Vec::new())
    }
}

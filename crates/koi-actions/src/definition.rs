// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use koi_llm::{Action, ActionDescription};

use crate::ActionContext;

/// Capability an agent's role must hold to run an action.  Tokens match
/// hierarchically: the `registry` capability grants both registry levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Execute,
    Delegate,
    RegistryRead,
    RegistryWrite,
    Registry,
}

impl Permission {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Delegate => "delegate",
            Self::RegistryRead => "registry:read",
            Self::RegistryWrite => "registry:write",
            Self::Registry => "registry",
        }
    }
}

/// What executing an action did, beyond producing a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionEffect {
    /// Regular result recorded into the session history.
    Value(Value),
    /// A `return` action: the loop terminates (or, in CLI mode, waits for
    /// the user) and this payload surfaces.
    Return(Value),
    /// A delegate asks its caller a question; the delegate's session
    /// short-circuits until the answer is merged into its args.
    AskParent { question: String },
}

impl ActionEffect {
    /// The value form of the effect, for history recording.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Return(v) => v.clone(),
            Self::AskParent { question } => {
                serde_json::json!({ "ask_parent": question })
            }
        }
    }
}

/// One registered action.
#[async_trait]
pub trait ActionDefinition: Send + Sync {
    fn intent(&self) -> &str;
    fn description(&self) -> &str;
    fn permission(&self) -> Permission;
    /// JSON Schema for the action's inputs.
    fn schema(&self) -> Value;
    /// Example invocations shown to the model.
    fn examples(&self) -> Vec<Action> {
        Vec::new()
    }
    /// Next-step label computed from the action, shown while the model
    /// decides its next move.
    fn thinking_hint(&self, _action: &Action) -> Option<String> {
        None
    }
    /// Execute.  User-caused failures are returned as
    /// [`crate::failure`] values; thrown errors are programming or protocol
    /// errors and are caught by the loop.
    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect>;
}

/// Process-wide table of action definitions: populated at startup,
/// read-only afterwards.
pub struct ActionRegistry {
    definitions: HashMap<String, Arc<dyn ActionDefinition>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: impl ActionDefinition + 'static) {
        self.definitions
            .insert(definition.intent().to_string(), Arc::new(definition));
    }

    pub fn register_arc(&mut self, definition: Arc<dyn ActionDefinition>) {
        self.definitions
            .insert(definition.intent().to_string(), definition);
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn ActionDefinition>> {
        self.definitions.get(intent).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Intent + description pairs for the model's action catalogue.
    pub fn descriptions(&self) -> Vec<ActionDescription> {
        let mut list: Vec<ActionDescription> = self
            .definitions
            .values()
            .map(|d| ActionDescription {
                intent: d.intent().to_string(),
                description: d.description().to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.intent.cmp(&b.intent));
        list
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

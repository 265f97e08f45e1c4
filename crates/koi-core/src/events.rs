// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Events emitted by the reactive loop during a turn.  Consumers (the CLI
/// status line, tests) subscribe via the runtime's event sender; the core
/// never renders them itself.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// An action is about to execute.
    ActionStarted { intent: String, hint: Option<String> },
    /// An action finished; `success` reflects the recorded outcome.
    ActionFinished { intent: String, success: bool },
    /// The error budget forced a strategy reset.
    Pivot { attempt: u32, max: u32 },
    /// The model transport failed; the loop continues.
    LlmError(String),
    /// Staged file changes were flushed as one changeset.
    SessionCommitted { hash: String, files: usize },
    /// The loop finished handling the current event.
    TurnComplete { agent: String },
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use koi_llm::ActionDescription;

/// Playbooks containing this marker skip the model on the very first
/// top-level CLI iteration and greet immediately.
pub const FAST_GREETING_MARKER: &str = "__FAST_GREETING__";

/// Canned greeting lines for the fast-greeting path.
pub const GREETINGS: &[&str] = &[
    "Hi! What would you like to work on?",
    "Ready when you are — what should we do?",
    "Hello! Tell me what you need.",
];

/// Pick a greeting deterministically so the same agent greets the same way.
pub fn greeting_for(agent_name: &str) -> &'static str {
    let sum: usize = agent_name.bytes().map(|b| b as usize).sum();
    GREETINGS[sum % GREETINGS.len()]
}

/// Render the system prompt for one loop turn.
pub fn system_prompt(
    agent_name: &str,
    role_name: &str,
    playbook: &str,
    actions: &[ActionDescription],
    delegation_targets: &[String],
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!(
        "You are {agent_name}, an agent with the role '{role_name}'. \
         You work by emitting one JSON action (or a batch) per turn; each \
         action's result is fed back to you before you decide the next one.\n\n"
    ));
    let playbook = playbook.replace(FAST_GREETING_MARKER, "").trim().to_string();
    if !playbook.is_empty() {
        prompt.push_str("## Instructions\n\n");
        prompt.push_str(&playbook);
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Available actions\n\n");
    for action in actions {
        prompt.push_str(&format!("- `{}`: {}\n", action.intent, action.description));
    }
    if !delegation_targets.is_empty() {
        prompt.push_str("\n## Delegation\n\nYou can delegate to: ");
        prompt.push_str(&delegation_targets.join(", "));
        prompt.push_str(
            "\nEmit {\"intent\": \"<agent::event>\", \"actionType\": \"delegate\", ...} to hand off a sub-task.",
        );
    }
    prompt.push_str(
        "\n\nRespond with a JSON action object, an array of them, or \
         {\"parallel\": [...]} for independent actions that can run together. \
         Finish with a `return` action.",
    );
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_actions::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};
use koi_llm::Action;

use crate::{orchestrator::Orchestrator, runtime::RuntimeContext};

/// Iteration ceiling when the action does not set one.
const DEFAULT_MAX_ITERATIONS: u64 = 10;

/// Condition-first loop over a body of actions.  The condition is evaluated
/// against the agent's state blob before every pass.
pub struct WhileAction {
    rt: Weak<RuntimeContext>,
}

impl WhileAction {
    pub fn new(rt: Weak<RuntimeContext>) -> Self {
        Self { rt }
    }
}

/// Body-first variant: runs the body once before the first condition check.
/// This is the semantics the playbook resolver wires by default.
pub struct DoWhileAction {
    rt: Weak<RuntimeContext>,
}

impl DoWhileAction {
    pub fn new(rt: Weak<RuntimeContext>) -> Self {
        Self { rt }
    }
}

#[async_trait]
impl ActionDefinition for WhileAction {
    fn intent(&self) -> &str {
        "while"
    }

    fn description(&self) -> &str {
        "Repeat a body of actions while a condition over the agent state \
         holds. The condition is checked BEFORE each pass; a body action can \
         flip it with update_state. 'max_iterations' defaults to 10."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        loop_schema()
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        run_loop(&self.rt, action, cx, true).await
    }
}

#[async_trait]
impl ActionDefinition for DoWhileAction {
    fn intent(&self) -> &str {
        "do_while"
    }

    fn description(&self) -> &str {
        "Repeat a body of actions until a condition over the agent state \
         stops holding. The body runs once BEFORE the first check. \
         'max_iterations' defaults to 10."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        loop_schema()
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        run_loop(&self.rt, action, cx, false).await
    }
}

fn loop_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "condition": {
                "type": "object",
                "description": "State predicate: {\"key\": <state key>} for truthiness, \
                                plus optional \"equals\" for an exact comparison"
            },
            "body": {
                "type": "array",
                "description": "Actions executed each pass, in order",
                "items": { "type": "object" }
            },
            "max_iterations": { "type": "integer", "description": "Pass ceiling (default 10)" }
        },
        "required": ["condition", "body"]
    })
}

async fn run_loop(
    rt: &Weak<RuntimeContext>,
    action: &Action,
    cx: &ActionContext,
    check_before: bool,
) -> anyhow::Result<ActionEffect> {
    let rt = rt
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("runtime context dropped"))?;
    let Some(agent) = rt.agent(&cx.agent_name) else {
        anyhow::bail!("unknown agent: {}", cx.agent_name);
    };
    let orchestrator = Orchestrator::new(rt);

    let condition = match action.get("condition") {
        Some(c) => c.clone(),
        None => {
            return Ok(ActionEffect::Value(failure(
                "loop requires a 'condition'",
                None,
            )))
        }
    };
    let body: Vec<Action> = match action.get("body").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .cloned()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("invalid loop body: {e}"))?,
        None => {
            return Ok(ActionEffect::Value(failure(
                "loop requires a 'body' array",
                None,
            )))
        }
    };
    let max_iterations = action
        .get("max_iterations")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    let mut iterations = 0u64;
    loop {
        if check_before && !condition_holds(cx, &condition) {
            break;
        }
        if iterations >= max_iterations {
            return Ok(ActionEffect::Value(failure(
                format!("loop stopped after {max_iterations} iterations with the condition still true"),
                Some("make a body action flip the condition via update_state"),
            )));
        }
        debug!(iteration = iterations, "loop pass");
        for step in &body {
            let effect = Box::pin(orchestrator.execute(step, &agent)).await?;
            // A `return` inside the body terminates the whole loop action.
            if let ActionEffect::Return(payload) = effect {
                return Ok(ActionEffect::Return(payload));
            }
        }
        iterations += 1;
        if !check_before && !condition_holds(cx, &condition) {
            break;
        }
    }

    Ok(ActionEffect::Value(success(json!({ "iterations": iterations }))))
}

/// Evaluate a condition against the agent state: `{"key": k}` is truthy
/// when the state value is neither absent, null nor false; adding
/// `"equals": v` compares exactly.  A bare boolean is itself.
fn condition_holds(cx: &ActionContext, condition: &Value) -> bool {
    match condition {
        Value::Bool(b) => *b,
        Value::Object(map) => {
            let Some(key) = map.get("key").and_then(Value::as_str) else {
                return false;
            };
            let state = cx.state.lock().unwrap();
            let current = state.get(key).cloned().unwrap_or(Value::Null);
            match map.get("equals") {
                Some(expected) => &current == expected,
                None => !matches!(current, Value::Null | Value::Bool(false)),
            }
        }
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

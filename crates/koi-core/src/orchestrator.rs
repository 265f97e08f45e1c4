// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use koi_actions::{denied, failure, is_failure, success, ActionEffect};
use koi_llm::Action;
use koi_session::AccessLevel;

use crate::{
    agent::Agent,
    reactive::AgentRunner,
    runtime::RuntimeContext,
};

/// File-touching intents and the access level each needs, for the parallel
/// pre-flight permission collector.
const FILE_INTENTS: &[(&str, AccessLevel)] = &[
    ("grep", AccessLevel::Read),
    ("search", AccessLevel::Read),
    ("read_file", AccessLevel::Read),
    ("edit_file", AccessLevel::Write),
    ("write_file", AccessLevel::Write),
];

/// Resolves, gates, and executes actions on behalf of the reactive loop.
pub struct Orchestrator {
    rt: Arc<RuntimeContext>,
}

impl Orchestrator {
    pub fn new(rt: Arc<RuntimeContext>) -> Self {
        Self { rt }
    }

    // ── Single actions ────────────────────────────────────────────────────────

    /// Normalise, dispatch, and run one action.
    ///
    /// Delegates route through the resolution cascade; registered intents run
    /// their definition behind the role's permission gate; anything else
    /// falls back to the cascade.  Exceptions are never swallowed here; the
    /// playbook session decides how to react.
    pub async fn execute(
        &self,
        action: &Action,
        agent: &Arc<Agent>,
    ) -> anyhow::Result<ActionEffect> {
        let mut action = action.clone();
        action.normalize_delegate_data();
        action.lift_data();

        if action.is_delegate() {
            let task_id = delegate_task_id(&action);
            if let Some(id) = &task_id {
                self.transition_task(id, "in_progress");
            }
            let outcome = self.resolve(&action, agent).await;
            if let (Some(id), Ok(effect)) = (&task_id, &outcome) {
                if !is_failure(&effect.as_value()) {
                    self.transition_task(id, "completed");
                }
            }
            return outcome;
        }

        if let Some(definition) = self.rt.actions.get(&action.intent) {
            let required = definition.permission().token();
            if !agent.role.has_capability(required) {
                return Ok(ActionEffect::Value(denied(
                    format!(
                        "role '{}' lacks the '{required}' capability required by {}",
                        agent.role.name, action.intent
                    ),
                    Some("pick an action this role is allowed to run"),
                )));
            }
            let cx = self.rt.action_context(agent);
            return definition.execute(&action, &cx).await;
        }

        self.resolve(&action, agent).await
    }

    /// Best-effort task bookkeeping in the KV registry around delegate calls.
    fn transition_task(&self, task_id: &str, status: &str) {
        let key = format!("task:{task_id}");
        let mut task = self
            .rt
            .kv
            .get(&key)
            .ok()
            .flatten()
            .unwrap_or_else(|| json!({}));
        task["status"] = Value::String(status.to_string());
        if self.rt.kv.set(&key, task).is_err() {
            warn!(task_id, status, "task transition not recorded");
        }
    }

    // ── Resolution cascade ────────────────────────────────────────────────────

    /// Find someone to handle an intent no definition covers: the agent's
    /// own handlers, its skills, its team, the global router, and finally a
    /// direct model execution for simple actions.
    pub async fn resolve(
        &self,
        action: &Action,
        caller: &Arc<Agent>,
    ) -> anyhow::Result<ActionEffect> {
        let intent = action.intent.clone();
        let payload = action
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(action.fields.clone()));

        // Qualified `agent::event` / `agent.event` bypasses fuzzy matching.
        if let Some((agent_name, event)) = split_qualified(&intent) {
            let Some(target) = self.rt.agent(agent_name) else {
                anyhow::bail!("unknown agent in qualified intent: {agent_name}");
            };
            if !caller.role.has_capability("delegate") {
                return Ok(ActionEffect::Value(denied(
                    format!("role '{}' cannot delegate", caller.role.name),
                    None,
                )));
            }
            return self.delegate_to(&target, event, payload, caller).await;
        }

        // 1. A handler of the agent itself.
        if let Some(event) = best_handler_match(caller, &intent) {
            debug!(agent = %caller.name, %event, %intent, "resolved to self handler");
            return self.delegate_to(caller, &event, payload, caller).await;
        }

        // 2. One of the agent's declared skills.  The skill body itself
        // lives behind the external semantic toolbox; it resolves to a
        // focused model task named after the skill.
        if let Some(skill) = caller
            .skills
            .iter()
            .find(|s| handler_matches(s, &intent))
            .cloned()
        {
            debug!(agent = %caller.name, %skill, %intent, "resolved to skill");
            let text = self
                .rt
                .provider
                .complete_text(
                    &format!("Apply the skill '{skill}' to this request:\n{payload}"),
                    "skill-execution",
                )
                .await?;
            return Ok(ActionEffect::Value(success(json!({
                "skill": skill,
                "result": text,
            }))));
        }

        // 3. A team peer whose handler matches (exact → substring → keyword).
        if let Some((peer, event)) = self.find_peer_handler(caller, &intent) {
            if !caller.role.has_capability("delegate") {
                return Ok(ActionEffect::Value(denied(
                    format!("role '{}' cannot delegate", caller.role.name),
                    None,
                )));
            }
            debug!(caller = %caller.name, peer = %peer.name, %event, "resolved to team peer");
            return self.delegate_to(&peer, &event, payload, caller).await;
        }

        // 4. The global semantic router, consulted only for teamless agents.
        let has_team = caller.peers.lock().unwrap().is_some() || !caller.uses_teams.is_empty();
        if !has_team {
            if let Some(router) = self.rt.semantic_router() {
                if let Some((target, event)) = router.top_candidate(&intent, &self.rt.agents()) {
                    debug!(target = %target.name, %event, "resolved via global router");
                    return self.delegate_to(&target, &event, payload, caller).await;
                }
            }
        }

        // 5. Direct model execution for simple actions.
        if looks_simple(action) {
            debug!(%intent, "resolved to direct model execution");
            let result = self
                .rt
                .provider
                .call_json(&format!(
                    "Perform this step and answer with a JSON object describing the outcome.\n\
                     Intent: {intent}\nInput: {payload}"
                ))
                .await?;
            return Ok(ActionEffect::Value(success(result)));
        }

        anyhow::bail!("no handler found for intent '{intent}'")
    }

    /// Search the caller's team(s) for an agent with a matching handler.
    /// Exact matches beat substring matches beat keyword matches.
    fn find_peer_handler(&self, caller: &Arc<Agent>, intent: &str) -> Option<(Arc<Agent>, String)> {
        let mut peers: Vec<Arc<Agent>> = Vec::new();
        if let Some(team) = &*caller.peers.lock().unwrap() {
            peers.extend(team.agents());
        }
        for team_name in &caller.uses_teams {
            if let Some(team) = self.rt.team(team_name) {
                peers.extend(team.agents());
            }
        }
        peers.retain(|p| p.name != caller.name);

        let tiers: [&dyn Fn(&str, &str) -> bool; 3] = [
            &|handler, intent| normalize_name(handler) == normalize_name(intent),
            &|handler, intent| {
                let h = normalize_name(handler);
                let i = normalize_name(intent);
                h.contains(&i) || i.contains(&h)
            },
            &|handler, intent| keyword_overlap(handler, intent),
        ];
        for tier in tiers {
            for peer in &peers {
                for event in peer.handlers.keys() {
                    if tier(event, intent) {
                        return Some((Arc::clone(peer), event.clone()));
                    }
                }
            }
        }
        None
    }

    // ── Delegation ────────────────────────────────────────────────────────────

    /// Run another agent's loop for one event.  The callee never waits for
    /// user input; `ask_parent` short-circuits back here, where the caller's
    /// model answers and the callee is re-invoked with `args.answer` set.
    pub async fn delegate_to(
        &self,
        target: &Arc<Agent>,
        event: &str,
        payload: Value,
        _caller: &Arc<Agent>,
    ) -> anyhow::Result<ActionEffect> {
        let _guard = self.rt.enter_call(&target.name, event)?;
        let runner = AgentRunner::new(Arc::clone(&self.rt));

        let mut args = payload;
        let mut outcome =
            Box::pin(runner.run_delegate(Arc::clone(target), event, args.clone())).await?;

        if let Some(question) = outcome.ask_parent.clone() {
            debug!(delegate = %target.name, %question, "delegate asks parent");
            let answer = self
                .rt
                .provider
                .call_json(&format!(
                    "Your delegate '{}' needs an answer to continue.\n\
                     Question: {question}\n\
                     Respond as a JSON object: {{\"answer\": <your answer>}}",
                    target.name
                ))
                .await?;
            let answer_value = answer.get("answer").cloned().unwrap_or(answer);
            match &mut args {
                Value::Object(map) => {
                    map.insert("answer".to_string(), answer_value);
                }
                other => *other = json!({ "answer": answer_value }),
            }
            outcome = Box::pin(runner.run_delegate(Arc::clone(target), event, args)).await?;
        }

        if outcome.gave_up {
            let mut value = failure(
                format!("delegate '{}' could not complete '{event}'", target.name),
                None,
            );
            value["agentName"] = Value::String(target.name.clone());
            return Ok(ActionEffect::Value(value));
        }
        Ok(ActionEffect::Value(success(json!({ "result": outcome.result }))))
    }

    // ── Parallel groups ───────────────────────────────────────────────────────

    /// Run a parallel group: collect the needed `(directory, level)` grants
    /// up front (one prompt per deduplicated pair), then execute every child
    /// concurrently and synthesise the combined feedback record.
    pub async fn execute_parallel(
        &self,
        actions: &[Action],
        agent: &Arc<Agent>,
    ) -> anyhow::Result<Value> {
        let cx = self.rt.action_context(agent);

        // Pre-flight permission collection.
        let mut pairs: Vec<(PathBuf, AccessLevel)> = Vec::new();
        for action in actions {
            let Some(level) = file_access_level(&action.intent) else {
                continue;
            };
            let Some(path) = action.get_str("path") else {
                continue;
            };
            let dir = koi_actions::ActionContext::permission_dir(Path::new(path));
            if !pairs.contains(&(dir.clone(), level)) {
                pairs.push((dir, level));
            }
        }

        let mut refused: Vec<(PathBuf, AccessLevel)> = Vec::new();
        for (dir, level) in &pairs {
            if cx.permissions.lock().unwrap().is_allowed(dir, *level) {
                continue;
            }
            match cx.ensure_allowed(dir, *level).await? {
                None => {}
                Some(_) => refused.push((dir.clone(), *level)),
            }
        }

        // Concurrent execution.  A refused directory turns its children into
        // denials without re-prompting; failures in one child never cancel
        // the others.
        let children = actions.iter().enumerate().map(|(index, action)| {
            let refused = &refused;
            async move {
                if let Some(level) = file_access_level(&action.intent) {
                    if let Some(path) = action.get_str("path") {
                        let dir =
                            koi_actions::ActionContext::permission_dir(Path::new(path));
                        if refused.iter().any(|(d, l)| *l == level && dir.starts_with(d)) {
                            return (
                                index,
                                Ok(ActionEffect::Value(denied(
                                    format!("{level} access to {} was refused", dir.display()),
                                    None,
                                ))),
                            );
                        }
                    }
                }
                (index, self.execute(action, agent).await)
            }
        });
        let mut results = futures::future::join_all(children).await;
        results.sort_by_key(|(index, _)| *index);

        // Synthesised feedback entry.
        let mut lines = Vec::with_capacity(actions.len());
        for (index, outcome) in &results {
            let action = &actions[*index];
            let label = match &action.id {
                Some(id) => format!("{}[{}]", action.intent, id),
                None => format!("{}[{}]", action.intent, index),
            };
            let line = match outcome {
                Ok(effect) => {
                    let value = effect.as_value();
                    if is_failure(&value) {
                        let error = value
                            .get("error")
                            .or_else(|| value.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("failed");
                        format!("❌ {label} → {error}")
                    } else {
                        format!("✅ {label} → {}", compact(&value))
                    }
                }
                Err(e) => format!("❌ {label} → {e}"),
            };
            lines.push(line);
        }

        Ok(json!({
            "event": "_parallel_done",
            "content": lines.join("\n"),
            "children": actions.len(),
        }))
    }
}

fn file_access_level(intent: &str) -> Option<AccessLevel> {
    FILE_INTENTS
        .iter()
        .find(|(name, _)| *name == intent)
        .map(|(_, level)| *level)
}

fn delegate_task_id(action: &Action) -> Option<String> {
    if let Some(id) = action.get_str("taskId") {
        return Some(id.to_string());
    }
    action
        .get("data")
        .and_then(|d| d.get("taskId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `agent::event` or `agent.event`.  Free-text intents (anything with
/// whitespace) are never treated as qualified.
fn split_qualified(intent: &str) -> Option<(&str, &str)> {
    if intent.contains(char::is_whitespace) {
        return None;
    }
    if let Some((agent, event)) = intent.split_once("::") {
        if !agent.is_empty() && !event.is_empty() {
            return Some((agent, event));
        }
    }
    if let Some((agent, event)) = intent.split_once('.') {
        if !agent.is_empty() && !event.is_empty() {
            return Some((agent, event));
        }
    }
    None
}

/// Lowercase with every non-alphanumeric character stripped.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Words of an identifier: split on non-alphanumerics and camelCase humps.
fn keywords(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && previous_lower {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn keyword_overlap(a: &str, b: &str) -> bool {
    let wa = keywords(a);
    let wb = keywords(b);
    wa.iter().any(|w| wb.contains(w))
}

/// Normalised-name matching used for handlers and skills: exact, prefix or
/// substring, then keyword overlap on camelCase splits.
pub fn handler_matches(handler: &str, intent: &str) -> bool {
    let h = normalize_name(handler);
    let i = normalize_name(intent);
    if h.is_empty() || i.is_empty() {
        return false;
    }
    h == i || h.contains(&i) || i.contains(&h) || keyword_overlap(handler, intent)
}

/// Pick the best-matching handler on an agent: exact beats substring beats
/// keyword overlap.
fn best_handler_match(agent: &Agent, intent: &str) -> Option<String> {
    let normalized = normalize_name(intent);
    let mut substring: Option<&String> = None;
    let mut keyword: Option<&String> = None;
    for event in agent.handlers.keys() {
        let h = normalize_name(event);
        if h == normalized {
            return Some(event.clone());
        }
        if substring.is_none() && (h.contains(&normalized) || normalized.contains(&h)) {
            substring = Some(event);
        }
        if keyword.is_none() && keyword_overlap(event, intent) {
            keyword = Some(event);
        }
    }
    substring.or(keyword).cloned()
}

/// Simple enough to hand straight to the model: an inline playbook, an
/// `llm_task`-style record, or a short free-text phrase.
fn looks_simple(action: &Action) -> bool {
    if action.get("playbook").is_some() || action.get("task").is_some() {
        return true;
    }
    let intent = &action.intent;
    intent.contains(' ') && intent.len() < 120
}

/// One-line rendering of a result for the parallel feedback entry.
fn compact(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    } else {
        text
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

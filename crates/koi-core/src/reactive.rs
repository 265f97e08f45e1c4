// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use koi_actions::{failure, is_failure, success, ActionEffect};
use koi_llm::{Action, ActionItem, PlaybookRequest, Role, ToolDescriptor};
use koi_memory::ContextMemory;

use crate::{
    agent::Agent,
    events::AgentEvent,
    orchestrator::Orchestrator,
    playbook::{PlaybookSession, SessionLimits},
    prompts::{greeting_for, system_prompt, FAST_GREETING_MARKER},
    runtime::{LlmSummarizer, RuntimeContext},
};

/// Transport failures tolerated in a row before the loop gives up rather
/// than spinning against a dead provider.
const MAX_LLM_ERROR_STREAK: u32 = 3;

/// What one `run_session` produced.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Value,
    /// Set when a delegate short-circuited with `ask_parent`.
    pub ask_parent: Option<String>,
    /// The error/pivot budget was exhausted.
    pub gave_up: bool,
    pub last_error: Option<String>,
}

/// Drives one agent's reactive loop: ask the model for the next action
/// batch, execute it, feed the result back, repeat until terminal.
pub struct AgentRunner {
    rt: Arc<RuntimeContext>,
}

impl AgentRunner {
    pub fn new(rt: Arc<RuntimeContext>) -> Self {
        Self { rt }
    }

    fn cli_mode(&self) -> bool {
        self.rt.config.runtime.cli_mode
    }

    /// Top-level entry for one event.  In CLI mode an exhausted error
    /// budget triggers exactly one recovery re-entry with a synthetic user
    /// message; a second give-up prints the last error and stops.  An abort
    /// always exits silently.
    pub async fn handle(&self, agent: Arc<Agent>, event: &str, args: Value) -> anyhow::Result<Value> {
        let outcome = self.run_session(&agent, event, args.clone(), false).await?;
        if !outcome.gave_up || !self.cli_mode() {
            return Ok(outcome.result);
        }
        if self.rt.abort.is_aborted() {
            return Ok(Value::Null);
        }

        warn!(agent = %agent.name, "error budget exhausted, attempting recovery");
        {
            let mut memory = agent.memory.lock().await;
            memory.push(
                Role::User,
                "The previous attempt failed repeatedly and was stopped. Recover: \
                 review what went wrong, explain it briefly, and either take a \
                 different approach or ask the user how to proceed.",
            );
        }
        let retry = self.run_session(&agent, event, args, false).await?;
        if retry.gave_up {
            let last = retry.last_error.as_deref().unwrap_or("repeated action failures");
            self.rt.prompter.print(&format!("error: {last}"));
        }
        Ok(retry.result)
    }

    /// Delegate entry: `return` always terminates, `ask_parent` surfaces to
    /// the caller, and the loop never waits for user input.
    pub async fn run_delegate(
        &self,
        agent: Arc<Agent>,
        event: &str,
        args: Value,
    ) -> anyhow::Result<SessionOutcome> {
        self.run_session(&agent, event, args, true).await
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    async fn run_session(
        &self,
        agent: &Arc<Agent>,
        event: &str,
        args: Value,
        is_delegate: bool,
    ) -> anyhow::Result<SessionOutcome> {
        let playbook = agent
            .handler(event)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("agent '{}' has no handler for '{event}'", agent.name))?;

        let orchestrator = Orchestrator::new(Arc::clone(&self.rt));
        let summarizer = LlmSummarizer::new(Arc::clone(&self.rt.provider));
        let mut session = PlaybookSession::new(SessionLimits::from(&self.rt.config.runtime));
        agent.set_busy(true);

        // The memory lock is taken per use, never across an action: a
        // self-delegating action re-enters this agent's loop and must be
        // able to take the lock itself.
        let memory_was_fresh = {
            let mut memory = agent.memory.lock().await;
            self.restore_memory_if_fresh(agent, &mut memory);
            let fresh = memory.is_empty();
            if let Some(user_turn) = render_args(event, &args) {
                memory.push(Role::User, user_turn);
            }
            fresh
        };

        let prompt = self.render_system_prompt(agent, &playbook);
        let mut thinking_hint: Option<String> = None;
        let mut latest_result = Value::Null;
        let mut first_iteration = true;
        let mut llm_error_streak = 0u32;
        let mut gave_up = false;

        'turns: loop {
            if self.rt.abort.is_aborted() {
                debug!(agent = %agent.name, "aborted, exiting silently");
                break;
            }
            if session.is_terminated() {
                break;
            }
            if session.needs_pivot() {
                if session.pivot() {
                    let attempt = session.pivot_count;
                    let max = session.limits().max_pivots;
                    agent.memory.lock().await.push(
                        Role::User,
                        format!(
                            "CRITICAL — PIVOT REQUIRED (attempt {attempt}/{max}): the current \
                             approach keeps failing. Abandon it entirely and try something \
                             different. Do not repeat the failing action."
                        ),
                    );
                    self.rt.emit(AgentEvent::Pivot { attempt, max });
                } else {
                    gave_up = true;
                    break;
                }
            }

            let batch = if first_iteration
                && self.fast_greeting_applies(is_delegate, &playbook, memory_was_fresh)
            {
                debug!(agent = %agent.name, "fast greeting, skipping model call");
                vec![
                    ActionItem::Single(
                        Action::new("print").with("text", json!(greeting_for(&agent.name))),
                    ),
                    ActionItem::Single(Action::new("prompt_user")),
                ]
            } else {
                let request = PlaybookRequest {
                    playbook: playbook.clone(),
                    agent_name: agent.name.clone(),
                    transcript: agent.memory.lock().await.to_messages(&prompt),
                    actions: self.rt.actions.descriptions(),
                    delegation_targets: agent.peer_names(),
                    mcp_tools: self.mcp_catalogue(agent).await,
                    is_first_call: first_iteration,
                    thinking_hint: thinking_hint.clone(),
                    is_delegate,
                    abort: self.rt.abort.clone(),
                };
                match self.rt.provider.next_actions(request).await {
                    Ok(batch) => {
                        llm_error_streak = 0;
                        batch
                    }
                    Err(e) => {
                        // Transport failure: recorded, no pivot pressure, the
                        // loop continues, unless the provider stays dead.
                        warn!(error = %e, "model call failed");
                        session.record_feedback("_llm_error", json!({ "error": e.to_string() }));
                        self.rt.emit(AgentEvent::LlmError(e.to_string()));
                        llm_error_streak += 1;
                        if llm_error_streak >= MAX_LLM_ERROR_STREAK {
                            gave_up = true;
                            break;
                        }
                        continue;
                    }
                }
            };
            first_iteration = false;

            for item in batch {
                if self.rt.abort.is_aborted() {
                    break 'turns;
                }
                match item {
                    ActionItem::Parallel(actions) => {
                        agent.memory.lock().await.push(
                            Role::Assistant,
                            format!("parallel batch of {} actions", actions.len()),
                        );
                        match orchestrator.execute_parallel(&actions, agent).await {
                            Ok(feedback) => {
                                let content = feedback
                                    .get("content")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                session.record_feedback("_parallel_done", feedback);
                                agent.memory.lock().await.push(Role::User, content);
                            }
                            Err(e) => {
                                session.record_feedback(
                                    "_parallel_error",
                                    json!({ "error": e.to_string() }),
                                );
                                agent
                                    .memory
                                    .lock()
                                    .await
                                    .push(Role::User, format!("parallel group failed: {e}"));
                            }
                        }
                    }
                    ActionItem::Single(action) => {
                        let flow = self
                            .run_single(
                                &orchestrator,
                                agent,
                                &mut session,
                                &mut thinking_hint,
                                &mut latest_result,
                                action,
                                is_delegate,
                            )
                            .await?;
                        match flow {
                            StepFlow::Continue => {}
                            StepFlow::AskParent(question) => {
                                agent.set_busy(false);
                                self.persist_memory(agent).await;
                                return Ok(SessionOutcome {
                                    result: Value::Null,
                                    ask_parent: Some(question),
                                    gave_up: false,
                                    last_error: None,
                                });
                            }
                        }
                    }
                }
                agent.memory.lock().await.tick(&summarizer).await;
                if session.is_terminated() {
                    break;
                }
            }
        }

        agent.set_busy(false);
        // Loop termination is a flush point for staged file changes.
        self.rt.flush_commits().await;
        self.persist_memory(agent).await;
        self.rt.emit(AgentEvent::TurnComplete {
            agent: agent.name.clone(),
        });

        let last_error = last_error_text(&session);
        Ok(SessionOutcome {
            result: session.final_result.clone().unwrap_or(latest_result),
            ask_parent: None,
            gave_up,
            last_error,
        })
    }

    /// Execute one single action with all its special handling.
    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        orchestrator: &Orchestrator,
        agent: &Arc<Agent>,
        session: &mut PlaybookSession,
        thinking_hint: &mut Option<String>,
        latest_result: &mut Value,
        action: Action,
        is_delegate: bool,
    ) -> anyhow::Result<StepFlow> {
        // Control returns to the user (or the caller) after these intents:
        // flush staged changes and drop the busy flag first.
        if action.intent == "prompt_user" || action.intent == "return" {
            self.rt.flush_commits().await;
            self.persist_memory(agent).await;
            agent.set_busy(false);
        }

        let hint = self
            .rt
            .actions
            .get(&action.intent)
            .and_then(|d| d.thinking_hint(&action));
        self.rt.emit(AgentEvent::ActionStarted {
            intent: action.intent.clone(),
            hint: hint.clone(),
        });
        agent.memory.lock().await.push(
            Role::Assistant,
            format!(
                "action: {}",
                serde_json::to_string(&action).unwrap_or_else(|_| action.intent.clone())
            ),
        );

        match orchestrator.execute(&action, agent).await {
            Ok(ActionEffect::Return(payload)) => {
                session.record_result(&action, success(json!({ "returned": payload.clone() })));
                *latest_result = payload.clone();
                if self.cli_mode() && !is_delegate {
                    // CLI semantics: the task is done, but the process waits
                    // for the next user request instead of exiting.
                    agent
                        .memory
                        .lock()
                        .await
                        .push(Role::User, "Task completed. Use prompt_user now.");
                } else {
                    session.terminate(Some(payload));
                }
                self.rt.emit(AgentEvent::ActionFinished {
                    intent: action.intent.clone(),
                    success: true,
                });
            }
            Ok(ActionEffect::AskParent { question }) => {
                if is_delegate {
                    session.record_result(
                        &action,
                        success(json!({ "ask_parent": question.clone() })),
                    );
                    return Ok(StepFlow::AskParent(question));
                }
                let value = failure("ask_parent is only available inside a delegated task", None);
                session.record_result(&action, value.clone());
                agent
                    .memory
                    .lock()
                    .await
                    .push(Role::User, feedback_text(&action.intent, &value));
            }
            Ok(ActionEffect::Value(value)) => {
                if action.intent == "prompt_user" {
                    let mut answer = value
                        .get("input")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    // Slash commands intercept the answer; their result is
                    // re-fed as if the user had typed it normally.
                    if answer.starts_with('/') {
                        if let Some(router) = self.rt.command_router() {
                            match router.route(&answer, agent).await {
                                Ok(Some(replacement)) => answer = replacement,
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "slash command failed"),
                            }
                        }
                    }
                    agent.set_busy(true);
                    if !answer.is_empty() {
                        self.record_user_input(agent, &answer);
                    }
                    let recorded = success(json!({ "input": answer }));
                    session.record_result(&action, recorded);
                    agent.memory.lock().await.push(
                        Role::User,
                        if answer.is_empty() { "(empty input)".to_string() } else { answer },
                    );
                } else {
                    session.record_result(&action, value.clone());
                    agent
                        .memory
                        .lock()
                        .await
                        .push(Role::User, feedback_text(&action.intent, &value));
                    *latest_result = value.clone();
                    *thinking_hint = hint.or_else(|| next_step_hint(&action.intent, &value));
                    self.rt.emit(AgentEvent::ActionFinished {
                        intent: action.intent.clone(),
                        success: !is_failure(&value),
                    });
                }
            }
            Err(e) => {
                // Programming/protocol errors abort this iteration only; the
                // model sees them as feedback and the loop continues.
                warn!(intent = %action.intent, error = %e, "action raised");
                session.record_error(&action, e.to_string());
                agent.memory.lock().await.push(
                    Role::User,
                    format!("Action {} failed: {e}", action.intent),
                );
                self.rt.emit(AgentEvent::ActionFinished {
                    intent: action.intent.clone(),
                    success: false,
                });
            }
        }
        Ok(StepFlow::Continue)
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn fast_greeting_applies(&self, is_delegate: bool, playbook: &str, fresh: bool) -> bool {
        self.cli_mode()
            && self.rt.config.runtime.fast_greeting
            && !is_delegate
            && fresh
            && playbook.contains(FAST_GREETING_MARKER)
            && !self.rt.mcp.has_error()
    }

    fn render_system_prompt(&self, agent: &Agent, playbook: &str) -> String {
        system_prompt(
            &agent.name,
            &agent.role.name,
            playbook,
            &self.rt.actions.descriptions(),
            &agent.peer_names(),
        )
    }

    async fn mcp_catalogue(&self, agent: &Agent) -> Vec<ToolDescriptor> {
        if agent.mcp.is_empty() {
            return Vec::new();
        }
        self.rt
            .mcp
            .catalogue(&agent.mcp)
            .await
            .into_iter()
            .map(|(server, tool)| ToolDescriptor {
                server,
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect()
    }

    /// Persist a completed user answer: the line-editor history picks it up
    /// on the next session, and the dialogue log records it for analysis.
    fn record_user_input(&self, agent: &Agent, answer: &str) {
        let mut history = self.rt.store.load_input_history().unwrap_or_default();
        if history.last().map(String::as_str) != Some(answer) {
            history.push(answer.to_string());
            if let Err(e) = self.rt.store.save_input_history(&history) {
                warn!(error = %e, "input history not saved");
            }
        }
        let _ = self.rt.store.append_dialogue(json!({
            "type": "user_input",
            "agent": agent.name,
            "text": answer,
        }));
    }

    /// Reload a saved conversation snapshot into an empty memory.
    fn restore_memory_if_fresh(&self, agent: &Agent, memory: &mut ContextMemory) {
        if !memory.is_empty() {
            return;
        }
        let Ok(Some(snapshot)) = self.rt.store.load_conversation(&agent.name) else {
            return;
        };
        let windows = koi_memory::MemoryWindows::new(
            self.rt.config.memory.short_term_window,
            self.rt.config.memory.active_window,
            self.rt.config.memory.long_term_cap,
        );
        match ContextMemory::restore(windows, snapshot) {
            Ok(restored) => {
                debug!(agent = %agent.name, entries = restored.len(), "conversation restored");
                *memory = restored;
            }
            Err(e) => warn!(agent = %agent.name, error = %e, "conversation snapshot unusable"),
        }
    }

    async fn persist_memory(&self, agent: &Agent) {
        let snapshot = agent.memory.lock().await.snapshot();
        if let Err(e) = self.rt.store.save_conversation(&agent.name, &snapshot) {
            warn!(agent = %agent.name, error = %e, "conversation persistence failed");
        }
    }
}

enum StepFlow {
    Continue,
    AskParent(String),
}

/// The user turn pushed into memory for a `handle()` invocation.
fn render_args(event: &str, args: &Value) -> Option<String> {
    match args {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => match map.get("input").and_then(Value::as_str) {
            Some(input) if map.len() == 1 => Some(input.to_string()),
            _ => Some(format!("{event}: {}", Value::Object(map.clone()))),
        },
        other => Some(format!("{event}: {other}")),
    }
}

fn feedback_text(intent: &str, value: &Value) -> String {
    let rendered = value.to_string();
    let clipped: String = rendered.chars().take(2000).collect();
    format!("Result of {intent}: {clipped}")
}

/// Next-step label derived from a result when the definition offers none.
fn next_step_hint(intent: &str, value: &Value) -> Option<String> {
    if is_failure(value) {
        Some(format!("recovering from failed {intent}"))
    } else {
        Some(format!("continuing after {intent}"))
    }
}

fn last_error_text(session: &PlaybookSession) -> Option<String> {
    session.action_history.iter().rev().find_map(|record| {
        if let Some(error) = &record.error {
            return Some(error.clone());
        }
        match &record.result {
            Some(result) if is_failure(result) => result
                .get("error")
                .or_else(|| result.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use koi_actions::SilentPrompter;
    use koi_config::{AgentSpec, Config};
    use koi_llm::ScriptedProvider;

    fn config_with_agent(dir: &std::path::Path, cli_mode: bool, playbook: &str) -> Config {
        let mut config = Config::default();
        config.session.project_root = Some(dir.to_string_lossy().into_owned());
        config.session.session_id = Some("reactive-test".into());
        config.runtime.cli_mode = cli_mode;
        let mut spec = AgentSpec {
            name: "tester".into(),
            ..Default::default()
        };
        spec.handlers.insert("main".into(), playbook.to_string());
        config.agents.push(spec);
        config
    }

    fn runtime_with(
        dir: &std::path::Path,
        cli_mode: bool,
        playbook: &str,
        provider: ScriptedProvider,
    ) -> Arc<RuntimeContext> {
        RuntimeContext::build(
            config_with_agent(dir, cli_mode, playbook),
            Arc::new(provider),
            Arc::new(SilentPrompter),
        )
        .unwrap()
    }

    fn single(action: Action) -> ActionItem {
        ActionItem::Single(action)
    }

    // ── Terminal behaviour ────────────────────────────────────────────────────

    #[tokio::test]
    async fn return_terminates_non_cli_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![single(
            Action::new("return").with("value", json!({"done": true})),
        )]]);
        let rt = runtime_with(dir.path(), false, "Finish immediately.", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let result = runner
            .handle(agent, "main", json!({"input": "go"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"done": true}));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let rt = runtime_with(dir.path(), false, "x", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        assert!(runner.handle(agent, "no_such_event", Value::Null).await.is_err());
    }

    // ── Fast greeting ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fast_greeting_skips_the_model() {
        let dir = tempfile::tempdir().unwrap();
        // The script is EMPTY: the provider can never produce actions, so a
        // greeting appearing in the transcript proves iteration 0 bypassed
        // the model entirely.
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let rt = RuntimeContext::build(
            config_with_agent(dir.path(), true, "__FAST_GREETING__ Help the user."),
            Arc::clone(&provider) as Arc<dyn koi_llm::LlmProvider>,
            Arc::new(SilentPrompter),
        )
        .unwrap();
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let _ = runner
            .run_session(&agent, "main", Value::Null, false)
            .await
            .unwrap();

        let memory = agent.memory.lock().await;
        let greeted = memory
            .entries()
            .iter()
            .any(|e| e.immediate.contains("\"intent\":\"print\""));
        let prompted = memory
            .entries()
            .iter()
            .any(|e| e.immediate.contains("\"intent\":\"prompt_user\""));
        assert!(greeted, "greeting print must run without a model call");
        assert!(prompted, "prompt_user must follow the greeting");
    }

    // ── Pivot and give-up ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn pivot_message_reaches_the_model() {
        let dir = tempfile::tempdir().unwrap();
        // Ten failing shell batches exhaust the error budget, then the
        // eleventh call observes the pivot message and succeeds.
        let mut batches: Vec<Vec<ActionItem>> = (0..10)
            .map(|_| vec![single(Action::new("shell").with("command", json!("exit 1")))])
            .collect();
        batches.push(vec![single(Action::new("return").with("value", json!("ok")))]);
        let provider = ScriptedProvider::new(batches);
        let rt = runtime_with(dir.path(), false, "Keep trying.", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let result = runner
            .handle(Arc::clone(&agent), "main", json!({"input": "run"}))
            .await
            .unwrap();
        assert_eq!(result, json!("ok"));

        let memory = agent.memory.lock().await;
        let transcript: Vec<String> = memory.entries().iter().map(|e| e.immediate.clone()).collect();
        assert!(
            transcript
                .iter()
                .any(|t| t.starts_with("CRITICAL — PIVOT REQUIRED (attempt 1/3)")),
            "pivot message missing from transcript: {transcript:?}"
        );
    }

    #[tokio::test]
    async fn exhausted_pivots_give_up() {
        let dir = tempfile::tempdir().unwrap();
        // Enough failing batches to pass 10 errors × (3 pivots + 1).
        let batches: Vec<Vec<ActionItem>> = (0..45)
            .map(|i| vec![single(Action::new("shell").with("command", json!(format!("exit {}", i % 7 + 1))))])
            .collect();
        let provider = ScriptedProvider::new(batches);
        let rt = runtime_with(dir.path(), false, "Fail forever.", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_session(&agent, "main", json!({"input": "go"}), false)
            .await
            .unwrap();
        assert!(outcome.gave_up);
        assert!(outcome.last_error.is_some());
    }

    // ── Parallel groups ───────────────────────────────────────────────────────

    /// Grants everything, counting how many permission dialogs were shown.
    struct CountingPrompter {
        confirms: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl koi_actions::Prompter for CountingPrompter {
        fn print(&self, _text: &str) {}

        async fn prompt_user(&self, _message: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn confirm_permission(
            &self,
            _dir: &std::path::Path,
            _level: koi_session::AccessLevel,
        ) -> anyhow::Result<koi_actions::PermissionReply> {
            self.confirms
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(koi_actions::PermissionReply::Always)
        }
    }

    #[tokio::test]
    async fn parallel_group_produces_combined_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("main.rs"), "// TODO: everything\n").unwrap();

        let group = ActionItem::Parallel(vec![
            Action::new("grep")
                .with("pattern", json!("TODO"))
                .with("path", json!(src.to_string_lossy())),
            Action::new("read_file").with("path", json!(src.join("main.rs").to_string_lossy())),
        ]);
        let provider = ScriptedProvider::new(vec![
            vec![group],
            vec![single(Action::new("return").with("value", json!("done")))],
        ]);
        let prompter = Arc::new(CountingPrompter {
            confirms: std::sync::atomic::AtomicUsize::new(0),
        });
        let rt = RuntimeContext::build(
            config_with_agent(dir.path(), false, "Inspect."),
            Arc::new(provider),
            Arc::clone(&prompter) as Arc<dyn koi_actions::Prompter>,
        )
        .unwrap();
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_session(&agent, "main", json!({"input": "inspect"}), false)
            .await
            .unwrap();
        assert_eq!(outcome.result, json!("done"));

        // Both children need read access to the same directory: exactly one
        // pre-flight dialog covers them.
        assert_eq!(
            prompter.confirms.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let memory = agent.memory.lock().await;
        let feedback = memory
            .entries()
            .iter()
            .find(|e| e.immediate.contains("✅"))
            .expect("parallel feedback entry in transcript");
        let lines: Vec<&str> = feedback.immediate.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.starts_with("✅")));
        assert!(lines.iter().any(|l| l.contains("grep")));
        assert!(lines.iter().any(|l| l.contains("read_file")));
    }

    // ── Delegation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delegate_return_surfaces_payload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![single(
            Action::new("return").with("value", json!(21)),
        )]]);
        // CLI mode on: a delegate must STILL terminate on return.
        let rt = runtime_with(dir.path(), true, "Compute.", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_delegate(agent, "main", json!({"input": "compute"}))
            .await
            .unwrap();
        assert_eq!(outcome.result, json!(21));
        assert!(!outcome.gave_up);
    }

    #[tokio::test]
    async fn ask_parent_short_circuits_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![single(
            Action::new("ask_parent").with("question", json!("Which unit?")),
        )]]);
        let rt = runtime_with(dir.path(), false, "Compute.", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_delegate(agent, "main", json!({"input": "compute"}))
            .await
            .unwrap();
        assert_eq!(outcome.ask_parent.as_deref(), Some("Which unit?"));
    }

    // ── LLM transport failures ────────────────────────────────────────────────

    #[tokio::test]
    async fn llm_errors_are_recorded_without_pivot_pressure() {
        let dir = tempfile::tempdir().unwrap();
        // An empty script makes every model call fail; after the streak cap
        // the session gives up instead of spinning.
        let provider = ScriptedProvider::new(vec![]);
        let rt = runtime_with(dir.path(), false, "x", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_session(&agent, "main", json!({"input": "go"}), false)
            .await
            .unwrap();
        assert!(outcome.gave_up);
    }

    // ── Abort ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_exits_silently() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![single(
            Action::new("return").with("value", json!("never")),
        )]]);
        let rt = runtime_with(dir.path(), false, "x", provider);
        rt.abort.abort();
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        let outcome = runner
            .run_session(&agent, "main", json!({"input": "go"}), false)
            .await
            .unwrap();
        assert_eq!(outcome.result, Value::Null);
        assert!(!outcome.gave_up);
    }

    // ── Memory persistence ────────────────────────────────────────────────────

    #[tokio::test]
    async fn conversation_snapshot_survives_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![vec![single(
            Action::new("return").with("value", json!("first")),
        )]]);
        let rt = runtime_with(dir.path(), false, "x", provider);
        let runner = AgentRunner::new(Arc::clone(&rt));
        let agent = rt.agent("tester").unwrap();
        runner
            .handle(Arc::clone(&agent), "main", json!({"input": "remember me"}))
            .await
            .unwrap();
        let saved = rt.store.load_conversation("tester").unwrap().unwrap();
        let entries = saved["entries"].as_array().unwrap();
        assert!(entries
            .iter()
            .any(|e| e["immediate"].as_str().unwrap_or("").contains("remember me")));
    }
}

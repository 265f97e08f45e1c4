// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the reactive runtime using the scripted provider.
use std::sync::Arc;

use serde_json::{json, Value};

use koi_actions::SilentPrompter;
use koi_config::{AgentSpec, Config, TeamSpec};
use koi_core::{AgentRunner, RuntimeContext};
use koi_llm::{Action, ActionItem, ScriptedProvider};

fn base_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.session.project_root = Some(dir.to_string_lossy().into_owned());
    config.session.session_id = Some("it-session".into());
    config
}

fn agent(name: &str, event: &str, playbook: &str) -> AgentSpec {
    let mut spec = AgentSpec {
        name: name.to_string(),
        ..Default::default()
    };
    spec.handlers.insert(event.to_string(), playbook.to_string());
    spec
}

fn single(action: Action) -> ActionItem {
    ActionItem::Single(action)
}

fn runtime(config: Config, provider: ScriptedProvider) -> Arc<RuntimeContext> {
    RuntimeContext::build(config, Arc::new(provider), Arc::new(SilentPrompter)).unwrap()
}

#[tokio::test]
async fn file_changes_commit_per_user_turn_and_check_out() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let a_path = work.join("A.txt");
    let b_path = work.join("B.txt");
    std::fs::write(&b_path, "Y").unwrap();

    // Turn 1: write A = "X", edit B from "Y" to "Z", then prompt_user
    // (flushes one commit).  Turn 2: write A = "X2", prompt_user (second
    // commit), then return.
    let provider = ScriptedProvider::new(vec![
        vec![single(
            Action::new("write_file")
                .with("path", json!(a_path.to_string_lossy()))
                .with("content", json!("X")),
        )],
        vec![single(
            Action::new("edit_file")
                .with("path", json!(b_path.to_string_lossy()))
                .with("old_text", json!("Y"))
                .with("new_text", json!("Z")),
        )],
        vec![single(Action::new("prompt_user"))],
        vec![single(
            Action::new("write_file")
                .with("path", json!(a_path.to_string_lossy()))
                .with("content", json!("X2")),
        )],
        vec![single(Action::new("prompt_user"))],
        vec![single(Action::new("return").with("value", json!("done")))],
    ]);

    let mut config = base_config(dir.path());
    config.agents.push(agent("editor", "main", "Edit files as asked."));
    let rt = runtime(config, provider);
    let runner = AgentRunner::new(Arc::clone(&rt));
    let agent = rt.agent("editor").unwrap();

    let result = runner
        .handle(agent, "main", json!({"input": "make the edits"}))
        .await
        .unwrap();
    assert_eq!(result, json!("done"));

    // One commit per completed user turn.
    let history = rt.tracker.history();
    assert_eq!(history.len(), 2, "expected exactly two changesets: {history:?}");
    let h1 = &history[0];
    let h2 = &history[1];
    assert_eq!(h1.changed_files.len(), 2);
    assert_eq!(h2.changed_files.len(), 1);
    assert_eq!(h2.parent_hash.as_deref(), Some(h1.hash.as_str()));
    assert_eq!(std::fs::read_to_string(&a_path).unwrap(), "X2");

    // Checking out the first changeset restores A to "X" and keeps B at "Z".
    rt.tracker.checkout_commit(&h1.hash).unwrap();
    assert_eq!(std::fs::read_to_string(&a_path).unwrap(), "X");
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "Z");
}

#[tokio::test]
async fn delegate_ask_parent_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    // parent delegates `compute`; child asks which unit, the parent's model
    // answers "meters" through the JSON adapter, and the child completes on
    // re-invocation with args.answer set.
    let provider = ScriptedProvider::new(vec![
        vec![single(
            Action::delegate("compute").with("value", json!(12)),
        )],
        vec![single(
            Action::new("ask_parent").with("question", json!("Which unit?")),
        )],
        vec![single(
            Action::new("return").with("value", json!({"converted": "12 meters"})),
        )],
        vec![single(Action::new("return").with("value", json!("all done")))],
    ])
    .with_json_answers(vec![json!({"answer": "meters"})]);

    let mut config = base_config(dir.path());
    config.agents.push(agent("parent", "main", "Coordinate the work."));
    config.agents.push(agent("child", "compute", "Convert the value."));
    config.teams.push(TeamSpec {
        name: "crew".into(),
        members: [
            ("lead".to_string(), "parent".to_string()),
            ("worker".to_string(), "child".to_string()),
        ]
        .into_iter()
        .collect(),
    });

    let rt = runtime(config, provider);
    let runner = AgentRunner::new(Arc::clone(&rt));
    let parent = rt.agent("parent").unwrap();

    let result = runner
        .handle(parent, "main", json!({"input": "convert 12"}))
        .await
        .unwrap();
    assert_eq!(result, json!("all done"));

    // The child's second invocation saw the merged answer.
    let child = rt.agent("child").unwrap();
    let memory = child.memory.lock().await;
    assert!(
        memory
            .entries()
            .iter()
            .any(|e| e.immediate.contains("meters")),
        "child transcript must contain the parent's answer"
    );
}

#[tokio::test]
async fn qualified_intents_bypass_fuzzy_matching() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![single(Action::delegate("child::compute"))],
        vec![single(Action::new("return").with("value", json!(7)))],
        vec![single(Action::new("return").with("value", json!("ok")))],
    ]);

    let mut config = base_config(dir.path());
    config.agents.push(agent("parent", "main", "Coordinate."));
    config.agents.push(agent("child", "compute", "Compute."));
    let rt = runtime(config, provider);
    let runner = AgentRunner::new(Arc::clone(&rt));
    let parent = rt.agent("parent").unwrap();

    let result = runner
        .handle(parent, "main", json!({"input": "go"}))
        .await
        .unwrap();
    assert_eq!(result, json!("ok"));
}

#[tokio::test]
async fn dialogue_log_records_commits() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("work.txt");
    let provider = ScriptedProvider::new(vec![
        vec![single(
            Action::new("write_file")
                .with("path", json!(file.to_string_lossy()))
                .with("content", json!("logged")),
        )],
        vec![single(Action::new("return").with("value", Value::Null))],
    ]);
    let mut config = base_config(dir.path());
    config.agents.push(agent("writer", "main", "Write."));
    let rt = runtime(config, provider);
    let runner = AgentRunner::new(Arc::clone(&rt));
    let agent = rt.agent("writer").unwrap();

    runner
        .handle(agent, "main", json!({"input": "write it"}))
        .await
        .unwrap();

    let records = rt.store.read_dialogue().unwrap();
    assert!(
        records
            .iter()
            .any(|r| r["type"] == json!("commit") && r["files"][0].as_str().is_some()),
        "commit must be logged to dialogue.jsonl: {records:?}"
    );
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{ActionItem, LlmProvider, PlaybookRequest};

/// A pre-scripted provider.  Each call to `next_actions` pops the next batch
/// from the front of the queue; each `call_json` pops the next answer.  This
/// lets tests specify exact decision sequences without network access.
pub struct ScriptedProvider {
    batches: Mutex<VecDeque<Vec<ActionItem>>>,
    json_answers: Mutex<VecDeque<Value>>,
    text_answers: Mutex<VecDeque<String>>,
    /// Number of `next_actions` calls observed.
    pub calls: AtomicUsize,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<PlaybookRequest>>>,
}

impl ScriptedProvider {
    pub fn new(batches: Vec<Vec<ActionItem>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            json_answers: Mutex::new(VecDeque::new()),
            text_answers: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_json_answers(self, answers: Vec<Value>) -> Self {
        *self.json_answers.lock().unwrap() = answers.into();
        self
    }

    pub fn with_text_answers(self, answers: Vec<String>) -> Self {
        *self.text_answers.lock().unwrap() = answers.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn next_actions(&self, req: PlaybookRequest) -> anyhow::Result<Vec<ActionItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        match self.batches.lock().unwrap().pop_front() {
            Some(batch) => Ok(batch),
            None => anyhow::bail!("scripted provider exhausted"),
        }
    }

    async fn call_json(&self, _prompt: &str) -> anyhow::Result<Value> {
        match self.json_answers.lock().unwrap().pop_front() {
            Some(v) => Ok(v),
            None => Ok(Value::Object(Default::default())),
        }
    }

    async fn complete_text(&self, prompt: &str, _label: &str) -> anyhow::Result<String> {
        match self.text_answers.lock().unwrap().pop_front() {
            Some(t) => Ok(t),
            // Deterministic fallback: a clipped echo, so summary consumers
            // always receive non-empty text.
            None => Ok(prompt.chars().take(80).collect()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{AbortSignal, Action};

    fn request() -> PlaybookRequest {
        PlaybookRequest {
            playbook: String::new(),
            agent_name: "t".into(),
            transcript: vec![],
            actions: vec![],
            delegation_targets: vec![],
            mcp_tools: vec![],
            is_first_call: true,
            thinking_hint: None,
            is_delegate: false,
            abort: AbortSignal::new(),
        }
    }

    #[tokio::test]
    async fn batches_pop_in_order() {
        let p = ScriptedProvider::new(vec![
            vec![Action::new("print").into()],
            vec![Action::new("return").into()],
        ]);
        let first = p.next_actions(request()).await.unwrap();
        match &first[0] {
            ActionItem::Single(a) => assert_eq!(a.intent, "print"),
            _ => panic!(),
        }
        let second = p.next_actions(request()).await.unwrap();
        match &second[0] {
            ActionItem::Single(a) => assert_eq!(a.intent, "return"),
            _ => panic!(),
        }
        assert_eq!(p.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let p = ScriptedProvider::new(vec![]);
        assert!(p.next_actions(request()).await.is_err());
    }

    #[tokio::test]
    async fn json_answers_pop_then_default_to_empty_object() {
        let p = ScriptedProvider::new(vec![]).with_json_answers(vec![json!({"answer": "meters"})]);
        assert_eq!(p.call_json("q").await.unwrap()["answer"], json!("meters"));
        assert!(p.call_json("q").await.unwrap().as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_request_is_recorded() {
        let p = ScriptedProvider::new(vec![vec![]]);
        let mut req = request();
        req.thinking_hint = Some("next: read".into());
        p.next_actions(req).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().thinking_hint.as_deref(), Some("next: read"));
    }
}

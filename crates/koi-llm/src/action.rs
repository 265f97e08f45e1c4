// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Top-level keys that are structural, not payload.  Everything else on a
/// delegate action is folded into its `data` object during normalisation.
pub const RESERVED_KEYS: &[&str] = &["actionType", "intent", "id"];

/// Fields that identify "the same action" for loop detection.  The order is
/// fixed so canonical keys are deterministic across runs.
const KEY_FIELDS: &[&str] = &[
    "tool", "path", "file", "key", "query", "pattern", "command", "data", "input",
];

/// How an action is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Executed by a registered action definition.
    Direct,
    /// Routed to another agent via the resolution cascade.
    Delegate,
}

/// A single decision emitted by the model: an intent plus intent-specific
/// fields.  The wire form is a flat JSON object; `intent`, `actionType` and
/// `id` are structural, every other key lands in `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub intent: String,
    pub action_type: Option<ActionKind>,
    pub id: Option<String>,
    pub fields: Map<String, Value>,
}

impl Action {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            action_type: None,
            id: None,
            fields: Map::new(),
        }
    }

    pub fn delegate(intent: impl Into<String>) -> Self {
        let mut a = Self::new(intent);
        a.action_type = Some(ActionKind::Delegate);
        a
    }

    /// Builder-style field setter for tests and synthetic actions.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.action_type, Some(ActionKind::Delegate))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Deterministic canonicalisation of the action's identifying fields.
    /// Two actions with the same key are "the same action" to the loop
    /// detectors regardless of field ordering in the wire form.
    pub fn canonical_key(&self) -> String {
        let mut key = self.intent.clone();
        for field in KEY_FIELDS {
            if let Some(v) = self.fields.get(*field) {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                key.push('|');
                key.push_str(field);
                key.push('=');
                key.push_str(&rendered);
            }
        }
        key
    }

    /// The target a failure is attributed to: the first present identifying
    /// field after the intent (usually a path or command).
    pub fn failure_target(&self) -> String {
        for field in KEY_FIELDS {
            if let Some(v) = self.fields.get(*field) {
                return match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
        String::new()
    }

    /// Delegate normalisation: when a delegate action carries no `data`
    /// field, collect every non-reserved key into a fresh `data` object so
    /// the callee receives one payload blob.
    pub fn normalize_delegate_data(&mut self) {
        if !self.is_delegate() || self.fields.contains_key("data") {
            return;
        }
        let mut data = Map::new();
        let keys: Vec<String> = self.fields.keys().cloned().collect();
        for k in keys {
            if let Some(v) = self.fields.remove(&k) {
                data.insert(k, v);
            }
        }
        self.fields.insert("data".to_string(), Value::Object(data));
    }

    /// Direct-action lift: shallow-copy `data` keys onto the top level where
    /// the top level has no value yet.  Models sometimes wrap arguments in a
    /// `data` envelope even for direct actions.
    pub fn lift_data(&mut self) {
        if self.is_delegate() {
            return;
        }
        let data = match self.fields.get("data") {
            Some(Value::Object(m)) => m.clone(),
            _ => return,
        };
        for (k, v) in data {
            self.fields.entry(k).or_insert(v);
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        map.insert("intent".to_string(), Value::String(self.intent.clone()));
        if let Some(kind) = self.action_type {
            let tag = match kind {
                ActionKind::Direct => "direct",
                ActionKind::Delegate => "delegate",
            };
            map.insert("actionType".to_string(), Value::String(tag.to_string()));
        }
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        action_from_value(value).map_err(D::Error::custom)
    }
}

fn action_from_value(value: Value) -> Result<Action, String> {
    let mut map = match value {
        Value::Object(m) => m,
        other => return Err(format!("action must be a JSON object, got {other}")),
    };
    let intent = match map.remove("intent") {
        Some(Value::String(s)) => s,
        Some(other) => return Err(format!("intent must be a string, got {other}")),
        None => return Err("action is missing 'intent'".to_string()),
    };
    let action_type = match map.remove("actionType") {
        Some(Value::String(s)) => match s.as_str() {
            "direct" => Some(ActionKind::Direct),
            "delegate" => Some(ActionKind::Delegate),
            other => return Err(format!("unknown actionType: {other}")),
        },
        Some(other) => return Err(format!("actionType must be a string, got {other}")),
        None => None,
    };
    let id = match map.remove("id") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => return Err(format!("id must be a string, got {other}")),
        None => None,
    };
    Ok(Action {
        intent,
        action_type,
        id,
        fields: map,
    })
}

/// One entry in the batch returned by the model: a single action or a
/// parallel group whose children run concurrently.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionItem {
    Single(Action),
    Parallel(Vec<Action>),
}

impl ActionItem {
    pub fn single(action: Action) -> Self {
        Self::Single(action)
    }
}

impl From<Action> for ActionItem {
    fn from(a: Action) -> Self {
        Self::Single(a)
    }
}

impl Serialize for ActionItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Single(a) => a.serialize(serializer),
            Self::Parallel(actions) => {
                let mut map = Map::new();
                map.insert(
                    "parallel".to_string(),
                    serde_json::to_value(actions).map_err(serde::ser::Error::custom)?,
                );
                Value::Object(map).serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for ActionItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = match &value {
            Value::Object(m) => m,
            _ => return Err(D::Error::custom("action item must be a JSON object")),
        };
        if let Some(children) = obj.get("parallel") {
            let list = children
                .as_array()
                .ok_or_else(|| D::Error::custom("'parallel' must be an array"))?;
            let actions = list
                .iter()
                .cloned()
                .map(action_from_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(D::Error::custom)?;
            return Ok(Self::Parallel(actions));
        }
        action_from_value(value)
            .map(Self::Single)
            .map_err(D::Error::custom)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(v: Value) -> Action {
        serde_json::from_value(v).unwrap()
    }

    // ── Wire form ─────────────────────────────────────────────────────────────

    #[test]
    fn flat_object_parses_into_fields() {
        let a = parse(json!({"intent": "grep", "pattern": "TODO", "path": "src"}));
        assert_eq!(a.intent, "grep");
        assert_eq!(a.get_str("pattern"), Some("TODO"));
        assert_eq!(a.get_str("path"), Some("src"));
    }

    #[test]
    fn action_type_and_id_are_structural() {
        let a = parse(json!({"intent": "compute", "actionType": "delegate", "id": "a1", "x": 1}));
        assert!(a.is_delegate());
        assert_eq!(a.id.as_deref(), Some("a1"));
        assert!(!a.fields.contains_key("actionType"));
        assert!(!a.fields.contains_key("id"));
    }

    #[test]
    fn missing_intent_is_an_error() {
        let r: Result<Action, _> = serde_json::from_value(json!({"path": "src"}));
        assert!(r.is_err());
    }

    #[test]
    fn unknown_action_type_is_an_error() {
        let r: Result<Action, _> =
            serde_json::from_value(json!({"intent": "x", "actionType": "sideways"}));
        assert!(r.is_err());
    }

    #[test]
    fn serialisation_round_trips() {
        let a = parse(json!({"intent": "shell", "actionType": "direct", "command": "ls"}));
        let v = serde_json::to_value(&a).unwrap();
        let b: Action = serde_json::from_value(v).unwrap();
        assert_eq!(a, b);
    }

    // ── Parallel groups ───────────────────────────────────────────────────────

    #[test]
    fn parallel_wrapper_parses_to_group() {
        let item: ActionItem = serde_json::from_value(json!({
            "parallel": [
                {"intent": "grep", "pattern": "TODO", "path": "src"},
                {"intent": "read_file", "path": "src/main"}
            ]
        }))
        .unwrap();
        match item {
            ActionItem::Parallel(actions) => {
                assert_eq!(actions.len(), 2);
                assert_eq!(actions[0].intent, "grep");
            }
            _ => panic!("expected parallel group"),
        }
    }

    #[test]
    fn plain_object_parses_to_single() {
        let item: ActionItem = serde_json::from_value(json!({"intent": "print", "text": "hi"})).unwrap();
        assert!(matches!(item, ActionItem::Single(_)));
    }

    #[test]
    fn parallel_must_be_array() {
        let r: Result<ActionItem, _> = serde_json::from_value(json!({"parallel": "nope"}));
        assert!(r.is_err());
    }

    // ── Canonical keys ────────────────────────────────────────────────────────

    #[test]
    fn canonical_key_is_field_order_independent() {
        let a = parse(json!({"intent": "grep", "pattern": "x", "path": "src"}));
        let b = parse(json!({"intent": "grep", "path": "src", "pattern": "x"}));
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn canonical_key_distinguishes_targets() {
        let a = parse(json!({"intent": "read_file", "path": "a.txt"}));
        let b = parse(json!({"intent": "read_file", "path": "b.txt"}));
        assert_ne!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn canonical_key_ignores_non_identifying_fields() {
        let a = parse(json!({"intent": "shell", "command": "ls", "comment": "first try"}));
        let b = parse(json!({"intent": "shell", "command": "ls", "comment": "second try"}));
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn failure_target_prefers_identifying_field() {
        let a = parse(json!({"intent": "grep", "pattern": "x", "path": "src"}));
        // "path" precedes "pattern" in the fixed field order, so it wins.
        assert_eq!(a.failure_target(), "src");
    }

    // ── Normalisation ─────────────────────────────────────────────────────────

    #[test]
    fn delegate_without_data_collects_payload() {
        let mut a = parse(json!({
            "intent": "compute", "actionType": "delegate", "id": "t1",
            "value": 42, "unit": "m"
        }));
        a.normalize_delegate_data();
        let data = a.get("data").unwrap().as_object().unwrap();
        assert_eq!(data["value"], json!(42));
        assert_eq!(data["unit"], json!("m"));
        assert!(!a.fields.contains_key("value"));
    }

    #[test]
    fn delegate_with_data_is_untouched() {
        let mut a = parse(json!({
            "intent": "compute", "actionType": "delegate",
            "data": {"value": 1}, "stray": true
        }));
        a.normalize_delegate_data();
        assert_eq!(a.get("data").unwrap()["value"], json!(1));
        assert_eq!(a.get("stray"), Some(&json!(true)));
    }

    #[test]
    fn direct_lift_copies_only_missing_keys() {
        let mut a = parse(json!({
            "intent": "write_file", "path": "top.txt",
            "data": {"path": "inner.txt", "content": "hello"}
        }));
        a.lift_data();
        assert_eq!(a.get_str("path"), Some("top.txt"), "top level wins");
        assert_eq!(a.get_str("content"), Some("hello"), "missing key lifted");
    }

    #[test]
    fn lift_skips_delegates() {
        let mut a = parse(json!({
            "intent": "x", "actionType": "delegate", "data": {"k": 1}
        }));
        a.lift_data();
        assert!(!a.fields.contains_key("k"));
    }
}

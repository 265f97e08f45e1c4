// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Read one key from the persistent registry.
pub struct KvGetAction;

#[async_trait]
impl ActionDefinition for KvGetAction {
    fn intent(&self) -> &str {
        "kv_get"
    }

    fn description(&self) -> &str {
        "Read a value from the persistent key/value registry. Returns null \
         for missing keys."
    }

    fn permission(&self) -> Permission {
        Permission::RegistryRead
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "key": { "type": "string" } },
            "required": ["key"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(key) = action.get_str("key") else {
            return Ok(ActionEffect::Value(failure("kv_get requires 'key'", None)));
        };
        let value = cx.kv.get(key)?.unwrap_or(Value::Null);
        Ok(ActionEffect::Value(success(json!({ "key": key, "value": value }))))
    }
}

/// Write one key to the persistent registry.
pub struct KvSetAction;

#[async_trait]
impl ActionDefinition for KvSetAction {
    fn intent(&self) -> &str {
        "kv_set"
    }

    fn description(&self) -> &str {
        "Write a value into the persistent key/value registry. Last writer \
         wins."
    }

    fn permission(&self) -> Permission {
        Permission::RegistryWrite
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": { "description": "Any JSON value" }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let (Some(key), Some(value)) = (action.get_str("key"), action.get("value")) else {
            return Ok(ActionEffect::Value(failure(
                "kv_set requires 'key' and 'value'",
                None,
            )));
        };
        cx.kv.set(key, value.clone())?;
        Ok(ActionEffect::Value(success(json!({ "key": key }))))
    }
}

/// Query the registry with a search document (`$eq`, `$gt`, `$in`, `$regex`
/// and friends; dot paths for nested fields).
pub struct KvSearchAction;

#[async_trait]
impl ActionDefinition for KvSearchAction {
    fn intent(&self) -> &str {
        "kv_search"
    }

    fn description(&self) -> &str {
        "Search the persistent registry with a query document. Leaf values \
         are literals or operator records ($eq, $ne, $gt, $gte, $lt, $lte, \
         $in, $regex); nested fields via dot notation."
    }

    fn permission(&self) -> Permission {
        Permission::RegistryRead
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "object", "description": "The search document" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(query) = action.get("query") else {
            return Ok(ActionEffect::Value(failure(
                "kv_search requires a 'query' document",
                None,
            )));
        };
        let hits: Vec<Value> = cx
            .kv
            .search(query)?
            .into_iter()
            .map(|hit| json!({ "key": hit.key, "value": hit.value }))
            .collect();
        Ok(ActionEffect::Value(success(json!({
            "count": hits.len(),
            "hits": hits,
        }))))
    }
}

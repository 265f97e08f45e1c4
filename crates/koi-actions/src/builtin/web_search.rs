// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Results returned per query.
const MAX_RESULTS: usize = 8;

/// Web search via the Brave Search API, falling back to Tavily when only
/// that key is configured.  Keys come from `BRAVE_SEARCH_API_KEY` /
/// `TAVILY_API_KEY`.
pub struct WebSearchAction;

fn api_keys() -> (Option<String>, Option<String>) {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    (read("BRAVE_SEARCH_API_KEY"), read("TAVILY_API_KEY"))
}

#[async_trait]
impl ActionDefinition for WebSearchAction {
    fn intent(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return result titles, URLs and snippets. \
         Requires BRAVE_SEARCH_API_KEY or TAVILY_API_KEY to be set."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" }
            },
            "required": ["query"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("query").map(|q| format!("searching the web for {q}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(query) = action.get_str("query") else {
            return Ok(ActionEffect::Value(failure(
                "web_search requires a 'query'",
                None,
            )));
        };

        let (brave, tavily) = api_keys();
        let timeout = Duration::from_secs(cx.tools.web_fetch_timeout_secs);
        debug!(query, "web_search");

        if let Some(key) = brave {
            return Ok(ActionEffect::Value(brave_search(query, &key, timeout).await));
        }
        if let Some(key) = tavily {
            return Ok(ActionEffect::Value(tavily_search(query, &key, timeout).await));
        }
        Ok(ActionEffect::Value(failure(
            "no web search backend configured",
            Some("set BRAVE_SEARCH_API_KEY or TAVILY_API_KEY and retry"),
        )))
    }
}

async fn brave_search(query: &str, key: &str, timeout: Duration) -> Value {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return failure(format!("http client error: {e}"), None),
    };
    let response = client
        .get("https://api.search.brave.com/res/v1/web/search")
        .header("X-Subscription-Token", key)
        .header("Accept", "application/json")
        .query(&[("q", query), ("count", "8")])
        .send()
        .await;
    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => return failure(format!("search returned HTTP {}", r.status()), None),
        Err(e) => return failure(format!("search failed: {e}"), None),
    };
    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return failure(format!("malformed search response: {e}"), None),
    };
    let results: Vec<Value> = body["web"]["results"]
        .as_array()
        .map(|list| {
            list.iter()
                .take(MAX_RESULTS)
                .map(|r| {
                    json!({
                        "title": r["title"],
                        "url": r["url"],
                        "snippet": r["description"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    success(json!({ "results": results, "count": results.len() }))
}

async fn tavily_search(query: &str, key: &str, timeout: Duration) -> Value {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return failure(format!("http client error: {e}"), None),
    };
    let response = client
        .post("https://api.tavily.com/search")
        .json(&json!({ "api_key": key, "query": query, "max_results": MAX_RESULTS }))
        .send()
        .await;
    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => return failure(format!("search returned HTTP {}", r.status()), None),
        Err(e) => return failure(format!("search failed: {e}"), None),
    };
    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return failure(format!("malformed search response: {e}"), None),
    };
    let results: Vec<Value> = body["results"]
        .as_array()
        .map(|list| {
            list.iter()
                .take(MAX_RESULTS)
                .map(|r| {
                    json!({
                        "title": r["title"],
                        "url": r["url"],
                        "snippet": r["content"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    success(json!({ "results": results, "count": results.len() }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    #[tokio::test]
    async fn missing_query_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = WebSearchAction
            .execute(&Action::new("web_search"), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
    }

    #[tokio::test]
    async fn missing_keys_name_the_env_vars() {
        // Guard against ambient keys leaking into the test environment.
        std::env::remove_var("BRAVE_SEARCH_API_KEY");
        std::env::remove_var("TAVILY_API_KEY");
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let action = Action::new("web_search").with("query", json!("rust"));
        let v = WebSearchAction.execute(&action, &cx).await.unwrap().as_value();
        assert!(is_failure(&v));
        assert!(v["fix"].as_str().unwrap().contains("BRAVE_SEARCH_API_KEY"));
    }
}

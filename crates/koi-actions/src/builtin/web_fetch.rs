// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Body bytes kept before truncation.
const BODY_LIMIT_BYTES: usize = 100_000;

pub struct WebFetchAction;

#[async_trait]
impl ActionDefinition for WebFetchAction {
    fn intent(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the response body as text. \
         Bodies are truncated at ~100 KB."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch" }
            },
            "required": ["url"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("url").map(|u| format!("fetching {u}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(url) = action.get_str("url") else {
            return Ok(ActionEffect::Value(failure(
                "missing required parameter 'url'",
                None,
            )));
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(ActionEffect::Value(failure(
                format!("unsupported URL scheme: {url}"),
                Some("only http:// and https:// are supported"),
            )));
        }

        debug!(url, "web_fetch");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cx.tools.web_fetch_timeout_secs))
            .build()?;

        let response = tokio::select! {
            biased;
            _ = cx.abort.cancelled() => {
                return Ok(ActionEffect::Value(failure("fetch aborted by user", None)));
            }
            outcome = client.get(url).send() => match outcome {
                Ok(r) => r,
                Err(e) => {
                    return Ok(ActionEffect::Value(failure(
                        format!("fetch failed: {e}"),
                        Some("check the URL or try again later"),
                    )))
                }
            },
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let truncated = body.len() > BODY_LIMIT_BYTES;
        let body = if truncated {
            body[..BODY_LIMIT_BYTES].to_string()
        } else {
            body
        };

        if (200..300).contains(&status) {
            Ok(ActionEffect::Value(success(json!({
                "status": status,
                "body": body,
                "truncated": truncated,
            }))))
        } else {
            Ok(ActionEffect::Value(failure(
                format!("HTTP {status} from {url}"),
                None,
            )))
        }
    }
}

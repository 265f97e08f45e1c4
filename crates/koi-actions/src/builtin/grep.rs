// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use koi_llm::Action;
use koi_session::AccessLevel;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Matches returned before the list is cut off.
const MAX_MATCHES: usize = 200;

pub struct GrepAction;

#[async_trait]
impl ActionDefinition for GrepAction {
    fn intent(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents under a path with a regular expression. \
         Returns 'file:line: text' matches, capped at 200."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "File or directory to search" }
            },
            "required": ["pattern", "path"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("pattern").map(|p| format!("searching for {p}"))
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let (Some(pattern), Some(path)) = (action.get_str("pattern"), action.get_str("path"))
        else {
            return Ok(ActionEffect::Value(failure(
                "grep requires 'pattern' and 'path'",
                None,
            )));
        };

        let root = Path::new(path);
        if !root.exists() {
            return Ok(ActionEffect::Value(failure(
                format!("no such path: {path}"),
                Some("list the parent directory to find the right path"),
            )));
        }
        if let Some(deny) = cx.ensure_allowed(root, AccessLevel::Read).await? {
            return Ok(ActionEffect::Value(deny));
        }

        let regex = match regex::Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                return Ok(ActionEffect::Value(failure(
                    format!("invalid pattern: {e}"),
                    Some("escape regex metacharacters or simplify the pattern"),
                )))
            }
        };

        debug!(pattern, path, "grep");
        let mut matches = Vec::new();
        let mut truncated = false;
        'files: for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= MAX_MATCHES {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(format!("{}:{}: {}", entry.path().display(), number + 1, line));
                }
            }
        }

        Ok(ActionEffect::Value(success(json!({
            "matches": matches,
            "count": matches.len(),
            "truncated": truncated,
        }))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    fn grep(pattern: &str, path: &std::path::Path) -> Action {
        Action::new("grep")
            .with("pattern", json!(pattern))
            .with("path", json!(path.to_string_lossy()))
    }

    #[tokio::test]
    async fn finds_matches_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let sub = dir.path().join("src");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("a.rs"), "// TODO: fix this\nfn main() {}\n").unwrap();
        std::fs::write(sub.join("b.rs"), "nothing here\n").unwrap();
        let v = GrepAction.execute(&grep("TODO", &sub), &cx).await.unwrap().as_value();
        assert_eq!(v["count"], json!(1));
        assert!(v["matches"][0].as_str().unwrap().contains("a.rs:1:"));
    }

    #[tokio::test]
    async fn missing_path_fails_softly_with_fix() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let ghost = dir.path().join("ghost");
        let v = GrepAction.execute(&grep("x", &ghost), &cx).await.unwrap().as_value();
        assert!(is_failure(&v));
        assert!(v["fix"].is_string());
    }

    #[tokio::test]
    async fn invalid_regex_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = GrepAction
            .execute(&grep("[unclosed", dir.path()), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
        assert!(v["error"].as_str().unwrap().contains("invalid pattern"));
    }
}

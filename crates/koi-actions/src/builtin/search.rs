// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use koi_llm::Action;
use koi_session::AccessLevel;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

const MAX_RESULTS: usize = 200;

/// File-name search: case-insensitive substring match over paths.
pub struct SearchAction;

#[async_trait]
impl ActionDefinition for SearchAction {
    fn intent(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Find files by name under a path (case-insensitive substring match \
         against the file name). Use grep to search file contents."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Name fragment to look for" },
                "path": { "type": "string", "description": "Directory to search under" }
            },
            "required": ["query", "path"]
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let (Some(query), Some(path)) = (action.get_str("query"), action.get_str("path")) else {
            return Ok(ActionEffect::Value(failure(
                "search requires 'query' and 'path'",
                None,
            )));
        };

        let root = Path::new(path);
        if !root.is_dir() {
            return Ok(ActionEffect::Value(failure(
                format!("not a directory: {path}"),
                Some("pass a directory to search under"),
            )));
        }
        if let Some(deny) = cx.ensure_allowed(root, AccessLevel::Read).await? {
            return Ok(ActionEffect::Value(deny));
        }

        let needle = query.to_lowercase();
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.contains(&needle) {
                files.push(entry.path().display().to_string());
                if files.len() >= MAX_RESULTS {
                    break;
                }
            }
        }

        Ok(ActionEffect::Value(success(json!({
            "files": files,
            "count": files.len(),
        }))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    #[tokio::test]
    async fn matches_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let sub = dir.path().join("tree");
        std::fs::create_dir_all(sub.join("nested")).unwrap();
        std::fs::write(sub.join("Makefile"), "").unwrap();
        std::fs::write(sub.join("nested").join("makefile.bak"), "").unwrap();
        std::fs::write(sub.join("other.rs"), "").unwrap();
        let action = Action::new("search")
            .with("query", json!("makefile"))
            .with("path", json!(sub.to_string_lossy()));
        let v = SearchAction.execute(&action, &cx).await.unwrap().as_value();
        assert_eq!(v["count"], json!(2));
    }

    #[tokio::test]
    async fn non_directory_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let action = Action::new("search")
            .with("query", json!("x"))
            .with("path", json!(dir.path().join("nope").to_string_lossy()));
        let v = SearchAction.execute(&action, &cx).await.unwrap().as_value();
        assert!(is_failure(&v));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use koi_llm::Action;

use crate::{failure, success, ActionContext, ActionDefinition, ActionEffect, Permission};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

pub struct ShellAction;

#[async_trait]
impl ActionDefinition for ShellAction {
    fn intent(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout, stderr and the exit code. \
         Prefer non-interactive commands; avoid anything that needs a TTY. \
         Use read_file / grep / search for file operations instead of \
         cat / grep / find. Output is capped at ~20 KB."
    }

    fn permission(&self) -> Permission {
        Permission::Execute
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command line" },
                "workdir": { "type": "string", "description": "Working directory (optional)" }
            },
            "required": ["command"]
        })
    }

    fn thinking_hint(&self, action: &Action) -> Option<String> {
        action.get_str("command").map(|c| {
            let head: String = c.chars().take(40).collect();
            format!("running `{head}`")
        })
    }

    async fn execute(&self, action: &Action, cx: &ActionContext) -> anyhow::Result<ActionEffect> {
        let Some(command) = action.get_str("command") else {
            return Ok(ActionEffect::Value(failure(
                "missing required parameter 'command'",
                None,
            )));
        };

        debug!(command, "shell");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The timeout path drops the future; the child must die with it.
            .kill_on_drop(true);
        if let Some(workdir) = action.get_str("workdir") {
            cmd.current_dir(workdir);
        }

        let timeout = Duration::from_secs(cx.tools.shell_timeout_secs);
        let run = async {
            let output = cmd.output().await?;
            anyhow::Ok(output)
        };
        let output = tokio::select! {
            biased;
            _ = cx.abort.cancelled() => {
                return Ok(ActionEffect::Value(failure("command aborted by user", None)));
            }
            outcome = tokio::time::timeout(timeout, run) => match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Ok(ActionEffect::Value(failure(format!("spawn error: {e}"), None)))
                }
                Err(_) => {
                    return Ok(ActionEffect::Value(failure(
                        format!("command timed out after {}s", timeout.as_secs()),
                        Some("break the work into smaller commands"),
                    )))
                }
            },
        };

        let stdout = clip(&String::from_utf8_lossy(&output.stdout));
        let stderr = clip(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();

        if output.status.success() {
            Ok(ActionEffect::Value(success(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            }))))
        } else {
            let mut value = failure(
                format!("command exited with status {exit_code:?}"),
                Some("inspect stderr and adjust the command"),
            );
            value["stdout"] = Value::String(stdout);
            value["stderr"] = Value::String(stderr);
            value["exit_code"] = json!(exit_code);
            Ok(ActionEffect::Value(value))
        }
    }
}

fn clip(text: &str) -> String {
    if text.len() <= OUTPUT_LIMIT_BYTES {
        return text.to_string();
    }
    let cut = text[..OUTPUT_LIMIT_BYTES]
        .rfind('\n')
        .unwrap_or(OUTPUT_LIMIT_BYTES);
    format!(
        "{}\n[... {} bytes omitted ...]",
        &text[..cut],
        text.len() - cut
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::test_context;
    use crate::is_failure;

    fn shell(command: &str) -> Action {
        Action::new("shell").with("command", json!(command))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = ShellAction
            .execute(&shell("echo hello-koi"), &cx)
            .await
            .unwrap()
            .as_value();
        assert_eq!(v["success"], json!(true));
        assert!(v["stdout"].as_str().unwrap().contains("hello-koi"));
        assert_eq!(v["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_soft_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let v = ShellAction
            .execute(&shell("echo oops >&2; exit 3"), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
        assert!(v["stderr"].as_str().unwrap().contains("oops"));
        assert_eq!(v["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut cx = test_context(dir.path());
        cx.tools.shell_timeout_secs = 1;
        let started = std::time::Instant::now();
        let v = ShellAction
            .execute(&shell("sleep 30"), &cx)
            .await
            .unwrap()
            .as_value();
        assert!(is_failure(&v));
        assert!(v["error"].as_str().unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn workdir_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let cx = test_context(dir.path());
        let action = shell("pwd").with("workdir", json!(dir.path().to_string_lossy()));
        let v = ShellAction.execute(&action, &cx).await.unwrap().as_value();
        let reported = v["stdout"].as_str().unwrap().trim();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            std::fs::canonicalize(reported).unwrap(),
            expected
        );
    }

    #[test]
    fn clip_preserves_short_output() {
        assert_eq!(clip("short"), "short");
    }

    #[test]
    fn clip_truncates_long_output_at_line_boundary() {
        let long = "line\n".repeat(10_000);
        let clipped = clip(&long);
        assert!(clipped.len() < long.len());
        assert!(clipped.contains("omitted"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use koi_actions::{PermissionReply, Prompter};
use koi_config::{AgentSpec, Config};
use koi_core::{AgentEvent, AgentRunner, CommandRouter, RuntimeContext, FAST_GREETING_MARKER};
use koi_llm::{LlmProvider, ScriptedProvider};
use koi_session::{AccessLevel, SessionTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = koi_config::load(cli.config.as_deref())?;

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        Some(Commands::History) => {
            return show_history(&config);
        }
        Some(Commands::Checkout { hash }) => {
            return checkout(&config, hash);
        }
        _ => {}
    }

    // Bare `koi` with no configured agents still works: synthesise a
    // general-purpose one so the greeting loop has somewhere to go.
    if config.agents.is_empty() {
        let mut spec = AgentSpec {
            name: "koi".to_string(),
            ..Default::default()
        };
        spec.handlers.insert(
            "main".to_string(),
            format!("{FAST_GREETING_MARKER}\nYou are a helpful general-purpose assistant."),
        );
        config.agents.push(spec);
    }

    let provider = build_provider(&config)?;
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter);
    let rt = RuntimeContext::build(config, provider, prompter)?;
    rt.set_command_router(Arc::new(SlashCommands {
        rt: Arc::downgrade(&rt),
    }));

    // Ctrl-C raises the process-wide abort signal; the loop checks it at
    // the top of every iteration and exits silently.
    let abort = rt.abort.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    // Status line consumer for loop events.
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);
    rt.set_event_sink(events_tx);
    let verbose = cli.verbose;
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                AgentEvent::Pivot { attempt, max } => {
                    eprintln!("· pivoting strategy ({attempt}/{max})");
                }
                AgentEvent::SessionCommitted { hash, files } => {
                    eprintln!("· committed {files} file(s) as {hash}");
                }
                AgentEvent::ActionStarted { intent, hint } if verbose => {
                    let hint = hint.unwrap_or_default();
                    eprintln!("· {intent} {hint}");
                }
                _ => {}
            }
        }
    });

    let (event, input) = match cli.command {
        Some(Commands::Run { event, input }) => (event, input),
        _ => ("main".to_string(), None),
    };
    let agent_name = cli
        .agent
        .or_else(|| rt.config.agents.first().map(|a| a.name.clone()))
        .context("no agent configured")?;
    let agent = rt
        .agent(&agent_name)
        .with_context(|| format!("unknown agent: {agent_name}"))?;

    let args = match input {
        Some(text) => serde_json::json!({ "input": text }),
        None => serde_json::Value::Null,
    };

    debug!(agent = %agent_name, %event, "starting reactive loop");
    let runner = AgentRunner::new(Arc::clone(&rt));
    let result = runner.handle(agent, &event, args).await?;
    if !result.is_null() {
        println!("{result}");
    }
    rt.mcp.shutdown().await;
    Ok(())
}

/// Tracing setup: `KOI_LOG_FILE` appends structured logs to a file;
/// `--verbose` mirrors them to stderr.  With neither, logging is off so the
/// interactive prompt stays clean.
fn init_logging(verbose: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_file = std::env::var("KOI_LOG_FILE").ok().filter(|p| !p.is_empty());

    let file_layer = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(|file| {
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_filter(filter())
            })
    });
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_filter(filter()));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

/// The LLM adapters are external collaborators plugged in through
/// [`LlmProvider`]; the binary itself ships only the deterministic offline
/// provider.
fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn LlmProvider>> {
    match config.llm.provider.as_str() {
        "scripted" | "mock" => Ok(Arc::new(ScriptedProvider::new(vec![]))),
        other => anyhow::bail!(
            "LLM provider '{other}' is not bundled with this binary; link an \
             adapter crate implementing LlmProvider, or set `llm.provider: scripted` \
             for the offline mode"
        ),
    }
}

// ── Terminal prompter ─────────────────────────────────────────────────────────

/// Line-oriented prompter over stdin/stdout.
struct TerminalPrompter;

fn read_stdin_line() -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[async_trait]
impl Prompter for TerminalPrompter {
    fn print(&self, text: &str) {
        println!("{text}");
    }

    async fn prompt_user(&self, message: &str) -> anyhow::Result<String> {
        print!("{message} ");
        std::io::stdout().flush().ok();
        tokio::task::spawn_blocking(read_stdin_line).await?
    }

    async fn confirm_permission(
        &self,
        dir: &Path,
        level: AccessLevel,
    ) -> anyhow::Result<PermissionReply> {
        print!("Allow {level} access to {}? [y/a/N] ", dir.display());
        std::io::stdout().flush().ok();
        let answer = tokio::task::spawn_blocking(read_stdin_line).await??;
        Ok(match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => PermissionReply::Yes,
            "a" | "always" => PermissionReply::Always,
            _ => PermissionReply::No,
        })
    }
}

// ── Slash commands ────────────────────────────────────────────────────────────

/// The built-in command table behind the `prompt_user` surface.  A command's
/// output is re-fed to the loop as if the user had answered normally.
struct SlashCommands {
    rt: Weak<RuntimeContext>,
}

#[async_trait]
impl CommandRouter for SlashCommands {
    async fn route(
        &self,
        input: &str,
        _agent: &koi_core::Agent,
    ) -> anyhow::Result<Option<String>> {
        let Some(rt) = self.rt.upgrade() else {
            return Ok(None);
        };
        let mut parts = input.trim_start_matches('/').split_whitespace();
        match parts.next() {
            Some("help") => Ok(Some(
                "Available commands: /help, /history, /checkout <hash>, /quit. \
                 Tell the user about them and await the next instruction."
                    .to_string(),
            )),
            Some("history") => {
                let mut lines = Vec::new();
                for commit in rt.tracker.history() {
                    lines.push(format!(
                        "{} {} ({} files)",
                        commit.hash,
                        commit.summary,
                        commit.changed_files.len()
                    ));
                }
                if lines.is_empty() {
                    lines.push("no commits yet".to_string());
                }
                for line in &lines {
                    rt.prompter.print(line);
                }
                Ok(Some(
                    "The session history was shown to the user. Await the next instruction."
                        .to_string(),
                ))
            }
            Some("checkout") => match parts.next() {
                Some(hash) => {
                    // Show what the revert would do before touching the tree.
                    if let Ok(diff) = rt.tracker.commit_diff(hash) {
                        rt.prompter.print(&diff);
                    }
                    match rt.tracker.checkout_commit(hash) {
                        Ok(commit) => Ok(Some(format!(
                            "The working tree was restored to commit {} ({}). \
                             Confirm this with the user.",
                            commit.hash, commit.summary
                        ))),
                        Err(e) => Ok(Some(format!("Checkout failed: {e}. Tell the user."))),
                    }
                }
                None => Ok(Some("Usage shown: /checkout <hash>.".to_string())),
            },
            Some("quit") => {
                rt.abort.abort();
                Ok(Some(String::new()))
            }
            _ => Ok(None),
        }
    }
}

// ── History / checkout subcommands ────────────────────────────────────────────

fn session_dir(config: &Config) -> anyhow::Result<PathBuf> {
    let root = config.session.resolved_project_root().join(".koi").join("sessions");
    if let Some(id) = config.session.resolved_session_id() {
        return Ok(root.join(id));
    }
    // No explicit session: pick the most recently used one.
    let mut dirs: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(&root)
        .with_context(|| format!("no sessions under {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    dirs.sort_by_key(|(modified, _)| *modified);
    dirs.pop()
        .map(|(_, path)| path)
        .context("no sessions recorded yet")
}

fn show_history(config: &Config) -> anyhow::Result<()> {
    let tracker = SessionTracker::open(session_dir(config)?)?;
    let history = tracker.history();
    if history.is_empty() {
        println!("no commits yet");
        return Ok(());
    }
    for commit in history {
        println!(
            "{}  {}  {}  ({} files)",
            commit.hash,
            commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
            commit.summary,
            commit.changed_files.len()
        );
    }
    Ok(())
}

fn checkout(config: &Config, hash: &str) -> anyhow::Result<()> {
    let tracker = SessionTracker::open(session_dir(config)?)?;
    println!("{}", tracker.commit_diff(hash)?);
    let commit = tracker.checkout_commit(hash)?;
    println!("restored working tree to {} ({})", commit.hash, commit.summary);
    Ok(())
}

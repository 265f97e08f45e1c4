// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// koi: an LLM agent runtime with a reactive action loop, tiered context
/// memory, and session-tracked file changes.
#[derive(Parser, Debug)]
#[command(name = "koi", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered ones).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr in addition to KOI_LOG_FILE.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Agent to talk to; defaults to the first configured agent.
    #[arg(long, short = 'a', global = true)]
    pub agent: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the interactive loop (the default when no subcommand is given).
    Run {
        /// Event to invoke on the agent.
        #[arg(long, default_value = "main")]
        event: String,
        /// Initial user input; when omitted the agent greets and waits.
        input: Option<String>,
    },

    /// List the session's commit history.
    History,

    /// Restore the working tree to a prior session commit.
    Checkout {
        /// Commit hash from `koi history`.
        hash: String,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default number of failed messages shown by `inspect`.
const DEFAULT_INSPECT_LIMIT: usize = 10;

/// Default number of failed messages moved by `requeue`.
const DEFAULT_REQUEUE_LIMIT: usize = 100;

/// Forward-progress tooling for the mailpipe pipeline.
#[derive(Parser, Debug)]
#[command(name = "mailpipe")]
#[command(about = "Retry scheduler and failed-queue tooling for the mailpipe pipeline")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Without it, `config/default.toml`,
    /// `config/$MAILPIPE_ENV.toml` and `MAILPIPE__*` variables are read.
    #[arg(short, long, global = true, env = "MAILPIPE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the retry scheduler periodically until SIGINT/SIGTERM.
    Serve,

    /// Run a single scheduler pass and print its report.
    RunOnce,

    /// Show failed messages without removing them.
    Inspect {
        /// Topic or failed queue name (`json.parsed` or `json.parsed.failed`).
        queue: String,

        /// Maximum number of messages to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_INSPECT_LIMIT)]
        limit: usize,
    },

    /// Move failed messages back to their topic.
    Requeue {
        /// Topic or failed queue name.
        queue: String,

        /// Maximum number of messages to move.
        #[arg(short = 'n', long, default_value_t = DEFAULT_REQUEUE_LIMIT)]
        limit: usize,
    },

    /// Discard every message in a failed queue.
    Purge {
        /// Topic or failed queue name.
        queue: String,
    },

    /// Apply pending database migrations.
    Migrate,
}

//! Diagnostics CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::RecoveryOptions;
use crate::journal::{EntrySnapshot, JournalSnapshot, OperationStatus};
use crate::telemetry::LogFormat;

/// Command line of the `filesafe` binary.
#[derive(Parser)]
#[command(name = "filesafe")]
#[command(about = "filesafe recovery diagnostics", long_about = None)]
pub struct Cli {
    /// Log output format: text or json.
    #[arg(long, default_value = "text", env = "FILESAFE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// What to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Loads and validates a recovery options file, then prints the effective options.
    CheckConfig {
        /// TOML or JSON options file.
        path: PathBuf,
    },
    /// Decodes a journal snapshot and prints its entries as JSON.
    InspectJournal {
        /// Snapshot file written from `JournalSnapshot::to_bytes`.
        path: PathBuf,
        /// Only print entries that are still pending.
        #[arg(long)]
        pending: bool,
    },
}

#[derive(Debug, Serialize)]
struct JournalReport<'a> {
    taken_ms: u64,
    total: usize,
    pending: usize,
    entries: Vec<&'a EntrySnapshot>,
}

impl Cli {
    /// Runs the selected command, returning what it would print.
    pub fn run(&self) -> Result<String> {
        match &self.command {
            Command::CheckConfig { path } => check_config(path),
            Command::InspectJournal { path, pending } => inspect_journal(path, *pending),
        }
    }
}

/// Validates an options file and renders the effective options as JSON.
pub fn check_config(path: &Path) -> Result<String> {
    let options = RecoveryOptions::from_file(path)
        .with_context(|| format!("invalid options file {}", path.display()))?;
    tracing::info!(path = %path.display(), "options valid");
    Ok(serde_json::to_string_pretty(&options)?)
}

/// Renders a journal snapshot file as JSON.
pub fn inspect_journal(path: &Path, pending_only: bool) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot = JournalSnapshot::from_bytes(&bytes)?;
    let pending = snapshot.pending().count();
    let entries = snapshot
        .entries
        .iter()
        .filter(|e| !pending_only || e.status == OperationStatus::Pending)
        .collect();
    let report = JournalReport {
        taken_ms: snapshot.taken_ms,
        total: snapshot.entries.len(),
        pending,
        entries,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

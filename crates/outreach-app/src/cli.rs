//! CLI argument definitions for the `outreach` binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Outreach - decides whom to contact about what, and learns from the reply.
#[derive(Parser, Debug)]
#[command(name = "outreach", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every sweep on its interval until Ctrl-C.
    Run,
    /// Run one pass of every sweep and print the summary.
    Sweep,
    /// Classify a reply with the pattern tables.
    Classify { text: String },
    /// Show which goal the planner would pick for a contact right now.
    Plan { contact_id: Uuid },
    /// Per-goal attempt stats and the lifecycle distribution.
    Report,
    /// Play a scripted conversation against a contact without touching the
    /// database. An empty `--reply ""` lets the reply window lapse.
    Rehearse {
        contact_id: Uuid,
        #[arg(long = "reply")]
        replies: Vec<String>,
    },
    /// Feed an inbound reply from a contact and print the response.
    Reply { contact_id: Uuid, text: String },
    /// Close an escalated attempt after handling it by hand.
    Resolve {
        attempt_id: Uuid,
        /// Record the escalation as declined instead of successful.
        #[arg(long)]
        declined: bool,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Validate a goal catalog file without saving it.
    ValidateGoals { path: PathBuf },
    /// Validate a goal catalog file and store it as the active catalog.
    ImportGoals { path: PathBuf },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > OUTREACH_CONFIG env var > ~/.outreach/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("OUTREACH_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory: --data-dir flag > config file value.
    pub fn resolve_data_dir(&self, config_data_dir: &str) -> PathBuf {
        match &self.data_dir {
            Some(p) => p.clone(),
            None => expand_home(config_data_dir),
        }
    }

    /// Resolve the log level: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME");
    home.ok().map(PathBuf::from)
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".outreach").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = path
        .strip_prefix("~/")
        .or_else(|| path.strip_prefix("~\\"));
    match (rest, home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        (Some(rest), None) => Path::new(".").join(rest),
        _ => PathBuf::from(path),
    }
}

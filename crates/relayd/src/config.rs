//! Configuration for relayd

use clap::Parser;
use std::path::PathBuf;

/// relayd - guild log relay daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "Guild log relay: sequencing, subscriptions, retention, checkpoints")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 7447)]
    pub port: u16,

    /// Database path for persistent storage
    #[arg(long, env = "DB", default_value = "./relay-db")]
    pub db: PathBuf,

    /// Wipe the database path before starting
    #[arg(long)]
    pub clean: bool,

    /// Keep the log in memory only (no persistence)
    #[arg(long)]
    pub memory: bool,

    /// Relay name reported in HELLO_OK
    #[arg(long, default_value = "relayd")]
    pub relay_name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.memory && self.db.as_os_str().is_empty() {
            anyhow::bail!("DB path cannot be empty");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log format must be json or pretty");
        }
        Ok(())
    }

    /// In-memory relay on an ephemeral port, for tests and local runs
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            db: PathBuf::new(),
            clean: false,
            memory: true,
            relay_name: "relayd".into(),
            verbose: false,
            log_format: "pretty".into(),
        }
    }
}

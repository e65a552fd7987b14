use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::scheduler::DEFAULT_MAX_TASKS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory files are copied from
    pub source_dir: PathBuf,

    /// Directory files are copied to
    pub dest_dir: PathBuf,

    /// File holding the names to copy, one per line
    pub file_list: PathBuf,

    /// Maximum number of concurrently running copies
    pub max_tasks: usize,

    /// How often running copies are checked on
    pub tick_interval: Duration,

    /// How often the file list is re-read
    pub rescan_interval: Duration,

    /// Wait between termination signals when stopping a copy
    pub stop_grace: Duration,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("/var/spool/copy/incoming"),
            dest_dir: PathBuf::from("/var/spool/copy/outgoing"),
            file_list: PathBuf::from("/var/spool/copy/files"),
            max_tasks: DEFAULT_MAX_TASKS,
            tick_interval: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(30),
            stop_grace: Duration::from_millis(10),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Load config from environment and a `.env` file
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by whatever `lookup` knows about.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(dir) = lookup("COPY_SOURCE_DIR") {
            config.source_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("COPY_DEST_DIR") {
            config.dest_dir = PathBuf::from(dir);
        }

        if let Some(list) = lookup("COPY_FILE_LIST") {
            config.file_list = PathBuf::from(list);
        }

        if let Some(tasks) = lookup("COPY_MAX_TASKS") {
            config.max_tasks = tasks
                .parse()
                .with_context(|| format!("invalid COPY_MAX_TASKS: {tasks}"))?;
        }

        if let Some(interval) = lookup("COPY_TICK_INTERVAL") {
            config.tick_interval = parse_duration("COPY_TICK_INTERVAL", &interval)?;
        }

        if let Some(interval) = lookup("COPY_RESCAN_INTERVAL") {
            config.rescan_interval = parse_duration("COPY_RESCAN_INTERVAL", &interval)?;
        }

        if let Some(grace) = lookup("COPY_STOP_GRACE") {
            config.stop_grace = parse_duration("COPY_STOP_GRACE", &grace)?;
        }

        if let Some(level) = lookup("COPY_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(json) = lookup("COPY_JSON_LOGS") {
            config.json_logs = json
                .parse()
                .with_context(|| format!("invalid COPY_JSON_LOGS: {json}"))?;
        }

        Ok(config)
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_tasks == 0 {
            bail!("COPY_MAX_TASKS must be at least 1");
        }
        if self.tick_interval.is_zero() || self.rescan_interval.is_zero() {
            bail!("tick and rescan intervals must be non-zero");
        }
        for dir in [&self.source_dir, &self.dest_dir] {
            if !dir.is_dir() {
                bail!("not a directory: {}", dir.display());
            }
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {key}: {value}"))
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

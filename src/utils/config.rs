use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP port
    pub port: u16,

    pub database_url: String,

    /// Path or name of the borg executable
    pub borg_binary: String,

    /// Transitions kept in the in-memory history
    pub history_capacity: usize,

    pub progress_queue_capacity: usize,

    pub event_channel_capacity: usize,

    /// How long borg waits for a repository lock before giving up
    pub lock_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|p| p.join("backup-orchestrator"))
            .unwrap_or_else(|| ".".into());

        Self {
            port: 8899,
            database_url: format!("sqlite://{}", data_dir.join("orchestrator.db").display()),
            borg_binary: "borg".to_string(),
            history_capacity: 1000,
            progress_queue_capacity: 64,
            event_channel_capacity: 256,
            lock_wait: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Defaults, then `.env`, then the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(port) = lookup("ORCH_PORT") {
            config.port = parse("ORCH_PORT", &port)?;
        }

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(binary) = lookup("BORG_BINARY") {
            config.borg_binary = binary;
        }

        if let Some(size) = lookup("TRANSITION_HISTORY_SIZE") {
            config.history_capacity = parse("TRANSITION_HISTORY_SIZE", &size)?;
        }

        if let Some(size) = lookup("PROGRESS_QUEUE_SIZE") {
            config.progress_queue_capacity = parse("PROGRESS_QUEUE_SIZE", &size)?;
        }

        if let Some(size) = lookup("EVENT_CHANNEL_SIZE") {
            config.event_channel_capacity = parse("EVENT_CHANNEL_SIZE", &size)?;
        }

        if let Some(wait) = lookup("BORG_LOCK_WAIT") {
            config.lock_wait = humantime::parse_duration(&wait)
                .with_context(|| format!("invalid BORG_LOCK_WAIT: {}", wait))?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid {}: {}", key, value))
}

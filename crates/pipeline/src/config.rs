//! Environment configuration for the pipeline binary.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::analysis::ai::AiConfig;
use crate::queue::{JobOptions, LocalQueueConfig};
use crate::sync::SyncConfig;

/// Everything the binary needs, read once at startup
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub database_pool_size: usize,
    /// Base64 AES-256 key for account secrets; only needed to talk to IMAP
    pub credentials_key: Option<String>,
    pub ai: AiConfig,
    pub sync: SyncConfig,
    /// Messages fetched per sync pass
    pub fetch_limit: u32,
    pub analysis_job: JobOptions,
    pub queue: LocalQueueConfig,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        let ai = AiConfig {
            base_url: lookup("AI_BASE_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: lookup("AI_MODEL").unwrap_or_else(|| "llama3.1".to_string()),
            api_key: lookup("AI_API_KEY").filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(parse_or(&lookup, "AI_TIMEOUT_SECS", 60)?),
            max_input_chars: parse_or(&lookup, "AI_MAX_INPUT_CHARS", 8000)?,
        };

        let sync = SyncConfig {
            mailbox: lookup("SYNC_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            poll_interval: Duration::from_secs(parse_or(&lookup, "SYNC_INTERVAL_SECS", 300)?),
            rate_limit: Duration::from_secs(parse_or(&lookup, "SYNC_RATE_LIMIT_SECS", 60)?),
        };

        let analysis_job = JobOptions {
            max_retry: parse_or(&lookup, "ANALYSIS_MAX_RETRY", 5)?,
            timeout: Duration::from_secs(parse_or(&lookup, "ANALYSIS_TIMEOUT_SECS", 120)?),
        };

        let queue = LocalQueueConfig {
            workers: parse_or(&lookup, "QUEUE_WORKERS", 4)?,
            capacity: parse_or(&lookup, "QUEUE_CAPACITY", 1024)?,
            retry_base: Duration::from_millis(parse_or(&lookup, "QUEUE_RETRY_BASE_MS", 1000)?),
            ..LocalQueueConfig::default()
        };
        anyhow::ensure!(queue.workers > 0, "QUEUE_WORKERS must be at least 1");
        anyhow::ensure!(queue.capacity > 0, "QUEUE_CAPACITY must be at least 1");

        Ok(Self {
            database_url,
            database_pool_size: parse_or(&lookup, "DATABASE_POOL_SIZE", 10)?,
            credentials_key: lookup("CREDENTIALS_KEY").filter(|k| !k.is_empty()),
            ai,
            sync,
            fetch_limit: parse_or(&lookup, "SYNC_FETCH_LIMIT", 50)?,
            analysis_job,
            queue,
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, value)),
        _ => Ok(default),
    }
}

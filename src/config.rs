//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` reading optional
//! environment variables. Missing variables fall back to the defaults;
//! unparsable ones are rejected.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::durable::retry::RetryPolicy;
use crate::error::ConfigError;

/// Parse `key` from `lookup`, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Upper bound for the inbox record lifetime. Expiry timestamps are compared
/// as RFC 3339 text and must keep a four-digit year.
pub const MAX_INBOX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Ingestion guard settings.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// Handler attempts per delivery when the caller does not specify one.
    pub default_max_retries: u32,
    /// Fixed delay between handler attempts.
    pub retry_delay: Duration,
    /// Best-effort attempts to persist the final status.
    pub finalize_retries: u32,
    /// Delay between finalize attempts.
    pub finalize_delay: Duration,
    /// Lifetime of an inbox record before cleanup may remove it.
    pub ttl: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_delay: Duration::from_millis(500),
            finalize_retries: 3,
            finalize_delay: Duration::from_millis(100),
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl InboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let mut ttl = Duration::from_secs(parse_var(lookup, "INBOX_TTL_SECS", d.ttl.as_secs())?);
        if ttl > MAX_INBOX_TTL {
            warn!(requested = ?ttl, max = ?MAX_INBOX_TTL, "INBOX_TTL_SECS too large, clamping");
            ttl = MAX_INBOX_TTL;
        }
        Ok(Self {
            default_max_retries: parse_var(lookup, "INBOX_MAX_RETRIES", d.default_max_retries)?,
            retry_delay: Duration::from_millis(parse_var(
                lookup,
                "INBOX_RETRY_DELAY_MS",
                d.retry_delay.as_millis() as u64,
            )?),
            finalize_retries: parse_var(lookup, "INBOX_FINALIZE_RETRIES", d.finalize_retries)?,
            finalize_delay: d.finalize_delay,
            ttl,
        })
    }
}

/// Inbox cleanup scheduler settings.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub schedule: String,
    /// Rows deleted per statement.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_pause: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 0 * * * *".to_string(), // hourly
            batch_size: 1000,
            batch_pause: Duration::from_millis(100),
        }
    }
}

impl CleanupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            enabled: parse_var(lookup, "INBOX_CLEANUP_ENABLED", d.enabled)?,
            schedule: lookup("INBOX_CLEANUP_CRON").unwrap_or(d.schedule),
            batch_size: parse_var(lookup, "INBOX_CLEANUP_BATCH_SIZE", d.batch_size)?,
            batch_pause: Duration::from_millis(parse_var(
                lookup,
                "INBOX_CLEANUP_PAUSE_MS",
                d.batch_pause.as_millis() as u64,
            )?),
        };
        config.cron_schedule()?;
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_CLEANUP_BATCH_SIZE".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(config)
    }

    /// Parse the cron expression.
    pub fn cron_schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.schedule).map_err(|e| ConfigError::InvalidValue {
            key: "INBOX_CLEANUP_CRON".into(),
            message: format!("'{}': {e}", self.schedule),
        })
    }
}

/// Per-thread conversation workflow settings.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub task_queue: String,
    /// Longest wait for a signal while the queue is empty.
    pub idle_interval: Duration,
    /// Start-to-close timeout of one parse attempt.
    pub parse_timeout: Duration,
    pub parse_retry: RetryPolicy,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            task_queue: "rfq-conversations".to_string(),
            idle_interval: Duration::from_secs(5),
            parse_timeout: Duration::from_secs(5 * 60),
            parse_retry: RetryPolicy::default(),
        }
    }
}

impl ConversationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            task_queue: lookup("CONVERSATION_TASK_QUEUE").unwrap_or(d.task_queue),
            idle_interval: Duration::from_secs(parse_var(
                lookup,
                "CONVERSATION_IDLE_SECS",
                d.idle_interval.as_secs(),
            )?),
            parse_timeout: Duration::from_secs(parse_var(
                lookup,
                "PARSE_TIMEOUT_SECS",
                d.parse_timeout.as_secs(),
            )?),
            parse_retry: RetryPolicy {
                maximum_attempts: parse_var(
                    lookup,
                    "PARSE_MAX_ATTEMPTS",
                    d.parse_retry.maximum_attempts,
                )?,
                ..d.parse_retry
            },
        })
    }
}

/// Polling trigger workflow settings.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub enabled: bool,
    pub workflow_id: String,
    pub task_queue: String,
    pub interval: Duration,
    /// Most items fetched per poll.
    pub batch_limit: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workflow_id: "rfq-inbox-poller".to_string(),
            task_queue: "rfq-polling".to_string(),
            interval: Duration::from_secs(60),
            batch_limit: 50,
        }
    }
}

impl PollingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            enabled: parse_var(lookup, "POLL_ENABLED", d.enabled)?,
            workflow_id: d.workflow_id,
            task_queue: d.task_queue,
            interval: Duration::from_secs(parse_var(
                lookup,
                "POLL_INTERVAL_SECS",
                d.interval.as_secs(),
            )?),
            batch_limit: parse_var(lookup, "POLL_BATCH_LIMIT", d.batch_limit)?,
        })
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub inbox: InboxConfig,
    pub cleanup: CleanupConfig,
    pub conversation: ConversationConfig,
    pub polling: PollingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/rfq-intake.db"),
            inbox: InboxConfig::default(),
            cleanup: CleanupConfig::default(),
            conversation: ConversationConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| AppConfig::default().db_path),
            inbox: InboxConfig::from_lookup(lookup)?,
            cleanup: CleanupConfig::from_lookup(lookup)?,
            conversation: ConversationConfig::from_lookup(lookup)?,
            polling: PollingConfig::from_lookup(lookup)?,
        })
    }
}

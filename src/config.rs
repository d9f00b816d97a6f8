use clap::Parser;
use std::time::Duration;

/// attendanced: batch attendance engine sidecar
#[derive(Debug, Clone, Parser)]
#[command(name = "attendanced")]
#[command(version)]
pub struct Cli {
    /// Number of job worker threads started per workspace
    #[arg(long, env = "ATTENDANCED_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Lifetime of a batch lock; must outlast draining the largest roster
    #[arg(long, env = "ATTENDANCED_LOCK_TTL_SECS", default_value_t = 3600)]
    pub lock_ttl_secs: u64,

    /// How long a completion marker stays readable after a batch finishes
    #[arg(long, env = "ATTENDANCED_COMPLETION_RETENTION_SECS", default_value_t = 86_400)]
    pub completion_retention_secs: u64,

    /// Attempts per job before a retryable failure becomes terminal
    #[arg(long, env = "ATTENDANCED_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Base retry delay, doubled after every failed attempt
    #[arg(long, env = "ATTENDANCED_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Idle sleep between queue polls
    #[arg(long, env = "ATTENDANCED_POLL_INTERVAL_MS", default_value_t = 50)]
    pub poll_interval_ms: u64,

    /// Active jobs untouched this long are handed back to the queue
    #[arg(long, env = "ATTENDANCED_STALL_TIMEOUT_SECS", default_value_t = 300)]
    pub stall_timeout_secs: u64,

    /// Emit logs as JSON lines on stderr
    #[arg(long, env = "ATTENDANCED_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub lock_ttl: Duration,
    pub completion_retention: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: 4,
            lock_ttl: Duration::from_secs(3600),
            completion_retention: Duration::from_secs(86_400),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&Cli> for EngineConfig {
    fn from(cli: &Cli) -> Self {
        EngineConfig {
            workers: cli.workers.max(1),
            lock_ttl: Duration::from_secs(cli.lock_ttl_secs),
            completion_retention: Duration::from_secs(cli.completion_retention_secs),
            max_attempts: cli.max_attempts.max(1),
            retry_backoff: Duration::from_millis(cli.retry_backoff_ms),
            poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
            stall_timeout: Duration::from_secs(cli.stall_timeout_secs),
        }
    }
}

impl EngineConfig {
    /// Delay before attempt `attempt + 1`, given `attempt` attempts have failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }
}

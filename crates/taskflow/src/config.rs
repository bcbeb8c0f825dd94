use std::time::Duration;

use crate::jobs::dispatcher::DispatcherConfig;
use crate::jobs::retry::RetryPolicy;
use crate::jobs::worker::WorkerConfig;

// Config is a central place for runtime configuration.
// Values come from the environment (and `.env` via dotenvy).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queue: String,
    pub pool_size: usize,
    pub max_retries: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter_pct: f64,
    pub job_timeout: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub result_ttl: Option<Duration>,
    pub max_payload_bytes: usize,
    pub migrate_on_startup: bool,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("TASKFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("TASKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queue =
            env_or_fallback("TASKFLOW_QUEUE", "QUEUE").unwrap_or_else(|| "default".to_string());

        let cfg = Self {
            database_url,
            worker_id,
            queue,
            pool_size: env_parse("TASKFLOW_POOL_SIZE", "POOL_SIZE").unwrap_or(4),
            max_retries: env_parse("TASKFLOW_MAX_RETRIES", "MAX_RETRIES").unwrap_or(3),
            backoff_base: Duration::from_millis(
                env_parse("TASKFLOW_BACKOFF_BASE_MS", "BACKOFF_BASE_MS").unwrap_or(2_000),
            ),
            backoff_cap: Duration::from_millis(
                env_parse("TASKFLOW_BACKOFF_CAP_MS", "BACKOFF_CAP_MS").unwrap_or(15 * 60 * 1000),
            ),
            backoff_jitter_pct: env_parse("TASKFLOW_BACKOFF_JITTER_PCT", "BACKOFF_JITTER_PCT")
                .unwrap_or(0.20),
            job_timeout: Duration::from_millis(
                env_parse("TASKFLOW_JOB_TIMEOUT_MS", "JOB_TIMEOUT_MS").unwrap_or(10_000),
            ),
            visibility_timeout: Duration::from_secs(
                env_parse("TASKFLOW_VISIBILITY_TIMEOUT_SECS", "VISIBILITY_TIMEOUT_SECS")
                    .unwrap_or(30),
            ),
            poll_interval: Duration::from_millis(
                env_parse("TASKFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS").unwrap_or(250),
            ),
            reap_interval: Duration::from_millis(
                env_parse("TASKFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS").unwrap_or(1_000),
            ),
            result_ttl: env_parse::<u64>("TASKFLOW_RESULT_TTL_SECS", "RESULT_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_payload_bytes: env_parse("TASKFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
                .unwrap_or(256 * 1024),
            migrate_on_startup: env_bool("TASKFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            log_json: env_bool("TASKFLOW_LOG_JSON").unwrap_or(false),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// A job must be able to finish before its lease runs out, or a healthy
    /// worker's job gets redelivered while it is still running.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            anyhow::bail!("POOL_SIZE must be at least 1");
        }
        if self.max_retries < 0 {
            anyhow::bail!("MAX_RETRIES must not be negative");
        }
        if self.job_timeout >= self.visibility_timeout {
            anyhow::bail!(
                "JOB_TIMEOUT_MS ({}ms) must be shorter than VISIBILITY_TIMEOUT_SECS ({}s)",
                self.job_timeout.as_millis(),
                self.visibility_timeout.as_secs()
            );
        }
        if self.backoff_base > self.backoff_cap {
            anyhow::bail!("BACKOFF_BASE_MS must not exceed BACKOFF_CAP_MS");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: self.backoff_base,
            cap: self.backoff_cap,
            jitter_pct: self.backoff_jitter_pct,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone(),
            queue: self.queue.clone(),
            pool_size: self.pool_size,
            visibility_timeout: self.visibility_timeout,
            job_timeout: self.job_timeout,
            poll_interval: self.poll_interval,
            reap_interval: self.reap_interval,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_queue: self.queue.clone(),
            max_retries: self.max_retries,
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

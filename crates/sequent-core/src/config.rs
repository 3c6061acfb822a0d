//! Engine configuration, assembled once at startup and passed into the
//! engine's constructors.

use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Ignored by loops that retry forever.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay (before jitter).
    pub max_backoff: Duration,
    /// Random extra delay added to each wait, in `[0, jitter]`.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_backoff`, plus jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of commands executing at once across all aggregates.
    pub worker_limit: usize,
    /// How long an idle mailbox lives before it is retired.
    pub mailbox_idle_timeout: Duration,
    /// Timeout applied to commands that do not carry their own.
    pub default_command_timeout: Duration,
    /// Retry policy for optimistic concurrency conflicts.
    pub conflict_retry: RetryPolicy,
    /// Backoff policy for failed publications (retried indefinitely).
    pub publish_retry: RetryPolicy,
    /// Snapshots waiting to be written before new ones are dropped.
    pub snapshot_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_limit: 64,
            mailbox_idle_timeout: Duration::from_secs(60),
            default_command_timeout: Duration::from_secs(30),
            conflict_retry: RetryPolicy {
                max_retries: 5,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(500),
                jitter: Duration::from_millis(10),
            },
            publish_retry: RetryPolicy {
                max_retries: 0,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(10),
                jitter: Duration::from_millis(50),
            },
            snapshot_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Reads overrides from `SEQUENT_*` environment variables on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if a variable is set but does
    /// not parse.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    ///
    /// Recognized keys: `SEQUENT_WORKER_LIMIT`, `SEQUENT_MAILBOX_IDLE_MS`,
    /// `SEQUENT_COMMAND_TIMEOUT_MS`, `SEQUENT_CONFLICT_RETRIES`,
    /// `SEQUENT_CONFLICT_BACKOFF_MS`, `SEQUENT_PUBLISH_BACKOFF_MS`,
    /// `SEQUENT_PUBLISH_MAX_BACKOFF_MS`, `SEQUENT_SNAPSHOT_QUEUE`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if a value does not parse or
    /// `SEQUENT_WORKER_LIMIT` is zero.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str| -> Result<Option<Duration>, EngineError> {
            Ok(parse::<u64>(&lookup, key)?.map(Duration::from_millis))
        };

        if let Some(limit) = parse::<usize>(&lookup, "SEQUENT_WORKER_LIMIT")? {
            if limit == 0 {
                return Err(EngineError::Misconfiguration(
                    "SEQUENT_WORKER_LIMIT must be greater than zero".to_owned(),
                ));
            }
            config.worker_limit = limit;
        }
        if let Some(idle) = millis("SEQUENT_MAILBOX_IDLE_MS")? {
            config.mailbox_idle_timeout = idle;
        }
        if let Some(timeout) = millis("SEQUENT_COMMAND_TIMEOUT_MS")? {
            config.default_command_timeout = timeout;
        }
        if let Some(retries) = parse::<u32>(&lookup, "SEQUENT_CONFLICT_RETRIES")? {
            config.conflict_retry.max_retries = retries;
        }
        if let Some(backoff) = millis("SEQUENT_CONFLICT_BACKOFF_MS")? {
            config.conflict_retry.initial_backoff = backoff;
        }
        if let Some(backoff) = millis("SEQUENT_PUBLISH_BACKOFF_MS")? {
            config.publish_retry.initial_backoff = backoff;
        }
        if let Some(backoff) = millis("SEQUENT_PUBLISH_MAX_BACKOFF_MS")? {
            config.publish_retry.max_backoff = backoff;
        }
        if let Some(capacity) = parse::<usize>(&lookup, "SEQUENT_SNAPSHOT_QUEUE")? {
            config.snapshot_queue_capacity = capacity;
        }
        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, EngineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| EngineError::Misconfiguration(format!("{key} is invalid: {e}")))
        })
        .transpose()
}

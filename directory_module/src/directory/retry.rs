//! Transient-fault retry wrapper for directory calls.

use std::env;
use std::thread;
use std::time::Duration;

use tracing::warn;

use super::{DirectoryClient, DirectoryError, FetchedMessage, ReplyMessage};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Exponential-backoff policy for transient directory failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = env::var("DIRECTORY_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_attempts);
        let base_delay = env::var("DIRECTORY_RETRY_BASE_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.base_delay);
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the retry that follows attempt `attempt` (zero-based).
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Decorator adding retry around any [`DirectoryClient`].
///
/// Only transient failures (transport errors, 429, 5xx) are retried;
/// everything else returns to the caller on the first attempt.
pub struct RetryingDirectory<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: DirectoryClient> RetryingDirectory<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn run<T>(
        &self,
        label: &'static str,
        call: impl Fn(&C) -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let mut attempt = 0;
        loop {
            match call(&self.inner) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "directory {} failed on attempt {}/{}, retrying in {:?}: {}",
                        label,
                        attempt + 1,
                        self.policy.max_attempts,
                        delay,
                        err
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<C: DirectoryClient> DirectoryClient for RetryingDirectory<C> {
    fn fetch_message_by_id(
        &self,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, DirectoryError> {
        self.run("fetch_message_by_id", |client| {
            client.fetch_message_by_id(message_id)
        })
    }

    fn resolve_user_id(&self, address: &str) -> Result<Option<String>, DirectoryError> {
        self.run("resolve_user_id", |client| client.resolve_user_id(address))
    }

    fn send_reply(
        &self,
        user_id: &str,
        message_id: &str,
        reply: &ReplyMessage,
    ) -> Result<(), DirectoryError> {
        self.run("send_reply", |client| {
            client.send_reply(user_id, message_id, reply)
        })
    }
}

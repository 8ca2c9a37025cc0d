//! In-process token bucket limiter keyed by (user, provider).
//!
//! The contract is "no more than N calls per window to provider P for user
//! U". A distributed deployment would swap this for a shared limiter behind
//! the same acquire call.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::types::Source;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

/// Per-(user, provider) token buckets. `acquire` waits for a token; `try_acquire`
/// reports how long the caller would have to wait.
pub struct RateLimiter {
    configs: HashMap<String, RateLimitConfig>,
    buckets: Mutex<HashMap<(String, Source), Bucket>>,
}

impl RateLimiter {
    pub fn new(configs: HashMap<String, RateLimitConfig>) -> Self {
        Self {
            configs,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn config_for(&self, source: Source) -> Option<RateLimitConfig> {
        self.configs.get(source.as_str()).copied()
    }

    /// Take a token if available, else return the seconds to wait for one.
    pub async fn try_acquire(
        &self,
        user: &str,
        source: Source,
        clock: &dyn Clock,
    ) -> Result<(), f64> {
        let Some(config) = self.config_for(source) else {
            // Unconfigured providers are unlimited.
            return Ok(());
        };

        let now = clock.now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((user.to_string(), source))
            .or_insert_with(|| Bucket {
                tokens: config.capacity as f64,
                last_refill: now,
            });

        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens =
            (bucket.tokens + elapsed * config.refill_per_sec).min(config.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / config.refill_per_sec.max(1e-9);
            Err(wait)
        }
    }

    /// Wait for a token, sleeping between attempts. Respects the caller's
    /// cancellation token.
    pub async fn acquire(
        &self,
        user: &str,
        source: Source,
        clock: &dyn Clock,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            match self.try_acquire(user, source, clock).await {
                Ok(()) => return Ok(()),
                Err(wait_secs) => {
                    let sleep = std::time::Duration::from_secs_f64(wait_secs.min(5.0).max(0.01));
                    tokio::select! {
                        _ = cancel.cancelled() => anyhow::bail!("cancelled while rate limited"),
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
            }
        }
    }
}

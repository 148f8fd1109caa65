//! Exponential backoff used to redial brokers.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Exponential backoff with jitter and a total elapsed-time ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First retry interval
    pub initial_interval: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Jitter as a fraction of the interval (0.0 disables it)
    pub randomization: f64,
    /// Upper bound of a single interval
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

impl ExponentialBackoff {
    /// Backoff that stops retrying after `max_elapsed`.
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed,
            ..Default::default()
        }
    }

    /// Interval before retry number `attempt` (0-indexed), without jitter.
    pub fn interval(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = self.initial_interval.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(u64::MAX as f64) as u64).min(self.max_interval)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.interval(attempt);
        if self.randomization <= 0.0 {
            return base;
        }
        let base = base.as_secs_f64();
        let delta = base * self.randomization;
        let secs = rand::rng().random_range((base - delta)..=(base + delta));
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `op` until it succeeds or the elapsed-time ceiling is reached.
    ///
    /// The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let wait = self.jittered(attempt);
                    if started.elapsed() + wait > self.max_elapsed {
                        return Err(e);
                    }
                    debug!(attempt, wait = ?wait, error = %e, "operation failed, backing off");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

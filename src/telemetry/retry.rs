use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff: the delay starts at `initial_delay_ms` and
/// doubles per failed attempt up to `max_delay_ms`, with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let initial_delay_ms = initial_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms,
            max_delay_ms: max_delay_ms.max(initial_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt.saturating_sub(1) as u32);
        let delay = self.initial_delay_ms.saturating_mul(exp).min(self.max_delay_ms);

        if self.jitter_pct == 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Run `op` until it succeeds or `max_attempts` is reached. `op` gets
    /// the 1-based attempt number. Returns the last error together with the
    /// number of attempts made.
    pub async fn retry_async<F, Fut, T, E>(&self, mut op: F) -> Result<(T, usize), (E, usize)>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if attempt >= self.max_attempts => return Err((err, attempt)),
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 150, 2_000, 0.0)
    }
}

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{PosmapError, Result};

/// Exponential backoff for transient collaborator failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), with up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Duration::from_secs_f64(capped * (1.0 + jitter)).min(self.max_delay)
    }
}

/// Outcome of one attempt: only `Transient` failures are retried.
pub enum Attempt {
    Transient(PosmapError),
    Fatal(PosmapError),
}

pub fn with_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> std::result::Result<T, Attempt>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(e)) => return Err(e),
            Err(Attempt::Transient(e)) if attempt >= policy.max_retries => {
                return Err(PosmapError::Remote(format!(
                    "{what} failed after {} attempts: {e}",
                    attempt + 1
                )));
            }
            Err(Attempt::Transient(e)) => {
                let delay = policy.delay_for(attempt);
                warn!(what, attempt = attempt + 1, ?delay, error = %e, "transient failure, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

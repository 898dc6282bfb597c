use std::time::Duration;

use rand::Rng;

/// Backoff policy used when rescheduling a retryable job.
///
/// The delay before attempt `n + 1` is
/// `initial_interval * backoff_coefficient ^ (n - 1)`, jittered by
/// `+/- jitter_ratio` and capped at `maximum_interval`. Jitter keeps a
/// burst of failures from synchronizing their retries.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient applied for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval before the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Duration,
    /// Fraction of the computed interval used as the jitter band.
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            jitter_ratio: 0.25,
        }
    }

    /// Delay until the next retry after `attempt` failed attempts
    /// (`attempt` is 1-based: the first failure passes 1).
    ///
    /// When the failing call reported a preferred interval (e.g. an HTTP
    /// Retry-After), that interval acts as a floor.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<Duration>,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));
        let capped = std::cmp::min(base, self.maximum_interval);

        let jittered = self.apply_jitter(capped);

        match preferred_retry_interval {
            Some(preferred) => std::cmp::min(
                std::cmp::max(jittered, preferred),
                self.maximum_interval,
            ),
            None => jittered,
        }
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return interval;
        }
        let band = interval.as_secs_f64() * self.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-band..=band);
        let jittered = (interval.as_secs_f64() + offset).max(0.0);
        std::cmp::min(
            Duration::from_secs_f64(jittered),
            self.maximum_interval,
        )
    }
}

impl Default for RetryPolicy {
    /// Base 2 s doubling per attempt, capped at 5 minutes.
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Duration::from_secs(300),
            jitter_ratio: 0.25,
        }
    }
}

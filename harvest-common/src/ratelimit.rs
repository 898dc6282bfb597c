use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Rate budget for one job kind: at most `max_tokens` starts per `window`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_tokens: u32,
    pub window: Duration,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// While set, the refill rate is halved. Installed when an external
    /// API pushed back with an explicit rate-limit signal.
    penalty_until: Option<Instant>,
}

/// Token bucket consumed before a job is reserved, so a worker never holds
/// a reservation it cannot start within its rate budget.
///
/// Tokens refill continuously at `max_tokens / window`. An external 429
/// (or equivalent) reported through [`TokenBucket::throttle`] halves the
/// refill rate for the next window.
pub struct TokenBucket {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit.max_tokens as f64,
                last_refill: Instant::now(),
                penalty_until: None,
            }),
        }
    }

    /// Take one token, waiting cooperatively until one is available.
    /// Callers wanting cancellation wrap this in `tokio::select!`.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let rate = self.refill_and_rate(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until a full token accrues at the current rate.
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token if immediately available.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill_and_rate(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Record external rate-limit pushback: the refill rate is halved for
    /// the next window.
    pub async fn throttle(&self) {
        let mut state = self.state.lock().await;
        state.penalty_until = Some(Instant::now() + self.limit.window);
        debug!(window = ?self.limit.window, "rate limiter throttled by external signal");
    }

    /// Advance the refill clock and return the current per-second rate.
    fn refill_and_rate(&self, state: &mut BucketState) -> f64 {
        let now = Instant::now();
        let penalized = matches!(state.penalty_until, Some(until) if now < until);
        if !penalized {
            state.penalty_until = None;
        }

        let mut rate = self.limit.max_tokens as f64 / self.limit.window.as_secs_f64();
        if penalized {
            rate /= 2.0;
        }

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(self.limit.max_tokens as f64);
        state.last_refill = now;
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(max_tokens: u32, window_secs: u64) -> TokenBucket {
        TokenBucket::new(RateLimit {
            max_tokens,
            window: Duration::from_secs(window_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_max_then_blocks() {
        let bucket = bucket(3, 60);

        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_the_window() {
        let bucket = bucket(6, 60);
        for _ in 0..6 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);

        // One token accrues every 10 seconds.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = bucket(1, 10);
        bucket.acquire().await;

        let start = Instant::now();
        bucket.acquire().await;
        // Paused clock: the sleep inside acquire auto-advances exactly as
        // far as requested.
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_halves_the_refill_rate() {
        let bucket = bucket(6, 60);
        for _ in 0..6 {
            assert!(bucket.try_acquire().await);
        }
        bucket.throttle().await;

        // Normally 10s per token; penalized it takes 20s.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!bucket.try_acquire().await);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_expires_after_the_window() {
        let bucket = bucket(6, 60);
        for _ in 0..6 {
            assert!(bucket.try_acquire().await);
        }
        bucket.throttle().await;

        // Past the penalty window the full rate applies again.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(bucket.try_acquire().await);
    }
}

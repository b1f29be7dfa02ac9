//! Token-bucket rate governor for outbound REST calls.

use common::TokenBucketConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Continuously refilling token bucket.
///
/// `throttle` suspends the calling task until the bucket holds enough
/// tokens, without blocking unrelated tasks. The bucket is the one piece
/// of state legitimately contended by concurrent REST callers, so the
/// refill-then-debit check runs atomically under a single async lock.
#[derive(Debug)]
pub struct Throttle {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refreshed_at: Instant,
}

impl Throttle {
    /// Create a bucket starting at full steady-state capacity
    #[must_use]
    pub fn new(mut config: TokenBucketConfig) -> Self {
        config.capacity = config.capacity.min(config.max_capacity);
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                refreshed_at: Instant::now(),
            }),
            config,
        }
    }

    /// The configuration this bucket was built from
    #[must_use]
    pub const fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Suspend until the bucket holds at least `cost` tokens, then debit.
    ///
    /// `cost` defaults to the configured per-request cost. Tokens accrue
    /// at `refill_rate` per elapsed millisecond, clamped to the capacity
    /// bound; they never go negative and never exceed `max_capacity`.
    pub async fn throttle(&self, cost: Option<f64>) {
        let cost = cost.unwrap_or(self.config.default_cost);
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed_ms = now.duration_since(state.refreshed_at).as_secs_f64() * 1000.0;
                state.tokens = self
                    .config
                    .capacity
                    .min(state.tokens + elapsed_ms * self.config.refill_rate);
                state.refreshed_at = now;
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.delay_ms.max(1))).await;
        }
    }

    /// Current token count after refill, for inspection in tests
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.refreshed_at).as_secs_f64() * 1000.0;
        state.tokens = self
            .config
            .capacity
            .min(state.tokens + elapsed_ms * self.config.refill_rate);
        state.refreshed_at = now;
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(rate_limit_ms: u64) -> Throttle {
        Throttle::new(TokenBucketConfig::from_rate_limit_ms(rate_limit_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_spends_initial_capacity() {
        let throttle = bucket(1000);
        throttle.throttle(None).await;
        assert!(throttle.available().await < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_waits_for_refill() {
        let throttle = bucket(1000);
        let started = Instant::now();
        throttle.throttle(None).await;
        throttle.throttle(None).await;
        // The second token only accrues after a full rate-limit interval.
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_clamp_at_capacity() {
        let throttle = bucket(100);
        // Idle far longer than needed to refill many tokens.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(throttle.available().await <= throttle.config().capacity + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_larger_than_one_token() {
        let throttle = Throttle::new(TokenBucketConfig {
            refill_rate: 0.001,
            capacity: 5.0,
            delay_ms: 1,
            default_cost: 1.0,
            max_capacity: 1000.0,
        });
        let started = Instant::now();
        // Drain the 5 initial tokens, then ask for 3 more.
        throttle.throttle(Some(5.0)).await;
        throttle.throttle(Some(3.0)).await;
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_serialize_on_credit() {
        let throttle = std::sync::Arc::new(bucket(500));
        let a = throttle.clone();
        let b = throttle.clone();
        let started = Instant::now();
        let (first, second) = tokio::join!(
            async move { a.throttle(None).await },
            async move { b.throttle(None).await },
        );
        drop((first, second));
        // One call proceeds on the initial token, the other waits ~500ms.
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}

// =============================================================================
// Token-bucket limiter for the REST client
// =============================================================================
//
// Two constraints combined: a bucket of N tokens refilled continuously over
// the window, and a minimum spacing between consecutive requests. `acquire`
// sleeps until both are satisfied; it never fails.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_request: Option<Instant>,
}

/// Async token bucket with minimum request spacing.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    window: Duration,
    min_interval: Duration,
}

impl TokenBucket {
    /// `capacity` requests per `window`, at least `min_interval` apart.
    pub fn new(capacity: u32, window: Duration, min_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                last_request: None,
            }),
            capacity: capacity.max(1) as f64,
            window,
            min_interval,
        }
    }

    /// Wait until a request slot is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();

                // Continuous refill at capacity/window.
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                let rate = self.capacity / self.window.as_secs_f64().max(f64::MIN_POSITIVE);
                state.tokens = (state.tokens + elapsed * rate).min(self.capacity);
                state.last_refill = now;

                let spacing_wait = state
                    .last_request
                    .and_then(|last| self.min_interval.checked_sub(now.duration_since(last)))
                    .filter(|d| !d.is_zero());

                if state.tokens >= 1.0 && spacing_wait.is_none() {
                    state.tokens -= 1.0;
                    state.last_request = Some(now);
                    None
                } else {
                    let token_wait = if state.tokens >= 1.0 {
                        Duration::ZERO
                    } else {
                        Duration::from_secs_f64((1.0 - state.tokens) / rate)
                    };
                    Some(token_wait.max(spacing_wait.unwrap_or(Duration::ZERO)))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    trace!(wait_ms = d.as_millis() as u64, "rate limiter backing off");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

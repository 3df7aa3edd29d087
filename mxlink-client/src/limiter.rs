//! Outbound send-rate limiting.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token bucket shared by all sends on one connection.
///
/// Holds up to N tokens (N = configured messages per second) and replenishes
/// the whole bucket once per second. A send proceeds only after taking one
/// token; when the bucket is empty, [`acquire`](Self::acquire) sleeps until
/// the next replenish instead of dropping the request, so queue order is
/// never disturbed.
pub struct RateLimiter {
    capacity: u32,
    state: Mutex<State>,
}

struct State {
    tokens: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        let capacity = messages_per_second.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                tokens: capacity,
                window_start: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping across replenish boundaries as needed.
    ///
    /// Returns `false` without a token if `shutdown` fires first; the lock is
    /// never held across the sleep.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let deadline = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now.duration_since(state.window_start) >= Duration::from_secs(1) {
                    state.tokens = self.capacity;
                    state.window_start = now;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return true;
                }
                state.window_start + Duration::from_secs(1)
            };

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Tokens currently available, for introspection.
    pub fn available(&self) -> u32 {
        self.state.lock().tokens
    }
}

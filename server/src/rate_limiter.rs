//! Shared adaptive rate limiter for AI service calls.
//!
//! One windowed counter row, shared by every concurrent analysis
//! worker and mutated only through compare-and-swap. The ceiling
//! adapts downward when the upstream service throttles us and never
//! recovers on its own; operators reset it deliberately.
//!
//! Failure bias: the limiter fails open. The downstream service's own
//! throttling is the hard limit, so a limiter that cannot read its
//! state must not stall the whole workflow.

use std::sync::Arc;

use crate::{
    server_config::RateLimitConfig,
    store::{LimiterState, LimiterStore},
    util::unix_now,
};

/// Bounded CAS retries before giving up on contention.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn LimiterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn LimiterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// One check-and-increment transition. Allowed increments the
    /// window counter; Denied leaves it untouched.
    pub async fn try_acquire(&self) -> Decision {
        self.try_acquire_at(unix_now()).await
    }

    pub(crate) async fn try_acquire_at(&self, now: i64) -> Decision {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let loaded = match self.store.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!("Rate limit check failed, allowing call: {}", e);
                    return Decision::Allowed;
                }
            };

            let (state, version) = match loaded {
                Some(loaded) => loaded,
                None => {
                    let initial = LimiterState {
                        window_start: now,
                        calls_in_window: 0,
                        max_calls_per_window: self.config.max_calls_per_window,
                    };
                    match self.store.init(initial).await {
                        Ok(created) => created,
                        Err(e) => {
                            tracing::warn!("Rate limiter init failed, allowing call: {}", e);
                            return Decision::Allowed;
                        }
                    }
                }
            };

            // Expired window: the candidate state resets the counter,
            // then the call is counted like any other.
            let candidate = if now - state.window_start >= self.config.window_secs {
                LimiterState {
                    window_start: now,
                    calls_in_window: 0,
                    ..state
                }
            } else {
                state
            };

            if candidate.calls_in_window >= candidate.max_calls_per_window {
                tracing::info!(
                    "Rate limit reached: {}/{} calls this window",
                    candidate.calls_in_window,
                    candidate.max_calls_per_window
                );
                return Decision::Denied;
            }

            let next = LimiterState {
                calls_in_window: candidate.calls_in_window + 1,
                ..candidate
            };
            match self.store.compare_and_swap(version, next).await {
                Ok(true) => return Decision::Allowed,
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Rate limiter CAS failed, allowing call: {}", e);
                    return Decision::Allowed;
                }
            }
        }

        tracing::warn!("Rate limiter contention exhausted CAS attempts, allowing call");
        Decision::Allowed
    }

    /// Lower the ceiling after an upstream throttle event, floored at
    /// the configured minimum. One-directional: nothing in the system
    /// raises it back.
    pub async fn note_throttled(&self) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let loaded = match self.store.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!("Could not apply rate limit backoff: {}", e);
                    return;
                }
            };

            let Some((state, version)) = loaded else {
                // Nothing has called yet; the next acquire initializes
                // from config and a later throttle will lower it.
                return;
            };

            let floor = self.config.min_calls_per_window.max(2);
            let lowered = state
                .max_calls_per_window
                .saturating_sub(self.config.backoff_decrement)
                .max(floor);

            if lowered == state.max_calls_per_window {
                return;
            }

            let next = LimiterState {
                max_calls_per_window: lowered,
                ..state
            };
            match self.store.compare_and_swap(version, next).await {
                Ok(true) => {
                    tracing::info!(
                        "Reduced AI call ceiling to {}/window after throttling",
                        lowered
                    );
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Could not apply rate limit backoff: {}", e);
                    return;
                }
            }
        }
    }

    /// Current counter snapshot for status logging.
    pub async fn status(&self) -> String {
        match self.store.load().await {
            Ok(Some((state, _))) => format!(
                "calls: {}/{} window_start: {}",
                state.calls_in_window, state.max_calls_per_window, state.window_start
            ),
            Ok(None) => "uninitialized".to_string(),
            Err(e) => format!("unavailable ({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn limiter_with(max: u32) -> (Arc<InMemoryStore>, RateLimiter) {
        let store = Arc::new(InMemoryStore::new());
        let config = RateLimitConfig {
            window_secs: 60,
            max_calls_per_window: max,
            backoff_decrement: 2,
            min_calls_per_window: 2,
        };
        (store.clone(), RateLimiter::new(store, config))
    }

    #[tokio::test]
    async fn allows_at_most_k_calls_per_window() {
        let (_, limiter) = limiter_with(3);
        let now = 1_000_000;

        for _ in 0..3 {
            assert_eq!(limiter.try_acquire_at(now).await, Decision::Allowed);
        }
        assert_eq!(limiter.try_acquire_at(now).await, Decision::Denied);
        assert_eq!(limiter.try_acquire_at(now + 30).await, Decision::Denied);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let (_, limiter) = limiter_with(2);
        let now = 1_000_000;

        assert_eq!(limiter.try_acquire_at(now).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now).await, Decision::Denied);

        // A full window later the counter starts over.
        assert_eq!(limiter.try_acquire_at(now + 60).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now + 60).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now + 60).await, Decision::Denied);
    }

    #[tokio::test]
    async fn throttle_lowers_ceiling_and_respects_floor() {
        let (store, limiter) = limiter_with(5);
        let now = 1_000_000;

        // Initialize the row.
        assert_eq!(limiter.try_acquire_at(now).await, Decision::Allowed);

        limiter.note_throttled().await;
        let (state, _) = store.load().await.unwrap().unwrap();
        assert_eq!(state.max_calls_per_window, 3);

        limiter.note_throttled().await;
        limiter.note_throttled().await;
        limiter.note_throttled().await;
        let (state, _) = store.load().await.unwrap().unwrap();
        // Decrements stop at the floor.
        assert_eq!(state.max_calls_per_window, 2);

        // The lowered ceiling binds new acquisitions in a new window.
        assert_eq!(limiter.try_acquire_at(now + 120).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now + 120).await, Decision::Allowed);
        assert_eq!(limiter.try_acquire_at(now + 120).await, Decision::Denied);
    }

    #[tokio::test]
    async fn ceiling_never_rises_without_reset() {
        let (store, limiter) = limiter_with(10);
        let now = 1_000_000;

        assert_eq!(limiter.try_acquire_at(now).await, Decision::Allowed);
        limiter.note_throttled().await;
        let (before, _) = store.load().await.unwrap().unwrap();

        // Window resets and further traffic never raise the ceiling.
        for offset in [60, 120, 180] {
            limiter.try_acquire_at(now + offset).await;
        }
        let (after, _) = store.load().await.unwrap().unwrap();
        assert_eq!(after.max_calls_per_window, before.max_calls_per_window);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let (store, limiter) = limiter_with(1);
        store.set_unavailable(true);

        assert_eq!(limiter.try_acquire().await, Decision::Allowed);
        assert_eq!(limiter.try_acquire().await, Decision::Allowed);

        // Backoff during an outage is a no-op, not an error.
        limiter.note_throttled().await;
    }
}

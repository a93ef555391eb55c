//! Time source used for timestamps, deadlines and backoff sleeps.
//!
//! Every wait in the protocol goes through a [`Clock`] so that timers can be
//! replaced in tests and by the browser bindings (`setTimeout`).

use std::time::Duration;

use futures::future::LocalBoxFuture;

/// A source of wall-clock time and of sleeps.
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Completes after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;
}

/// Native clock backed by the `tokio` timer.
///
/// `now_ms` follows the paused test clock, so deadlines computed in tests line up
/// with the virtual time `tokio::time::sleep` observes.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch_ms: u64,
    started: tokio::time::Instant,
}

#[cfg(not(target_arch = "wasm32"))]
impl TokioClock {
    /// Creates a clock anchored at the current system time.
    #[must_use]
    pub fn new() -> Self {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self {
            epoch_ms,
            started: tokio::time::Instant::now(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_virtual_time() {
        let clock = TokioClock::new();
        let before = clock.now_ms();
        clock.sleep(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_ms() - before, 1_500);
    }
}

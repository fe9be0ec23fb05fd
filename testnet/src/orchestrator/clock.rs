// File: testnet/src/orchestrator/clock.rs
//
// Clock Abstraction
//
// Every deadline in the controller (readiness, finality, block waits, process
// grace periods) reads time through this trait so that tests can drive the
// polling loops with tokio's paused clock instead of real delays.

use std::future::Future;
use std::pin::Pin;
use tokio::time::{self, Duration, Instant};

/// Source of time for deadline-bounded loops.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use posnet_testnet::orchestrator::clock::{Clock, SystemClock};
///
/// #[tokio::main]
/// async fn main() {
///     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
///     let start = clock.now();
///     clock.sleep(Duration::from_millis(10)).await;
///     assert!(clock.now() - start >= Duration::from_millis(10));
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Sleeps for the given duration.
    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Wall-clock time, used by every real testnet.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

/// Paused clock for tests.
///
/// Works with `#[tokio::test(start_paused = true)]`: sleeping auto-advances
/// the runtime clock once every task is idle, so a 120 second readiness
/// deadline elapses instantly.
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use posnet_testnet::orchestrator::clock::{Clock, PausedClock};
///
/// #[tokio::test(start_paused = true)]
/// async fn test_deadline() {
///     let clock = Arc::new(PausedClock::new());
///     let start = clock.now();
///     clock.advance(Duration::from_secs(90)).await;
///     assert_eq!(clock.now() - start, Duration::from_secs(90));
/// }
/// ```
#[derive(Debug)]
pub struct PausedClock;

impl PausedClock {
    /// Clock for a runtime whose time is already paused
    /// (`start_paused = true`).
    pub fn new() -> Self {
        Self
    }

    /// Pauses tokio time, then returns the clock.
    ///
    /// Must be called from a current-thread runtime whose time is running;
    /// tokio panics if it is already paused.
    pub fn pause() -> Self {
        time::pause();
        Self
    }

    /// Moves simulated time forward, waking expired sleeps.
    pub async fn advance(&self, d: Duration) {
        time::advance(d).await
    }
}

impl Clock for PausedClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

impl Default for PausedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_paused_clock_advancement() {
        let clock = Arc::new(PausedClock::pause());
        let start = clock.now();

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(1));

        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_sleep_auto_advances() {
        let clock = PausedClock;
        let start = clock.now();

        clock.sleep(Duration::from_secs(60)).await;

        assert!(clock.now() - start >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_system_clock_sleep() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let start = clock.now();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(clock.now() - start >= Duration::from_millis(5));
    }
}

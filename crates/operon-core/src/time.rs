//! Time abstraction for testable timing behavior.
//!
//! Backoff schedules, alert cooldowns, and failure-rate windows all depend
//! on wall-clock time. Injecting a [`Clock`] lets production code use the
//! system clock while tests advance virtual time deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`] and call
/// `advance` instead of sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System clock backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Both the monotonic instant and the wall-clock timestamp advance together
/// under explicit control. `sleep` advances the clock instead of waiting.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Milliseconds advanced since construction.
    elapsed_ms: Arc<AtomicU64>,
    /// Wall-clock origin.
    epoch: DateTime<Utc>,
    /// Monotonic origin.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock anchored at a specific wall-clock time.
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self { elapsed_ms: Arc::new(AtomicU64::new(0)), epoch, base_instant: Instant::now() }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.elapsed_ms.load(Ordering::Acquire);
        self.epoch + chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

/// A fixed wall-clock origin useful for reproducible test fixtures.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid fixed epoch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::starting_at(test_epoch());
        let start_instant = clock.now();
        let start_utc = clock.now_utc();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(start_instant), Duration::from_secs(90));
        assert_eq!(clock.now_utc() - start_utc, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::starting_at(test_epoch());

        clock.sleep(Duration::from_secs(300)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(300));
    }

    #[test]
    fn clones_share_the_same_timeline() {
        let clock = TestClock::starting_at(test_epoch());
        let other = clock.clone();

        clock.advance(Duration::from_secs(10));

        assert_eq!(other.elapsed(), Duration::from_secs(10));
    }
}

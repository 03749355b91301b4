//! Process-wide request spacing.
//!
//! The source blocks an origin that polls too often, so every fetch from
//! every worker passes through one [`RateGate`]. The gate remembers when the
//! last request was released and makes the next caller wait out the rest of
//! the minimum delay. Callers queue on the mutex, so releases are strictly
//! serialised.

use super::{FetchError, RawPage, ReportSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::trace;

/// Time source for the gate; swapped for a fake in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, dur: Duration);
}

/// Wall clock backed by the Tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

pub struct RateGate {
    min_delay: Duration,
    clock: Arc<dyn Clock>,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_delay: Duration) -> Self {
        Self::with_clock(min_delay, Arc::new(TokioClock))
    }

    pub fn with_clock(min_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_delay,
            clock,
            last: Mutex::new(None),
        }
    }

    /// Wait until a request may be issued, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = self.clock.now().saturating_duration_since(prev);
            if elapsed < self.min_delay {
                let wait = self.min_delay - elapsed;
                trace!("rate gate: waiting {:?}", wait);
                self.clock.sleep(wait).await;
            }
        }
        *last = Some(self.clock.now());
    }
}

// ── Gated source ──────────────────────────────────────────────────────────────

/// Wraps a [`ReportSource`] so every fetch first passes the shared gate.
pub struct RateLimited<S> {
    inner: S,
    gate: Arc<RateGate>,
}

impl<S: ReportSource> RateLimited<S> {
    pub fn new(inner: S, gate: Arc<RateGate>) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl<S: ReportSource> ReportSource for RateLimited<S> {
    async fn fetch(&self, date: &str, page: u32) -> Result<RawPage, FetchError> {
        self.gate.acquire().await;
        self.inner.fetch(date, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Clock whose time only moves when someone sleeps (or on `advance`).
    struct FakeClock {
        origin: Instant,
        offset: StdMutex<Duration>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset: StdMutex::new(Duration::ZERO),
            }
        }

        fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap()
        }

        fn advance(&self, dur: Duration) {
            *self.offset.lock().unwrap() += dur;
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }

        async fn sleep(&self, dur: Duration) {
            self.advance(dur);
        }
    }

    #[tokio::test]
    async fn test_consecutive_acquires_are_spaced() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::with_clock(Duration::from_secs(1), clock.clone());

        for _ in 0..5 {
            gate.acquire().await;
        }

        assert!(clock.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_first_acquire_does_not_wait() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::with_clock(Duration::from_secs(1), clock.clone());
        gate.acquire().await;
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_idle_time_counts_towards_delay() {
        let clock = Arc::new(FakeClock::new());
        let gate = RateGate::with_clock(Duration::from_secs(1), clock.clone());

        gate.acquire().await;
        clock.advance(Duration::from_millis(700));
        gate.acquire().await;

        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shared_gate_serialises_concurrent_callers() {
        let clock = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::with_clock(Duration::from_secs(1), clock.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(clock.elapsed() >= Duration::from_secs(7));
    }

    struct InstantSource;

    #[async_trait]
    impl ReportSource for InstantSource {
        async fn fetch(&self, _date: &str, _page: u32) -> Result<RawPage, FetchError> {
            Ok(RawPage { status: 200, body: String::new() })
        }
    }

    #[tokio::test]
    async fn test_gated_source_spaces_fetches() {
        let clock = Arc::new(FakeClock::new());
        let gate = Arc::new(RateGate::with_clock(Duration::from_secs(1), clock.clone()));
        let source = RateLimited::new(InstantSource, gate);

        for page in 1..=6 {
            source.fetch("2018-08-01", page).await.unwrap();
        }

        assert!(clock.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wall_clock_spacing() {
        let gate = Arc::new(RateGate::new(Duration::from_millis(25)));
        let source = RateLimited::new(InstantSource, gate);
        let start = Instant::now();

        for page in 1..=4 {
            source.fetch("2018-08-01", page).await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(75));
    }
}

//! Three-state circuit breaker gating outbound protocol calls.
//!
//! Deliberate design choice: context-cancellation and
//! deadline-exceeded are treated as neither a success nor a failure. This is
//! deliberate — it keeps client-side cancellation from tripping the breaker —
//! but can mask genuine upstream slowness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_requests_half_open: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests_half_open: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            success_threshold: 2,
        }
    }
}

struct Counts {
    consecutive_failures: u32,
    consecutive_successes: u32,
    window_start: Instant,
}

struct Inner {
    state: State,
    counts: Counts,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
}

enum Admission {
    Proceed,
    Refused,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                counts: Counts {
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    window_start: Instant::now(),
                },
                opened_at: None,
                half_open_inflight: 0,
            }),
            trips: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// Number of times this breaker has transitioned into `Open`, for the
    /// in-process health surface.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::SeqCst)
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => {
                if Instant::now().duration_since(inner.counts.window_start) >= self.config.interval
                {
                    inner.counts.consecutive_failures = 0;
                    inner.counts.consecutive_successes = 0;
                    inner.counts.window_start = Instant::now();
                }
                Admission::Proceed
            }
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| Instant::now().duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.config.timeout {
                    inner.state = State::HalfOpen;
                    inner.half_open_inflight = 1;
                    inner.counts.consecutive_successes = 0;
                    inner.counts.consecutive_failures = 0;
                    Admission::Proceed
                } else {
                    Admission::Refused
                }
            }
            State::HalfOpen => {
                if inner.half_open_inflight >= self.config.max_requests_half_open {
                    Admission::Refused
                } else {
                    inner.half_open_inflight += 1;
                    Admission::Proceed
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => {
                inner.counts.consecutive_successes += 1;
                inner.counts.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.counts.consecutive_successes += 1;
                if inner.counts.consecutive_successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.counts.consecutive_failures = 0;
                    inner.counts.consecutive_successes = 0;
                    inner.counts.window_start = Instant::now();
                    inner.opened_at = None;
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => {
                inner.counts.consecutive_failures += 1;
                inner.counts.consecutive_successes = 0;
                if inner.counts.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    self.trips.fetch_add(1, Ordering::SeqCst);
                }
            }
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.counts.consecutive_failures = 0;
                inner.counts.consecutive_successes = 0;
                self.trips.fetch_add(1, Ordering::SeqCst);
            }
            State::Open => {}
        }
    }

    fn release_half_open_slot_without_counting(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == State::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    /// Wraps a single outbound call. `f` is not invoked at all when the
    /// breaker refuses admission.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        match self.admit() {
            Admission::Refused => return Err(Error::CircuitOpen),
            Admission::Proceed => {}
        }

        let outcome = f().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(Error::Cancelled) => self.release_half_open_slot_without_counting(),
            Err(_) => self.record_failure(),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            max_requests_half_open: 2,
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(20),
            failure_threshold: 3,
            success_threshold: 2,
        })
    }

    async fn ok(b: &CircuitBreaker) -> Result<(), Error> {
        b.call(|| async { Ok(()) }).await
    }
    async fn fail(b: &CircuitBreaker) -> Result<(), Error> {
        b.call(|| async { Err(Error::ConnectionFailed("x".into())) })
            .await
    }

    #[tokio::test]
    async fn trips_open_after_failure_threshold() {
        let b = breaker();
        for _ in 0..3 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), State::Open);
        assert_eq!(b.trip_count(), 1);
        // next call refused immediately, no call made
        let err = b.call::<_, _, ()>(|| async { panic!("must not be called") }).await;
        assert_eq!(err.unwrap_err().code(), "circuit-open");
        assert_eq!(b.trip_count(), 1);
    }

    #[tokio::test]
    async fn transitions_to_half_open_then_closed_on_success_streak() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), State::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ok(&b).await.is_ok()); // probe 1, transitions Open->HalfOpen
        assert_eq!(b.state(), State::HalfOpen);
        assert!(ok(&b).await.is_ok()); // probe 2 reaches success_threshold
        assert_eq!(b.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), State::Open);
    }

    #[tokio::test]
    async fn half_open_excess_calls_refused() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        // one probe slot already consumed by admit(); fill remaining
        let res1 = b.call(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Error>(())
        });
        let res2 = b.call(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Error>(())
        });
        let res3 = b.call::<_, _, ()>(|| async { panic!("should be refused") });
        let (_, _, r3) = tokio::join!(res1, res2, res3);
        assert_eq!(r3.unwrap_err().code(), "circuit-open");
    }

    #[tokio::test]
    async fn cancellation_neither_trips_nor_resets() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        let cancelled: Result<(), Error> = b.call(|| async { Err(Error::cancelled()) }).await;
        assert!(cancelled.is_err());
        assert_eq!(b.state(), State::Closed);
        // one more real failure should still trip it (cancellation didn't reset the streak)
        let _ = fail(&b).await;
        assert_eq!(b.state(), State::Open);
    }
}

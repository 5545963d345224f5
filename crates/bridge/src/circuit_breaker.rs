//! Sliding-window circuit breaker guarding publishes to the bus.
//!
//! The window is a fixed ring of buckets, each covering `window_duration /
//! window_buckets`. Buckets are cleared lazily, by timestamp, as the ring
//! rotates past them — there is no background sweeper. A `generation`
//! counter is bumped on every Closed<->Open<->HalfOpen transition so that a
//! call admitted under one generation can never report its outcome into a
//! later one; `execute` captures its generation at admission time and drops
//! the result if the breaker has since moved on.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use bridge_config::CircuitBreakerConfig;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Default)]
struct Bucket {
    successes: AtomicU32,
    failures: AtomicU32,
    /// Millis since breaker construction; `u64::MAX` marks an unused bucket.
    stamp_ms: AtomicU64,
}

impl Bucket {
    fn reset(&self, stamp_ms: u64) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.stamp_ms.store(stamp_ms, Ordering::Relaxed);
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    buckets: Vec<Bucket>,
    bucket_width_ms: u64,
    start: Instant,
    state: Mutex<BreakerState>,
    generation: AtomicU64,
    opened_at_ms: AtomicU64,
    half_open_successes: AtomicU32,
    in_flight: AtomicUsize,
}

pub struct Permit {
    generation: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window_buckets = config.window_buckets.max(1);
        let bucket_width_ms =
            (config.window_duration.as_millis() as u64 / window_buckets as u64).max(1);
        let buckets = (0..window_buckets)
            .map(|_| Bucket {
                successes: AtomicU32::new(0),
                failures: AtomicU32::new(0),
                stamp_ms: AtomicU64::new(u64::MAX),
            })
            .collect();

        Self {
            config,
            buckets,
            bucket_width_ms,
            start: Instant::now(),
            state: Mutex::new(BreakerState::Closed),
            generation: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_successes: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.lock().unwrap()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn current_bucket_index(&self, now_ms: u64) -> usize {
        let slot = now_ms / self.bucket_width_ms;
        (slot as usize) % self.buckets.len()
    }

    /// Clears any bucket whose last write predates the current window, then
    /// records into the bucket for `now`.
    fn touch(&self, now_ms: u64, success: bool) {
        let idx = self.current_bucket_index(now_ms);
        let bucket = &self.buckets[idx];
        let slot_start = (now_ms / self.bucket_width_ms) * self.bucket_width_ms;
        let last = bucket.stamp_ms.load(Ordering::Relaxed);
        if last == u64::MAX || slot_start.saturating_sub(last) >= self.bucket_width_ms {
            bucket.reset(now_ms);
        } else {
            bucket.stamp_ms.store(now_ms, Ordering::Relaxed);
        }
        if success {
            bucket.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            bucket.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sums counts over buckets still inside the trailing window; a clock
    /// jump forward of a full window or more naturally ages every bucket out.
    fn window_counts(&self, now_ms: u64) -> (u32, u32) {
        let mut successes = 0u32;
        let mut failures = 0u32;
        let window_ms = self.bucket_width_ms * self.buckets.len() as u64;
        for bucket in &self.buckets {
            let stamp = bucket.stamp_ms.load(Ordering::Relaxed);
            if stamp != u64::MAX && now_ms.saturating_sub(stamp) < window_ms {
                successes += bucket.successes.load(Ordering::Relaxed);
                failures += bucket.failures.load(Ordering::Relaxed);
            }
        }
        (successes, failures)
    }

    fn error_rate_trips(&self, successes: u32, failures: u32) -> bool {
        let total = successes + failures;
        if total < self.config.request_volume_threshold {
            return false;
        }
        let rate = (failures as f64 / total as f64) * 100.0;
        rate >= self.config.error_threshold as f64
    }

    /// Admits a call if the breaker's state allows it, returning a [`Permit`]
    /// tagged with the generation the caller must report its outcome under.
    pub fn try_acquire(&self) -> Result<Permit> {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().unwrap();

        if *state == BreakerState::Open {
            let opened_at = self.opened_at_ms.load(Ordering::Acquire);
            if now_ms.saturating_sub(opened_at) >= self.config.timeout.as_millis() as u64 {
                *state = BreakerState::HalfOpen;
                self.half_open_successes.store(0, Ordering::Relaxed);
                self.generation.fetch_add(1, Ordering::AcqRel);
                info!("circuit breaker: open timeout elapsed, moving to half-open");
            } else {
                return Err(BridgeError::OpenState {
                    generation: self.generation.load(Ordering::Acquire),
                });
            }
        }

        if *state == BreakerState::HalfOpen {
            let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel);
            if in_flight as u32 >= self.config.max_concurrent_calls {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(BridgeError::TooManyConcurrent {
                    limit: self.config.max_concurrent_calls,
                });
            }
            return Ok(Permit {
                generation: self.generation.load(Ordering::Acquire),
            });
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if in_flight as u32 >= self.config.max_concurrent_calls {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(BridgeError::TooManyConcurrent {
                limit: self.config.max_concurrent_calls,
            });
        }
        Ok(Permit {
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    pub fn record_success(&self, permit: Permit) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if permit.generation != self.generation.load(Ordering::Acquire) {
            return;
        }

        let now_ms = self.now_ms();
        self.touch(now_ms, true);

        let mut state = self.state.lock().unwrap();
        if *state == BreakerState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                *state = BreakerState::Closed;
                self.generation.fetch_add(1, Ordering::AcqRel);
                info!("circuit breaker: half-open success threshold met, closing");
            }
        }
    }

    pub fn record_failure(&self, permit: Permit) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if permit.generation != self.generation.load(Ordering::Acquire) {
            return;
        }

        let now_ms = self.now_ms();
        self.touch(now_ms, false);

        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::HalfOpen => {
                self.open(&mut state, now_ms);
            }
            BreakerState::Closed => {
                let (successes, failures) = self.window_counts(now_ms);
                if self.error_rate_trips(successes, failures) {
                    self.open(&mut state, now_ms);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, state: &mut BreakerState, now_ms: u64) {
        *state = BreakerState::Open;
        self.opened_at_ms.store(now_ms, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        warn!("circuit breaker: opened");
    }

    /// Runs `f` under breaker admission control, catching panics so one bad
    /// publish never poisons the breaker's internal lock.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;

        let outcome = std::panic::AssertUnwindSafe(f()).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(permit);
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.counts_as_publish_failure() {
                    self.record_failure(permit);
                } else {
                    self.record_success(permit);
                }
                Err(err)
            }
            Err(_) => {
                self.record_failure(permit);
                Err(BridgeError::PublishError {
                    topic: "<panic>".into(),
                    source: anyhow::anyhow!("publish task panicked"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold: 50,
            success_threshold: 3,
            timeout: StdDuration::from_millis(100),
            max_concurrent_calls: 10,
            request_volume_threshold: 10,
            window_buckets: 10,
            window_duration: StdDuration::from_secs(10),
        }
    }

    #[test]
    fn test_closed_admits_calls() {
        let breaker = CircuitBreaker::new(test_config());
        assert_eq!(breaker.state(), BreakerState::Closed);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_success(permit);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_trips_open_past_error_threshold_and_volume() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..4 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_success(permit);
        }
        for _ in 0..6 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }

        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_below_volume_threshold_never_trips() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..9 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_until_timeout() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        std::thread::sleep(StdDuration::from_millis(110));

        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            assert_eq!(breaker.state(), BreakerState::HalfOpen);
            breaker.record_success(permit);
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_single_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        std::thread::sleep(StdDuration::from_millis(110));

        let permit = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure(permit);

        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_stale_generation_result_is_ignored() {
        let breaker = CircuitBreaker::new(test_config());
        let stale_permit = breaker.try_acquire().unwrap();

        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // A result computed under the old (closed) generation must not flip
        // the now-open breaker back to closed.
        breaker.record_success(stale_permit);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_admission_capped_at_max_concurrent_calls() {
        let mut config = test_config();
        config.max_concurrent_calls = 1;
        let breaker = CircuitBreaker::new(config);
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        std::thread::sleep(StdDuration::from_millis(110));

        let _permit = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err());
    }
}

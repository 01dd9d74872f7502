//! Admission control for subprocess launches.
//!
//! - [`ConcurrencyLimiter`] caps how many jobs run at once (FIFO wake order).
//! - [`RateLimiter`] spaces consecutive job starts by a minimum delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Bounded-concurrency gate.
///
/// Wraps a Tokio semaphore, which queues waiters fairly, so released slots go
/// to callers in arrival order. Waiters have no timeout of their own.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter allowing `max_concurrent` holders (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max_permits = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot. The slot is released when the permit is dropped,
    /// whichever way the holder exits.
    pub async fn acquire(&self) -> ConcurrencyPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("concurrency semaphore is never closed");

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        ConcurrencyPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Waits until a slot is free without holding on to it.
    pub async fn ready(&self) {
        drop(self.acquire().await);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    /// Current number of permit holders.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held concurrency slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Enforces a minimum spacing between successive callers.
///
/// Callers are serialized: each one holds the lock while it sleeps out the
/// remainder of the interval, then records its own start time.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Waits until at least `min_delay` has passed since the previous caller
    /// was released.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_holders() {
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                peak.fetch_max(limiter.in_flight(), Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::Relaxed), 2);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn releases_wake_waiters_in_arrival_order() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = limiter.acquire().await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let the task reach the semaphore before spawning the next one.
            tokio::task::yield_now().await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_for_a_release_without_consuming_it() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let held = limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        assert_eq!(ConcurrencyLimiter::new(0).max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_callers() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(2000)));
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait().await;
                starts.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_and_late_calls_do_not_wait() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let begin = Instant::now();
        limiter.wait().await;
        assert_eq!(begin.elapsed(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}

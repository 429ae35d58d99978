use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Granularity of the back-off loop in [`RequestLimiter::wait_for_slot`].
/// Must stay `<= 100ms` to bound latency on slot release.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Rolling-window count limiter (RPM/RPD).
///
/// Holds a sequence of admission timestamps under a `tokio::sync::Mutex` so
/// that contending callers yield back to the runtime instead of blocking a
/// worker thread while waiting for the lock.
pub struct RequestLimiter {
    limit: u64,
    period: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RequestLimiter {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Try to admit `n` requests. Expires stale timestamps first, then
    /// admits iff `len + n <= limit`.
    pub async fn acquire(&self, n: u64) -> bool {
        let now = Instant::now();
        let mut ts = self.timestamps.lock().await;
        Self::expire(&mut ts, now, self.period);

        if ts.len() as u64 + n <= self.limit {
            for _ in 0..n {
                ts.push_back(now);
            }
            true
        } else {
            false
        }
    }

    /// Remove up to `n` most recent timestamps. Used for chain rollback on
    /// refused admission; NOT used to relieve processor failures (those
    /// count against the budget).
    pub async fn release(&self, n: u64) {
        let mut ts = self.timestamps.lock().await;
        for _ in 0..n {
            if ts.pop_back().is_none() {
                break;
            }
        }
    }

    /// Poll [`Self::acquire`] with a short back-off until it succeeds.
    pub async fn wait_for_slot(&self, n: u64) {
        loop {
            if self.acquire(n).await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Count of non-expired timestamps.
    pub async fn usage(&self) -> u64 {
        let now = Instant::now();
        let mut ts = self.timestamps.lock().await;
        Self::expire(&mut ts, now, self.period);
        ts.len() as u64
    }

    pub async fn available(&self) -> u64 {
        self.limit.saturating_sub(self.usage().await)
    }

    fn expire(ts: &mut VecDeque<Instant>, now: Instant, period: Duration) {
        while let Some(front) = ts.front() {
            if now.duration_since(*front) >= period {
                ts.pop_front();
            } else {
                break;
            }
        }
    }
}

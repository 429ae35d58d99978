use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A dated ledger entry. `delta` may be negative (a refund) or positive
/// (an admission or overage correction).
struct Entry {
    at: Instant,
    delta: i64,
}

/// Rolling-window signed ledger limiter (TPM/TPD/ITPM/OTPM).
///
/// Refunds and overage corrections are themselves dated entries that decay
/// on the same `period` schedule as admissions — reconciling long after
/// admission does not let the window "forget" the adjustment early, and a
/// quiet period does not create a pathological capacity gain.
pub struct TokenLimiter {
    limit: u64,
    period: Duration,
    ledger: Mutex<VecDeque<Entry>>,
}

impl TokenLimiter {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            ledger: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Try to acquire `n` tokens. Admits iff `max(0, current) + n <= limit`.
    pub async fn acquire(&self, n: u64) -> bool {
        let now = Instant::now();
        let mut ledger = self.ledger.lock().await;
        Self::expire(&mut ledger, now, self.period);

        let current = Self::sum(&ledger).max(0) as u64;
        if current + n <= self.limit {
            ledger.push_back(Entry {
                at: now,
                delta: n as i64,
            });
            true
        } else {
            false
        }
    }

    /// Append a dated `-n` refund. Always succeeds; does not block.
    pub async fn release(&self, n: u64) {
        let now = Instant::now();
        let mut ledger = self.ledger.lock().await;
        ledger.push_back(Entry {
            at: now,
            delta: -(n as i64),
        });
    }

    /// Reconcile an estimate against the actual usage reported after
    /// completion. If `est > actual`, refunds the difference. If
    /// `est < actual`, acquires the difference unconditionally — this may
    /// transiently push usage above `limit`; subsequent acquisitions will
    /// block until the window rolls. That overage is the specified
    /// semantics, not a bug.
    pub async fn reconcile(&self, est: u64, actual: u64) {
        if est > actual {
            self.release(est - actual).await;
        } else if actual > est {
            let now = Instant::now();
            let mut ledger = self.ledger.lock().await;
            ledger.push_back(Entry {
                at: now,
                delta: (actual - est) as i64,
            });
        }
    }

    pub async fn wait_for_slot(&self, n: u64) {
        loop {
            if self.acquire(n).await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current usage, clamped to `>= 0` (refunds may drive the raw sum
    /// negative transiently; that is not observable usage).
    pub async fn usage(&self) -> u64 {
        let now = Instant::now();
        let mut ledger = self.ledger.lock().await;
        Self::expire(&mut ledger, now, self.period);
        Self::sum(&ledger).max(0) as u64
    }

    pub async fn available(&self) -> u64 {
        self.limit.saturating_sub(self.usage().await)
    }

    fn sum(ledger: &VecDeque<Entry>) -> i64 {
        ledger.iter().map(|e| e.delta).sum()
    }

    fn expire(ledger: &mut VecDeque<Entry>, now: Instant, period: Duration) {
        while let Some(front) = ledger.front() {
            if now.duration_since(front.at) >= period {
                ledger.pop_front();
            } else {
                break;
            }
        }
    }
}

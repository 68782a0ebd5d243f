//! Blocking two-window rate limiter for metered external services.
//!
//! Each window admits at most `capacity` operations in any span of `period`.
//! A window remembers its most recent admissions; a caller that finds it full
//! sleeps until the oldest one ages out, holding the lock so concurrent
//! callers queue behind it instead of racing past the cap. Nothing is ever
//! rejected, only delayed.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use newsdigest_shared::EngineConfig;

/// One sliding window over the last `capacity` admissions.
#[derive(Debug, Clone)]
pub struct RateWindow {
    pub capacity: u32,
    pub period: Duration,
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            admitted: VecDeque::with_capacity(capacity as usize),
        }
    }

    /// Forget admissions that no longer fall inside the window ending at `now`.
    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest + self.period <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_full(&self) -> bool {
        self.admitted.len() >= self.capacity as usize
    }

    fn record(&mut self, at: Instant) {
        self.admitted.push_back(at);
        while self.admitted.len() > self.capacity as usize {
            self.admitted.pop_front();
        }
    }
}

/// Lock-guarded set of sliding windows; all must admit before a call proceeds.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Vec<RateWindow>>,
}

impl RateLimiter {
    /// Build a limiter from `(capacity, period)` pairs.
    pub fn new(windows: impl IntoIterator<Item = (u32, Duration)>) -> Self {
        let windows = windows
            .into_iter()
            .map(|(capacity, period)| RateWindow::new(capacity.max(1), period))
            .collect();
        Self {
            windows: Mutex::new(windows),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new([])
    }

    /// Per-second and per-minute windows from an engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut windows = Vec::new();
        if let Some(cap) = config.per_second {
            windows.push((cap, Duration::from_secs(1)));
        }
        if let Some(cap) = config.per_minute {
            windows.push((cap, Duration::from_secs(60)));
        }
        Self::new(windows)
    }

    /// Wait until every window has room, then record one operation.
    pub async fn acquire(&self) {
        let mut windows = self.windows.lock().await;

        // Waiting on one window only ages the others, so a window that
        // already has room keeps it.
        for window in windows.iter_mut() {
            window.expire(Instant::now());
            if !window.is_full() {
                continue;
            }
            if let Some(&oldest) = window.admitted.front() {
                let until = oldest + window.period;
                debug!(
                    capacity = window.capacity,
                    period_ms = window.period.as_millis() as u64,
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "rate window full, waiting"
                );
                tokio::time::sleep_until(until).await;
            }
            window.expire(Instant::now());
        }

        let now = Instant::now();
        for window in windows.iter_mut() {
            window.record(now);
        }
    }
}

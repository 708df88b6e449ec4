//! Per-minute and per-day quota limiter for a rate-restricted endpoint.
//!
//! The limiter never fails a call: when a ceiling is reached it sleeps until
//! the relevant window rolls over. Callers record a request only after it
//! succeeded, so failed attempts do not consume quota.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{info, warn};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Extra wait after a minute window elapses.
pub const MINUTE_SAFETY_MARGIN: Duration = Duration::from_secs(2);
/// Extra wait after the daily quota resets.
pub const DAY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

// =============================================================================
// Clock
// =============================================================================

/// Time source and sleeper used by the limiter.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time as an offset from the Unix epoch.
    fn now(&self) -> Duration;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Simulated clock: `sleep` advances time instantly and is recorded.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn starting_at(now: Duration) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Ceilings enforced by a [`QuotaLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub per_minute: u32,
    pub per_day: u32,
}

impl QuotaConfig {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_day,
        }
    }
}

#[derive(Debug, Clone)]
struct QuotaState {
    day_count: u32,
    minute_count: u32,
    minute_window_start: Duration,
    day_window_start: Duration,
}

/// Snapshot of limiter counters, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub day_count: u32,
    pub minute_count: u32,
}

pub struct QuotaLimiter {
    config: QuotaConfig,
    state: tokio::sync::Mutex<QuotaState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// The day window starts at the most recent UTC midnight.
    pub fn with_clock(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let day_start = Duration::from_secs(now.as_secs() - now.as_secs() % DAY.as_secs());
        Self {
            config,
            state: tokio::sync::Mutex::new(QuotaState {
                day_count: 0,
                minute_count: 0,
                minute_window_start: now,
                day_window_start: day_start,
            }),
            clock,
        }
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Block until one more request fits in both the daily and minute quota.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        let mut waited = Duration::ZERO;

        let now = self.clock.now();
        if now.saturating_sub(state.day_window_start) >= DAY {
            state.day_count = 0;
            state.day_window_start = now;
        }

        if state.day_count >= self.config.per_day {
            let wait = (state.day_window_start + DAY).saturating_sub(now) + DAY_SAFETY_MARGIN;
            warn!(
                per_day = self.config.per_day,
                wait_hours = wait.as_secs() / 3600,
                wait_minutes = wait.as_secs() % 3600 / 60,
                "daily quota exhausted; waiting for reset"
            );
            self.clock.sleep(wait).await;
            waited += wait;
            let now = self.clock.now();
            state.day_count = 0;
            state.minute_count = 0;
            state.day_window_start = now;
            state.minute_window_start = now;
        }

        let now = self.clock.now();
        if now.saturating_sub(state.minute_window_start) >= MINUTE {
            state.minute_window_start = now;
            state.minute_count = 0;
        }

        if state.minute_count >= self.config.per_minute {
            let elapsed = now.saturating_sub(state.minute_window_start);
            let wait = MINUTE.saturating_sub(elapsed) + MINUTE_SAFETY_MARGIN;
            info!(
                per_minute = self.config.per_minute,
                wait_secs = wait.as_secs(),
                "minute quota exhausted; waiting"
            );
            self.clock.sleep(wait).await;
            waited += wait;
            state.minute_window_start = self.clock.now();
            state.minute_count = 0;
        }

        waited
    }

    /// Count one successful request against both windows.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.day_count += 1;
        state.minute_count += 1;
    }

    pub async fn usage(&self) -> QuotaUsage {
        let state = self.state.lock().await;
        QuotaUsage {
            day_count: state.day_count,
            minute_count: state.minute_count,
        }
    }
}

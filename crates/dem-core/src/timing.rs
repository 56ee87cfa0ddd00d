//! Tick-based timing for the fleet scheduler.
//!
//! All periodic behavior is expressed as integer tick counts derived once
//! from configuration, so the scheduler can be driven deterministically by
//! advancing N ticks instead of waiting on wall-clock timers.

use serde::{Deserialize, Serialize};

/// Default scheduler tick period.
pub const DEFAULT_TICK_MS: u64 = 100;

/// Keep-alive period. Must stay below the discovery controller's KATO.
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 100_000;

/// Ticks a failing target waits before its next refresh attempt.
pub const DEFAULT_RETRY_TICKS: u32 = 50;

const MS_PER_MINUTE: u64 = 60_000;

/// Tick counts derived from the configured periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub tick_ms: u64,
    pub ticks_per_minute: u32,
    pub keep_alive_ticks: u32,
    pub retry_ticks: u32,
}

impl Timing {
    /// Derive tick counts from millisecond periods.
    ///
    /// A zero tick period is clamped to 1 ms; every derived count is at least 1.
    pub fn derive(tick_ms: u64, keep_alive_ms: u64, retry_ticks: u32) -> Self {
        let tick_ms = tick_ms.max(1);
        if tick_ms > MS_PER_MINUTE {
            tracing::warn!(tick_ms, "Tick period longer than a minute, refresh granularity is one tick");
        }

        Self {
            tick_ms,
            ticks_per_minute: ticks(MS_PER_MINUTE, tick_ms),
            keep_alive_ticks: ticks(keep_alive_ms, tick_ms),
            retry_ticks: retry_ticks.max(1),
        }
    }

    /// Full refresh countdown for a target refreshing every `minutes`.
    /// Zero minutes yields zero, which disables periodic refresh.
    pub fn refresh_ticks(&self, minutes: u32) -> u32 {
        minutes.saturating_mul(self.ticks_per_minute)
    }

    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_ms)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::derive(DEFAULT_TICK_MS, DEFAULT_KEEP_ALIVE_MS, DEFAULT_RETRY_TICKS)
    }
}

fn ticks(period_ms: u64, tick_ms: u64) -> u32 {
    u32::try_from(period_ms / tick_ms).unwrap_or(u32::MAX).max(1)
}

/// Per-target countdowns. Unsigned and saturating, so never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdowns {
    pub refresh: u32,
    pub keep_alive: u32,
    pub retry: u32,
}

impl Countdowns {
    pub fn new(timing: &Timing, refresh_minutes: u32) -> Self {
        Self {
            refresh: timing.refresh_ticks(refresh_minutes),
            keep_alive: timing.keep_alive_ticks,
            retry: 0,
        }
    }

    /// Advance the keep-alive countdown. Returns true when a probe is due.
    pub fn tick_keep_alive(&mut self) -> bool {
        self.keep_alive = self.keep_alive.saturating_sub(1);
        self.keep_alive == 0
    }

    /// Advance the retry budget. Returns true while the target is still
    /// backing off; the tick that drains the budget returns false.
    pub fn tick_retry(&mut self) -> bool {
        if self.retry == 0 {
            return false;
        }
        self.retry -= 1;
        self.retry > 0
    }

    /// Advance the refresh countdown. Returns true when a refresh is due.
    /// A countdown already at zero means periodic refresh is disabled.
    pub fn tick_refresh(&mut self) -> bool {
        if self.refresh == 0 {
            return false;
        }
        self.refresh -= 1;
        self.refresh == 0
    }

    pub fn reset_keep_alive(&mut self, timing: &Timing) {
        self.keep_alive = timing.keep_alive_ticks;
    }

    pub fn reset_refresh(&mut self, timing: &Timing, refresh_minutes: u32) {
        self.refresh = timing.refresh_ticks(refresh_minutes);
    }

    pub fn start_backoff(&mut self, timing: &Timing) {
        self.retry = timing.retry_ticks;
    }

    pub fn clear_backoff(&mut self) {
        self.retry = 0;
    }

    pub fn backing_off(&self) -> bool {
        self.retry > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_derivation() {
        let t = Timing::default();
        assert_eq!(t.tick_ms, 100);
        assert_eq!(t.ticks_per_minute, 600);
        assert_eq!(t.keep_alive_ticks, 1000);
        assert_eq!(t.retry_ticks, 50);
        assert_eq!(t.refresh_ticks(5), 3000);
    }

    #[test]
    fn zero_periods_are_clamped() {
        let t = Timing::derive(0, 0, 0);
        assert_eq!(t.tick_ms, 1);
        assert_eq!(t.keep_alive_ticks, 1);
        assert_eq!(t.retry_ticks, 1);
        assert_eq!(t.ticks_per_minute, 60_000);
    }

    #[test]
    fn refresh_fires_once_per_interval() {
        let t = Timing::derive(100, 100_000, 5);
        let mut c = Countdowns::new(&t, 1);
        let fired: Vec<usize> = (1..=600).filter(|_| c.tick_refresh()).collect();
        assert_eq!(fired, vec![600]);
        assert_eq!(c.refresh, 0);
    }

    #[test]
    fn zero_refresh_never_fires() {
        let t = Timing::default();
        let mut c = Countdowns::new(&t, 0);
        for _ in 0..10_000 {
            assert!(!c.tick_refresh());
        }
    }

    #[test]
    fn retry_drains_then_clears() {
        let t = Timing::derive(100, 1000, 3);
        let mut c = Countdowns::default();
        c.start_backoff(&t);
        assert!(c.tick_retry());
        assert!(c.tick_retry());
        assert!(!c.tick_retry());
        assert!(!c.backing_off());
        assert!(!c.tick_retry());
    }

    #[test]
    fn countdowns_never_underflow() {
        let mut c = Countdowns::default();
        for _ in 0..5 {
            c.tick_keep_alive();
            c.tick_retry();
            c.tick_refresh();
        }
        assert_eq!(c, Countdowns::default());
    }
}

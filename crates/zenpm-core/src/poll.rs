//! Adaptive polling interval.
//!
//! The poll loop should fire often while external consumers are actively
//! asking for fresh telemetry and back off to a slow idle cadence when they
//! stop. Each consumer request updates an estimated request interval; each
//! completed cycle reschedules to
//! `clamp(50, 1200, max(now - last_missed_request, estimated_interval))`
//! milliseconds. The very first interval is 1 ms so the one-time
//! initialization round runs immediately after start.

use serde::Serialize;

/// Fastest steady-state polling cadence, ms.
pub const MIN_POLL_INTERVAL_MS: u32 = 50;
/// Slowest steady-state polling cadence, ms.
pub const MAX_POLL_INTERVAL_MS: u32 = 1200;
/// Interval used before the initialization round has run, ms.
pub const INIT_POLL_INTERVAL_MS: u32 = 1;

/// Adaptive scheduling state, recomputed once per polling cycle.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PollState {
    pub current_interval_ms: u32,
    /// Observed gap between the two previous cycles, ms.
    pub actual_interval_ms: u32,
    last_update_ms: u32,
    last_missed_request_ms: u32,
    estimated_request_interval_ms: u32,
}

impl PollState {
    pub fn new() -> Self {
        Self {
            current_interval_ms: INIT_POLL_INTERVAL_MS,
            actual_interval_ms: 0,
            last_update_ms: 0,
            last_missed_request_ms: 0,
            estimated_request_interval_ms: 0,
        }
    }

    /// Signal that an external caller just asked for fresh data.
    pub fn register_request(&mut self, now_ms: u32) {
        self.estimated_request_interval_ms = now_ms.saturating_sub(self.last_missed_request_ms);
        self.last_missed_request_ms = now_ms;
    }

    /// Recompute the next polling delay after a completed cycle.
    pub fn reschedule(&mut self, now_ms: u32) -> u32 {
        let next = now_ms
            .saturating_sub(self.last_missed_request_ms)
            .max(self.estimated_request_interval_ms);
        self.actual_interval_ms = now_ms.saturating_sub(self.last_update_ms);
        self.last_update_ms = now_ms;
        self.current_interval_ms = next.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        self.current_interval_ms
    }
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

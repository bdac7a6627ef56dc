//! Time sources.
//!
//! [`ManualClock`] and [`FastForwardClock`] are cheap `Clone` handles over
//! shared state, so a test or simulator keeps one handle and moves time while
//! the engine owns another.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use paymaster_core::traits::Clock;
use paymaster_core::types::Timestamp;

/// Wall-clock time in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        u64::try_from(Utc::now().timestamp()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Jump to `t`. Moving backwards is allowed but the engine will reject
    /// writes that land behind already settled data.
    pub fn set(&self, t: Timestamp) {
        *self.now.write() = t;
    }

    /// Move forward by `seconds`.
    pub fn advance(&self, seconds: u64) {
        let mut now = self.now.write();
        *now = now.saturating_add(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read()
    }
}

#[derive(Debug, Clone, Copy)]
struct FastForwardState {
    /// Base time at the last re-anchoring.
    anchor_base: Timestamp,
    /// Reported time at the last re-anchoring.
    anchor_reported: Timestamp,
    multiplier: u64,
}

/// Clock running `multiplier` times faster than its base, with explicit skips.
///
/// Used for staging deployments where months of settlement must play out in
/// hours.
#[derive(Clone)]
pub struct FastForwardClock {
    base: Arc<dyn Clock>,
    state: Arc<RwLock<FastForwardState>>,
}

impl FastForwardClock {
    /// Start at the base clock's current time with a multiplier of 1.
    pub fn new(base: Arc<dyn Clock>) -> Self {
        let now = base.now();
        Self {
            base,
            state: Arc::new(RwLock::new(FastForwardState {
                anchor_base: now,
                anchor_reported: now,
                multiplier: 1,
            })),
        }
    }

    /// Jump ahead by `seconds` of reported time.
    pub fn skip(&self, seconds: u64) {
        let mut state = self.state.write();
        state.anchor_reported = state.anchor_reported.saturating_add(seconds);
    }

    /// Change the speed. Time already elapsed keeps its old speed.
    pub fn set_multiplier(&self, multiplier: u64) {
        let base_now = self.base.now();
        let mut state = self.state.write();
        state.anchor_reported = reported(&state, base_now);
        state.anchor_base = base_now;
        state.multiplier = multiplier.max(1);
    }

    pub fn multiplier(&self) -> u64 {
        self.state.read().multiplier
    }
}

fn reported(state: &FastForwardState, base_now: Timestamp) -> Timestamp {
    let elapsed = base_now.saturating_sub(state.anchor_base);
    state
        .anchor_reported
        .saturating_add(elapsed.saturating_mul(state.multiplier))
}

impl Clock for FastForwardClock {
    fn now(&self) -> Timestamp {
        let base_now = self.base.now();
        reported(&self.state.read(), base_now)
    }
}

impl std::fmt::Debug for FastForwardClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastForwardClock")
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

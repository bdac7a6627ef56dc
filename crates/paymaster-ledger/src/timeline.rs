//! Interval income ledger.
//!
//! Income is added as uniform streams over half-open intervals `[from, to)`.
//! Each stream is stored as two integer rate changes (per second) plus an
//! optional one-second remainder stream on `[to - 1, to)`, so the full-span
//! sum of a stream is exactly its value.
//!
//! Two watermarks split the time axis:
//! - below `processed_until` the rate changes are folded into checkpoints
//!   holding the cumulative sum and the rate in force, answered in O(log n);
//! - below `cleared_until` history is dropped and sums count as zero.
//!
//! Sums are computed as differences of an absolute prefix sum, so clearing
//! never changes the answer for intervals entirely after the cleared bound.

use std::collections::BTreeMap;

use paymaster_core::error::TimelineError;
use paymaster_core::types::{Amount, Timestamp};
use tracing::debug;

/// Folded state at a rate change below the processed watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Checkpoint {
    /// Income accumulated on `[0, key)`.
    cumulative: Amount,
    /// Rate in force from `key` up to the next checkpoint.
    rate: Amount,
}

/// Interval income ledger with processed and cleared watermarks.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Rate changes at or after `processed_until`.
    pending: BTreeMap<Timestamp, i128>,
    /// Folded rate changes below `processed_until`.
    checkpoints: BTreeMap<Timestamp, Checkpoint>,
    /// Rate in force at `processed_until`, excluding a pending change keyed there.
    base_rate: Amount,
    /// Income accumulated on `[0, processed_until)`.
    processed_total: Amount,
    processed_until: Timestamp,
    cleared_until: Timestamp,
}

impl Timeline {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger whose history starts at `t`: nothing can be added
    /// before it and sums below it are zero.
    pub fn starting_at(t: Timestamp) -> Self {
        Self {
            processed_until: t,
            cleared_until: t,
            ..Self::default()
        }
    }

    /// Everything before this instant has been folded into checkpoints.
    pub fn processed_until(&self) -> Timestamp {
        self.processed_until
    }

    /// Everything before this instant has been dropped.
    pub fn cleared_until(&self) -> Timestamp {
        self.cleared_until
    }

    /// Number of rate changes not yet folded.
    pub fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    /// Number of retained checkpoints.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// Add `value` spread uniformly over `[from, to)`.
    pub fn add(&mut self, from: Timestamp, to: Timestamp, value: Amount) -> Result<(), TimelineError> {
        self.apply(from, to, value, false)
    }

    /// Remove a stream previously added with the same arguments.
    pub fn remove(&mut self, from: Timestamp, to: Timestamp, value: Amount) -> Result<(), TimelineError> {
        self.apply(from, to, value, true)
    }

    fn apply(&mut self, from: Timestamp, to: Timestamp, value: Amount, negate: bool) -> Result<(), TimelineError> {
        if to <= from {
            return Err(TimelineError::InvalidInterval { from, to });
        }
        if from < self.processed_until {
            return Err(TimelineError::PastAddition {
                from,
                processed_until: self.processed_until,
            });
        }
        if value == 0 {
            return Ok(());
        }

        let len = Amount::from(to - from);
        let rate = signed(value / len, negate)?;
        let remainder = signed(value % len, negate)?;

        let mut changes = Vec::with_capacity(4);
        if rate != 0 {
            changes.push((from, rate));
            changes.push((to, -rate));
        }
        if remainder != 0 {
            changes.push((to - 1, remainder));
            changes.push((to, -remainder));
        }

        // Validate every change before touching the map.
        let mut staged = Vec::with_capacity(changes.len());
        for (at, delta) in changes {
            let current = staged
                .iter()
                .rev()
                .find(|(k, _)| *k == at)
                .map(|(_, d)| *d)
                .or_else(|| self.pending.get(&at).copied())
                .unwrap_or(0);
            let next = current
                .checked_add(delta)
                .ok_or(TimelineError::ArithmeticOverflow)?;
            staged.push((at, next));
        }
        for (at, next) in staged {
            if next == 0 {
                self.pending.remove(&at);
            } else {
                self.pending.insert(at, next);
            }
        }
        Ok(())
    }

    /// Income on `[from, to)`. Anything below the cleared bound counts as zero.
    pub fn sum(&self, from: Timestamp, to: Timestamp) -> Result<Amount, TimelineError> {
        if to <= from {
            return Err(TimelineError::InvalidInterval { from, to });
        }
        let lo = from.max(self.cleared_until);
        let hi = to.max(self.cleared_until);
        if hi == lo {
            return Ok(0);
        }
        let upper = self.prefix(hi)?;
        let lower = self.prefix(lo)?;
        upper
            .checked_sub(lower)
            .ok_or(TimelineError::ArithmeticOverflow)
    }

    /// Absolute income on `[0, t)`.
    fn prefix(&self, t: Timestamp) -> Result<Amount, TimelineError> {
        if t <= self.processed_until {
            let Some((&at, cp)) = self.checkpoints.range(..=t).next_back() else {
                return Ok(0);
            };
            return accumulate(cp.cumulative, cp.rate, t - at);
        }

        let mut total = self.processed_total;
        let mut rate = self.base_rate;
        let mut pos = self.processed_until;
        for (&at, &delta) in self.pending.range(..t) {
            total = accumulate(total, rate, at - pos)?;
            rate = rate
                .checked_add_signed(delta)
                .ok_or(TimelineError::ArithmeticOverflow)?;
            pos = at;
        }
        accumulate(total, rate, t - pos)
    }

    /// Fold every rate change below `t` into checkpoints.
    ///
    /// No-op when `t <= processed_until`.
    pub fn process(&mut self, t: Timestamp) -> Result<(), TimelineError> {
        if t <= self.processed_until {
            return Ok(());
        }

        let mut total = self.processed_total;
        let mut rate = self.base_rate;
        let mut pos = self.processed_until;
        let mut folded = Vec::new();
        for (&at, &delta) in self.pending.range(..t) {
            total = accumulate(total, rate, at - pos)?;
            rate = rate
                .checked_add_signed(delta)
                .ok_or(TimelineError::ArithmeticOverflow)?;
            pos = at;
            folded.push((at, Checkpoint { cumulative: total, rate }));
        }
        total = accumulate(total, rate, t - pos)?;

        for (at, cp) in &folded {
            self.pending.remove(at);
            self.checkpoints.insert(*at, *cp);
        }
        self.processed_total = total;
        self.base_rate = rate;
        self.processed_until = t;
        debug!(processed_until = t, folded = folded.len(), "timeline processed");
        Ok(())
    }

    /// Drop history below `until` and return the retained lower bound.
    ///
    /// The checkpoint spanning `until` is re-keyed to `until`, so sums over
    /// intervals starting at or after it are unaffected.
    pub fn clear(&mut self, until: Timestamp) -> Result<Timestamp, TimelineError> {
        if until > self.processed_until {
            return Err(TimelineError::ClearUnprocessed {
                until,
                processed_until: self.processed_until,
            });
        }
        if until <= self.cleared_until {
            return Ok(self.cleared_until);
        }

        if let Some((&at, &cp)) = self.checkpoints.range(..=until).next_back() {
            let rekeyed = Checkpoint {
                cumulative: accumulate(cp.cumulative, cp.rate, until - at)?,
                rate: cp.rate,
            };
            let retained = self.checkpoints.split_off(&until);
            let dropped = self.checkpoints.len();
            self.checkpoints = retained;
            self.checkpoints.insert(until, rekeyed);
            debug!(until, dropped, "timeline checkpoints cleared");
        }
        self.cleared_until = until;
        debug!(cleared_until = until, "timeline history cleared");
        Ok(until)
    }
}

fn signed(value: Amount, negate: bool) -> Result<i128, TimelineError> {
    let v = i128::try_from(value).map_err(|_| TimelineError::ArithmeticOverflow)?;
    Ok(if negate { -v } else { v })
}

fn accumulate(total: Amount, rate: Amount, seconds: u64) -> Result<Amount, TimelineError> {
    rate.checked_mul(Amount::from(seconds))
        .and_then(|v| total.checked_add(v))
        .ok_or(TimelineError::ArithmeticOverflow)
}

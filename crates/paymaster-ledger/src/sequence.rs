//! Forward-only step functions.
//!
//! A [`Sequence`] keeps one step function per key plus the aggregate (sum
//! over all keys). Each function starts at an implicit `(0, 0)` entry and
//! holds its value until the next entry. Changes may only be appended, which
//! keeps every series sorted and makes point lookup a binary search.

use std::collections::BTreeMap;
use std::iter;

use paymaster_core::error::SequenceError;
use paymaster_core::types::Timestamp;
use tracing::debug;

use crate::heap::MinHeap;

/// One step of a series: `value` holds from `at` until the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub at: Timestamp,
    pub value: u64,
}

/// Keyed step functions with a running aggregate.
#[derive(Debug, Clone)]
pub struct Sequence<K> {
    series: BTreeMap<K, Vec<Entry>>,
    aggregate: Vec<Entry>,
    cleared_until: Timestamp,
}

impl<K> Default for Sequence<K> {
    fn default() -> Self {
        Self {
            series: BTreeMap::new(),
            aggregate: Vec::new(),
            cleared_until: 0,
        }
    }
}

impl<K: Ord + Copy> Sequence<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change for `key` at `t`.
    ///
    /// `t` must be strictly after the key's last change and not before the
    /// aggregate's last change.
    pub fn add(&mut self, key: K, t: Timestamp, value: u64) -> Result<(), SequenceError> {
        self.write(key, t, value, false)
    }

    /// Like [`add`](Self::add), but a change at exactly the key's last
    /// timestamp replaces that entry. Setting the current value is a no-op.
    pub fn set(&mut self, key: K, t: Timestamp, value: u64) -> Result<(), SequenceError> {
        self.write(key, t, value, true)
    }

    fn write(&mut self, key: K, t: Timestamp, value: u64, upsert: bool) -> Result<(), SequenceError> {
        let last = self.series.get(&key).and_then(|s| s.last()).map_or(0, |e| e.at);
        let replaces = upsert && t == last && self.series.contains_key(&key);
        if t < last || (t == last && !replaces) {
            return Err(SequenceError::CannotAddToThePast { timestamp: t, last });
        }
        let aggregate_last = self.aggregate.last().map_or(0, |e| e.at);
        if t < aggregate_last {
            return Err(SequenceError::CannotAddToThePast {
                timestamp: t,
                last: aggregate_last,
            });
        }

        let old = self.latest(&key);
        if upsert && old == value {
            return Ok(());
        }
        let total = self
            .latest_aggregate()
            .checked_sub(old)
            .and_then(|v| v.checked_add(value))
            .ok_or(SequenceError::ArithmeticOverflow)?;

        let entries = self.series.entry(key).or_default();
        match entries.last_mut() {
            Some(e) if replaces => e.value = value,
            _ => entries.push(Entry { at: t, value }),
        }
        match self.aggregate.last_mut() {
            Some(e) if e.at == t => e.value = total,
            _ => self.aggregate.push(Entry { at: t, value: total }),
        }
        Ok(())
    }

    /// Value of `key` at `t`; 0 before its first change or below the cleared bound.
    pub fn value_at(&self, key: &K, t: Timestamp) -> u64 {
        if t < self.cleared_until {
            return 0;
        }
        self.series.get(key).map_or(0, |s| lookup(s, t))
    }

    /// Aggregate value at `t`; 0 below the cleared bound.
    pub fn aggregate_at(&self, t: Timestamp) -> u64 {
        if t < self.cleared_until {
            return 0;
        }
        lookup(&self.aggregate, t)
    }

    /// Most recent value of `key`.
    pub fn latest(&self, key: &K) -> u64 {
        self.series
            .get(key)
            .and_then(|s| s.last())
            .map_or(0, |e| e.value)
    }

    /// Most recent aggregate value.
    pub fn latest_aggregate(&self) -> u64 {
        self.aggregate.last().map_or(0, |e| e.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.series.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn cleared_until(&self) -> Timestamp {
        self.cleared_until
    }

    /// Sorted, distinct change timestamps in `[from, to)` across every key
    /// and the aggregate.
    pub fn change_points(&self, from: Timestamp, to: Timestamp) -> Vec<Timestamp> {
        let streams: Vec<&[Entry]> = self
            .series
            .values()
            .map(Vec::as_slice)
            .chain(iter::once(self.aggregate.as_slice()))
            .collect();

        let mut cursors = Vec::with_capacity(streams.len());
        let mut frontier = MinHeap::with_capacity(streams.len());
        for (i, s) in streams.iter().enumerate() {
            let start = s.partition_point(|e| e.at < from);
            cursors.push(start);
            if let Some(e) = s.get(start).filter(|e| e.at < to) {
                frontier.insert((e.at, i));
            }
        }

        let mut points: Vec<Timestamp> = Vec::new();
        while let Ok((at, i)) = frontier.pop_min() {
            if points.last() != Some(&at) {
                points.push(at);
            }
            cursors[i] += 1;
            if let Some(e) = streams[i].get(cursors[i]).filter(|e| e.at < to) {
                frontier.insert((e.at, i));
            }
        }
        points
    }

    /// Drop entries not needed to answer queries at or after `until`.
    ///
    /// Returns the new cleared bound; clearing never moves it backwards.
    pub fn clear(&mut self, until: Timestamp) -> Timestamp {
        if until <= self.cleared_until {
            return self.cleared_until;
        }
        let mut dropped = truncate(&mut self.aggregate, until);
        for entries in self.series.values_mut() {
            dropped += truncate(entries, until);
        }
        self.cleared_until = until;
        debug!(until, dropped, "sequence history cleared");
        until
    }

    /// Drop `key` entirely. Only allowed once its latest value is 0.
    pub fn forget(&mut self, key: &K) -> Result<(), SequenceError> {
        let value = self.latest(key);
        if value != 0 {
            return Err(SequenceError::ForgetActiveKey { value });
        }
        self.series.remove(key);
        Ok(())
    }
}

fn lookup(entries: &[Entry], t: Timestamp) -> u64 {
    match entries.partition_point(|e| e.at <= t) {
        0 => 0,
        n => entries[n - 1].value,
    }
}

/// Keep the greatest entry `<= until` and everything after it.
fn truncate(entries: &mut Vec<Entry>, until: Timestamp) -> usize {
    let n = entries.partition_point(|e| e.at <= until);
    if n > 1 {
        entries.drain(..n - 1);
        n - 1
    } else {
        0
    }
}

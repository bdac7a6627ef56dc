//! Bounded queue of income waiting to be redistributed.
//!
//! A debt is income that could not be paid out through the timeline in its
//! own window. Income that found no active resource is credited into a later
//! window; a payment that arrived after its window was settled is owed
//! directly to the recipients active in that window. Either way the debt is
//! kept here until every recipient has claimed it and its window falls
//! behind every claim boundary.
//!
//! Indices are absolute and only grow: `begin` is the first live debt, `end`
//! one past the last.

use paymaster_core::error::SettlementError;
use paymaster_core::types::{decimal, Amount, Timestamp};
use serde::{Deserialize, Serialize};

/// Income moved from its origin period into a later window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Debt {
    /// Start of the period the income originally belonged to.
    pub origin: Timestamp,
    /// Window the income is paid out from.
    pub credited_from: Timestamp,
    pub credited_to: Timestamp,
    #[serde(with = "decimal")]
    pub amount: Amount,
}

/// Fixed-capacity ring buffer of debts.
#[derive(Debug, Clone)]
pub struct DebtQueue {
    slots: Vec<Option<Debt>>,
    begin: u64,
    end: u64,
}

impl DebtQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            begin: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        usize::try_from(self.end - self.begin).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Free slots.
    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }

    /// Append at the tail, returning the absolute index.
    pub fn push(&mut self, debt: Debt) -> Result<u64, SettlementError> {
        if self.remaining() == 0 {
            return Err(SettlementError::DebtQueueFull {
                capacity: self.capacity(),
            });
        }
        let index = self.end;
        let slot = self.slot(index);
        self.slots[slot] = Some(debt);
        self.end += 1;
        Ok(index)
    }

    pub fn front(&self) -> Option<&Debt> {
        self.get(self.begin)
    }

    pub fn pop_front(&mut self) -> Option<Debt> {
        if self.is_empty() {
            return None;
        }
        let slot = self.slot(self.begin);
        self.begin += 1;
        self.slots[slot].take()
    }

    /// Live debt at absolute `index`.
    pub fn get(&self, index: u64) -> Option<&Debt> {
        if index < self.begin || index >= self.end {
            return None;
        }
        self.slots[self.slot(index)].as_ref()
    }

    /// Live debts from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &Debt> {
        (self.begin..self.end).filter_map(|i| self.get(i))
    }

    /// Drop debts from the head while `settled(index, debt)` holds.
    /// Returns how many were dropped.
    pub fn release_while<F>(&mut self, mut settled: F) -> usize
    where
        F: FnMut(u64, &Debt) -> bool,
    {
        let mut released = 0;
        while self.front().is_some_and(|d| settled(self.begin, d)) {
            self.pop_front();
            released += 1;
        }
        released
    }
}

//! Settlement period calendar.
//!
//! Payments are bought and claims are settled in whole periods. The reference
//! calendar is the UTC month: a period starts at 00:00:00 on the first day of
//! a month and ends where the next one starts. A fixed-length period is also
//! available for simulations and tests that want short, uniform periods.
//!
//! Every function is a pure function of its timestamp arguments.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// The period calendar used to align payments and claims.
///
/// # Examples
///
/// ```
/// use paymaster_core::period::Period;
/// // 2024-01-10 00:00:00 UTC
/// let t = 1_704_844_800;
/// assert_eq!(Period::CalendarMonth.start_of(t), 1_704_067_200); // 2024-01-01
/// assert_eq!(Period::CalendarMonth.next_boundary(t), 1_706_745_600); // 2024-02-01
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Period {
    /// UTC calendar month, first-of-month boundaries.
    #[default]
    CalendarMonth,
    /// Fixed number of seconds, boundaries at multiples of `seconds`.
    Fixed { seconds: u64 },
}

impl Period {
    /// Start of the period containing `t`.
    ///
    /// Saturates to `Timestamp::MAX` for timestamps the calendar cannot
    /// represent.
    pub fn start_of(&self, t: Timestamp) -> Timestamp {
        match self {
            Self::CalendarMonth => month_start(t)
                .and_then(to_timestamp)
                .unwrap_or(Timestamp::MAX),
            Self::Fixed { seconds } => {
                let len = (*seconds).max(1);
                t - t % len
            }
        }
    }

    /// First period boundary strictly after `t`.
    pub fn next_boundary(&self, t: Timestamp) -> Timestamp {
        match self {
            Self::CalendarMonth => month_start(t)
                .and_then(|d| d.checked_add_months(Months::new(1)))
                .and_then(to_timestamp)
                .unwrap_or(Timestamp::MAX),
            Self::Fixed { seconds } => self.start_of(t).saturating_add((*seconds).max(1)),
        }
    }

    /// The boundary `periods` periods after the start of the period containing `boundary`.
    ///
    /// `advance(b, 0) == start_of(b)`.
    pub fn advance(&self, boundary: Timestamp, periods: u32) -> Timestamp {
        match self {
            Self::CalendarMonth => month_start(boundary)
                .and_then(|d| d.checked_add_months(Months::new(periods)))
                .and_then(to_timestamp)
                .unwrap_or(Timestamp::MAX),
            Self::Fixed { seconds } => self
                .start_of(boundary)
                .saturating_add((*seconds).max(1).saturating_mul(u64::from(periods))),
        }
    }

    /// Whether `t` lies exactly on a period boundary.
    pub fn is_boundary(&self, t: Timestamp) -> bool {
        self.start_of(t) == t
    }

    /// Length in seconds of the period containing `t`.
    pub fn length_of(&self, t: Timestamp) -> u64 {
        self.next_boundary(t).saturating_sub(self.start_of(t))
    }
}

fn month_start(t: Timestamp) -> Option<NaiveDate> {
    let secs = i64::try_from(t).ok()?;
    let dt = DateTime::<Utc>::from_timestamp(secs, 0)?;
    NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
}

fn to_timestamp(date: NaiveDate) -> Option<Timestamp> {
    let secs = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
    u64::try_from(secs).ok()
}

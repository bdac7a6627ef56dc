//! Ledger constants. All monetary values in base units (1 token = 10^18 units).

use crate::types::Amount;

/// One whole token in base units.
pub const ONE_TOKEN: Amount = 1_000_000_000_000_000_000;

/// Default ceiling on how many periods past the current one a source may prepay.
pub const DEFAULT_MAX_REPLENISHMENT_PERIODS: u32 = 24;

/// Default allowed age of the unit price before a payment is refused, in seconds.
pub const DEFAULT_ALLOWED_PRICE_LAG_SECS: u64 = 60;

/// Default capacity of the debt ring buffer.
pub const DEFAULT_DEBT_CAPACITY: usize = 1024;

/// Seconds in one day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Version tag reported before one has been set explicitly.
pub const DEFAULT_VERSION: &str = concat!("paymaster-", env!("CARGO_PKG_VERSION"));

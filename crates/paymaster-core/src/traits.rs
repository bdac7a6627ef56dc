//! Collaborator interfaces for the settlement engine.
//!
//! The engine itself only does bookkeeping. Everything that touches the
//! outside world sits behind one of these traits:
//! - [`Custody`] — moves the distributed token in and out of the pool
//! - [`PriceOracle`] — turns a number of periods into a token amount
//! - [`Authority`] — decides who may run administrative operations
//! - [`Clock`] — supplies the current timestamp

use crate::error::{CustodyError, OracleError, SettlementError};
use crate::types::{Address, Amount, Operation, Timestamp};

/// Custody of the pooled token.
///
/// Transfers must be atomic: a call either moves the full amount or
/// returns an error and moves nothing.
pub trait Custody: Send + Sync {
    /// Pull `amount` from `from` into the pool.
    fn transfer_in(&mut self, from: &Address, amount: Amount) -> Result<(), CustodyError>;

    /// Push `amount` from the pool to `to`.
    fn transfer_out(&mut self, to: &Address, amount: Amount) -> Result<(), CustodyError>;

    /// Current balance of an account outside the pool.
    fn balance_of(&self, account: &Address) -> Amount;

    /// Current pool balance.
    fn pool_balance(&self) -> Amount;
}

/// Price source for buying periods.
pub trait PriceOracle: Send + Sync {
    /// Token amount due for `periods` periods at time `now`.
    ///
    /// Fails when the underlying price is missing or older than the allowed
    /// lag; implementations must never fall back to a stale value.
    fn amount_for_periods(&self, periods: u32, now: Timestamp) -> Result<Amount, OracleError>;
}

/// Capability check for administrative operations.
pub trait Authority: Send + Sync {
    /// Whether `caller` may perform `operation`.
    fn is_authorized(&self, caller: &Address, operation: Operation) -> bool;

    /// Fail with [`SettlementError::Unauthorized`] unless `caller` may perform `operation`.
    ///
    /// Default implementation delegates to [`is_authorized`](Self::is_authorized).
    fn require(&self, caller: &Address, operation: Operation) -> Result<(), SettlementError> {
        if self.is_authorized(caller, operation) {
            Ok(())
        } else {
            Err(SettlementError::Unauthorized {
                caller: *caller,
                operation: operation.to_string(),
            })
        }
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> Timestamp;
}

//! Error types for the Paymaster ledger.
use thiserror::Error;

use crate::types::{Address, Amount, RecipientId, SourceId, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("heap is empty")] EmptyHeap,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    #[error("cannot add income starting at {from}: processed until {processed_until}")] PastAddition { from: Timestamp, processed_until: Timestamp },
    #[error("invalid interval [{from}, {to})")] InvalidInterval { from: Timestamp, to: Timestamp },
    #[error("cannot clear until {until}: processed only until {processed_until}")] ClearUnprocessed { until: Timestamp, processed_until: Timestamp },
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("cannot add at {timestamp}: last change at {last}")] CannotAddToThePast { timestamp: Timestamp, last: Timestamp },
    #[error("cannot forget a key with non-zero value {value}")] ForgetActiveKey { value: u64 },
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("payment source already exists: {0}")] DuplicateSource(SourceId),
    #[error("payment source not found: {0}")] SourceNotFound(SourceId),
    #[error("replenishment of {periods} periods exceeds the limit of {max}")] ReplenishmentTooLarge { periods: u32, max: u32 },
    #[error("replenishment period must be positive")] ReplenishmentTooSmall,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecipientError {
    #[error("recipient id already in use: {0}")] DuplicateId(RecipientId),
    #[error("recipient address already in use: {0}")] DuplicateAddress(Address),
    #[error("recipient not found: {0}")] RecipientNotFound(RecipientId),
    #[error("no recipient with address {0}")] UnknownAddress(Address),
    #[error("recipient {id} was removed at {removed_at}")] Removed { id: RecipientId, removed_at: Timestamp },
    #[error("active count {active} exceeds total {total}")] ActiveExceedsTotal { active: u64, total: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("clearing until {until} would remove data needed up to {watermark}")] ImportantDataRemoval { until: Timestamp, watermark: Timestamp },
    #[error("debt queue full: capacity {capacity}")] DebtQueueFull { capacity: usize },
    #[error("{caller} is not allowed to {operation}")] Unauthorized { caller: Address, operation: String },
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("unit price has not been set")] PriceNotSet,
    #[error("unit price set at {updated_at} is stale at {now} (allowed lag {max_lag}s)")] StalePrice { updated_at: Timestamp, now: Timestamp, max_lag: u64 },
    #[error("unit price is zero")] ZeroPrice,
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("insufficient funds for {account}: have {have}, need {need}")] InsufficientFunds { account: Address, have: Amount, need: Amount },
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing 0x prefix")] MissingPrefix,
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("invalid hex: {0}")] InvalidHex(String),
}

#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error(transparent)] Heap(#[from] HeapError),
    #[error(transparent)] Timeline(#[from] TimelineError),
    #[error(transparent)] Sequence(#[from] SequenceError),
    #[error(transparent)] Source(#[from] SourceError),
    #[error(transparent)] Recipient(#[from] RecipientError),
    #[error(transparent)] Settlement(#[from] SettlementError),
    #[error(transparent)] Oracle(#[from] OracleError),
    #[error(transparent)] Custody(#[from] CustodyError),
    #[error(transparent)] Address(#[from] AddressError),
}

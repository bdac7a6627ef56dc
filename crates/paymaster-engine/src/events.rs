//! Ledger event stream.
//!
//! Every successful mutation appends one or more events. Events carry the
//! boundary timestamp the mutation produced where one exists, so a consumer
//! can replay the stream without querying the engine.

use paymaster_core::types::{decimal, Address, Amount, RecipientId, SourceId, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    SourceRegistered {
        id: SourceId,
        label: String,
        paid_until: Timestamp,
    },
    SourcePaid {
        id: SourceId,
        payer: Address,
        periods: u32,
        #[serde(with = "decimal")]
        amount: Amount,
        paid_until: Timestamp,
    },
    SourceRemoved {
        id: SourceId,
        #[serde(with = "decimal")]
        refunded: Amount,
        at: Timestamp,
    },
    RecipientRegistered {
        id: RecipientId,
        address: Address,
        claimed_until: Timestamp,
    },
    /// The recipient stops earning; it may still claim elapsed windows.
    RecipientMarkedRemoved {
        id: RecipientId,
        removed_at: Timestamp,
    },
    /// A removed recipient was fully settled and dropped from the ledger.
    RecipientRemoved {
        id: RecipientId,
    },
    ResourceCountChanged {
        id: RecipientId,
        total: u64,
        active: u64,
        at: Timestamp,
    },
    RewardClaimed {
        id: RecipientId,
        to: Address,
        #[serde(with = "decimal")]
        amount: Amount,
        until: Timestamp,
    },
    DebtRecorded {
        index: u64,
        origin: Timestamp,
        #[serde(with = "decimal")]
        amount: Amount,
        credited_to: Timestamp,
    },
    HistoryCleared {
        until: Timestamp,
    },
    MaxReplenishmentPeriodsSet {
        periods: u32,
    },
    VersionSet {
        version: String,
    },
}

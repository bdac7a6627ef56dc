//! # paymaster-engine — reward settlement for the Paymaster ledger.
//!
//! [`SettlementEngine`] accepts time-bounded payments from payment sources,
//! spreads them over the periods they buy and lets recipients claim their
//! pro-rata share of the income that accrued while their resources were
//! active.
//!
//! The engine itself only keeps books. Token movement, pricing, permission
//! checks and time are provided through the traits in
//! [`paymaster_core::traits`]; this crate ships in-memory reference
//! implementations of each:
//! - [`Treasury`] — custody of balances and the reward pool
//! - [`PriceFeed`] — per-period fee converted at a fresh unit price
//! - [`RoleAuthority`] / [`AllowAll`] — permission checks
//! - [`SystemClock`], [`ManualClock`], [`FastForwardClock`] — time sources

pub mod access;
pub mod clock;
pub mod config;
pub mod debt;
pub mod engine;
pub mod events;
pub mod price;
pub mod treasury;

pub use access::{AllowAll, RoleAuthority};
pub use clock::{FastForwardClock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use debt::{Debt, DebtQueue};
pub use engine::{Funding, PaymentSource, Recipient, SettlementEngine};
pub use events::LedgerEvent;
pub use price::PriceFeed;
pub use treasury::Treasury;

//! # paymaster-core
//! Foundation types, errors and collaborator traits for the Paymaster ledger.

pub mod constants;
pub mod error;
pub mod period;
pub mod traits;
pub mod types;

//! Scenario and adversarial test suite for the Paymaster settlement engine.
//!
//! The tests drive a full engine (treasury, price feed, manual clock) over
//! calendar months and check that funds are conserved and that no window is
//! paid twice, whatever order operations arrive in.

pub mod helpers;

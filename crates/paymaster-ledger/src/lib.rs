//! # paymaster-ledger — time-indexed data structures for reward settlement.
//!
//! All calculations use integer arithmetic only for determinism.
//!
//! - **Timeline**: income streams stored as integer rate changes, answering
//!   range sums exactly. A processed watermark folds old changes into
//!   cumulative checkpoints; a cleared bound drops them entirely.
//! - **Sequence**: forward-only step functions per key plus their aggregate,
//!   with binary-search point lookup.
//! - **MinHeap**: ordered frontier used to merge the change points of many
//!   step functions without re-sorting.

pub mod heap;
pub mod sequence;
pub mod timeline;

pub use heap::MinHeap;
pub use sequence::Sequence;
pub use timeline::Timeline;

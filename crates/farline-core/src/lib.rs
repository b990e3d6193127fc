//! farline-core: the wire-level protocol pieces of farline.
//!
//! This crate is independent of any memory backend. It defines:
//!
//! - the 64-byte [`Entry`] line, its whole-line XOR checksum and the epoch
//!   discipline that makes a slot self-describing ([`entry`]);
//! - the per-reason exponential [`Backoff`] engine ([`backoff`]);
//! - the best-effort [`Metrics`] counter block ([`metrics`]);
//! - the shared error taxonomy ([`error`]).
//!
//! The queue itself, the cache-bypass primitives and the shared-memory
//! plumbing live in `farline-shm`.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod backoff;
pub mod entry;
pub mod error;
pub mod metrics;

pub use backoff::{
    cpu_relax, Backoff, CONSUMER_EMPTY_MIN_WAIT, CONSUMER_TORN_MIN_WAIT, MAX_WAIT_CYCLES,
    PRODUCER_FULL_MIN_WAIT,
};
pub use entry::{expected_epoch, xor_fold, Entry, ENTRY_SIZE, MAX_ORDER, MIN_ORDER, PAYLOAD_WORDS};
pub use error::{DequeueError, Full, LayoutError};
pub use metrics::Metrics;

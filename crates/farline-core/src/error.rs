//! Error taxonomy shared across the workspace.
//!
//! Runtime outcomes (`Full`, `DequeueError`) are non-fatal and returned by
//! value on every call; construction problems (`LayoutError`) are programming
//! errors detected once, at wiring time.

use thiserror::Error;

use crate::entry::{MAX_ORDER, MIN_ORDER};

/// Construction-time validation failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The ring base address is not 64-byte aligned.
    #[error("ring base {0:#x} is not 64-byte aligned")]
    MisalignedRing(usize),
    /// The shared tail line address is not 64-byte aligned.
    #[error("tail line base {0:#x} is not 64-byte aligned")]
    MisalignedTailLine(usize),
    /// A handshake cell address is not 64-byte aligned.
    #[error("handshake cell {0:#x} is not 64-byte aligned")]
    MisalignedCell(usize),
    /// The ring order is outside the supported range.
    #[error("ring order {0} outside supported range [{MIN_ORDER}, {MAX_ORDER}]")]
    OrderOutOfRange(u32),
}

/// The producer cannot accept an entry right now.
///
/// The ring held `capacity` unconsumed entries even after a fresh read of the
/// shared tail. The caller decides whether to retry or drop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("ring is full")]
pub struct Full;

/// The consumer has nothing to take right now.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    /// The current slot's epoch does not match this lap: nothing new yet.
    #[error("no new entry at the current slot")]
    Empty,
    /// The slot's bytes do not fold to zero: a store is presumed in flight.
    #[error("slot bytes do not fold to zero; store presumed in flight")]
    Torn,
}

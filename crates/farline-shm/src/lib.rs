//! farline-shm: the shared-memory side of farline.
//!
//! This crate binds the protocol pieces from `farline-core` to real memory:
//! cache-bypassing primitives, region mapping and carving, the queue itself,
//! and the two-process wiring.
//!
//! # Characteristics
//!
//! - SPSC ring of fixed 64-byte entries, one per cache line
//! - One cache-bypassing 64-byte store (+ store fence) per enqueue
//! - One flush-then-load 64-byte read per dequeue
//! - Slot readiness from the entry's own epoch + checksum, never a flag
//! - Consumer back-pressure through a single shared tail line
//! - Per-reason exponential back-off on every failing branch
//!
//! # Memory layout (one session)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Ring: capacity × 64-byte Entry (capacity = 1 << order)              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Shared tail line (64 bytes: u64 tail + 56 reserved)                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Handshake flags (4 × 64-byte cells: producer_ready,                 │
//! │  consumer_ready, start, reserved)                                    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The region is *borrowed*: an external allocator (or this crate's
//! [`SharedRegion`]) owns the mapping, and the queue never frees anything.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod mem;
pub mod queue;
pub mod region;
pub mod session;

pub use queue::{BackoffStatus, LineCell, LineQueue};
pub use region::{RegionError, SharedRegion, LINE_ALIGN};
pub use session::{session_size, HandshakeCell, SessionLayout};

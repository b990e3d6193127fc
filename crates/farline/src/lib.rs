//! farline: a single-producer / single-consumer queue for far memory.
//!
//! farline carries fixed 64-byte messages between two sides (different
//! cores, processes or machines) that share a physical memory region, such
//! as a CXL slice, a DAX mapping or a remote NUMA node, where ordinary cache
//! coherence cannot be relied on. Every shared access is cache-bypassing, and a slot
//! announces itself through its own epoch byte and whole-line checksum
//! instead of a separate flag.
//!
//! # Quick start
//!
//! ```no_run
//! use farline::prelude::*;
//!
//! let order = 14; // 16_384 slots
//! let region = SharedRegion::anon(session_size(order))?;
//! let layout = SessionLayout::allocate(&region, order)?;
//!
//! let mut producer = layout.queue(true)?;  // first side up zeroes the ring
//! let mut consumer = layout.queue(false)?; // peer attaches
//!
//! let mut entry = Entry::default();
//! entry.rpc_id = 42;
//! producer.enqueue(&entry)?;
//!
//! let got = consumer.dequeue()?;
//! assert_eq!(got.rpc_id, 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Neither call blocks: `enqueue` returns [`Full`] and `dequeue` returns
//! [`DequeueError::Empty`] or [`DequeueError::Torn`] immediately, each after
//! one pause of its own exponential back-off schedule. The caller owns the
//! waiting policy.
//!
//! # Two processes
//!
//! Map the same backing with [`SharedRegion::create_file`] /
//! [`SharedRegion::open_file`], let both sides run the same
//! [`SessionLayout::allocate`] sequence, and gate the start on the
//! [`HandshakeCell`] flags. See `examples/two_process.rs`.

#![forbid(unsafe_op_in_unsafe_fn)]

// Re-export the protocol pieces.
pub use farline_core::{
    cpu_relax, expected_epoch, xor_fold, Backoff, DequeueError, Entry, Full, LayoutError, Metrics,
    ENTRY_SIZE, MAX_ORDER, MAX_WAIT_CYCLES, MIN_ORDER, PAYLOAD_WORDS,
};

// Re-export the shared-memory side.
pub use farline_shm::{
    session_size, BackoffStatus, HandshakeCell, LineCell, LineQueue, RegionError, SessionLayout,
    SharedRegion, LINE_ALIGN,
};

/// Prelude module for convenient imports.
///
/// ```
/// use farline::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        session_size, DequeueError, Entry, Full, LineQueue, SessionLayout, SharedRegion,
    };
}

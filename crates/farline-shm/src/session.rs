//! Two-process wiring: allocation plan and start-up handshake.
//!
//! The queue core never blocks and never signals; when producer and consumer
//! live in different processes something still has to make both sides carve
//! identical addresses out of the region and agree on a start moment. A
//! [`SessionLayout`] performs the deterministic allocation sequence (ring,
//! tail line, four flag cells), and a [`HandshakeCell`] is a one-shot flag
//! raised and observed purely through cache-bypassing accesses, so it works
//! over the same unreliable memory as the queue itself.
//!
//! The handshake protocol mirrors the original deployment drivers: the
//! initializing side zeroes the flags and raises `producer_ready`, the peer
//! raises `consumer_ready` after attaching, and the initializing side then
//! raises `start` to open the gates.

use std::ptr::NonNull;

use tracing::debug;

use farline_core::{cpu_relax, Entry, LayoutError, ENTRY_SIZE};

use crate::mem;
use crate::queue::{LineCell, LineQueue};
use crate::region::{RegionError, SharedRegion};

/// A one-shot flag in its own shared cache line.
///
/// Raised with a cache-bypassing 64-bit store, observed with flush-then-load
/// reads. Cells are zeroed by the initializing side only.
pub struct HandshakeCell {
    cell: NonNull<LineCell>,
}

// SAFETY: the cell is a raw shared-memory line; raise/wait use bypassing
// accesses and any interleaving of one raiser and one waiter is sound.
unsafe impl Send for HandshakeCell {}
unsafe impl Sync for HandshakeCell {}

impl HandshakeCell {
    /// Wrap a shared cell.
    ///
    /// With `initialize` the flag is lowered (zeroed) through a bypassing
    /// store; the attaching side passes `false`.
    ///
    /// # Safety
    ///
    /// `cell` must be valid for reads and writes of 64 bytes for the cell's
    /// lifetime.
    pub unsafe fn from_raw(cell: NonNull<LineCell>, initialize: bool) -> Result<Self, LayoutError> {
        let addr = cell.as_ptr() as usize;
        if addr % 64 != 0 {
            return Err(LayoutError::MisalignedCell(addr));
        }
        let this = Self { cell };
        if initialize {
            // SAFETY: validity from the caller, alignment checked above.
            unsafe { mem::store_u64(this.value_ptr(), 0) };
        }
        Ok(this)
    }

    /// Raise the flag with a cache-bypassing store.
    pub fn raise(&self) {
        // SAFETY: value_ptr is valid and aligned per construction.
        unsafe { mem::store_u64(self.value_ptr(), 1) };
    }

    /// Whether the flag has been raised, observing current shared memory.
    pub fn is_raised(&self) -> bool {
        // SAFETY: value_ptr is valid and aligned per construction.
        unsafe { mem::load_u64_fresh(self.value_ptr()) != 0 }
    }

    /// Spin until the flag is raised, relaxing `relax_cycles` per probe.
    pub fn wait(&self, relax_cycles: u32) {
        while !self.is_raised() {
            cpu_relax(relax_cycles);
        }
    }

    #[inline]
    fn value_ptr(&self) -> *mut u64 {
        self.cell.as_ptr().cast::<u64>()
    }
}

/// Shared-memory footprint of one queue plus its handshake flags.
pub fn session_size(order: u32) -> usize {
    // ring + tail line + four flag cells (producer_ready, consumer_ready,
    // start, reserved)
    (ENTRY_SIZE << order) + ENTRY_SIZE + 4 * ENTRY_SIZE
}

/// Addresses of one queue's pieces inside a shared region.
///
/// Both processes construct the layout with the same `order` against the
/// same (freshly cursored) region, so the bump allocator hands out identical
/// offsets on both sides.
pub struct SessionLayout {
    ring: NonNull<Entry>,
    order: u32,
    tail_line: NonNull<LineCell>,
    producer_ready: NonNull<LineCell>,
    consumer_ready: NonNull<LineCell>,
    start: NonNull<LineCell>,
}

impl SessionLayout {
    /// Carve the queue pieces out of `region` in deterministic order.
    pub fn allocate(region: &SharedRegion, order: u32) -> Result<Self, RegionError> {
        let ring = region.alloc_lines(ENTRY_SIZE << order)?.cast::<Entry>();
        let tail_line = region.alloc_lines(ENTRY_SIZE)?.cast::<LineCell>();
        let producer_ready = region.alloc_lines(ENTRY_SIZE)?.cast::<LineCell>();
        let consumer_ready = region.alloc_lines(ENTRY_SIZE)?.cast::<LineCell>();
        let start = region.alloc_lines(ENTRY_SIZE)?.cast::<LineCell>();
        let _reserved = region.alloc_lines(ENTRY_SIZE)?;
        debug!(order, "session layout carved");
        Ok(Self {
            ring,
            order,
            tail_line,
            producer_ready,
            consumer_ready,
            start,
        })
    }

    /// Construct the queue over this layout's ring and tail line.
    ///
    /// The first side up passes `initialize = true` and zeroes the ring; the
    /// peer attaches without mutating.
    pub fn queue(&self, initialize: bool) -> Result<LineQueue, LayoutError> {
        // SAFETY: the pieces were carved from a live region sized by
        // session_size; single producer / single consumer is the caller's
        // deployment contract.
        unsafe { LineQueue::from_raw(self.ring, self.order, self.tail_line, initialize) }
    }

    /// The `producer_ready` flag.
    pub fn producer_ready(&self, initialize: bool) -> Result<HandshakeCell, LayoutError> {
        // SAFETY: carved from the live region.
        unsafe { HandshakeCell::from_raw(self.producer_ready, initialize) }
    }

    /// The `consumer_ready` flag.
    pub fn consumer_ready(&self, initialize: bool) -> Result<HandshakeCell, LayoutError> {
        // SAFETY: carved from the live region.
        unsafe { HandshakeCell::from_raw(self.consumer_ready, initialize) }
    }

    /// The `start` flag.
    pub fn start(&self, initialize: bool) -> Result<HandshakeCell, LayoutError> {
        // SAFETY: carved from the live region.
        unsafe { HandshakeCell::from_raw(self.start, initialize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_size_covers_the_layout() {
        let order = 4;
        let region = SharedRegion::anon(session_size(order)).unwrap();
        let layout = SessionLayout::allocate(&region, order).unwrap();
        let _ = layout.queue(true).unwrap();
        assert_eq!(region.remaining(), 0);
    }

    #[test]
    fn flags_raise_and_observe_across_instances() {
        let order = 4;
        let region = SharedRegion::anon(session_size(order)).unwrap();
        let layout = SessionLayout::allocate(&region, order).unwrap();

        let a = layout.producer_ready(true).unwrap();
        let b = layout.producer_ready(false).unwrap();

        assert!(!b.is_raised());
        a.raise();
        assert!(b.is_raised());
        b.wait(1);
    }

    #[test]
    fn layout_offsets_are_deterministic() {
        // Two processes repeat the same allocation sequence against the same
        // backing, so every piece must land at a base-independent offset.
        let order = 5;
        let region = SharedRegion::anon(session_size(order)).unwrap();
        let layout = SessionLayout::allocate(&region, order).unwrap();
        let base = region.as_ptr() as usize;

        assert_eq!(layout.ring.as_ptr() as usize - base, 0);
        assert_eq!(
            layout.tail_line.as_ptr() as usize - base,
            ENTRY_SIZE << order
        );
        assert_eq!(
            layout.producer_ready.as_ptr() as usize - base,
            (ENTRY_SIZE << order) + ENTRY_SIZE
        );
    }
}

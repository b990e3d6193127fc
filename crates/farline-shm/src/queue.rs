//! The single-producer / single-consumer line queue.
//!
//! A [`LineQueue`] binds a power-of-two ring of 64-byte [`Entry`] slots and a
//! shared tail line, both living in memory the allocator owns. The queue
//! itself owns nothing shared: the producer's `head` and `shadow_tail` and
//! the consumer's `tail` are instance-local, and each side of a deployment
//! constructs its own instance over the same memory.
//!
//! Readiness is never a separate flag. A slot is consumable when its epoch
//! byte matches the expected value for the consumer's lap *and* the whole
//! line folds to zero; a zeroed slot, a prior-lap slot and a torn delivery
//! all fail one of the two gates.
//!
//! Back-pressure flows the other way through the shared tail line: the
//! consumer republishes its tail every `capacity / 4` dequeues, so the
//! producer's view is stale by at most `flush_interval - 1` slots. Staleness
//! can only cause spurious `Full` returns, never overwrites.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};

use farline_core::{
    expected_epoch, Backoff, DequeueError, Entry, Full, LayoutError, Metrics,
    CONSUMER_EMPTY_MIN_WAIT, CONSUMER_TORN_MIN_WAIT, MAX_ORDER, MIN_ORDER, PRODUCER_FULL_MIN_WAIT,
};

use crate::mem;

/// A 64-byte-aligned cache line carrying one published 64-bit value.
///
/// The queue's shared tail line and the handshake flags all have this shape:
/// the value sits in the first eight bytes, the rest is reserved and left
/// undisturbed after initialization.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug)]
pub struct LineCell {
    pub value: u64,
    _reserved: [u8; 56],
}

// SAFETY: repr(C), size == align == 64, all fields plain bytes, no padding
// (8 + 56 = 64).
unsafe impl Zeroable for LineCell {}
unsafe impl Pod for LineCell {}

const _: () = assert!(core::mem::size_of::<LineCell>() == 64);
const _: () = assert!(core::mem::align_of::<LineCell>() == 64);
const _: () = assert!(core::mem::offset_of!(LineCell, value) == 0);

/// Current per-reason back-off waits, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStatus {
    /// Next wait of the producer-full schedule.
    pub producer_full: u32,
    /// Next wait of the consumer-empty schedule.
    pub consumer_empty: u32,
    /// Next wait of the consumer-torn schedule.
    pub consumer_torn: u32,
}

/// Single-producer / single-consumer queue over cache-bypassed shared memory.
///
/// Exactly one instance may act as producer and one as consumer per ring.
/// Both hot paths take `&mut self`; the type is [`Send`] but deliberately not
/// [`Sync`], so the single-writer discipline per side is a property of the
/// type rather than a convention.
#[derive(Debug)]
pub struct LineQueue {
    ring: NonNull<Entry>,
    order: u32,
    mask: u32,
    /// Producer-local: slots reserved so far. Never read by the consumer.
    head: AtomicU32,
    /// Producer-local cached belief about the consumer's tail.
    shadow_tail: u32,
    /// Consumer-local: slots consumed so far.
    tail: u32,
    tail_line: NonNull<LineCell>,
    backoff_full: Backoff,
    backoff_empty: Backoff,
    backoff_torn: Backoff,
    metrics: Metrics,
}

// SAFETY: the raw pointers refer to shared memory whose cross-instance
// coordination is the whole point of the protocol; moving a LineQueue to
// another thread is fine. The type is intentionally not Sync.
unsafe impl Send for LineQueue {}

impl LineQueue {
    /// Bind a queue to a ring of `1 << order` slots and a shared tail line.
    ///
    /// With `initialize` the ring is zeroed through cache-bypassing stores
    /// and `tail = 0` is published to the shared line; the attaching side of
    /// a two-process deployment passes `false` and mutates nothing.
    ///
    /// # Safety
    ///
    /// - `ring` must be valid for reads and writes of `64 << order` bytes
    ///   for the queue's lifetime;
    /// - `tail_line` must be valid for reads and writes of 64 bytes for the
    ///   queue's lifetime and distinct from the ring;
    /// - at most one producer instance and one consumer instance may operate
    ///   on the same ring.
    pub unsafe fn from_raw(
        ring: NonNull<Entry>,
        order: u32,
        tail_line: NonNull<LineCell>,
        initialize: bool,
    ) -> Result<Self, LayoutError> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(LayoutError::OrderOutOfRange(order));
        }
        let ring_addr = ring.as_ptr() as usize;
        if ring_addr % 64 != 0 {
            return Err(LayoutError::MisalignedRing(ring_addr));
        }
        let tail_addr = tail_line.as_ptr() as usize;
        if tail_addr % 64 != 0 {
            return Err(LayoutError::MisalignedTailLine(tail_addr));
        }

        let queue = Self {
            ring,
            order,
            mask: (1u32 << order) - 1,
            head: AtomicU32::new(0),
            shadow_tail: 0,
            tail: 0,
            tail_line,
            backoff_full: Backoff::new(PRODUCER_FULL_MIN_WAIT),
            backoff_empty: Backoff::new(CONSUMER_EMPTY_MIN_WAIT),
            backoff_torn: Backoff::new(CONSUMER_TORN_MIN_WAIT),
            metrics: Metrics::default(),
        };

        if initialize {
            let zero = Entry::default();
            for slot in 0..queue.capacity() {
                // SAFETY: slot pointers stay inside the ring allocation the
                // caller vouched for; alignment checked above.
                unsafe { mem::store_line(queue.ring.as_ptr().add(slot), &zero) };
            }
            // SAFETY: tail_line validity and alignment checked above.
            unsafe { mem::store_u64(queue.tail_value_ptr(), 0) };
            debug!(order, capacity = queue.capacity(), "queue initialized");
        } else {
            debug!(order, capacity = queue.capacity(), "queue attached");
        }

        Ok(queue)
    }

    /// Number of slots in the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        1usize << self.order
    }

    /// Stride in successful dequeues between shared-tail publications.
    #[inline]
    pub fn flush_interval(&self) -> u32 {
        1u32.max((1u32 << self.order) / 4)
    }

    /// Snapshot of this instance's counters.
    #[inline]
    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    /// Current back-off waits of every schedule.
    #[inline]
    pub fn backoff_status(&self) -> BackoffStatus {
        BackoffStatus {
            producer_full: self.backoff_full.current_wait(),
            consumer_empty: self.backoff_empty.current_wait(),
            consumer_torn: self.backoff_torn.current_wait(),
        }
    }

    /// Offer one entry to the ring.
    ///
    /// The caller fills `payload`, `rpc_method`, `rpc_id` and `seal_index`;
    /// `epoch` and `checksum` are overwritten here. On success the slot is
    /// written with a single 64-byte cache-bypassing store plus store fence.
    ///
    /// Returns [`Full`] when `capacity` entries are outstanding even after a
    /// fresh read of the shared tail; one producer back-off pause has been
    /// taken in that case.
    pub fn enqueue(&mut self, entry: &Entry) -> Result<(), Full> {
        self.metrics.enqueue_calls += 1;

        let slot = self.head.load(Ordering::Relaxed);
        let cap = 1u32 << self.order;

        // Unsigned counters compared as a signed difference, so the check
        // stays correct across 32-bit wrap.
        if slot.wrapping_sub(self.shadow_tail) as i32 >= cap as i32 {
            self.metrics.tail_reads += 1;
            // SAFETY: tail_value_ptr is valid and 8-byte aligned for the
            // queue's lifetime; the consumer is the only writer.
            self.shadow_tail = unsafe { mem::load_u64_fresh(self.tail_value_ptr()) } as u32;
            trace!(slot, shadow_tail = self.shadow_tail, "refreshed shared tail");

            if slot.wrapping_sub(self.shadow_tail) as i32 >= cap as i32 {
                self.metrics.queue_full += 1;
                self.backoff_full.pause(
                    &mut self.metrics.producer_backoff_events,
                    &mut self.metrics.producer_backoff_cycles,
                );
                return Err(Full);
            }
        }
        self.backoff_full.reset();

        let mut line = *entry;
        line.seal(expected_epoch(slot, self.order));

        // SAFETY: the slot pointer stays inside the ring; this instance is
        // the only writer of ring slots.
        unsafe { mem::store_line(self.slot_ptr(slot), &line) };

        self.head.store(slot.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Take the next entry from the ring, if one is ready.
    ///
    /// Performs one cache-bypassing 64-byte read of the current slot, then
    /// applies the two readiness gates. A failing gate never advances `tail`
    /// and never touches the shared line.
    pub fn dequeue(&mut self) -> Result<Entry, DequeueError> {
        self.metrics.dequeue_calls += 1;

        // SAFETY: the slot pointer stays inside the ring; concurrent writes
        // by the producer are expected and filtered by the gates below.
        let entry = unsafe { mem::load_line_fresh(self.slot_ptr(self.tail)) };

        let expected = expected_epoch(self.tail, self.order);
        if entry.epoch != expected {
            self.metrics.not_ready += 1;
            self.backoff_empty.pause(
                &mut self.metrics.consumer_backoff_events,
                &mut self.metrics.consumer_backoff_cycles,
            );
            return Err(DequeueError::Empty);
        }

        if !entry.verify() {
            self.metrics.checksum_failed += 1;
            debug!(tail = self.tail, "line did not fold to zero");
            self.backoff_torn.pause(
                &mut self.metrics.consumer_backoff_events,
                &mut self.metrics.consumer_backoff_cycles,
            );
            return Err(DequeueError::Torn);
        }

        self.backoff_empty.reset();
        self.backoff_torn.reset();
        self.tail = self.tail.wrapping_add(1);

        if self.tail & (self.flush_interval() - 1) == 0 {
            self.flush_tail();
        }

        Ok(entry)
    }

    /// Publish the consumer's tail to the shared line.
    fn flush_tail(&mut self) {
        // SAFETY: tail_value_ptr is valid and 8-byte aligned for the queue's
        // lifetime; this instance is the only writer of the shared line.
        unsafe { mem::store_u64(self.tail_value_ptr(), u64::from(self.tail)) };
        self.metrics.tail_flushes += 1;
        trace!(tail = self.tail, "published tail");
    }

    #[inline]
    fn slot_ptr(&self, counter: u32) -> *mut Entry {
        // SAFETY: masked index is < capacity, inside the ring allocation.
        unsafe { self.ring.as_ptr().add((counter & self.mask) as usize) }
    }

    #[inline]
    fn tail_value_ptr(&self) -> *mut u64 {
        // value sits at offset 0 of the cell (const-asserted above).
        self.tail_line.as_ptr().cast::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use farline_core::ENTRY_SIZE;

    fn pair(region: &SharedRegion, order: u32) -> (LineQueue, LineQueue) {
        let ring = region
            .alloc_lines(ENTRY_SIZE << order)
            .unwrap()
            .cast::<Entry>();
        let tail = region
            .alloc_lines(ENTRY_SIZE)
            .unwrap()
            .cast::<LineCell>();
        // SAFETY: both blocks come from a live region sized for them; one
        // producer, one consumer.
        let producer = unsafe { LineQueue::from_raw(ring, order, tail, true) }.unwrap();
        let consumer = unsafe { LineQueue::from_raw(ring, order, tail, false) }.unwrap();
        (producer, consumer)
    }

    fn entry_with_id(rpc_id: u16) -> Entry {
        Entry {
            rpc_id,
            ..Entry::default()
        }
    }

    #[test]
    fn rejects_bad_order() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let ring = region.alloc_lines(ENTRY_SIZE * 16).unwrap().cast::<Entry>();
        let tail = region.alloc_lines(ENTRY_SIZE).unwrap().cast::<LineCell>();
        for order in [0, 3, 31] {
            // SAFETY: the blocks outlive the call; construction fails before
            // any access.
            let err = unsafe { LineQueue::from_raw(ring, order, tail, true) }.unwrap_err();
            assert_eq!(err, LayoutError::OrderOutOfRange(order));
        }
    }

    #[test]
    fn rejects_misaligned_bases() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let block = region.alloc_lines(ENTRY_SIZE * 32).unwrap();
        let tail = region.alloc_lines(ENTRY_SIZE).unwrap().cast::<LineCell>();

        // SAFETY: pointer stays inside the block; construction rejects it
        // before any access.
        let skewed = unsafe { NonNull::new_unchecked(block.as_ptr().add(8)).cast::<Entry>() };
        let err = unsafe { LineQueue::from_raw(skewed, 4, tail, true) }.unwrap_err();
        assert!(matches!(err, LayoutError::MisalignedRing(_)));

        let ring = block.cast::<Entry>();
        // SAFETY: as above.
        let skewed_tail =
            unsafe { NonNull::new_unchecked(tail.as_ptr().cast::<u8>().add(8)).cast::<LineCell>() };
        let err = unsafe { LineQueue::from_raw(ring, 4, skewed_tail, true) }.unwrap_err();
        assert!(matches!(err, LayoutError::MisalignedTailLine(_)));
    }

    #[test]
    fn fresh_queue_is_empty() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (_producer, mut consumer) = pair(&region, 4);
        assert_eq!(consumer.dequeue(), Err(DequeueError::Empty));
        assert_eq!(consumer.metrics().not_ready, 1);
    }

    #[test]
    fn flush_interval_is_quarter_capacity() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (producer, _) = pair(&region, 4);
        assert_eq!(producer.flush_interval(), 4);

        let region = SharedRegion::anon(1 << 14).unwrap();
        let ring = region.alloc_lines(ENTRY_SIZE << 6).unwrap().cast::<Entry>();
        let tail = region.alloc_lines(ENTRY_SIZE).unwrap().cast::<LineCell>();
        // SAFETY: blocks sized for order 6.
        let q = unsafe { LineQueue::from_raw(ring, 6, tail, true) }.unwrap();
        assert_eq!(q.flush_interval(), 16);
    }

    #[test]
    fn single_round_trip_carries_caller_fields() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        let mut e = entry_with_id(42);
        e.rpc_method = 3;
        e.seal_index = -7;
        e.payload[0] = 0x0123_4567_89AB_CDEF;
        producer.enqueue(&e).unwrap();

        let got = consumer.dequeue().unwrap();
        assert_eq!(got.rpc_id, 42);
        assert_eq!(got.rpc_method, 3);
        assert_eq!(got.seal_index, -7);
        assert_eq!(got.payload[0], 0x0123_4567_89AB_CDEF);
        assert_eq!(got.epoch, 1);
        assert!(got.verify());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        for i in 0..15u16 {
            producer.enqueue(&entry_with_id(i)).unwrap();
        }
        for i in 0..15u16 {
            assert_eq!(consumer.dequeue().unwrap().rpc_id, i);
        }
        assert_eq!(consumer.dequeue(), Err(DequeueError::Empty));
    }

    #[test]
    fn full_after_capacity_then_frees_one_by_one() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        for i in 0..16u16 {
            producer.enqueue(&entry_with_id(i)).unwrap();
        }
        assert_eq!(producer.enqueue(&entry_with_id(16)), Err(Full));
        assert_eq!(producer.metrics().queue_full, 1);
        assert!(producer.metrics().tail_reads >= 1);

        assert_eq!(consumer.dequeue().unwrap().rpc_id, 0);
        // The consumer publishes every 4 dequeues on order 4; three more
        // drains make the freed slot visible to the producer.
        for i in 1..4u16 {
            assert_eq!(consumer.dequeue().unwrap().rpc_id, i);
        }
        producer.enqueue(&entry_with_id(16)).unwrap();
    }

    #[test]
    fn wraparound_bumps_the_epoch() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        for i in 0..16u16 {
            producer.enqueue(&entry_with_id(i)).unwrap();
        }
        for i in 0..8u16 {
            assert_eq!(consumer.dequeue().unwrap().rpc_id, i);
        }
        for i in 16..24u16 {
            producer.enqueue(&entry_with_id(i)).unwrap();
        }
        for i in 8..16u16 {
            let e = consumer.dequeue().unwrap();
            assert_eq!(e.rpc_id, i);
            assert_eq!(e.epoch, 1);
        }
        for i in 16..24u16 {
            let e = consumer.dequeue().unwrap();
            assert_eq!(e.rpc_id, i);
            assert_eq!(e.epoch, 2);
        }
    }

    #[test]
    fn torn_line_is_rejected_without_advancing() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        producer.enqueue(&entry_with_id(7)).unwrap();

        // Corrupt one byte of the slot behind the queue's back.
        let slot0 = producer.slot_ptr(0);
        // SAFETY: slot0 is inside the ring; the test owns both endpoints.
        unsafe {
            let byte = slot0.cast::<u8>().add(5);
            byte.write_volatile(byte.read_volatile() ^ 0x01);
        }

        assert_eq!(consumer.dequeue(), Err(DequeueError::Torn));
        assert_eq!(consumer.metrics().checksum_failed, 1);

        // Restore the byte: the entry becomes consumable again and tail
        // never moved.
        // SAFETY: as above.
        unsafe {
            let byte = slot0.cast::<u8>().add(5);
            byte.write_volatile(byte.read_volatile() ^ 0x01);
        }
        assert_eq!(consumer.dequeue().unwrap().rpc_id, 7);
    }

    #[test]
    fn backoff_escalates_then_resets_on_success() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        let initial = consumer.backoff_status().consumer_empty;
        for _ in 0..8 {
            assert_eq!(consumer.dequeue(), Err(DequeueError::Empty));
        }
        assert!(consumer.backoff_status().consumer_empty > initial);

        producer.enqueue(&entry_with_id(1)).unwrap();
        consumer.dequeue().unwrap();
        assert_eq!(consumer.backoff_status().consumer_empty, initial);
    }

    #[test]
    fn tail_flush_lands_exactly_on_the_interval() {
        let region = SharedRegion::anon(1 << 20).unwrap();
        let (mut producer, mut consumer) = pair(&region, 4);

        for i in 0..16u16 {
            producer.enqueue(&entry_with_id(i)).unwrap();
        }
        for i in 0..16u32 {
            consumer.dequeue().unwrap();
            let expected_flushes = u64::from((i + 1) / 4);
            assert_eq!(consumer.metrics().tail_flushes, expected_flushes);
        }
    }
}

//! In-memory model of the line-queue protocol for property-based testing.
//!
//! The model mirrors the real enqueue/dequeue algorithms (epoch stamping,
//! whole-line checksum, shadow-tail staleness, flush-interval publication)
//! over a plain `Vec` instead of shared memory, so invariants can be fuzzed
//! without mmap or cache-bypassing stores.

use farline_core::{expected_epoch, Entry, MAX_ORDER, MIN_ORDER};

/// Minimum ring order used by the fuzzer (capacity 16).
pub const FUZZ_MIN_ORDER: u32 = MIN_ORDER;
/// Maximum ring order used by the fuzzer (keep rings small to reach wraps).
pub const FUZZ_MAX_ORDER: u32 = 6;

const _: () = assert!(FUZZ_MAX_ORDER <= MAX_ORDER);

/// Outcome of a model enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEnqueue {
    Accepted,
    Full,
}

/// Outcome of a model dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDequeue {
    Entry(Entry),
    Empty,
    Torn,
}

/// A pure-Rust replica of the queue's slot/epoch/checksum protocol.
pub struct QueueModel {
    ring: Vec<Entry>,
    order: u32,
    /// Producer-local reservation counter.
    head: u32,
    /// Producer's cached view of the published tail.
    shadow_tail: u32,
    /// The shared tail line's current value.
    published_tail: u32,
    /// Consumer-local consumption counter.
    tail: u32,
}

impl QueueModel {
    /// Create a zeroed ring of `1 << order` slots.
    pub fn new(order: u32) -> Self {
        let order = order.clamp(FUZZ_MIN_ORDER, FUZZ_MAX_ORDER);
        Self {
            ring: vec![Entry::default(); 1 << order],
            order,
            head: 0,
            shadow_tail: 0,
            published_tail: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        1 << self.order
    }

    #[inline]
    pub fn flush_interval(&self) -> u32 {
        1u32.max(self.capacity() / 4)
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity() - 1
    }

    /// Producer path: fullness by shadow view, refresh from the published
    /// tail, seal and write.
    pub fn enqueue(&mut self, entry: &Entry) -> ModelEnqueue {
        let slot = self.head;
        let cap = self.capacity();

        if slot.wrapping_sub(self.shadow_tail) as i32 >= cap as i32 {
            self.shadow_tail = self.published_tail;
            if slot.wrapping_sub(self.shadow_tail) as i32 >= cap as i32 {
                return ModelEnqueue::Full;
            }
        }

        let mut line = *entry;
        line.seal(expected_epoch(slot, self.order));
        let idx = (slot & self.mask()) as usize;
        assert!(idx < self.ring.len(), "enqueue index out of bounds");
        self.ring[idx] = line;

        self.head = slot.wrapping_add(1);
        ModelEnqueue::Accepted
    }

    /// Consumer path: epoch gate, checksum gate, advance, periodic publish.
    pub fn dequeue(&mut self) -> ModelDequeue {
        let idx = (self.tail & self.mask()) as usize;
        assert!(idx < self.ring.len(), "dequeue index out of bounds");
        let entry = self.ring[idx];

        if entry.epoch != expected_epoch(self.tail, self.order) {
            return ModelDequeue::Empty;
        }
        if !entry.verify() {
            return ModelDequeue::Torn;
        }

        self.tail = self.tail.wrapping_add(1);
        if self.tail & (self.flush_interval() - 1) == 0 {
            self.published_tail = self.tail;
        }
        ModelDequeue::Entry(entry)
    }

    /// Flip one bit of the slot the consumer will read next.
    ///
    /// Returns the pristine line so the caller can restore it.
    pub fn corrupt_next_slot(&mut self, byte: usize, bit: u8) -> Entry {
        let idx = (self.tail & self.mask()) as usize;
        let pristine = self.ring[idx];
        let bytes = bytemuck::bytes_of_mut(&mut self.ring[idx]);
        bytes[byte % 64] ^= 1 << (bit % 8);
        pristine
    }

    /// Restore a slot the caller corrupted.
    pub fn restore_next_slot(&mut self, pristine: Entry) {
        let idx = (self.tail & self.mask()) as usize;
        self.ring[idx] = pristine;
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn published_tail(&self) -> u32 {
        self.published_tail
    }

    /// Entries enqueued but not yet consumed.
    pub fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations the fuzzer can drive.
#[derive(Clone, Copy, Debug)]
pub enum QueueOp {
    Enqueue(u16),
    Dequeue,
    /// Flip a bit of the next-to-read slot, observe the torn rejection,
    /// restore.
    TearNextSlot { byte: u8, bit: u8 },
}

/// Execute a sequence of operations and verify protocol invariants after
/// every step.
pub fn execute_and_verify(order: u32, ops: &[QueueOp]) -> Result<(), String> {
    let mut queue = QueueModel::new(order);
    let mut expected: std::collections::VecDeque<u16> = std::collections::VecDeque::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            QueueOp::Enqueue(id) => {
                let entry = Entry {
                    rpc_id: id,
                    payload: [u64::from(id), 0, 0, 0, 0, 0, 0],
                    ..Entry::default()
                };
                match queue.enqueue(&entry) {
                    ModelEnqueue::Accepted => expected.push_back(id),
                    ModelEnqueue::Full => {
                        // Full is legal iff the *published* tail (the view a
                        // fresh refresh yields) leaves no headroom; the
                        // consumer may privately be further along.
                        let visible = queue.head().wrapping_sub(queue.published_tail());
                        if visible < queue.capacity() {
                            return Err(format!(
                                "op {i}: reported full with {visible} of {} slots visible",
                                queue.capacity()
                            ));
                        }
                        if expected.len() == queue.capacity() as usize {
                            // Truly full is always a correct Full.
                        } else if queue.tail().wrapping_sub(queue.published_tail())
                            >= queue.flush_interval()
                        {
                            return Err(format!(
                                "op {i}: spurious full with stale tail beyond one interval"
                            ));
                        }
                    }
                }
            }
            QueueOp::Dequeue => match (queue.dequeue(), expected.pop_front()) {
                (ModelDequeue::Entry(e), Some(id)) => {
                    if e.rpc_id != id {
                        return Err(format!("op {i}: dequeued {} expected {id}", e.rpc_id));
                    }
                    if !e.verify() {
                        return Err(format!("op {i}: accepted entry does not fold to zero"));
                    }
                }
                (ModelDequeue::Empty, None) => {}
                (ModelDequeue::Entry(e), None) => {
                    return Err(format!("op {i}: dequeued {:?} from empty queue", e.rpc_id));
                }
                (ModelDequeue::Empty, Some(id)) => {
                    return Err(format!("op {i}: empty but {id} outstanding"));
                }
                (ModelDequeue::Torn, _) => {
                    return Err(format!("op {i}: torn without injected corruption"));
                }
            },
            QueueOp::TearNextSlot { byte, bit } => {
                if expected.is_empty() {
                    continue;
                }
                let tail_before = queue.tail();
                let pristine = queue.corrupt_next_slot(byte as usize, bit);
                // A flip in the epoch byte reads as Empty, anywhere else as
                // Torn; a corrupted line must never be consumable.
                match queue.dequeue() {
                    ModelDequeue::Empty | ModelDequeue::Torn => {}
                    ModelDequeue::Entry(e) => {
                        return Err(format!(
                            "op {i}: corrupted slot was consumable (rpc_id {})",
                            e.rpc_id
                        ));
                    }
                }
                if queue.tail() != tail_before {
                    return Err(format!("op {i}: corrupted read advanced the tail"));
                }
                queue.restore_next_slot(pristine);
            }
        }

        verify_invariants(&queue, &expected, i)?;
    }

    Ok(())
}

fn verify_invariants(
    queue: &QueueModel,
    expected: &std::collections::VecDeque<u16>,
    op_idx: usize,
) -> Result<(), String> {
    // Occupancy matches the reference sequence.
    if queue.len() as usize != expected.len() {
        return Err(format!(
            "after op {op_idx}: len {} but reference holds {}",
            queue.len(),
            expected.len()
        ));
    }

    // 0 <= head - tail <= capacity at all times.
    if queue.len() > queue.capacity() {
        return Err(format!(
            "after op {op_idx}: {} outstanding exceeds capacity {}",
            queue.len(),
            queue.capacity()
        ));
    }

    // The published tail never runs ahead of the consumer...
    let lag = queue.tail().wrapping_sub(queue.published_tail());
    // ...and never lags by a full flush interval or more.
    if lag >= queue.flush_interval() {
        return Err(format!(
            "after op {op_idx}: published tail lags by {lag}, interval {}",
            queue.flush_interval()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_fifo() {
        let mut ops = vec![QueueOp::Enqueue(1), QueueOp::Enqueue(2), QueueOp::Dequeue];
        ops.push(QueueOp::Enqueue(3));
        ops.extend([QueueOp::Dequeue, QueueOp::Dequeue, QueueOp::Dequeue]);
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn many_full_laps_wrap_the_epoch() {
        // Enough laps to wrap the 8-bit epoch twice on a 16-slot ring.
        let mut ops = Vec::new();
        for round in 0..520u32 {
            for i in 0..16u32 {
                ops.push(QueueOp::Enqueue((round * 16 + i) as u16));
            }
            for _ in 0..16 {
                ops.push(QueueOp::Dequeue);
            }
        }
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn stale_shadow_tail_never_over_admits() {
        // Fill, drain one short of a flush, and verify the producer still
        // reports Full: the published tail hasn't moved.
        let mut queue = QueueModel::new(4);
        let entry = Entry::default();
        for _ in 0..16 {
            assert_eq!(queue.enqueue(&entry), ModelEnqueue::Accepted);
        }
        for _ in 0..3 {
            assert!(matches!(queue.dequeue(), ModelDequeue::Entry(_)));
        }
        // Three slots free, but the last publish still says zero consumed.
        assert_eq!(queue.enqueue(&entry), ModelEnqueue::Full);

        // The fourth dequeue publishes and space becomes visible.
        assert!(matches!(queue.dequeue(), ModelDequeue::Entry(_)));
        assert_eq!(queue.enqueue(&entry), ModelEnqueue::Accepted);
    }

    #[test]
    fn torn_injection_is_always_rejected() {
        let ops = vec![
            QueueOp::Enqueue(7),
            QueueOp::TearNextSlot { byte: 3, bit: 5 },
            QueueOp::Dequeue,
        ];
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn torn_epoch_byte_reads_as_empty_or_torn_never_entry() {
        // Corrupting the epoch byte itself (offset 56) makes the slot fail
        // the epoch gate instead; either way it must not be consumable.
        let mut queue = QueueModel::new(4);
        let entry = Entry {
            rpc_id: 9,
            ..Entry::default()
        };
        assert_eq!(queue.enqueue(&entry), ModelEnqueue::Accepted);
        let pristine = queue.corrupt_next_slot(56, 0);
        assert!(!matches!(queue.dequeue(), ModelDequeue::Entry(_)));
        queue.restore_next_slot(pristine);
        assert!(matches!(queue.dequeue(), ModelDequeue::Entry(_)));
    }
}

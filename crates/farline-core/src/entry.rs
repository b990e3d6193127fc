//! The 64-byte message line and its integrity discipline.
//!
//! An [`Entry`] is exactly one cache line: seven 64-bit payload words followed
//! by eight bytes of metadata. The last two metadata bytes hold a whole-line
//! XOR checksum, so a receiver that observes the checksum bytes has
//! necessarily observed every earlier byte of the line (on platforms that
//! deliver a 64-byte store as a single burst).
//!
//! The byte layout is fixed for cross-process use on little-endian 64-bit
//! targets: `payload[0..7]` as little-endian words, then
//! `(epoch:1)(rpc_method:1)(rpc_id:2 LE)(seal_index:2 LE signed)(checksum:2 LE)`
//! with no padding.

use bytemuck::{Pod, Zeroable};

/// Size of one entry in bytes - exactly one cache line.
pub const ENTRY_SIZE: usize = 64;

/// Number of 64-bit payload words per entry.
pub const PAYLOAD_WORDS: usize = 7;

/// Minimum supported ring order (capacity 16).
pub const MIN_ORDER: u32 = 4;

/// Maximum supported ring order (capacity 2^30).
pub const MAX_ORDER: u32 = 30;

/// A fixed-size 64-byte message.
///
/// Callers fill `payload`, `rpc_method`, `rpc_id` and `seal_index`; `epoch`
/// and `checksum` are overwritten by the queue on enqueue.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    /// User payload, seven little-endian 64-bit words.
    pub payload: [u64; PAYLOAD_WORDS],
    /// Slot-generation tag, stamped by the producer.
    pub epoch: u8,
    /// Opaque method tag, caller-supplied.
    pub rpc_method: u8,
    /// Opaque correlation id, caller-supplied.
    pub rpc_id: u16,
    /// Opaque caller-supplied index.
    pub seal_index: i16,
    /// Whole-line XOR checksum; a sealed entry folds to zero.
    pub checksum: u16,
}

// SAFETY: repr(C) with 56 bytes of u64 words followed by exactly 8 bytes of
// integer fields; size equals alignment (64), so there is no padding anywhere
// and every bit pattern is valid.
unsafe impl Zeroable for Entry {}
unsafe impl Pod for Entry {}

const _: () = assert!(core::mem::size_of::<Entry>() == ENTRY_SIZE);
const _: () = assert!(core::mem::align_of::<Entry>() == ENTRY_SIZE);
const _: () = assert!(core::mem::offset_of!(Entry, epoch) == 56);
const _: () = assert!(core::mem::offset_of!(Entry, rpc_method) == 57);
const _: () = assert!(core::mem::offset_of!(Entry, rpc_id) == 58);
const _: () = assert!(core::mem::offset_of!(Entry, seal_index) == 60);
const _: () = assert!(core::mem::offset_of!(Entry, checksum) == 62);

/// Fold all 64 bytes of an entry down to 16 bits.
///
/// The line is XORed as eight 64-bit words, then collapsed with two
/// shift-XOR steps. A sealed entry folds to zero.
#[inline]
pub fn xor_fold(entry: &Entry) -> u16 {
    let words: &[u64; 8] = bytemuck::cast_ref(entry);
    let mut acc = 0u64;
    for w in words {
        acc ^= w;
    }
    acc ^= acc >> 32;
    acc ^= acc >> 16;
    acc as u16
}

/// Expected epoch byte for a slot counter on a ring of the given order.
///
/// The value is the lap number (`slot >> order`) truncated to a byte, plus
/// one, so the first lap is tagged 1 and freshly zeroed memory never matches.
/// The sequence wraps 1, 2, ..., 255, 0, 1, ... and both sides compute it the
/// same way.
#[inline]
pub fn expected_epoch(slot: u32, order: u32) -> u8 {
    ((slot >> order) as u8).wrapping_add(1)
}

impl Entry {
    /// Stamp the epoch and checksum, making the line self-describing.
    ///
    /// The checksum field is zeroed before folding, so after sealing the
    /// whole line folds to zero.
    #[inline]
    pub fn seal(&mut self, epoch: u8) {
        self.epoch = epoch;
        self.checksum = 0;
        self.checksum = xor_fold(self);
    }

    /// Whole-line integrity check: true iff the 64 bytes fold to zero.
    #[inline]
    pub fn verify(&self) -> bool {
        xor_fold(self) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_entry_folds_to_zero() {
        let mut e = Entry::default();
        for (i, w) in e.payload.iter_mut().enumerate() {
            *w = 0x1111_1111_1111_1111 * (i as u64 + 1);
        }
        e.rpc_method = 7;
        e.rpc_id = 77;
        e.seal_index = -123;

        e.seal(1);
        assert!(e.verify());
        assert_eq!(xor_fold(&e), 0);
    }

    #[test]
    fn any_single_bit_flip_breaks_the_fold() {
        let mut e = Entry::default();
        e.payload[0] = 0xAA55_AA55_AA55_AA55;
        e.rpc_id = 0xEE;
        e.seal(1);

        for byte in 0..ENTRY_SIZE {
            for bit in 0..8 {
                let mut corrupted = e;
                bytemuck::bytes_of_mut(&mut corrupted)[byte] ^= 1 << bit;
                assert!(
                    !corrupted.verify(),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn zeroed_entry_does_not_verify_as_lap_one() {
        // A zeroed slot folds to zero, but its epoch byte is 0 while the
        // first lap expects 1, so the epoch gate rejects it.
        let e = Entry::default();
        assert_eq!(e.epoch, 0);
        assert_ne!(e.epoch, expected_epoch(0, MIN_ORDER));
    }

    #[test]
    fn epoch_advances_per_lap_and_wraps() {
        let order = 4;
        assert_eq!(expected_epoch(0, order), 1);
        assert_eq!(expected_epoch(15, order), 1);
        assert_eq!(expected_epoch(16, order), 2);
        assert_eq!(expected_epoch(255 << order, order), 0);
        assert_eq!(expected_epoch(256 << order, order), 1);
    }

    #[test]
    fn reseal_is_idempotent() {
        let mut e = Entry {
            payload: [1, 2, 3, 4, 5, 6, 7],
            rpc_id: 9,
            ..Entry::default()
        };
        e.seal(3);
        let first = e;
        e.seal(3);
        assert_eq!(first, e);
    }
}

//! Cache-bypassing loads and stores.
//!
//! Every access the queue makes to shared memory goes through this module.
//! The contract is about the observable effect, not the instruction used:
//!
//! - a **bypassing store** must push the bytes past the local cache hierarchy
//!   and, after the trailing store fence, be visible to any observer of the
//!   physical memory;
//! - a **fresh load** must observe the current state of the physical memory,
//!   not a stale cached replica.
//!
//! On x86_64 the store side uses non-temporal (streaming) stores: the 64-byte
//! line goes out as two 32-byte AVX streaming stores through the same
//! write-combining buffer, which drains as a single burst once the full line
//! is written and `sfence` retires. The load side evicts the line with
//! `clflush` + `sfence` and then performs a normal aligned load. Hosts
//! without AVX2, and non-x86 targets, fall back to volatile accesses with
//! full fences; that keeps the protocol correct on coherent memory but does
//! not bypass the cache.

use farline_core::Entry;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use core::arch::x86_64::{
        __m256i, _mm256_load_si256, _mm256_stream_si256, _mm_clflush, _mm_sfence, _mm_stream_si64,
    };
    use std::sync::OnceLock;

    use farline_core::Entry;

    pub fn avx2_available() -> bool {
        static AVX2: OnceLock<bool> = OnceLock::new();
        *AVX2.get_or_init(|| is_x86_feature_detected!("avx2"))
    }

    /// Streaming 64-byte store, AVX2 path.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for a 64-byte write and 64-byte aligned; the CPU
    /// must support AVX2.
    #[target_feature(enable = "avx2")]
    pub unsafe fn store_line_nt(dst: *mut Entry, src: &Entry) {
        let src = src as *const Entry as *const u8;
        let dst = dst as *mut u8;
        // SAFETY: caller guarantees alignment and validity; Entry is 64-byte
        // aligned so both 32-byte halves are aligned loads.
        unsafe {
            let lo = _mm256_load_si256(src as *const __m256i);
            let hi = _mm256_load_si256(src.add(32) as *const __m256i);
            _mm256_stream_si256(dst as *mut __m256i, lo);
            _mm256_stream_si256(dst.add(32) as *mut __m256i, hi);
            _mm_sfence();
        }
    }

    /// Evict `src` from the cache hierarchy, then read it normally.
    ///
    /// # Safety
    ///
    /// `src` must be valid for a 64-byte read and 64-byte aligned.
    #[inline]
    pub unsafe fn load_line_fresh(src: *const Entry) -> Entry {
        // SAFETY: caller guarantees validity; clflush takes any byte of the
        // line.
        unsafe {
            _mm_clflush(src as *const u8);
            _mm_sfence();
            src.read_volatile()
        }
    }

    /// Streaming 8-byte store plus store fence.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for an 8-byte write and 8-byte aligned.
    #[inline]
    pub unsafe fn store_u64_nt(dst: *mut u64, val: u64) {
        // SAFETY: caller guarantees alignment and validity.
        unsafe {
            _mm_stream_si64(dst as *mut i64, val as i64);
            _mm_sfence();
        }
    }

    /// Evict the line holding `src`, then read the value normally.
    ///
    /// # Safety
    ///
    /// `src` must be valid for an 8-byte read and 8-byte aligned.
    #[inline]
    pub unsafe fn load_u64_fresh(src: *const u64) -> u64 {
        // SAFETY: caller guarantees alignment and validity.
        unsafe {
            _mm_clflush(src as *const u8);
            _mm_sfence();
            src.read_volatile()
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod generic {
    use std::sync::atomic::{fence, Ordering};

    use farline_core::Entry;

    /// # Safety
    ///
    /// `dst` must be valid for a 64-byte write and 64-byte aligned.
    #[inline]
    pub unsafe fn store_line(dst: *mut Entry, src: &Entry) {
        // SAFETY: forwarded caller contract.
        unsafe {
            dst.write_volatile(*src);
        }
        fence(Ordering::SeqCst);
    }

    /// # Safety
    ///
    /// `src` must be valid for a 64-byte read and 64-byte aligned.
    #[inline]
    pub unsafe fn load_line_fresh(src: *const Entry) -> Entry {
        fence(Ordering::SeqCst);
        // SAFETY: forwarded caller contract.
        unsafe { src.read_volatile() }
    }

    /// # Safety
    ///
    /// `dst` must be valid for an 8-byte write and 8-byte aligned.
    #[inline]
    pub unsafe fn store_u64(dst: *mut u64, val: u64) {
        // SAFETY: forwarded caller contract.
        unsafe {
            dst.write_volatile(val);
        }
        fence(Ordering::SeqCst);
    }

    /// # Safety
    ///
    /// `src` must be valid for an 8-byte read and 8-byte aligned.
    #[inline]
    pub unsafe fn load_u64_fresh(src: *const u64) -> u64 {
        fence(Ordering::SeqCst);
        // SAFETY: forwarded caller contract.
        unsafe { src.read_volatile() }
    }
}

/// Perform the single 64-byte cache-bypassing write of an entry.
///
/// Includes the trailing store fence: when this returns, the line is ordered
/// ahead of any later store from this core.
///
/// # Safety
///
/// `dst` must be valid for a 64-byte write, 64-byte aligned, and not written
/// concurrently by any other writer.
#[inline]
pub unsafe fn store_line(dst: *mut Entry, src: &Entry) {
    #[cfg(target_arch = "x86_64")]
    {
        if x86::avx2_available() {
            // SAFETY: feature checked; alignment and validity from caller.
            unsafe { x86::store_line_nt(dst, src) }
        } else {
            // SAFETY: forwarded caller contract.
            unsafe {
                dst.write_volatile(*src);
            }
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: forwarded caller contract.
    unsafe {
        generic::store_line(dst, src)
    }
}

/// Read a 64-byte entry observing the current state of shared memory.
///
/// # Safety
///
/// `src` must be valid for a 64-byte read and 64-byte aligned. Concurrent
/// writes by the remote side are expected; the caller validates the result
/// through the epoch and checksum gates.
#[inline]
pub unsafe fn load_line_fresh(src: *const Entry) -> Entry {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: forwarded caller contract.
    unsafe {
        x86::load_line_fresh(src)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: forwarded caller contract.
    unsafe {
        generic::load_line_fresh(src)
    }
}

/// Publish a 64-bit value with a cache-bypassing store plus store fence.
///
/// # Safety
///
/// `dst` must be valid for an 8-byte write, 8-byte aligned, and written by
/// exactly one side.
#[inline]
pub unsafe fn store_u64(dst: *mut u64, val: u64) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: forwarded caller contract.
    unsafe {
        x86::store_u64_nt(dst, val)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: forwarded caller contract.
    unsafe {
        generic::store_u64(dst, val)
    }
}

/// Read a 64-bit value observing the current state of shared memory.
///
/// # Safety
///
/// `src` must be valid for an 8-byte read and 8-byte aligned.
#[inline]
pub unsafe fn load_u64_fresh(src: *const u64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: forwarded caller contract.
    unsafe {
        x86::load_u64_fresh(src)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: forwarded caller contract.
    unsafe {
        generic::load_u64_fresh(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farline_core::ENTRY_SIZE;

    #[repr(align(64))]
    struct AlignedLine([u8; ENTRY_SIZE]);

    #[test]
    fn store_then_fresh_load_round_trips() {
        let mut slot = AlignedLine([0u8; ENTRY_SIZE]);
        let dst = slot.0.as_mut_ptr() as *mut Entry;

        let mut entry = Entry {
            payload: [1, 2, 3, 4, 5, 6, 7],
            rpc_id: 42,
            ..Entry::default()
        };
        entry.seal(1);

        // SAFETY: slot is 64-byte aligned and exclusively owned here.
        let loaded = unsafe {
            store_line(dst, &entry);
            load_line_fresh(dst)
        };
        assert_eq!(loaded, entry);
        assert!(loaded.verify());
    }

    #[test]
    fn u64_store_then_fresh_load_round_trips() {
        let mut cell = AlignedLine([0u8; ENTRY_SIZE]);
        let dst = cell.0.as_mut_ptr() as *mut u64;

        // SAFETY: cell is aligned and exclusively owned here.
        unsafe {
            store_u64(dst, 0xDEAD_BEEF_CAFE_F00D);
            assert_eq!(load_u64_fresh(dst), 0xDEAD_BEEF_CAFE_F00D);
        }
    }
}

#![forbid(unsafe_code)]
//! Extent allocation over the usable data area.
//!
//! A watermark plus a free list: allocations are satisfied first-fit from
//! the free list, otherwise carved off the watermark. Freed extents return
//! to the list uncoalesced. One mutex guards the whole state; critical
//! sections are O(free-list length) and perform no I/O.

use afs_error::{AfsError, Result};
use afs_types::{BLOCK_SIZE, MAX_ALLOCATION_SIZE, align_up};
use parking_lot::Mutex;
use tracing::trace;

/// A half-open byte interval `[offset, offset + len)` within the usable
/// data area. Offsets are absolute device offsets; lengths are multiples of
/// the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Space accounting reported through statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Usable area size in bytes.
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug)]
struct AllocState {
    next_offset: u64,
    free: Vec<Extent>,
}

/// Byte-extent allocator for one mounted pool.
#[derive(Debug)]
pub struct ExtentAllocator {
    usable_start: u64,
    usable_end: u64,
    /// First byte the watermark may hand out (metadata reservation end).
    data_start: u64,
    state: Mutex<AllocState>,
}

impl ExtentAllocator {
    /// Create a fresh allocator whose watermark starts at `data_start`
    /// (just past the metadata reservation).
    #[must_use]
    pub fn new(usable_start: u64, usable_end: u64, data_start: u64) -> Self {
        debug_assert!(usable_start <= data_start && data_start <= usable_end);
        Self {
            usable_start,
            usable_end,
            data_start,
            state: Mutex::new(AllocState {
                next_offset: data_start,
                free: Vec::new(),
            }),
        }
    }

    /// Rebuild allocator state at mount time from the persisted bitmap:
    /// the watermark and the free extents below it.
    #[must_use]
    pub fn restore(
        usable_start: u64,
        usable_end: u64,
        data_start: u64,
        next_offset: u64,
        free: Vec<Extent>,
    ) -> Self {
        debug_assert!(next_offset >= data_start && next_offset <= usable_end);
        Self {
            usable_start,
            usable_end,
            data_start,
            state: Mutex::new(AllocState { next_offset, free }),
        }
    }

    /// Hand out an extent of at least `requested` bytes, rounded up to a
    /// 4 KiB boundary.
    ///
    /// First-fit over the free list in insertion order; the chosen extent's
    /// prefix is returned and the remainder (if any) stays on the list.
    /// Otherwise the watermark advances. Exhausting the usable area is
    /// `NoSpace`.
    pub fn alloc(&self, requested: u64) -> Result<Extent> {
        if requested == 0 || requested > MAX_ALLOCATION_SIZE {
            return Err(AfsError::NoSpace);
        }
        let aligned = align_up(requested, BLOCK_SIZE).ok_or(AfsError::NoSpace)?;

        let mut state = self.state.lock();

        for i in 0..state.free.len() {
            let candidate = state.free[i];
            if candidate.len >= aligned {
                if candidate.len == aligned {
                    state.free.remove(i);
                } else {
                    state.free[i].offset += aligned;
                    state.free[i].len -= aligned;
                }
                trace!(offset = candidate.offset, len = aligned, "allocated from free list");
                return Ok(Extent {
                    offset: candidate.offset,
                    len: aligned,
                });
            }
        }

        let offset = state.next_offset;
        let end = offset.checked_add(aligned).ok_or(AfsError::NoSpace)?;
        if end > self.usable_end {
            return Err(AfsError::NoSpace);
        }
        state.next_offset = end;
        trace!(offset, len = aligned, "allocated at watermark");
        Ok(Extent {
            offset,
            len: aligned,
        })
    }

    /// Return an extent to the free list. Length is rounded up to a 4 KiB
    /// boundary (allocations only ever hand out aligned lengths).
    pub fn free(&self, extent: Extent) {
        if extent.len == 0 {
            return;
        }
        let len = align_up(extent.len, BLOCK_SIZE).unwrap_or(extent.len);
        debug_assert!(extent.offset >= self.data_start && extent.offset + len <= self.usable_end);
        self.state.lock().free.push(Extent {
            offset: extent.offset,
            len,
        });
    }

    /// Current watermark.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.state.lock().next_offset
    }

    /// Snapshot of the free list, in insertion order.
    #[must_use]
    pub fn free_extents(&self) -> Vec<Extent> {
        self.state.lock().free.clone()
    }

    /// First allocatable byte (end of the metadata reservation).
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Space accounting: used = watermark advance minus the free list,
    /// free = total minus used; both clamped non-negative.
    #[must_use]
    pub fn usage(&self) -> SpaceUsage {
        let state = self.state.lock();
        let free_listed: u64 = state.free.iter().map(|e| e.len).sum();
        let advanced = state.next_offset.saturating_sub(self.data_start);
        let used = advanced.saturating_sub(free_listed);
        let total = self.usable_end - self.usable_start;
        SpaceUsage {
            total,
            used,
            free: total.saturating_sub(used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USABLE_START: u64 = 512 * 1024;
    const USABLE_END: u64 = 8 * 1024 * 1024;
    const DATA_START: u64 = USABLE_START + 1024 * 1024;

    fn allocator() -> ExtentAllocator {
        ExtentAllocator::new(USABLE_START, USABLE_END, DATA_START)
    }

    #[test]
    fn alloc_rounds_up_to_block_size() {
        let alloc = allocator();
        let extent = alloc.alloc(1).expect("alloc");
        assert_eq!(extent.offset, DATA_START);
        assert_eq!(extent.len, 4096);

        let extent = alloc.alloc(4097).expect("alloc");
        assert_eq!(extent.offset, DATA_START + 4096);
        assert_eq!(extent.len, 8192);
    }

    #[test]
    fn alignment_invariant_holds() {
        let alloc = allocator();
        for requested in [1, 100, 4096, 5000, 65_536, 70_000] {
            let extent = alloc.alloc(requested).expect("alloc");
            assert_eq!(extent.offset % 4096, 0, "offset unaligned for {requested}");
            assert_eq!(extent.len % 4096, 0, "length unaligned for {requested}");
        }
    }

    #[test]
    fn free_list_is_first_fit_in_insertion_order() {
        let alloc = allocator();
        let a = alloc.alloc(8192).expect("a");
        let b = alloc.alloc(4096).expect("b");
        let _c = alloc.alloc(4096).expect("c");

        alloc.free(a);
        alloc.free(b);

        // First fit: a (8 KiB) satisfies a 4 KiB request before b does.
        let d = alloc.alloc(4096).expect("d");
        assert_eq!(d.offset, a.offset);
        // The remainder of a shrank from the front.
        let free = alloc.free_extents();
        assert!(free.contains(&Extent {
            offset: a.offset + 4096,
            len: 4096
        }));
        assert!(free.contains(&b));
    }

    #[test]
    fn exact_fit_removes_the_free_extent() {
        let alloc = allocator();
        let a = alloc.alloc(8192).expect("a");
        alloc.free(a);
        let b = alloc.alloc(8192).expect("b");
        assert_eq!(b, a);
        assert!(alloc.free_extents().is_empty());
    }

    #[test]
    fn exhaustion_is_no_space() {
        let alloc = allocator();
        let available = USABLE_END - DATA_START;
        let extent = alloc.alloc(available).expect("all of it");
        assert_eq!(extent.len, available);
        assert!(matches!(alloc.alloc(4096), Err(AfsError::NoSpace)));

        // Freeing brings space back.
        alloc.free(extent);
        assert!(alloc.alloc(4096).is_ok());
    }

    #[test]
    fn zero_and_oversized_requests_are_rejected() {
        let alloc = allocator();
        assert!(matches!(alloc.alloc(0), Err(AfsError::NoSpace)));
        assert!(matches!(
            alloc.alloc(MAX_ALLOCATION_SIZE + 1),
            Err(AfsError::NoSpace)
        ));
    }

    #[test]
    fn usage_accounting_conserves_space() {
        let alloc = allocator();
        let total = USABLE_END - USABLE_START;

        let fresh = alloc.usage();
        assert_eq!(fresh.total, total);
        assert_eq!(fresh.used, 0);
        assert_eq!(fresh.free, total);

        let a = alloc.alloc(65_536).expect("a");
        let b = alloc.alloc(4096).expect("b");
        let after_alloc = alloc.usage();
        assert_eq!(after_alloc.used, a.len + b.len);
        assert_eq!(after_alloc.free, total - a.len - b.len);

        alloc.free(a);
        let after_free = alloc.usage();
        assert_eq!(after_free.used, b.len);
        assert!(after_free.free <= after_free.total);
    }

    #[test]
    fn restore_resumes_from_persisted_state() {
        let free = vec![Extent {
            offset: DATA_START,
            len: 8192,
        }];
        let alloc = ExtentAllocator::restore(
            USABLE_START,
            USABLE_END,
            DATA_START,
            DATA_START + 65_536,
            free,
        );
        assert_eq!(alloc.next_offset(), DATA_START + 65_536);

        // Free-listed space is reused before the watermark moves.
        let extent = alloc.alloc(8192).expect("alloc");
        assert_eq!(extent.offset, DATA_START);
        assert_eq!(alloc.next_offset(), DATA_START + 65_536);

        let usage = alloc.usage();
        assert_eq!(usage.used, 65_536);
    }
}

//! Persistence primitives over the DAX mapping.
//!
//! Two durability paths with identical semantics from the caller's point of
//! view (on return, the affected bytes are durable on the backing medium):
//!
//! - **Line write-back**: walk the range in 64-byte cache-line strides and
//!   issue a non-invalidating write-back per line, then fence. An order of
//!   magnitude faster than a page sync on persistent memory.
//! - **Page sync**: expand the range outward to page boundaries and issue a
//!   blocking `msync(MS_SYNC)`.
//!
//! Selection happens once at device open. A mapping backed by a regular
//! file always takes the page-sync path: cache-line write-back reaches the
//! memory bus, not the page cache, so `msync` is the only instruction that
//! actually makes file-backed stores durable. Neither path reorders stores
//! already issued on the calling thread; callers issue their stores first.

use afs_error::{AfsError, Result};
use afs_types::{BLOCK_SIZE, CACHE_LINE_SIZE};
use nix::sys::mman::{MsFlags, msync};
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::warn;

/// Full-mapping syncs run in bounded page-aligned slices of this size so a
/// single enormous `msync` cannot fail or stall the daemon wholesale.
const SYNC_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Durability path, chosen once per device at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// `clflushopt` per cache line, `sfence` after the walk.
    LineWritebackOpt,
    /// `clflush` per cache line (older CPUs), `sfence` after the walk.
    LineWriteback,
    /// Page-aligned `msync(MS_SYNC)`.
    PageSync,
}

impl FlushMode {
    /// Pick the flush path for a device.
    ///
    /// Only DAX character devices are eligible for line write-back; see the
    /// module docs for why file-backed mappings must use `msync`.
    #[must_use]
    pub fn detect(is_dax_device: bool) -> Self {
        if !is_dax_device {
            return Self::PageSync;
        }
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("clflushopt") {
                return Self::LineWritebackOpt;
            }
            if std::arch::is_x86_feature_detected!("sse2") {
                return Self::LineWriteback;
            }
        }
        Self::PageSync
    }
}

/// Make `[offset, offset + len)` of the mapping durable.
pub(crate) fn flush_range(
    base: NonNull<c_void>,
    map_len: usize,
    mode: FlushMode,
    offset: u64,
    len: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }

    #[cfg(target_arch = "x86_64")]
    match mode {
        FlushMode::LineWritebackOpt => {
            let (start, count) = line_span(map_len, offset, len);
            // SAFETY: line_span clamps to the mapping; feature presence was
            // verified by `FlushMode::detect`.
            unsafe {
                x86::flush_lines_clflushopt(base.as_ptr().cast::<u8>().add(start), count);
            }
            return Ok(());
        }
        FlushMode::LineWriteback => {
            let (start, count) = line_span(map_len, offset, len);
            // SAFETY: as above.
            unsafe {
                x86::flush_lines_clflush(base.as_ptr().cast::<u8>().add(start), count);
            }
            return Ok(());
        }
        FlushMode::PageSync => {}
    }
    // `FlushMode::detect` never selects line write-back on other
    // architectures, so everything else falls through to msync.
    let _ = mode;
    sync_pages(base, map_len, offset, len)
}

/// Synchronise the whole mapping in bounded chunks.
///
/// A failing chunk is logged and the walk continues; the last error is
/// returned once every chunk has been attempted.
pub(crate) fn flush_all(base: NonNull<c_void>, map_len: usize) -> Result<()> {
    let mut last_err = None;
    let mut offset = 0_usize;
    while offset < map_len {
        let chunk = SYNC_CHUNK_SIZE.min(map_len - offset);
        if let Err(e) = sync_pages(base, map_len, offset as u64, chunk as u64) {
            warn!(offset, chunk, error = %e, "msync chunk failed");
            last_err = Some(e);
        }
        offset += chunk;
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Expand `[offset, offset + len)` to cache-line boundaries, clamped to the
/// mapping. Returns (start offset, byte count).
fn line_span(map_len: usize, offset: u64, len: u64) -> (usize, usize) {
    let line = CACHE_LINE_SIZE;
    let start = (offset / line * line) as usize;
    let end = ((offset + len).div_ceil(line) * line) as usize;
    let end = end.min(map_len);
    (start, end.saturating_sub(start))
}

fn sync_pages(base: NonNull<c_void>, map_len: usize, offset: u64, len: u64) -> Result<()> {
    let page = BLOCK_SIZE;
    let start = (offset / page * page) as usize;
    let end = ((offset + len).div_ceil(page) * page) as usize;
    let end = end.min(map_len);
    if end <= start {
        return Ok(());
    }

    // SAFETY: [start, end) lies within the live mapping; msync does not
    // alias any Rust references.
    unsafe {
        let addr = NonNull::new_unchecked(base.as_ptr().add(start));
        msync(addr, end - start, MsFlags::MS_SYNC)
            .map_err(|e| AfsError::Device(format!("msync [{start}, {end}): {e}")))
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::CACHE_LINE_SIZE;
    use core::arch::x86_64::{_mm_clflush, _mm_clflushopt, _mm_sfence};

    /// Write back `count` bytes of cache lines starting at `start` with
    /// `clflushopt`, then fence so the write-backs are globally ordered.
    ///
    /// # Safety
    /// `start..start + count` must be readable mapped memory and the CPU
    /// must support `clflushopt`.
    #[target_feature(enable = "sse2,clflushopt")]
    pub(super) unsafe fn flush_lines_clflushopt(start: *const u8, count: usize) {
        let mut line = 0_usize;
        while line < count {
            // SAFETY: caller guarantees the range is mapped.
            unsafe { _mm_clflushopt(start.add(line).cast_mut()) };
            line += CACHE_LINE_SIZE as usize;
        }
        // SAFETY: sfence has no memory-safety preconditions.
        unsafe { _mm_sfence() };
    }

    /// `clflush` variant for CPUs without `clflushopt`. Invalidating, but
    /// durability semantics are the same.
    ///
    /// # Safety
    /// As [`flush_lines_clflushopt`], requiring only SSE2.
    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn flush_lines_clflush(start: *const u8, count: usize) {
        let mut line = 0_usize;
        while line < count {
            // SAFETY: caller guarantees the range is mapped.
            unsafe { _mm_clflush(start.add(line)) };
            line += CACHE_LINE_SIZE as usize;
        }
        // SAFETY: sfence has no memory-safety preconditions.
        unsafe { _mm_sfence() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backed_mappings_use_page_sync() {
        assert_eq!(FlushMode::detect(false), FlushMode::PageSync);
    }

    #[test]
    fn line_span_expands_to_line_boundaries() {
        let (start, count) = line_span(1 << 20, 100, 8);
        assert_eq!(start, 64);
        assert_eq!(count, 64);

        // Spanning two lines.
        let (start, count) = line_span(1 << 20, 60, 10);
        assert_eq!(start, 0);
        assert_eq!(count, 128);

        // Already aligned.
        let (start, count) = line_span(1 << 20, 128, 64);
        assert_eq!(start, 128);
        assert_eq!(count, 64);
    }

    #[test]
    fn line_span_clamps_to_mapping() {
        let (start, count) = line_span(100, 96, 32);
        assert_eq!(start, 64);
        assert_eq!(count, 36);
    }
}

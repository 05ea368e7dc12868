#![deny(unsafe_op_in_unsafe_fn)]
//! DAX device mapping for AethelFS.
//!
//! Opens a memory-like backing object (CXL memory, persistent memory, or a
//! regular file), maps its full extent read-write-shared, and exposes the
//! mapping as an ordered sequence of bytes plus the durability primitives
//! of [`persist`].
//!
//! This is the only crate in the workspace that contains `unsafe` code: the
//! raw mapping access and the cache-line flush intrinsics live here, behind
//! a bounds-checked safe API. Every other crate keeps `forbid(unsafe_code)`.

mod persist;

pub use persist::FlushMode;

use afs_error::{AfsError, Result};
use afs_types::{BLOCK_SIZE, DEVICE_SIZE_ALIGNMENT, align_up};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info};

/// A memory-mapped DAX device.
///
/// The whole device is mapped once at open; file and metadata operations
/// are loads and stores into the mapping. Writes to disjoint byte ranges
/// may proceed from multiple threads; callers must not issue overlapping
/// writes without their own serialisation (the engine's per-node locks
/// provide it).
pub struct DaxDevice {
    file: File,
    base: NonNull<c_void>,
    len: usize,
    path: PathBuf,
    flush_mode: FlushMode,
}

// The raw mapping pointer is shared across FUSE worker threads; all access
// goes through the bounds-checked methods below.
unsafe impl Send for DaxDevice {}
unsafe impl Sync for DaxDevice {}

impl DaxDevice {
    /// Open `path` read-write and map its full extent shared.
    ///
    /// DAX character devices report a size of zero (or one page); for those
    /// the configured `max_size` is substituted, rounded up to a 2 MiB
    /// alignment boundary. A regular file must carry its real size; mapping
    /// past the end of a short file would fault on first store.
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| AfsError::Device(format!("open {}: {e}", path.display())))?;

        let meta = file
            .metadata()
            .map_err(|e| AfsError::Device(format!("stat {}: {e}", path.display())))?;

        let size = if meta.len() <= BLOCK_SIZE {
            if meta.file_type().is_char_device() {
                let synthesized = align_up(max_size, DEVICE_SIZE_ALIGNMENT)
                    .ok_or_else(|| AfsError::Device("max size overflows alignment".to_owned()))?;
                info!(
                    device = %path.display(),
                    size = synthesized,
                    "DAX device size unknown, using configured maximum"
                );
                synthesized
            } else {
                return Err(AfsError::Device(format!(
                    "{} is too small to back a pool ({} bytes)",
                    path.display(),
                    meta.len()
                )));
            }
        } else {
            meta.len()
        };

        let len = usize::try_from(size)
            .map_err(|_| AfsError::Device("device size exceeds address space".to_owned()))?;
        let map_len = NonZeroUsize::new(len)
            .ok_or_else(|| AfsError::Device("cannot map zero-length device".to_owned()))?;

        // SAFETY: the fd is open read-write and stays alive for the mapping's
        // lifetime; MAP_SHARED with a length we validated against the file.
        let base = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| AfsError::Device(format!("mmap {}: {e}", path.display())))?;

        let flush_mode = FlushMode::detect(meta.file_type().is_char_device());
        debug!(device = %path.display(), size, ?flush_mode, "mapped backing device");

        Ok(Self {
            file,
            base,
            len,
            path: path.to_owned(),
            flush_mode,
        })
    }

    /// Total mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path the device was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durability path selected at open.
    #[must_use]
    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| AfsError::Device("mapping range overflows".to_owned()))?;
        if end > self.len() {
            return Err(AfsError::Device(format!(
                "mapping access out of range: [{offset}, {end}) beyond {}",
                self.len()
            )));
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the mapping starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        // SAFETY: range checked above; source and destination cannot overlap
        // because `buf` is a distinct allocation.
        unsafe {
            let src = self.base.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the mapping starting at `offset`.
    ///
    /// The stores are issued before this returns; durability requires a
    /// subsequent [`Self::flush_range`] or [`Self::flush_all`].
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        // SAFETY: range checked above.
        unsafe {
            let dst = self.base.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Fill `len` bytes of the mapping starting at `offset` with `byte`.
    pub fn fill_at(&self, offset: u64, byte: u8, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above.
        unsafe {
            let dst = self.base.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::write_bytes(dst, byte, len as usize);
        }
        Ok(())
    }

    /// Make the bytes in `[offset, offset + len)` durable on the backing
    /// medium. See [`persist`] for the line write-back vs page-sync paths.
    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        persist::flush_range(self.base, self.len, self.flush_mode, offset, len)
    }

    /// Synchronise the entire mapping in bounded page-aligned chunks.
    ///
    /// Errors from individual chunks are aggregated; the sync continues past
    /// a failing chunk and the last error is returned.
    pub fn flush_all(&self) -> Result<()> {
        persist::flush_all(self.base, self.len)
    }
}

impl Drop for DaxDevice {
    fn drop(&mut self) {
        // SAFETY: base/len are the exact mapping created in `open`; the
        // mapping is not referenced after this point.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            tracing::warn!(device = %self.path.display(), error = %e, "munmap failed");
        }
        // `file` closes on drop.
        let _ = &self.file;
    }
}

impl std::fmt::Debug for DaxDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaxDevice")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("flush_mode", &self.flush_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_device(size: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.img");
        let file = File::create(&path).expect("create backing file");
        file.set_len(size).expect("size backing file");
        (dir, path)
    }

    #[test]
    fn open_maps_full_extent() {
        let (_dir, path) = temp_device(8 * 1024 * 1024);
        let dev = DaxDevice::open(&path, 0).expect("open");
        assert_eq!(dev.len(), 8 * 1024 * 1024);
        assert!(!dev.is_empty());
    }

    #[test]
    fn writes_are_visible_to_reads() {
        let (_dir, path) = temp_device(2 * 1024 * 1024);
        let dev = DaxDevice::open(&path, 0).expect("open");

        dev.write_at(4096, b"aethel").expect("write");
        let mut buf = [0_u8; 6];
        dev.read_at(4096, &mut buf).expect("read");
        assert_eq!(&buf, b"aethel");
    }

    #[test]
    fn writes_survive_remap() {
        let (_dir, path) = temp_device(2 * 1024 * 1024);
        {
            let dev = DaxDevice::open(&path, 0).expect("open");
            dev.write_at(0, b"persisted").expect("write");
            dev.flush_all().expect("flush");
        }
        let dev = DaxDevice::open(&path, 0).expect("reopen");
        let mut buf = [0_u8; 9];
        dev.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn fill_at_zeroes_region() {
        let (_dir, path) = temp_device(2 * 1024 * 1024);
        let dev = DaxDevice::open(&path, 0).expect("open");
        dev.write_at(100, &[0xFF_u8; 64]).expect("write");
        dev.fill_at(100, 0, 64).expect("fill");
        let mut buf = [0xAA_u8; 64];
        dev.read_at(100, &mut buf).expect("read");
        assert_eq!(buf, [0_u8; 64]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let (_dir, path) = temp_device(2 * 1024 * 1024);
        let dev = DaxDevice::open(&path, 0).expect("open");
        let mut buf = [0_u8; 16];
        assert!(dev.read_at(dev.len() - 8, &mut buf).is_err());
        assert!(dev.write_at(dev.len(), b"x").is_err());
        assert!(dev.flush_range(dev.len() - 1, 2).is_err());
        // Right at the boundary is fine.
        assert!(dev.write_at(dev.len() - 1, b"x").is_ok());
    }

    #[test]
    fn flush_range_succeeds_on_unaligned_ranges() {
        let (_dir, path) = temp_device(2 * 1024 * 1024);
        let dev = DaxDevice::open(&path, 0).expect("open");
        dev.write_at(4000, &[7_u8; 300]).expect("write");
        // Spans a page boundary, starts and ends unaligned.
        dev.flush_range(4000, 300).expect("flush");
    }

    #[test]
    fn tiny_regular_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.img");
        let mut file = File::create(&path).expect("create");
        file.write_all(b"not a pool").expect("write");
        drop(file);
        assert!(matches!(
            DaxDevice::open(&path, 0),
            Err(AfsError::Device(_))
        ));
    }

    #[test]
    fn missing_path_is_a_device_error() {
        assert!(matches!(
            DaxDevice::open("/nonexistent/aethelfs-test", 0),
            Err(AfsError::Device(_))
        ));
    }
}

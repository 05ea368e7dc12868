#![forbid(unsafe_code)]
//! FUSE adapter for AethelFS.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via
//! the `fuser` crate, get forwarded to the [`Filesystem`] engine, and errors
//! are mapped through [`AfsError::to_errno()`]. Persistence failures on the
//! data path (`flush`, `fsync`, `release`) are logged and swallowed:
//! failing those upcalls makes the kernel fail unrelated operations, which
//! is strictly worse than best-effort persistence.

use afs_engine::{Attr, FileType as AfsFileType, Filesystem, SetAttr};
use afs_error::AfsError;
use afs_types::InodeNo;
use fuser::{
    FileAttr, FileType, Filesystem as FuseFilesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TTL for cached attributes and entries. The daemon is the only writer of
/// the backing device, so short-lived kernel caching is safe.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: AfsFileType) -> FileType {
    match kind {
        AfsFileType::RegularFile => FileType::RegularFile,
        AfsFileType::Directory => FileType::Directory,
    }
}

fn to_file_attr(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_secs(t: TimeOrNow) -> u64 {
    let t = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    // No `DefaultPermissions`: permission bits are stored, never enforced.
    let mut opts = vec![
        MountOption::FSName("aethelfs".to_owned()),
        MountOption::Subtype("aethelfsd".to_owned()),
        MountOption::NoAtime,
        MountOption::RW,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates every operation to the engine.
pub struct AethelFuse {
    fs: Arc<Filesystem>,
}

impl AethelFuse {
    #[must_use]
    pub fn new(fs: Arc<Filesystem>) -> Self {
        Self { fs }
    }

    /// Convert a FUSE name into the engine's UTF-8 names; anything else is
    /// an invalid name.
    fn name_str(name: &OsStr) -> Result<&str, AfsError> {
        name.to_str()
            .ok_or_else(|| AfsError::InvalidName(name.to_string_lossy().into_owned()))
    }

    /// Best-effort write-back for the data path: log and report success.
    fn sync_best_effort(&self, op: &'static str) {
        if let Err(e) = self.fs.sync() {
            warn!(op, error = %e, "best-effort persistence failed");
        }
    }
}

impl FuseFilesystem for AethelFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.sync_best_effort("destroy");
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(InodeNo(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => {
                warn!(ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = Self::name_str(name).and_then(|n| self.fs.lookup(InodeNo(parent), n));
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => {
                // Missing entries are routine; only log unexpected failures.
                if e.to_errno() != libc::ENOENT {
                    warn!(parent, ?name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let set = SetAttr {
            mode,
            uid,
            gid,
            size,
            mtime: mtime.map(time_secs),
        };
        match self.fs.setattr(InodeNo(ino), set) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => {
                warn!(ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = Self::name_str(name)
            .and_then(|n| self.fs.mkdir(InodeNo(parent), n, mode, req.uid(), req.gid()));
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = Self::name_str(name)
            .and_then(|n| self.fs.create(InodeNo(parent), n, mode, req.uid(), req.gid()));
        match result {
            Ok(attr) => reply.created(&ATTR_TTL, &to_file_attr(&attr), 0, 0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = Self::name_str(name).and_then(|n| self.fs.unlink(InodeNo(parent), n));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = Self::name_str(name).and_then(|n| self.fs.rmdir(InodeNo(parent), n));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles to track.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.read(InodeNo(ino), byte_offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write(InodeNo(ino), byte_offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                warn!(ino, offset, len = data.len(), error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.sync_best_effort("flush");
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.sync_best_effort("release");
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.sync_best_effort("fsync");
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let skip = usize::try_from(offset).unwrap_or(0);
        match self.fs.readdir(InodeNo(ino)) {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate().skip(skip) {
                    let next_offset = i64::try_from(i + 1).unwrap_or(i64::MAX);
                    let full = reply.add(
                        entry.ino.0,
                        next_offset,
                        to_fuser_file_type(entry.kind),
                        OsStr::new(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                warn!(ino, offset, error = %e, "readdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.fs.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount an AethelFS filesystem at the given mountpoint (blocking until
/// unmounted).
pub fn mount(
    fs: Arc<Filesystem>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    fuser::mount2(AethelFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background, returning a session handle. The filesystem is
/// unmounted when the returned `BackgroundSession` is dropped.
pub fn mount_background(
    fs: Arc<Filesystem>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(AethelFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_dax::DaxDevice;
    use std::fs::File;

    fn engine() -> (tempfile::TempDir, Arc<Filesystem>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.img");
        let file = File::create(&path).expect("create");
        file.set_len(16 * 1024 * 1024).expect("set_len");
        drop(file);
        {
            let dev = DaxDevice::open(&path, 0).expect("open");
            afs_label::create_pool(&dev, "fusetest", 16 * 1024 * 1024).expect("pool");
            Filesystem::format(&dev, 0, 0).expect("format");
        }
        let dev = Arc::new(DaxDevice::open(&path, 0).expect("reopen"));
        let fs = Arc::new(Filesystem::mount(dev).expect("mount"));
        (dir, fs)
    }

    #[test]
    fn file_type_conversion() {
        assert_eq!(
            to_fuser_file_type(AfsFileType::RegularFile),
            FileType::RegularFile
        );
        assert_eq!(
            to_fuser_file_type(AfsFileType::Directory),
            FileType::Directory
        );
    }

    #[test]
    fn attr_conversion_carries_everything() {
        let (_dir, fs) = engine();
        let attr = fs
            .create(InodeNo(1), "conv.txt", 0o640, 1000, 1001)
            .expect("create");
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, attr.ino.0);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o640);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.gid, 1001);
        assert_eq!(fattr.size, 0);
        assert_eq!(fattr.blksize, 4096);
        assert_eq!(fattr.rdev, 0);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn mount_options_skip_permission_enforcement() {
        let opts = build_mount_options(&MountOptions::default());
        assert!(
            !opts
                .iter()
                .any(|o| matches!(o, MountOption::DefaultPermissions))
        );
        assert!(opts.iter().any(|o| matches!(o, MountOption::AutoUnmount)));
        assert!(!opts.iter().any(|o| matches!(o, MountOption::AllowOther)));

        let opts = build_mount_options(&MountOptions {
            allow_other: true,
            auto_unmount: false,
        });
        assert!(opts.iter().any(|o| matches!(o, MountOption::AllowOther)));
        assert!(!opts.iter().any(|o| matches!(o, MountOption::AutoUnmount)));
    }

    #[test]
    fn non_utf8_names_map_to_einval() {
        use std::os::unix::ffi::OsStrExt;
        let bad = OsStr::from_bytes(&[0x66, 0x6F, 0xFF]);
        let err = AethelFuse::name_str(bad).unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
        assert!(AethelFuse::name_str(OsStr::new("fine")).is_ok());
    }

    #[test]
    fn time_or_now_to_seconds() {
        let t = UNIX_EPOCH + Duration::from_secs(1234);
        assert_eq!(time_secs(TimeOrNow::SpecificTime(t)), 1234);
        assert!(time_secs(TimeOrNow::Now) >= 1234);
    }

    #[test]
    fn empty_mountpoint_is_rejected() {
        let (_dir, fs) = engine();
        let err = mount(fs, "", &MountOptions::default()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}

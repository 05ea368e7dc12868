//! In-memory node model.
//!
//! One [`Node`] per live inode, holding its attributes and either file
//! extent state or a directory's child map. Children reference their parent
//! only by inode number, never by an owning link, so removal stays local.

use crate::ondisk::PublishedPtrs;
use afs_alloc::Extent;
use afs_error::{AfsError, Result};
use afs_types::{BLOCK_SIZE, InodeNo, S_IFDIR, S_IFMT, S_IFREG};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node type as exposed through the VFS adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
}

/// Attributes returned by `getattr`/`lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: InodeNo,
    pub kind: FileType,
    pub mode: u32,
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub blksize: u32,
    pub blocks: u64,
}

/// One `readdir` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNo,
    pub kind: FileType,
    pub name: String,
}

/// Attribute changes requested by `setattr`; `None` fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    /// Seconds since the epoch.
    pub mtime: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    File {
        /// The file's single backing extent within the mapping.
        extent: Extent,
        /// Logical size; never exceeds `extent.len`.
        size: u64,
        ptrs: PublishedPtrs,
    },
    Dir {
        children: BTreeMap<String, InodeNo>,
        /// Backing extent for the serialized entries; empty directories
        /// may have none.
        extent: Option<Extent>,
        /// Exact serialized entry bytes currently on the device.
        ser_len: u64,
        ptrs: PublishedPtrs,
    },
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub links: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub ino: InodeNo,
    pub state: RwLock<NodeState>,
}

impl NodeState {
    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub(crate) fn file_type(&self) -> FileType {
        if self.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        }
    }

    pub(crate) fn attr_size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { size, .. } => *size,
            // Directories report a nominal block.
            NodeKind::Dir { .. } => BLOCK_SIZE,
        }
    }
}

impl Node {
    pub(crate) fn attr(&self) -> Attr {
        let state = self.state.read();
        let size = state.attr_size();
        #[expect(clippy::cast_possible_truncation)] // masked to 12 bits
        let perm = (state.mode & 0o7777) as u16;
        #[expect(clippy::cast_possible_truncation)] // block size is 4096
        let blksize = BLOCK_SIZE as u32;
        Attr {
            ino: self.ino,
            kind: state.file_type(),
            mode: state.mode,
            perm,
            uid: state.uid,
            gid: state.gid,
            size,
            nlink: state.links,
            atime: epoch_time(state.atime),
            mtime: epoch_time(state.mtime),
            ctime: epoch_time(state.ctime),
            blksize,
            blocks: size.div_ceil(512),
        }
    }
}

/// Build the stored mode for a new node: type bits from the node kind,
/// permission bits from the request.
pub(crate) fn make_mode(kind: FileType, requested: u32) -> u32 {
    let type_bits = match kind {
        FileType::RegularFile => S_IFREG,
        FileType::Directory => S_IFDIR,
    };
    type_bits | (requested & !S_IFMT)
}

/// Names must be non-empty and free of `/` and NUL.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(AfsError::InvalidName(name.to_owned()));
    }
    Ok(())
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn epoch_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("a.txt").is_ok());
        assert!(validate_name("with spaces and unicode é").is_ok());
        assert!(matches!(validate_name(""), Err(AfsError::InvalidName(_))));
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn make_mode_sets_type_bits() {
        assert_eq!(make_mode(FileType::RegularFile, 0o644), S_IFREG | 0o644);
        assert_eq!(make_mode(FileType::Directory, 0o755), S_IFDIR | 0o755);
        // Type bits in the request are ignored.
        assert_eq!(
            make_mode(FileType::RegularFile, S_IFDIR | 0o600),
            S_IFREG | 0o600
        );
    }

    #[test]
    fn attr_reports_nominal_dir_size() {
        let node = Node {
            ino: InodeNo(5),
            state: RwLock::new(NodeState {
                mode: make_mode(FileType::Directory, 0o755),
                uid: 1000,
                gid: 1000,
                links: 2,
                atime: 100,
                mtime: 100,
                ctime: 100,
                kind: NodeKind::Dir {
                    children: BTreeMap::new(),
                    extent: None,
                    ser_len: 0,
                    ptrs: PublishedPtrs::none(),
                },
            }),
        };
        let attr = node.attr();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.size, BLOCK_SIZE);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(100));
    }

    #[test]
    fn attr_reports_logical_file_size() {
        let node = Node {
            ino: InodeNo(7),
            state: RwLock::new(NodeState {
                mode: make_mode(FileType::RegularFile, 0o644),
                uid: 0,
                gid: 0,
                links: 1,
                atime: 0,
                mtime: 0,
                ctime: 0,
                kind: NodeKind::File {
                    extent: Extent {
                        offset: 1 << 20,
                        len: 65_536,
                    },
                    size: 1234,
                    ptrs: PublishedPtrs::none(),
                },
            }),
        };
        let attr = node.attr();
        assert_eq!(attr.size, 1234);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
    }
}

#![forbid(unsafe_code)]
//! The AethelFS filesystem engine.
//!
//! Owns the in-memory node graph, the space allocator, and the on-device
//! metadata (superblock, bitmaps, inode table, directory blocks). Every
//! mutating operation serializes the affected metadata back into the usable
//! area, persists it, and then publishes a new uberblock, so a crash at any
//! point leaves the previous committed root the winner.

mod node;
mod ondisk;

pub use node::{Attr, DirEntry, FileType, SetAttr};

use afs_alloc::{Extent, ExtentAllocator, SpaceUsage};
use afs_dax::DaxDevice;
use afs_error::{AfsError, Result};
use afs_label::{Uberblock, commit_uberblock, read_nv, select_best_uberblock};
use afs_types::{
    BLOCK_SIZE, DEFAULT_FILE_EXTENT, InodeNo, MAX_ALLOCATION_SIZE, POOL_VERSION, S_IFDIR, S_IFMT,
    S_IFREG, Txg, usable_area,
};
use node::{Node, NodeKind, NodeState, make_mode, now_secs, validate_name};
use ondisk::{
    Geometry, InodeRecord, MAX_EXTENT_BLOCKS, PublishedPtrs, Superblock, bit_clear, bit_get,
    bit_set, decode_dirents, encode_dirents, load_pointers, publish_pointers,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Copy buffer for extent migration during growth.
const COPY_CHUNK: usize = 1024 * 1024;

/// Filesystem statistics, shaped for the statfs upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// One mounted AethelFS filesystem.
///
/// Lock order, outermost first: the node table (`nodes`), then individual
/// node locks, then the allocator's internal mutex. Namespace mutations take
/// the table write lock; data-path operations take only their node's lock.
/// Commits serialize on `committed_txg` and lock one node at a time.
pub struct Filesystem {
    dev: Arc<DaxDevice>,
    geo: Geometry,
    alloc: ExtentAllocator,
    uuid: [u8; 16],
    guid_sum: u64,
    nodes: RwLock<HashMap<InodeNo, Arc<Node>>>,
    next_inode: AtomicU64,
    committed_txg: Mutex<Txg>,
}

impl Filesystem {
    // ── Format ──────────────────────────────────────────────────────────────

    /// Initialise a filesystem on a labelled pool: zero the metadata region,
    /// write the superblock, bitmaps, and a root inode, persist, then commit
    /// the first uberblock with a live root.
    ///
    /// An existing filesystem on the pool is replaced.
    pub fn format(dev: &DaxDevice, uid: u32, gid: u32) -> Result<()> {
        let nv = read_nv(dev)?;
        let (usable_start, usable_end) = usable_area(dev.len())
            .ok_or_else(|| AfsError::Device("device too small for a pool".to_owned()))?;
        let geo = Geometry::compute(usable_start, usable_end)?;

        dev.fill_at(usable_start, 0, geo.metadata_len())?;

        // Root directory, inode 1, initially empty.
        let now = now_secs();
        let root = InodeRecord {
            mode: S_IFDIR | 0o755,
            uid,
            gid,
            links: 2,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            direct: [0; ondisk::PTRS_DIRECT],
            indirect: 0,
            double_indirect: 0,
        };
        dev.write_at(geo.inode_table_offset(), &root.encode())?;

        let mut inode_bitmap = vec![0_u8; BLOCK_SIZE as usize];
        bit_set(&mut inode_bitmap, InodeNo::ROOT.0);
        dev.write_at(geo.inode_bitmap_offset(), &inode_bitmap)?;

        let mut data_bitmap = vec![0_u8; (geo.data_bitmap_blocks * BLOCK_SIZE) as usize];
        for block in 0..geo.first_data_block() {
            bit_set(&mut data_bitmap, block);
        }
        dev.write_at(geo.data_bitmap_offset(), &data_bitmap)?;

        let uuid = rand::random::<[u8; 16]>();
        let sb = Superblock::for_geometry(&geo, uuid, InodeNo::ROOT.0 + 1);
        dev.write_at(geo.sb_offset(), &sb.encode())?;

        dev.flush_range(usable_start, geo.metadata_len())?;

        let last_txg = select_best_uberblock(dev)?
            .map(|s| s.uberblock.txg)
            .ok_or_else(|| AfsError::Corrupt("device carries no pool labels".to_owned()))?;
        commit_uberblock(
            dev,
            &Uberblock {
                version: POOL_VERSION,
                txg: last_txg.next(),
                guid_sum: nv.pool_guid,
                timestamp: now,
                root_bp: geo.sb_offset(),
            },
        )?;

        info!(pool = %nv.pool_name, txg = %last_txg.next(), "formatted filesystem");
        Ok(())
    }

    // ── Mount ───────────────────────────────────────────────────────────────

    /// Load the most recently committed filesystem root.
    ///
    /// Selects the authoritative uberblock, reads the superblock, bitmaps,
    /// and inode table, reconstructs the node graph by walking directory
    /// extents from the root, and rebuilds the allocator from the data
    /// bitmap. Any inconsistency is a fatal `Corrupt`.
    pub fn mount(dev: Arc<DaxDevice>) -> Result<Self> {
        let nv = read_nv(&dev)?;
        let (usable_start, usable_end) = usable_area(dev.len())
            .ok_or_else(|| AfsError::Device("device too small for a pool".to_owned()))?;
        let geo = Geometry::compute(usable_start, usable_end)?;

        let selected = select_best_uberblock(&dev)?
            .ok_or_else(|| AfsError::Corrupt("no valid uberblock on device".to_owned()))?;
        if !selected.uberblock.has_root() {
            return Err(AfsError::Corrupt(
                "pool carries no filesystem (run `afs create` first)".to_owned(),
            ));
        }
        if selected.uberblock.root_bp != geo.sb_offset() {
            return Err(AfsError::Corrupt(format!(
                "uberblock root_bp {} does not match the superblock location {}",
                selected.uberblock.root_bp,
                geo.sb_offset()
            )));
        }

        let mut sb_block = vec![0_u8; BLOCK_SIZE as usize];
        dev.read_at(geo.sb_offset(), &mut sb_block)?;
        let sb = Superblock::decode(&sb_block).map_err(|e| AfsError::Corrupt(e.to_string()))?;
        if sb.block_count != geo.block_count || sb.inode_capacity != geo.inode_capacity {
            return Err(AfsError::Corrupt(
                "superblock geometry does not match the device".to_owned(),
            ));
        }

        let mut inode_bitmap = vec![0_u8; BLOCK_SIZE as usize];
        dev.read_at(geo.inode_bitmap_offset(), &mut inode_bitmap)?;
        let mut table = vec![0_u8; geo.inode_table_len() as usize];
        dev.read_at(geo.inode_table_offset(), &mut table)?;

        // Pass 1: decode every live inode record.
        struct Loaded {
            record: InodeRecord,
            extent: Option<Extent>,
            ptrs: PublishedPtrs,
            entries: Vec<(String, InodeNo)>,
        }
        let mut loaded: BTreeMap<InodeNo, Loaded> = BTreeMap::new();
        for ino in 1..=geo.inode_capacity {
            if !bit_get(&inode_bitmap, ino) {
                continue;
            }
            let slot = ((ino - 1) * ondisk::INODE_SIZE) as usize;
            let record = InodeRecord::decode(&table[slot..slot + ondisk::INODE_SIZE as usize])
                .map_err(|e| AfsError::Corrupt(format!("inode {ino}: {e}")))?;
            let (extent, owned) = load_pointers(&dev, &geo, &record)?;
            let ptrs = PublishedPtrs {
                direct: record.direct,
                indirect: record.indirect,
                double_indirect: record.double_indirect,
                owned,
            };

            let entries = match record.mode & S_IFMT {
                S_IFREG => {
                    let capacity = extent.map_or(0, |e| e.len);
                    if extent.is_none() || record.size > capacity {
                        return Err(AfsError::Corrupt(format!(
                            "inode {ino}: size {} exceeds extent capacity {capacity}",
                            record.size
                        )));
                    }
                    Vec::new()
                }
                S_IFDIR => {
                    let capacity = extent.map_or(0, |e| e.len);
                    if record.size > capacity {
                        return Err(AfsError::Corrupt(format!(
                            "directory inode {ino}: serialized length exceeds extent"
                        )));
                    }
                    match extent {
                        Some(e) if record.size > 0 => {
                            let mut bytes = vec![0_u8; record.size as usize];
                            dev.read_at(e.offset, &mut bytes)?;
                            decode_dirents(&bytes)?
                        }
                        _ => Vec::new(),
                    }
                }
                other => {
                    return Err(AfsError::Corrupt(format!(
                        "inode {ino}: unsupported mode {other:#o}"
                    )));
                }
            };

            loaded.insert(
                InodeNo(ino),
                Loaded {
                    record,
                    extent,
                    ptrs,
                    entries,
                },
            );
        }

        // Pass 2: every directory entry must resolve; the root must exist.
        if !loaded
            .get(&InodeNo::ROOT)
            .is_some_and(|l| l.record.mode & S_IFMT == S_IFDIR)
        {
            return Err(AfsError::Corrupt("root inode missing or not a directory".to_owned()));
        }
        for (ino, l) in &loaded {
            for (name, child) in &l.entries {
                if !loaded.contains_key(child) {
                    return Err(AfsError::Corrupt(format!(
                        "directory {ino} entry {name:?} references missing inode {child}"
                    )));
                }
            }
        }

        let mut max_ino = InodeNo::ROOT.0;
        let mut nodes: HashMap<InodeNo, Arc<Node>> = HashMap::with_capacity(loaded.len());
        for (ino, l) in loaded {
            max_ino = max_ino.max(ino.0);
            let kind = if l.record.mode & S_IFMT == S_IFDIR {
                NodeKind::Dir {
                    children: l.entries.into_iter().collect(),
                    extent: l.extent,
                    ser_len: l.record.size,
                    ptrs: l.ptrs,
                }
            } else {
                let Some(extent) = l.extent else {
                    return Err(AfsError::Corrupt(format!("file inode {ino} has no extent")));
                };
                NodeKind::File {
                    extent,
                    size: l.record.size,
                    ptrs: l.ptrs,
                }
            };
            nodes.insert(
                ino,
                Arc::new(Node {
                    ino,
                    state: RwLock::new(NodeState {
                        mode: l.record.mode,
                        uid: l.record.uid,
                        gid: l.record.gid,
                        links: l.record.links,
                        atime: l.record.atime,
                        mtime: l.record.mtime,
                        ctime: l.record.ctime,
                        kind,
                    }),
                }),
            );
        }

        let alloc = Self::restore_allocator(&dev, &geo)?;
        let next_inode = sb.next_inode.max(max_ino + 1);

        info!(
            pool = %nv.pool_name,
            txg = %selected.uberblock.txg,
            inodes = nodes.len(),
            free_mib = alloc.usage().free / (1024 * 1024),
            "mounted filesystem"
        );

        Ok(Self {
            dev,
            geo,
            alloc,
            uuid: sb.uuid,
            guid_sum: nv.pool_guid,
            nodes: RwLock::new(nodes),
            next_inode: AtomicU64::new(next_inode),
            committed_txg: Mutex::new(selected.uberblock.txg),
        })
    }

    fn restore_allocator(dev: &DaxDevice, geo: &Geometry) -> Result<ExtentAllocator> {
        let mut bitmap = vec![0_u8; (geo.data_bitmap_blocks * BLOCK_SIZE) as usize];
        dev.read_at(geo.data_bitmap_offset(), &mut bitmap)?;

        let first = geo.first_data_block();
        let mut highest = None;
        for block in first..geo.block_count {
            if bit_get(&bitmap, block) {
                highest = Some(block);
            }
        }
        let watermark_block = highest.map_or(first, |h| h + 1);

        // Each maximal free run below the watermark becomes one free extent.
        let mut free = Vec::new();
        let mut run_start = None;
        for block in first..watermark_block {
            let used = bit_get(&bitmap, block);
            match (used, run_start) {
                (false, None) => run_start = Some(block),
                (true, Some(start)) => {
                    free.push(Extent {
                        offset: geo.block_to_offset(start),
                        len: (block - start) * BLOCK_SIZE,
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            free.push(Extent {
                offset: geo.block_to_offset(start),
                len: (watermark_block - start) * BLOCK_SIZE,
            });
        }

        Ok(ExtentAllocator::restore(
            geo.usable_start,
            geo.usable_end,
            geo.data_start,
            geo.block_to_offset(watermark_block),
            free,
        ))
    }

    // ── Commit ──────────────────────────────────────────────────────────────

    /// Serialize all metadata into the usable area, persist it, then publish
    /// an uberblock with the next transaction group.
    ///
    /// A failure anywhere before the uberblock write leaves the previous
    /// root authoritative; the error is surfaced to the caller.
    pub fn commit(&self) -> Result<()> {
        let mut txg = self.committed_txg.lock();
        let nodes = self.nodes.read();

        // Directory extents first; serialization may grow them.
        for node in nodes.values() {
            let mut st = node.state.write();
            if !st.is_dir() {
                continue;
            }
            let bytes = match &st.kind {
                NodeKind::Dir { children, .. } => {
                    encode_dirents(children.iter().map(|(n, i)| (n.as_str(), *i)))
                }
                NodeKind::File { .. } => unreachable!(),
            };
            self.write_dir_extent(&mut st, &bytes)?;
        }

        // Inode table and inode bitmap.
        let mut table = vec![0_u8; self.geo.inode_table_len() as usize];
        let mut inode_bitmap = vec![0_u8; BLOCK_SIZE as usize];
        let mut live = 0_u64;
        for (ino, node) in nodes.iter() {
            let st = node.state.read();
            let record = Self::record_for(&st);
            let slot = ((ino.0 - 1) * ondisk::INODE_SIZE) as usize;
            table[slot..slot + ondisk::INODE_SIZE as usize].copy_from_slice(&record.encode());
            bit_set(&mut inode_bitmap, ino.0);
            live += 1;
        }

        // Data bitmap from the allocator: everything between the metadata
        // reservation and the watermark is owned unless on the free list.
        let mut data_bitmap = vec![0_u8; (self.geo.data_bitmap_blocks * BLOCK_SIZE) as usize];
        let watermark_block = self.geo.offset_to_block(self.alloc.next_offset());
        for block in 0..watermark_block {
            bit_set(&mut data_bitmap, block);
        }
        for extent in self.alloc.free_extents() {
            let start = self.geo.offset_to_block(extent.offset);
            for block in start..start + extent.len / BLOCK_SIZE {
                bit_clear(&mut data_bitmap, block);
            }
        }

        let sb = Superblock::for_geometry(
            &self.geo,
            self.uuid,
            self.next_inode.load(Ordering::Relaxed),
        );

        self.dev.write_at(self.geo.inode_table_offset(), &table)?;
        self.dev
            .write_at(self.geo.inode_bitmap_offset(), &inode_bitmap)?;
        self.dev
            .write_at(self.geo.data_bitmap_offset(), &data_bitmap)?;
        self.dev.write_at(self.geo.sb_offset(), &sb.encode())?;
        self.dev
            .flush_range(self.geo.usable_start, self.geo.metadata_len())?;
        drop(nodes);

        let next = txg.next();
        commit_uberblock(
            &self.dev,
            &Uberblock {
                version: POOL_VERSION,
                txg: next,
                guid_sum: self.guid_sum,
                timestamp: now_secs(),
                root_bp: self.geo.sb_offset(),
            },
        )?;
        *txg = next;
        debug!(txg = %next, live_inodes = live, "committed metadata");
        Ok(())
    }

    /// Write a directory's serialized entries, growing its extent when the
    /// bytes no longer fit. Holds the directory's write lock via `st`.
    fn write_dir_extent(&self, st: &mut NodeState, bytes: &[u8]) -> Result<()> {
        let NodeKind::Dir {
            extent,
            ser_len,
            ptrs,
            ..
        } = &mut st.kind
        else {
            unreachable!("caller checked is_dir");
        };

        let needed = bytes.len() as u64;
        let capacity = extent.map_or(0, |e| e.len);
        if needed > capacity {
            let new_capacity = needed.max(capacity * 2).max(BLOCK_SIZE);
            let new_extent = self.alloc.alloc(new_capacity)?;
            let new_ptrs = match publish_pointers(&self.dev, &self.geo, &self.alloc, new_extent) {
                Ok(p) => p,
                Err(e) => {
                    self.alloc.free(new_extent);
                    return Err(e);
                }
            };
            for pb in ptrs.owned.0.drain(..) {
                self.alloc.free(pb);
            }
            if let Some(old) = extent.take() {
                self.alloc.free(old);
            }
            *extent = Some(new_extent);
            *ptrs = new_ptrs;
        }

        if let Some(e) = *extent {
            if !bytes.is_empty() {
                self.dev.write_at(e.offset, bytes)?;
                self.dev.flush_range(e.offset, needed)?;
            }
        }
        *ser_len = needed;
        Ok(())
    }

    fn record_for(st: &NodeState) -> InodeRecord {
        let (size, ptrs) = match &st.kind {
            NodeKind::File { size, ptrs, .. } => (*size, ptrs),
            NodeKind::Dir { ser_len, ptrs, .. } => (*ser_len, ptrs),
        };
        InodeRecord {
            mode: st.mode,
            uid: st.uid,
            gid: st.gid,
            links: st.links,
            size,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            direct: ptrs.direct,
            indirect: ptrs.indirect,
            double_indirect: ptrs.double_indirect,
        }
    }

    // ── Node access ─────────────────────────────────────────────────────────

    fn get(&self, ino: InodeNo) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .get(&ino)
            .cloned()
            .ok_or_else(|| AfsError::NotFound(format!("inode {ino}")))
    }

    // ── Attribute and namespace operations ──────────────────────────────────

    pub fn getattr(&self, ino: InodeNo) -> Result<Attr> {
        Ok(self.get(ino)?.attr())
    }

    pub fn lookup(&self, parent: InodeNo, name: &str) -> Result<Attr> {
        let parent_node = self.get(parent)?;
        let child = {
            let st = parent_node.state.read();
            let NodeKind::Dir { children, .. } = &st.kind else {
                return Err(AfsError::NotDirectory);
            };
            children
                .get(name)
                .copied()
                .ok_or_else(|| AfsError::NotFound(format!("{name:?} in inode {parent}")))?
        };
        self.getattr(child)
    }

    /// Enumerate a directory. Order is the child-name order and is stable
    /// within one enumeration.
    pub fn readdir(&self, ino: InodeNo) -> Result<Vec<DirEntry>> {
        let node = self.get(ino)?;
        let children: Vec<(String, InodeNo)> = {
            let st = node.state.read();
            let NodeKind::Dir { children, .. } = &st.kind else {
                return Err(AfsError::NotDirectory);
            };
            children.iter().map(|(n, i)| (n.clone(), *i)).collect()
        };

        let nodes = self.nodes.read();
        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            let Some(child_node) = nodes.get(&child) else {
                // Invariant 3: every entry resolves.
                return Err(AfsError::Corrupt(format!(
                    "directory {ino} entry {name:?} references missing inode {child}"
                )));
            };
            entries.push(DirEntry {
                ino: child,
                kind: child_node.state.read().file_type(),
                name,
            });
        }
        Ok(entries)
    }

    pub fn create(&self, parent: InodeNo, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        let attr = self.insert_child(parent, name, |ino| {
            let extent = self.alloc.alloc(DEFAULT_FILE_EXTENT)?;
            let ptrs = match publish_pointers(&self.dev, &self.geo, &self.alloc, extent) {
                Ok(p) => p,
                Err(e) => {
                    self.alloc.free(extent);
                    return Err(e);
                }
            };
            let now = now_secs();
            Ok(Node {
                ino,
                state: RwLock::new(NodeState {
                    mode: make_mode(FileType::RegularFile, mode),
                    uid,
                    gid,
                    links: 1,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    kind: NodeKind::File {
                        extent,
                        size: 0,
                        ptrs,
                    },
                }),
            })
        })?;
        self.commit()?;
        Ok(attr)
    }

    pub fn mkdir(&self, parent: InodeNo, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        let attr = self.insert_child(parent, name, |ino| {
            let now = now_secs();
            Ok(Node {
                ino,
                state: RwLock::new(NodeState {
                    mode: make_mode(FileType::Directory, mode),
                    uid,
                    gid,
                    links: 2,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    kind: NodeKind::Dir {
                        children: BTreeMap::new(),
                        extent: None,
                        ser_len: 0,
                        ptrs: PublishedPtrs::none(),
                    },
                }),
            })
        })?;
        self.commit()?;
        Ok(attr)
    }

    fn insert_child(
        &self,
        parent: InodeNo,
        name: &str,
        build: impl FnOnce(InodeNo) -> Result<Node>,
    ) -> Result<Attr> {
        validate_name(name)?;

        let mut nodes = self.nodes.write();
        let parent_node = nodes
            .get(&parent)
            .cloned()
            .ok_or_else(|| AfsError::NotFound(format!("inode {parent}")))?;
        let mut pst = parent_node.state.write();
        let NodeKind::Dir { children, .. } = &mut pst.kind else {
            return Err(AfsError::NotDirectory);
        };
        if children.contains_key(name) {
            return Err(AfsError::Exists);
        }

        let ino = InodeNo(self.next_inode.fetch_add(1, Ordering::Relaxed));
        if ino.0 > self.geo.inode_capacity {
            return Err(AfsError::NoSpace);
        }
        let node = Arc::new(build(ino)?);

        children.insert(name.to_owned(), ino);
        pst.mtime = now_secs();
        drop(pst);

        let attr = node.attr();
        nodes.insert(ino, node);
        Ok(attr)
    }

    pub fn unlink(&self, parent: InodeNo, name: &str) -> Result<()> {
        self.remove_child(parent, name, false)?;
        self.commit()
    }

    pub fn rmdir(&self, parent: InodeNo, name: &str) -> Result<()> {
        self.remove_child(parent, name, true)?;
        self.commit()
    }

    fn remove_child(&self, parent: InodeNo, name: &str, want_dir: bool) -> Result<()> {
        let mut nodes = self.nodes.write();
        let parent_node = nodes
            .get(&parent)
            .cloned()
            .ok_or_else(|| AfsError::NotFound(format!("inode {parent}")))?;
        let mut pst = parent_node.state.write();
        let NodeKind::Dir { children, .. } = &mut pst.kind else {
            return Err(AfsError::NotDirectory);
        };
        let child_ino = children
            .get(name)
            .copied()
            .ok_or_else(|| AfsError::NotFound(format!("{name:?} in inode {parent}")))?;
        let child = nodes
            .get(&child_ino)
            .cloned()
            .ok_or_else(|| AfsError::Corrupt(format!("dangling directory entry {name:?}")))?;

        // Type check and reclaim under the child's write lock, so an
        // in-flight read of the extent cannot outlive the free.
        let mut cst = child.state.write();
        match (&mut cst.kind, want_dir) {
            (NodeKind::Dir { .. }, false) => return Err(AfsError::IsDirectory),
            (NodeKind::File { .. }, true) => return Err(AfsError::NotDirectory),
            (
                NodeKind::Dir {
                    children: grandchildren,
                    extent,
                    ptrs,
                    ..
                },
                true,
            ) => {
                if !grandchildren.is_empty() {
                    return Err(AfsError::NotEmpty);
                }
                for pb in ptrs.owned.0.drain(..) {
                    self.alloc.free(pb);
                }
                if let Some(e) = extent.take() {
                    self.alloc.free(e);
                }
            }
            (NodeKind::File { extent, ptrs, .. }, false) => {
                for pb in ptrs.owned.0.drain(..) {
                    self.alloc.free(pb);
                }
                self.alloc.free(*extent);
            }
        }
        drop(cst);

        children.remove(name);
        pst.mtime = now_secs();
        drop(pst);
        nodes.remove(&child_ino);
        Ok(())
    }

    // ── File I/O path ───────────────────────────────────────────────────────

    pub fn read(&self, ino: InodeNo, offset: u64, size: u32) -> Result<Vec<u8>> {
        let node = self.get(ino)?;
        let st = node.state.read();
        let NodeKind::File {
            extent,
            size: file_size,
            ..
        } = &st.kind
        else {
            return Err(AfsError::IsDirectory);
        };

        if offset >= *file_size {
            return Ok(Vec::new());
        }
        let end = (offset + u64::from(size)).min(*file_size);
        assert!(end <= extent.len, "file size exceeds its extent");

        let mut buf = vec![0_u8; (end - offset) as usize];
        self.dev.read_at(extent.offset + offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, growing the backing extent when the write
    /// extends past its capacity. Writes into a file's first page also
    /// trigger a metadata commit; later writes defer to the next fsync.
    pub fn write(&self, ino: InodeNo, offset: u64, data: &[u8]) -> Result<u32> {
        let node = self.get(ino)?;
        let commit_meta;
        {
            let mut st = node.state.write();
            if st.is_dir() {
                return Err(AfsError::IsDirectory);
            }
            let new_end = offset
                .checked_add(data.len() as u64)
                .ok_or(AfsError::NoSpace)?;
            self.grow_file(&mut st, new_end)?;

            let NodeKind::File {
                extent,
                size: file_size,
                ..
            } = &mut st.kind
            else {
                unreachable!("checked above");
            };
            assert!(new_end <= extent.len, "grow left the extent short");
            self.dev.write_at(extent.offset + offset, data)?;
            if new_end > *file_size {
                *file_size = new_end;
            }
            st.mtime = now_secs();

            commit_meta = offset < BLOCK_SIZE;
            if commit_meta {
                self.dev.flush_range(extent.offset + offset, data.len() as u64)?;
            }
        }
        if commit_meta {
            self.commit()?;
        }
        #[expect(clippy::cast_possible_truncation)] // FUSE writes are < 4 GiB
        let written = data.len() as u32;
        Ok(written)
    }

    /// Grow a file's extent so it can hold at least `new_min` bytes: pick
    /// `max(new_min, 2 × capacity)`, allocate fresh, copy the live prefix,
    /// republish pointers, and free the old extent.
    fn grow_file(&self, st: &mut NodeState, new_min: u64) -> Result<()> {
        let NodeKind::File { extent, size, ptrs } = &mut st.kind else {
            return Err(AfsError::IsDirectory);
        };
        if new_min <= extent.len {
            return Ok(());
        }

        let max_bytes = (MAX_EXTENT_BLOCKS * BLOCK_SIZE).min(MAX_ALLOCATION_SIZE);
        if new_min > max_bytes {
            return Err(AfsError::NoSpace);
        }
        let new_capacity = new_min.max(extent.len * 2).min(max_bytes);

        let new_extent = self.alloc.alloc(new_capacity)?;
        if let Err(e) = self.copy_region(extent.offset, new_extent.offset, *size) {
            self.alloc.free(new_extent);
            return Err(e);
        }
        let new_ptrs = match publish_pointers(&self.dev, &self.geo, &self.alloc, new_extent) {
            Ok(p) => p,
            Err(e) => {
                self.alloc.free(new_extent);
                return Err(e);
            }
        };

        for pb in ptrs.owned.0.drain(..) {
            self.alloc.free(pb);
        }
        self.alloc.free(*extent);
        debug!(
            old_offset = extent.offset,
            old_len = extent.len,
            new_offset = new_extent.offset,
            new_len = new_extent.len,
            "grew file extent"
        );
        *extent = new_extent;
        *ptrs = new_ptrs;
        Ok(())
    }

    fn copy_region(&self, src: u64, dst: u64, len: u64) -> Result<()> {
        let mut buf = vec![0_u8; COPY_CHUNK.min(len as usize).max(1)];
        let mut done = 0_u64;
        while done < len {
            let chunk = (len - done).min(buf.len() as u64) as usize;
            self.dev.read_at(src + done, &mut buf[..chunk])?;
            self.dev.write_at(dst + done, &buf[..chunk])?;
            done += chunk as u64;
        }
        Ok(())
    }

    /// Apply attribute changes. A size change through the file's capacity
    /// grows the extent exactly as a write would; shrinking only truncates
    /// the logical view.
    pub fn setattr(&self, ino: InodeNo, set: SetAttr) -> Result<Attr> {
        let node = self.get(ino)?;
        {
            let mut st = node.state.write();
            if let Some(new_size) = set.size {
                if st.is_dir() {
                    return Err(AfsError::IsDirectory);
                }
                self.grow_file(&mut st, new_size)?;
                let NodeKind::File { size, .. } = &mut st.kind else {
                    unreachable!("checked above");
                };
                *size = new_size;
            }
            if let Some(mode) = set.mode {
                st.mode = (st.mode & S_IFMT) | (mode & !S_IFMT);
            }
            if let Some(uid) = set.uid {
                st.uid = uid;
            }
            if let Some(gid) = set.gid {
                st.gid = gid;
            }
            if let Some(mtime) = set.mtime {
                st.mtime = mtime;
            }
            st.ctime = now_secs();
        }
        self.commit()?;
        Ok(node.attr())
    }

    // ── Durability and statistics ───────────────────────────────────────────

    /// Full write-back of the mapping plus a metadata commit. Callers on the
    /// FUSE data path treat failures as best-effort (log and carry on).
    pub fn sync(&self) -> Result<()> {
        self.dev.flush_all()?;
        self.commit()
    }

    /// Final flush before the daemon exits.
    pub fn unmount(&self) -> Result<()> {
        info!("unmounting: final write-back and commit");
        self.sync()
    }

    #[must_use]
    pub fn statfs(&self) -> StatFs {
        let usage: SpaceUsage = self.alloc.usage();
        let files = self.nodes.read().len() as u64;
        let blocks = usage.total.div_ceil(BLOCK_SIZE);
        let bfree = (usage.free.div_ceil(BLOCK_SIZE)).min(blocks);
        #[expect(clippy::cast_possible_truncation)] // block size is 4096
        let bsize = BLOCK_SIZE as u32;
        StatFs {
            blocks,
            bfree,
            bavail: bfree,
            files,
            ffree: self.geo.inode_capacity.saturating_sub(files),
            bsize,
            namelen: 255,
            frsize: bsize,
        }
    }

    /// Last committed transaction group.
    #[must_use]
    pub fn txg(&self) -> Txg {
        *self.committed_txg.lock()
    }
}

//! On-device metadata: geometry, superblock, inode records, directory
//! entries, and allocation bitmaps.
//!
//! Everything here is little-endian and block-aligned. The metadata region
//! sits at the start of the usable area, in order: superblock, inode
//! bitmap, data bitmap, inode table. The space allocator's watermark starts
//! past the end of this region (with the 1 MiB reservation as a floor).

use afs_alloc::{Extent, ExtentAllocator};
use afs_dax::DaxDevice;
use afs_error::{AfsError, Result};
use afs_types::{
    BLOCK_SIZE, CodecError, InodeNo, METADATA_RESERVATION, POOL_VERSION, align_up, put_le_u16,
    put_le_u32, put_le_u64, read_fixed, read_le_u16, read_le_u32, read_le_u64,
};

/// Superblock magic: "AETHELFS".
pub const SUPERBLOCK_MAGIC: u64 = 0x4145_5448_454C_4653;
/// Fixed inode record size.
pub const INODE_SIZE: u64 = 256;
/// Inode table slots. Slot for inode `i` is `i - 1`.
pub const INODE_CAPACITY: u64 = 2048;
/// Direct block pointers per inode record.
pub const PTRS_DIRECT: usize = 12;
/// Block pointers per 4 KiB pointer block.
pub const PTRS_PER_BLOCK: u64 = BLOCK_SIZE / 8;
/// Largest extent expressible through the pointer scheme, in blocks.
pub const MAX_EXTENT_BLOCKS: u64 =
    PTRS_DIRECT as u64 + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Computed layout of the usable data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub usable_start: u64,
    pub usable_end: u64,
    /// Whole blocks in the usable area.
    pub block_count: u64,
    pub data_bitmap_blocks: u64,
    pub inode_capacity: u64,
    /// First byte the allocator may hand out.
    pub data_start: u64,
}

impl Geometry {
    /// Lay out the metadata region for a usable area.
    pub fn compute(usable_start: u64, usable_end: u64) -> Result<Self> {
        if usable_end <= usable_start {
            return Err(AfsError::Device("empty usable area".to_owned()));
        }
        let block_count = (usable_end - usable_start) / BLOCK_SIZE;
        let data_bitmap_blocks = block_count.div_ceil(BLOCK_SIZE * 8);

        // Superblock + inode bitmap + data bitmap + inode table.
        let metadata_len =
            BLOCK_SIZE + BLOCK_SIZE + data_bitmap_blocks * BLOCK_SIZE + INODE_CAPACITY * INODE_SIZE;
        let metadata_len = align_up(metadata_len, BLOCK_SIZE).ok_or(AfsError::NoSpace)?;
        let data_start = usable_start + metadata_len.max(METADATA_RESERVATION);
        if data_start + BLOCK_SIZE > usable_end {
            return Err(AfsError::Device(format!(
                "usable area too small for metadata: {} bytes",
                usable_end - usable_start
            )));
        }

        Ok(Self {
            usable_start,
            usable_end,
            block_count,
            data_bitmap_blocks,
            inode_capacity: INODE_CAPACITY,
            data_start,
        })
    }

    #[must_use]
    pub fn sb_offset(&self) -> u64 {
        self.usable_start
    }

    #[must_use]
    pub fn inode_bitmap_offset(&self) -> u64 {
        self.usable_start + BLOCK_SIZE
    }

    #[must_use]
    pub fn data_bitmap_offset(&self) -> u64 {
        self.usable_start + 2 * BLOCK_SIZE
    }

    #[must_use]
    pub fn inode_table_offset(&self) -> u64 {
        self.data_bitmap_offset() + self.data_bitmap_blocks * BLOCK_SIZE
    }

    #[must_use]
    pub fn inode_table_len(&self) -> u64 {
        self.inode_capacity * INODE_SIZE
    }

    /// Length of the whole metadata region, reservation floor included.
    #[must_use]
    pub fn metadata_len(&self) -> u64 {
        self.data_start - self.usable_start
    }

    /// Absolute device offset of a usable-area block number.
    #[must_use]
    pub fn block_to_offset(&self, block: u64) -> u64 {
        self.usable_start + block * BLOCK_SIZE
    }

    /// Usable-area block number of an absolute, block-aligned offset.
    #[must_use]
    pub fn offset_to_block(&self, offset: u64) -> u64 {
        debug_assert!(offset >= self.usable_start && offset % BLOCK_SIZE == 0);
        (offset - self.usable_start) / BLOCK_SIZE
    }

    /// First block number the allocator may hand out.
    #[must_use]
    pub fn first_data_block(&self) -> u64 {
        (self.data_start - self.usable_start) / BLOCK_SIZE
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Root metadata record anchoring the filesystem inside the usable area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub uuid: [u8; 16],
    pub version: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub inode_bitmap_block: u64,
    pub data_bitmap_block: u64,
    pub data_bitmap_blocks: u64,
    pub inode_table_block: u64,
    pub inode_capacity: u64,
    pub root_inode: u64,
    pub next_inode: u64,
    pub data_start_block: u64,
}

impl Superblock {
    /// Build the superblock for a freshly formatted filesystem.
    #[must_use]
    pub fn for_geometry(geo: &Geometry, uuid: [u8; 16], next_inode: u64) -> Self {
        Self {
            uuid,
            version: POOL_VERSION,
            block_size: BLOCK_SIZE,
            block_count: geo.block_count,
            inode_bitmap_block: geo.offset_to_block(geo.inode_bitmap_offset()),
            data_bitmap_block: geo.offset_to_block(geo.data_bitmap_offset()),
            data_bitmap_blocks: geo.data_bitmap_blocks,
            inode_table_block: geo.offset_to_block(geo.inode_table_offset()),
            inode_capacity: geo.inode_capacity,
            root_inode: InodeNo::ROOT.0,
            next_inode,
            data_start_block: geo.first_data_block(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE as usize] {
        let mut block = [0_u8; BLOCK_SIZE as usize];
        put_le_u64(&mut block, 0, SUPERBLOCK_MAGIC);
        block[8..24].copy_from_slice(&self.uuid);
        put_le_u64(&mut block, 24, self.version);
        put_le_u64(&mut block, 32, self.block_size);
        put_le_u64(&mut block, 40, self.block_count);
        put_le_u64(&mut block, 48, self.inode_bitmap_block);
        put_le_u64(&mut block, 56, self.data_bitmap_block);
        put_le_u64(&mut block, 64, self.data_bitmap_blocks);
        put_le_u64(&mut block, 72, self.inode_table_block);
        put_le_u64(&mut block, 80, self.inode_capacity);
        put_le_u64(&mut block, 88, self.root_inode);
        put_le_u64(&mut block, 96, self.next_inode);
        put_le_u64(&mut block, 104, self.data_start_block);
        block
    }

    pub fn decode(block: &[u8]) -> std::result::Result<Self, CodecError> {
        let magic = read_le_u64(block, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(CodecError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }
        let sb = Self {
            uuid: read_fixed(block, 8)?,
            version: read_le_u64(block, 24)?,
            block_size: read_le_u64(block, 32)?,
            block_count: read_le_u64(block, 40)?,
            inode_bitmap_block: read_le_u64(block, 48)?,
            data_bitmap_block: read_le_u64(block, 56)?,
            data_bitmap_blocks: read_le_u64(block, 64)?,
            inode_table_block: read_le_u64(block, 72)?,
            inode_capacity: read_le_u64(block, 80)?,
            root_inode: read_le_u64(block, 88)?,
            next_inode: read_le_u64(block, 96)?,
            data_start_block: read_le_u64(block, 104)?,
        };
        if sb.block_size != BLOCK_SIZE {
            return Err(CodecError::InvalidField {
                field: "block_size",
                reason: "must be 4096",
            });
        }
        if sb.root_inode != InodeNo::ROOT.0 {
            return Err(CodecError::InvalidField {
                field: "root_inode",
                reason: "root must be inode 1",
            });
        }
        Ok(sb)
    }
}

// ── Inode records ───────────────────────────────────────────────────────────

/// Fixed-size on-device inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRecord {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub links: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub direct: [u64; PTRS_DIRECT],
    pub indirect: u64,
    pub double_indirect: u64,
}

impl InodeRecord {
    #[must_use]
    pub fn encode(&self) -> [u8; INODE_SIZE as usize] {
        let mut rec = [0_u8; INODE_SIZE as usize];
        put_le_u32(&mut rec, 0, self.mode);
        put_le_u32(&mut rec, 4, self.uid);
        put_le_u32(&mut rec, 8, self.gid);
        put_le_u32(&mut rec, 12, self.links);
        put_le_u64(&mut rec, 16, self.size);
        put_le_u64(&mut rec, 24, self.atime);
        put_le_u64(&mut rec, 32, self.mtime);
        put_le_u64(&mut rec, 40, self.ctime);
        for (i, block) in self.direct.iter().enumerate() {
            put_le_u64(&mut rec, 48 + i * 8, *block);
        }
        put_le_u64(&mut rec, 144, self.indirect);
        put_le_u64(&mut rec, 152, self.double_indirect);
        rec
    }

    pub fn decode(rec: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut direct = [0_u64; PTRS_DIRECT];
        for (i, block) in direct.iter_mut().enumerate() {
            *block = read_le_u64(rec, 48 + i * 8)?;
        }
        Ok(Self {
            mode: read_le_u32(rec, 0)?,
            uid: read_le_u32(rec, 4)?,
            gid: read_le_u32(rec, 8)?,
            links: read_le_u32(rec, 12)?,
            size: read_le_u64(rec, 16)?,
            atime: read_le_u64(rec, 24)?,
            mtime: read_le_u64(rec, 32)?,
            ctime: read_le_u64(rec, 40)?,
            direct,
            indirect: read_le_u64(rec, 144)?,
            double_indirect: read_le_u64(rec, 152)?,
        })
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Pack `(inode_number, name_length, name)` records.
#[must_use]
pub fn encode_dirents<'a>(entries: impl Iterator<Item = (&'a str, InodeNo)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, ino) in entries {
        let name = name.as_bytes();
        debug_assert!(name.len() <= usize::from(u16::MAX));
        let mut header = [0_u8; 10];
        put_le_u64(&mut header, 0, ino.0);
        #[expect(clippy::cast_possible_truncation)] // names are FUSE-limited
        put_le_u16(&mut header, 8, name.len() as u16);
        out.extend_from_slice(&header);
        out.extend_from_slice(name);
    }
    out
}

/// Unpack a directory extent's serialized entries.
pub fn decode_dirents(data: &[u8]) -> Result<Vec<(String, InodeNo)>> {
    let mut entries = Vec::new();
    let mut pos = 0_usize;
    while pos < data.len() {
        let ino = read_le_u64(data, pos)
            .map_err(|e| AfsError::Corrupt(format!("directory entry header: {e}")))?;
        let name_len = read_le_u16(data, pos + 8)
            .map_err(|e| AfsError::Corrupt(format!("directory entry header: {e}")))? as usize;
        pos += 10;
        if ino == 0 || name_len == 0 || pos + name_len > data.len() {
            return Err(AfsError::Corrupt(format!(
                "malformed directory entry at byte {}",
                pos - 10
            )));
        }
        let name = std::str::from_utf8(&data[pos..pos + name_len])
            .map_err(|_| AfsError::Corrupt("directory entry name is not UTF-8".to_owned()))?;
        entries.push((name.to_owned(), InodeNo(ino)));
        pos += name_len;
    }
    Ok(entries)
}

// ── Bitmaps ─────────────────────────────────────────────────────────────────

#[must_use]
pub fn bit_get(bitmap: &[u8], idx: u64) -> bool {
    let byte = (idx / 8) as usize;
    byte < bitmap.len() && (bitmap[byte] >> (idx % 8)) & 1 == 1
}

pub fn bit_set(bitmap: &mut [u8], idx: u64) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << (idx % 8);
    }
}

pub fn bit_clear(bitmap: &mut [u8], idx: u64) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(1 << (idx % 8));
    }
}

// ── Block pointer publication ───────────────────────────────────────────────

/// Pointer blocks owned by a node, tracked so growth and deletion can
/// return them to the allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtrBlocks(pub Vec<Extent>);

/// Pointer fields of an inode record plus the pointer blocks that carry them.
#[derive(Debug, Clone)]
pub struct PublishedPtrs {
    pub direct: [u64; PTRS_DIRECT],
    pub indirect: u64,
    pub double_indirect: u64,
    pub owned: PtrBlocks,
}

impl PublishedPtrs {
    /// No blocks at all (an empty directory).
    #[must_use]
    pub fn none() -> Self {
        Self {
            direct: [0; PTRS_DIRECT],
            indirect: 0,
            double_indirect: 0,
            owned: PtrBlocks::default(),
        }
    }
}

fn write_pointer_block(dev: &DaxDevice, offset: u64, blocks: &[u64]) -> Result<()> {
    debug_assert!(blocks.len() as u64 <= PTRS_PER_BLOCK);
    let mut buf = vec![0_u8; BLOCK_SIZE as usize];
    for (i, block) in blocks.iter().enumerate() {
        put_le_u64(&mut buf, i * 8, *block);
    }
    dev.write_at(offset, &buf)?;
    dev.flush_range(offset, BLOCK_SIZE)
}

/// Publish a contiguous extent through the inode pointer scheme.
///
/// The first 12 blocks go into the direct pointers; the next 512 into a
/// freshly allocated indirect block; the rest through a double-indirect
/// tree. Pointer blocks are written and persisted here; on allocation
/// failure everything allocated so far is returned to the allocator.
pub fn publish_pointers(
    dev: &DaxDevice,
    geo: &Geometry,
    alloc: &ExtentAllocator,
    extent: Extent,
) -> Result<PublishedPtrs> {
    let n = extent.len / BLOCK_SIZE;
    if n > MAX_EXTENT_BLOCKS {
        return Err(AfsError::NoSpace);
    }
    let start = geo.offset_to_block(extent.offset);

    let mut published = PublishedPtrs::none();
    for (i, slot) in published.direct.iter_mut().enumerate() {
        if (i as u64) < n {
            *slot = start + i as u64;
        }
    }

    let result = (|| -> Result<()> {
        if n > PTRS_DIRECT as u64 {
            let count = (n - PTRS_DIRECT as u64).min(PTRS_PER_BLOCK);
            let pb = alloc.alloc(BLOCK_SIZE)?;
            let entries: Vec<u64> = (0..count)
                .map(|j| start + PTRS_DIRECT as u64 + j)
                .collect();
            write_pointer_block(dev, pb.offset, &entries)?;
            published.indirect = geo.offset_to_block(pb.offset);
            published.owned.0.push(pb);
        }

        let single_covered = PTRS_DIRECT as u64 + PTRS_PER_BLOCK;
        if n > single_covered {
            let remaining = n - single_covered;
            let root = alloc.alloc(BLOCK_SIZE)?;
            published.owned.0.push(root);
            let mut child_blocks = Vec::new();
            let mut done = 0_u64;
            while done < remaining {
                let count = (remaining - done).min(PTRS_PER_BLOCK);
                let child = alloc.alloc(BLOCK_SIZE)?;
                published.owned.0.push(child);
                let entries: Vec<u64> = (0..count)
                    .map(|j| start + single_covered + done + j)
                    .collect();
                write_pointer_block(dev, child.offset, &entries)?;
                child_blocks.push(geo.offset_to_block(child.offset));
                done += count;
            }
            write_pointer_block(dev, root.offset, &child_blocks)?;
            published.double_indirect = geo.offset_to_block(root.offset);
        }
        Ok(())
    })();

    if let Err(e) = result {
        for pb in published.owned.0.drain(..) {
            alloc.free(pb);
        }
        return Err(e);
    }
    Ok(published)
}

fn read_pointer_block(dev: &DaxDevice, geo: &Geometry, block: u64) -> Result<Vec<u64>> {
    check_block(geo, block)?;
    let mut buf = vec![0_u8; BLOCK_SIZE as usize];
    dev.read_at(geo.block_to_offset(block), &mut buf)?;
    let mut entries = Vec::new();
    for i in 0..PTRS_PER_BLOCK as usize {
        let entry =
            read_le_u64(&buf, i * 8).map_err(|e| AfsError::Corrupt(e.to_string()))?;
        if entry == 0 {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn check_block(geo: &Geometry, block: u64) -> Result<()> {
    if block < geo.first_data_block() || block >= geo.block_count {
        return Err(AfsError::Corrupt(format!(
            "block pointer {block} outside the data area"
        )));
    }
    Ok(())
}

/// Walk an inode record's pointers back into an extent.
///
/// Returns the extent (if the record points at any blocks) and the pointer
/// blocks the inode owns. The published blocks of one inode are contiguous
/// by construction; anything else is corruption.
pub fn load_pointers(
    dev: &DaxDevice,
    geo: &Geometry,
    rec: &InodeRecord,
) -> Result<(Option<Extent>, PtrBlocks)> {
    let mut blocks: Vec<u64> = Vec::new();
    for block in rec.direct {
        if block == 0 {
            break;
        }
        check_block(geo, block)?;
        blocks.push(block);
    }

    let mut owned = PtrBlocks::default();
    if rec.indirect != 0 {
        check_block(geo, rec.indirect)?;
        owned.0.push(Extent {
            offset: geo.block_to_offset(rec.indirect),
            len: BLOCK_SIZE,
        });
        blocks.extend(read_pointer_block(dev, geo, rec.indirect)?);
    }
    if rec.double_indirect != 0 {
        check_block(geo, rec.double_indirect)?;
        owned.0.push(Extent {
            offset: geo.block_to_offset(rec.double_indirect),
            len: BLOCK_SIZE,
        });
        for child in read_pointer_block(dev, geo, rec.double_indirect)? {
            owned.0.push(Extent {
                offset: geo.block_to_offset(child),
                len: BLOCK_SIZE,
            });
            blocks.extend(read_pointer_block(dev, geo, child)?);
        }
    }

    if blocks.is_empty() {
        return Ok((None, owned));
    }

    let start = blocks[0];
    for (i, block) in blocks.iter().enumerate() {
        check_block(geo, *block)?;
        if *block != start + i as u64 {
            return Err(AfsError::Corrupt(format!(
                "inode extent is not contiguous at block {block}"
            )));
        }
    }

    Ok((
        Some(Extent {
            offset: geo.block_to_offset(start),
            len: blocks.len() as u64 * BLOCK_SIZE,
        }),
        owned,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const USABLE_START: u64 = 512 * 1024;
    const USABLE_END: u64 = 32 * 1024 * 1024 - 512 * 1024;

    fn geometry() -> Geometry {
        Geometry::compute(USABLE_START, USABLE_END).expect("geometry")
    }

    fn temp_device() -> (tempfile::TempDir, DaxDevice) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.img");
        let file = File::create(&path).expect("create");
        file.set_len(32 * 1024 * 1024).expect("set_len");
        drop(file);
        (dir, DaxDevice::open(&path, 0).expect("open"))
    }

    #[test]
    fn geometry_layout_is_ordered_and_reserved() {
        let geo = geometry();
        assert_eq!(geo.sb_offset(), USABLE_START);
        assert!(geo.inode_bitmap_offset() > geo.sb_offset());
        assert!(geo.data_bitmap_offset() > geo.inode_bitmap_offset());
        assert!(geo.inode_table_offset() > geo.data_bitmap_offset());
        assert!(geo.inode_table_offset() + geo.inode_table_len() <= geo.data_start);
        // The 1 MiB reservation is the floor for small pools.
        assert_eq!(geo.data_start, USABLE_START + METADATA_RESERVATION);
        assert_eq!(geo.first_data_block(), METADATA_RESERVATION / BLOCK_SIZE);
    }

    #[test]
    fn geometry_block_offset_round_trip() {
        let geo = geometry();
        let block = geo.first_data_block() + 5;
        assert_eq!(geo.offset_to_block(geo.block_to_offset(block)), block);
    }

    #[test]
    fn geometry_rejects_tiny_areas() {
        assert!(Geometry::compute(0, 0).is_err());
        assert!(Geometry::compute(512 * 1024, 512 * 1024 + 65_536).is_err());
    }

    #[test]
    fn superblock_round_trip() {
        let geo = geometry();
        let sb = Superblock::for_geometry(&geo, [7_u8; 16], 42);
        let block = sb.encode();
        let decoded = Superblock::decode(&block).expect("decode");
        assert_eq!(decoded, sb);
        assert_eq!(decoded.root_inode, 1);
        assert_eq!(decoded.next_inode, 42);
    }

    #[test]
    fn superblock_rejects_bad_magic_and_geometry() {
        let geo = geometry();
        let sb = Superblock::for_geometry(&geo, [0_u8; 16], 2);
        let mut block = sb.encode();
        block[0] ^= 1;
        assert!(Superblock::decode(&block).is_err());

        let mut bad = sb;
        bad.block_size = 8192;
        assert!(matches!(
            Superblock::decode(&bad.encode()),
            Err(CodecError::InvalidField { field: "block_size", .. })
        ));
    }

    #[test]
    fn inode_record_round_trip() {
        let rec = InodeRecord {
            mode: 0o100_644,
            uid: 1000,
            gid: 1000,
            links: 1,
            size: 60_000,
            atime: 1,
            mtime: 2,
            ctime: 3,
            direct: [256, 257, 258, 259, 260, 261, 262, 263, 264, 265, 266, 267],
            indirect: 300,
            double_indirect: 0,
        };
        let decoded = InodeRecord::decode(&rec.encode()).expect("decode");
        assert_eq!(decoded, rec);
    }

    #[test]
    fn dirent_round_trip() {
        let entries = vec![
            ("a.txt".to_owned(), InodeNo(2)),
            ("subdir".to_owned(), InodeNo(3)),
            ("name with spaces".to_owned(), InodeNo(4)),
        ];
        let encoded = encode_dirents(entries.iter().map(|(n, i)| (n.as_str(), *i)));
        let decoded = decode_dirents(&encoded).expect("decode");
        assert_eq!(decoded, entries);
    }

    #[test]
    fn empty_dirents_decode_to_nothing() {
        assert!(decode_dirents(&[]).expect("decode").is_empty());
    }

    #[test]
    fn truncated_dirent_is_corrupt() {
        let encoded = encode_dirents([("file", InodeNo(2))].into_iter());
        assert!(matches!(
            decode_dirents(&encoded[..encoded.len() - 1]),
            Err(AfsError::Corrupt(_))
        ));
        assert!(decode_dirents(&encoded[..5]).is_err());
    }

    #[test]
    fn bitmap_bit_ops() {
        let mut bm = vec![0_u8; 4];
        assert!(!bit_get(&bm, 0));
        bit_set(&mut bm, 0);
        bit_set(&mut bm, 9);
        assert!(bit_get(&bm, 0));
        assert!(bit_get(&bm, 9));
        assert!(!bit_get(&bm, 8));
        // Out of range reads are false, writes are dropped.
        assert!(!bit_get(&bm, 1000));
        bit_set(&mut bm, 1000);
    }

    #[test]
    fn publish_small_extent_uses_direct_only() {
        let (_dir, dev) = temp_device();
        let geo = geometry();
        let alloc = ExtentAllocator::new(geo.usable_start, geo.usable_end, geo.data_start);

        let extent = alloc.alloc(8 * BLOCK_SIZE).expect("alloc");
        let ptrs = publish_pointers(&dev, &geo, &alloc, extent).expect("publish");
        assert_eq!(ptrs.indirect, 0);
        assert_eq!(ptrs.double_indirect, 0);
        assert!(ptrs.owned.0.is_empty());
        assert_eq!(ptrs.direct[0], geo.offset_to_block(extent.offset));
        assert_eq!(ptrs.direct[7], geo.offset_to_block(extent.offset) + 7);
        assert_eq!(ptrs.direct[8], 0);
    }

    #[test]
    fn publish_and_load_round_trip_through_indirect() {
        let (_dir, dev) = temp_device();
        let geo = geometry();
        let alloc = ExtentAllocator::new(geo.usable_start, geo.usable_end, geo.data_start);

        // 16 blocks: the default 64 KiB file extent needs one indirect block.
        let extent = alloc.alloc(16 * BLOCK_SIZE).expect("alloc");
        let ptrs = publish_pointers(&dev, &geo, &alloc, extent).expect("publish");
        assert_ne!(ptrs.indirect, 0);
        assert_eq!(ptrs.owned.0.len(), 1);

        let rec = InodeRecord {
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            links: 1,
            size: 65_536,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: ptrs.direct,
            indirect: ptrs.indirect,
            double_indirect: ptrs.double_indirect,
        };
        let (loaded, owned) = load_pointers(&dev, &geo, &rec).expect("load");
        assert_eq!(loaded, Some(extent));
        assert_eq!(owned.0, ptrs.owned.0);
    }

    #[test]
    fn publish_and_load_round_trip_through_double_indirect() {
        let (_dir, dev) = temp_device();
        let geo = geometry();
        let alloc = ExtentAllocator::new(geo.usable_start, geo.usable_end, geo.data_start);

        // 600 blocks (~2.3 MiB) spills past the single indirect block.
        let extent = alloc.alloc(600 * BLOCK_SIZE).expect("alloc");
        let ptrs = publish_pointers(&dev, &geo, &alloc, extent).expect("publish");
        assert_ne!(ptrs.indirect, 0);
        assert_ne!(ptrs.double_indirect, 0);
        // Indirect + double root + one child.
        assert_eq!(ptrs.owned.0.len(), 3);

        let rec = InodeRecord {
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            links: 1,
            size: 600 * BLOCK_SIZE,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: ptrs.direct,
            indirect: ptrs.indirect,
            double_indirect: ptrs.double_indirect,
        };
        let (loaded, owned) = load_pointers(&dev, &geo, &rec).expect("load");
        assert_eq!(loaded, Some(extent));
        assert_eq!(owned.0.len(), ptrs.owned.0.len());
    }

    #[test]
    fn load_rejects_non_contiguous_pointers() {
        let (_dir, dev) = temp_device();
        let geo = geometry();

        let first = geo.first_data_block();
        let mut direct = [0_u64; PTRS_DIRECT];
        direct[0] = first;
        direct[1] = first + 2; // gap
        let rec = InodeRecord {
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            links: 1,
            size: 8192,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct,
            indirect: 0,
            double_indirect: 0,
        };
        assert!(matches!(
            load_pointers(&dev, &geo, &rec),
            Err(AfsError::Corrupt(_))
        ));
    }

    #[test]
    fn load_rejects_out_of_area_pointers() {
        let (_dir, dev) = temp_device();
        let geo = geometry();

        let mut direct = [0_u64; PTRS_DIRECT];
        direct[0] = geo.block_count + 10;
        let rec = InodeRecord {
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            links: 1,
            size: 4096,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct,
            indirect: 0,
            double_indirect: 0,
        };
        assert!(matches!(
            load_pointers(&dev, &geo, &rec),
            Err(AfsError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_record_loads_as_no_extent() {
        let (_dir, dev) = temp_device();
        let geo = geometry();
        let rec = InodeRecord {
            mode: 0o040_755,
            uid: 0,
            gid: 0,
            links: 2,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: [0; PTRS_DIRECT],
            indirect: 0,
            double_indirect: 0,
        };
        let (extent, owned) = load_pointers(&dev, &geo, &rec).expect("load");
        assert_eq!(extent, None);
        assert!(owned.0.is_empty());
    }
}

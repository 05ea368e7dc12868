#![forbid(unsafe_code)]
//! Device labels and the uberblock ring.
//!
//! Every pool member carries four 256 KiB labels (two at the front of the
//! device, two at the back) so a damaged region cannot take out the pool's
//! identity. Each label holds a reserved prefix, a name-value area with the
//! pool identity, and a ring of 128 uberblock slots. Commits append into
//! slot `txg % 128`; readers scan all 4 × 128 slots and take the highest
//! valid transaction group, so there is no mutable "current root" pointer
//! to tear.

mod nv;
mod uberblock;

pub use nv::{NvData, PoolState, decode_nv, encode_nv};
pub use uberblock::{ROOT_BP_NIL, Uberblock};

use afs_dax::DaxDevice;
use afs_error::{AfsError, Result};
use afs_types::{
    LABEL_COUNT, LABEL_SIZE, NV_AREA_OFFSET, NV_AREA_SIZE, POOL_VERSION, PoolGuid, Txg,
    UBERBLOCK_RING_OFFSET, UBERBLOCK_SIZE, label_offsets, usable_area,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// What `apool list` reports for one scanned device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub guid: PoolGuid,
    /// True intended size recorded at creation.
    pub size: u64,
    /// Mapped length of the device as opened.
    pub device_len: u64,
    pub filesystem_present: bool,
}

/// The authoritative uberblock and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedUberblock {
    pub uberblock: Uberblock,
    /// Label index 0–3 (0 and 1 are the front labels).
    pub label: usize,
    pub slot: u64,
}

fn label_offsets_checked(dev: &DaxDevice) -> Result<[u64; LABEL_COUNT]> {
    label_offsets(dev.len()).ok_or_else(|| {
        AfsError::Device(format!(
            "device too small for a pool: {} bytes (minimum 2 MiB)",
            dev.len()
        ))
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Pool create ─────────────────────────────────────────────────────────────

/// Lay down the four labels of a new pool.
///
/// Each label gets the reserved zero prefix, a name-value area identifying
/// the pool, and a ring whose slot 0 holds a bootstrap uberblock at txg 0
/// with no filesystem root. All four label regions are persisted before
/// this returns.
pub fn create_pool(dev: &DaxDevice, name: &str, intended_size: u64) -> Result<NvData> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(AfsError::InvalidName(name.to_owned()));
    }

    let offsets = label_offsets_checked(dev)?;
    let guid = rand::random::<u64>();
    let nv_data = NvData {
        pool_name: name.to_owned(),
        pool_guid: guid,
        version: POOL_VERSION,
        state: PoolState::Active,
        creation_txg: 0,
        size: intended_size,
    };

    let mut image = vec![0_u8; LABEL_SIZE as usize];
    let nv_area = encode_nv(&nv_data)?;
    image[NV_AREA_OFFSET as usize..(NV_AREA_OFFSET + NV_AREA_SIZE) as usize]
        .copy_from_slice(&nv_area);

    let bootstrap = Uberblock {
        version: POOL_VERSION,
        txg: Txg(0),
        guid_sum: guid,
        timestamp: now_secs(),
        root_bp: ROOT_BP_NIL,
    };
    let slot0 = bootstrap.encode();
    image[UBERBLOCK_RING_OFFSET as usize..UBERBLOCK_RING_OFFSET as usize + slot0.len()]
        .copy_from_slice(&slot0);

    for offset in offsets {
        dev.write_at(offset, &image)?;
        dev.flush_range(offset, LABEL_SIZE)?;
    }

    info!(pool = name, guid = %PoolGuid(guid), size = intended_size, "created pool");
    Ok(nv_data)
}

// ── Pool discovery ──────────────────────────────────────────────────────────

/// Probe a candidate device for a pool.
///
/// Reads the front label, verifies the first uberblock slot carries the
/// pool magic, and decodes the name-value area. Returns `Ok(None)` for
/// devices that are not (or no longer) pool members.
pub fn probe_pool(dev: &DaxDevice) -> Result<Option<PoolInfo>> {
    let Some(offsets) = label_offsets(dev.len()) else {
        return Ok(None);
    };

    let mut slot0 = vec![0_u8; UBERBLOCK_SIZE as usize];
    dev.read_at(offsets[0] + UBERBLOCK_RING_OFFSET, &mut slot0)?;
    let magic = afs_types::read_le_u64(&slot0, 0)
        .map_err(|e| AfsError::Corrupt(e.to_string()))?;
    if magic != afs_types::UBERBLOCK_MAGIC {
        return Ok(None);
    }

    let mut nv_area = vec![0_u8; NV_AREA_SIZE as usize];
    dev.read_at(offsets[0] + NV_AREA_OFFSET, &mut nv_area)?;
    let nv_data = match decode_nv(&nv_area) {
        Ok(nv_data) => nv_data,
        Err(e) => {
            warn!(device = %dev.path().display(), error = %e, "label magic present but name-value area unreadable");
            return Ok(None);
        }
    };

    let filesystem_present = select_best_uberblock(dev)?
        .is_some_and(|selected| selected.uberblock.has_root());

    Ok(Some(PoolInfo {
        name: nv_data.pool_name,
        guid: PoolGuid(nv_data.pool_guid),
        size: nv_data.size,
        device_len: dev.len(),
        filesystem_present,
    }))
}

/// Read the name-value area from the first label that decodes.
pub fn read_nv(dev: &DaxDevice) -> Result<NvData> {
    let offsets = label_offsets_checked(dev)?;
    let mut nv_area = vec![0_u8; NV_AREA_SIZE as usize];
    let mut last_err = None;
    for offset in offsets {
        dev.read_at(offset + NV_AREA_OFFSET, &mut nv_area)?;
        match decode_nv(&nv_area) {
            Ok(nv_data) => return Ok(nv_data),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| AfsError::Corrupt("no readable label".to_owned())))
}

// ── Pool destroy ────────────────────────────────────────────────────────────

/// Invalidate all four labels.
///
/// The identifying magic lives in the uberblock ring 128 KiB into each
/// label, so the whole 256 KiB region is zeroed, not only the leading
/// kilobytes.
pub fn destroy_pool(dev: &DaxDevice) -> Result<()> {
    let offsets = label_offsets_checked(dev)?;
    for offset in offsets {
        dev.fill_at(offset, 0, LABEL_SIZE)?;
        dev.flush_range(offset, LABEL_SIZE)?;
    }
    info!(device = %dev.path().display(), "destroyed pool labels");
    Ok(())
}

// ── Root selection ──────────────────────────────────────────────────────────

/// Scan every slot in every label and pick the authoritative uberblock.
///
/// A candidate is valid iff its magic and checksum verify and its `root_bp`
/// is nil or inside the usable data area. The candidate with the maximum
/// txg wins; ties go to front labels, then lower label index, then lower
/// slot (scan order, strictly-greater replacement).
pub fn select_best_uberblock(dev: &DaxDevice) -> Result<Option<SelectedUberblock>> {
    let offsets = label_offsets_checked(dev)?;
    let Some((usable_start, usable_end)) = usable_area(dev.len()) else {
        return Err(AfsError::Device("device too small for a pool".to_owned()));
    };

    let mut best: Option<SelectedUberblock> = None;
    let mut slot_buf = vec![0_u8; UBERBLOCK_SIZE as usize];

    for (label, label_offset) in offsets.into_iter().enumerate() {
        for slot in 0..afs_types::UBERBLOCKS_PER_LABEL {
            let offset = label_offset + UBERBLOCK_RING_OFFSET + slot * UBERBLOCK_SIZE;
            dev.read_at(offset, &mut slot_buf)?;
            let Ok(uberblock) = Uberblock::decode(&slot_buf) else {
                continue;
            };
            if uberblock.has_root()
                && !(usable_start..usable_end).contains(&uberblock.root_bp)
            {
                debug!(label, slot, root_bp = uberblock.root_bp, "uberblock root out of range");
                continue;
            }
            let better = best
                .as_ref()
                .is_none_or(|b| uberblock.txg > b.uberblock.txg);
            if better {
                best = Some(SelectedUberblock {
                    uberblock,
                    label,
                    slot,
                });
            }
        }
    }

    Ok(best)
}

// ── Commit ──────────────────────────────────────────────────────────────────

/// Publish a new root: write `uberblock` into ring slot `txg % 128` of all
/// four labels, persisting each slot range.
///
/// The caller must have written and persisted all dependent metadata in the
/// usable area first; a crash mid-way leaves the previous root the winner.
pub fn commit_uberblock(dev: &DaxDevice, uberblock: &Uberblock) -> Result<()> {
    let offsets = label_offsets_checked(dev)?;
    let slot = uberblock.txg.slot();
    let image = uberblock.encode();

    for label_offset in offsets {
        let offset = label_offset + UBERBLOCK_RING_OFFSET + slot * UBERBLOCK_SIZE;
        dev.write_at(offset, &image)?;
        dev.flush_range(offset, UBERBLOCK_SIZE)?;
    }

    debug!(txg = %uberblock.txg, slot, root_bp = uberblock.root_bp, "committed uberblock");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_types::UBERBLOCK_MAGIC;
    use std::fs::File;
    use std::path::PathBuf;

    const DEV_SIZE: u64 = 8 * 1024 * 1024;

    fn temp_pool() -> (tempfile::TempDir, DaxDevice) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path: PathBuf = dir.path().join("pool.img");
        let file = File::create(&path).expect("create");
        file.set_len(DEV_SIZE).expect("set_len");
        drop(file);
        let dev = DaxDevice::open(&path, 0).expect("open");
        (dir, dev)
    }

    fn test_uberblock(txg: u64) -> Uberblock {
        Uberblock {
            version: POOL_VERSION,
            txg: Txg(txg),
            guid_sum: 7,
            timestamp: 1_700_000_000,
            root_bp: 2 * LABEL_SIZE,
        }
    }

    #[test]
    fn create_writes_four_identical_labels() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");

        let offsets = label_offsets(DEV_SIZE).expect("offsets");
        let mut first = vec![0_u8; LABEL_SIZE as usize];
        dev.read_at(offsets[0], &mut first).expect("read label 0");

        for offset in &offsets[1..] {
            let mut other = vec![0_u8; LABEL_SIZE as usize];
            dev.read_at(*offset, &mut other).expect("read label");
            assert_eq!(first, other, "label at {offset} differs");
        }

        // Slot 0 carries the magic and a nil root.
        let slot0 = &first[UBERBLOCK_RING_OFFSET as usize..][..UBERBLOCK_SIZE as usize];
        assert_eq!(
            afs_types::read_le_u64(slot0, 0).expect("magic"),
            UBERBLOCK_MAGIC
        );
        let ub = Uberblock::decode(slot0).expect("decode bootstrap");
        assert_eq!(ub.txg, Txg(0));
        assert!(!ub.has_root());
    }

    #[test]
    fn create_rejects_bad_names() {
        let (_dir, dev) = temp_pool();
        assert!(matches!(
            create_pool(&dev, "", DEV_SIZE),
            Err(AfsError::InvalidName(_))
        ));
        assert!(create_pool(&dev, "a/b", DEV_SIZE).is_err());
        assert!(create_pool(&dev, "a\0b", DEV_SIZE).is_err());
    }

    #[test]
    fn probe_reports_the_pool() {
        let (_dir, dev) = temp_pool();
        let nv_data = create_pool(&dev, "tank", DEV_SIZE).expect("create");

        let info = probe_pool(&dev).expect("probe").expect("pool present");
        assert_eq!(info.name, "tank");
        assert_eq!(info.guid, PoolGuid(nv_data.pool_guid));
        assert_eq!(info.size, DEV_SIZE);
        assert_eq!(info.device_len, DEV_SIZE);
        assert!(!info.filesystem_present);
    }

    #[test]
    fn probe_of_blank_device_is_none() {
        let (_dir, dev) = temp_pool();
        assert_eq!(probe_pool(&dev).expect("probe"), None);
    }

    #[test]
    fn destroy_removes_the_pool() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");
        destroy_pool(&dev).expect("destroy");
        assert_eq!(probe_pool(&dev).expect("probe"), None);
        assert!(select_best_uberblock(&dev).expect("select").is_none());
    }

    #[test]
    fn selection_is_empty_without_commits() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");
        // The bootstrap uberblock at txg 0 is still a valid selection.
        let selected = select_best_uberblock(&dev).expect("select").expect("slot 0");
        assert_eq!(selected.uberblock.txg, Txg(0));
        assert!(!selected.uberblock.has_root());
    }

    #[test]
    fn highest_txg_wins() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");

        for txg in [1, 2, 3, 7, 5] {
            commit_uberblock(&dev, &test_uberblock(txg)).expect("commit");
        }

        let selected = select_best_uberblock(&dev).expect("select").expect("best");
        assert_eq!(selected.uberblock.txg, Txg(7));
        assert_eq!(selected.slot, 7 % 128);
        // Front label preferred on ties.
        assert_eq!(selected.label, 0);
    }

    #[test]
    fn ring_slot_wraps() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");

        commit_uberblock(&dev, &test_uberblock(130)).expect("commit");
        let selected = select_best_uberblock(&dev).expect("select").expect("best");
        assert_eq!(selected.uberblock.txg, Txg(130));
        assert_eq!(selected.slot, 2);
    }

    #[test]
    fn torn_commit_falls_back_to_previous_txg() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");
        commit_uberblock(&dev, &test_uberblock(1)).expect("commit txg 1");

        // Simulate a torn commit of txg 2: only the two front labels got the
        // new uberblock, and one of those two copies is itself torn.
        let offsets = label_offsets(DEV_SIZE).expect("offsets");
        let ub2 = test_uberblock(2);
        let slot_off = UBERBLOCK_RING_OFFSET + ub2.txg.slot() * UBERBLOCK_SIZE;
        let image = ub2.encode();
        dev.write_at(offsets[0] + slot_off, &image).expect("write");
        let mut torn = image;
        torn[20] ^= 0xFF;
        dev.write_at(offsets[1] + slot_off, &torn).expect("write torn");

        // The intact copy in label 0 still wins.
        let selected = select_best_uberblock(&dev).expect("select").expect("best");
        assert_eq!(selected.uberblock.txg, Txg(2));
        assert_eq!(selected.label, 0);

        // Tear the remaining copy too: selection falls back to txg 1.
        dev.write_at(offsets[0] + slot_off, &torn).expect("tear");
        let selected = select_best_uberblock(&dev).expect("select").expect("best");
        assert_eq!(selected.uberblock.txg, Txg(1));
    }

    #[test]
    fn out_of_range_root_bp_is_ignored() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");

        let bogus = Uberblock {
            root_bp: DEV_SIZE, // beyond the usable area
            ..test_uberblock(9)
        };
        commit_uberblock(&dev, &bogus).expect("commit");

        // The bogus txg 9 is skipped; the bootstrap slot remains the best.
        let selected = select_best_uberblock(&dev).expect("select").expect("best");
        assert_eq!(selected.uberblock.txg, Txg(0));
    }

    #[test]
    fn read_nv_falls_back_to_later_labels() {
        let (_dir, dev) = temp_pool();
        create_pool(&dev, "tank", DEV_SIZE).expect("create");

        // Corrupt the front label's name-value area.
        let offsets = label_offsets(DEV_SIZE).expect("offsets");
        dev.fill_at(offsets[0] + NV_AREA_OFFSET, 0xFF, 64).expect("corrupt");

        let nv_data = read_nv(&dev).expect("nv from surviving label");
        assert_eq!(nv_data.pool_name, "tank");
    }
}

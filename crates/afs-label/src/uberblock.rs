//! Uberblock codec.
//!
//! An uberblock is a 1 KiB atomic commit record pointing at the live
//! filesystem root. The slot with the greatest transaction group whose
//! magic and checksum verify is authoritative.

use afs_types::{
    CodecError, Txg, UBERBLOCK_MAGIC, UBERBLOCK_SIZE, put_le_u64, read_le_u64,
};

/// `root_bp` value meaning "no filesystem root yet".
pub const ROOT_BP_NIL: u64 = u64::MAX;

/// Byte offset of the CRC32C trailer within a slot. The declared record
/// layout ends at 1016; the trailing u64 carries the checksum over
/// everything before it, zero-extended.
const CHECKSUM_OFFSET: usize = 1016;

/// A decoded uberblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uberblock {
    pub version: u64,
    pub txg: Txg,
    /// Rolling sum of device GUIDs in the pool (single device: the pool GUID).
    pub guid_sum: u64,
    /// Seconds since the epoch at commit time.
    pub timestamp: u64,
    /// Byte offset of the superblock, or [`ROOT_BP_NIL`].
    pub root_bp: u64,
}

impl Uberblock {
    /// Whether this uberblock points at a committed filesystem root.
    #[must_use]
    pub fn has_root(&self) -> bool {
        self.root_bp != ROOT_BP_NIL
    }

    /// Serialize into a 1 KiB slot image with the trailing checksum set.
    #[must_use]
    pub fn encode(&self) -> [u8; UBERBLOCK_SIZE as usize] {
        let mut slot = [0_u8; UBERBLOCK_SIZE as usize];
        put_le_u64(&mut slot, 0, UBERBLOCK_MAGIC);
        put_le_u64(&mut slot, 8, self.version);
        put_le_u64(&mut slot, 16, self.txg.0);
        put_le_u64(&mut slot, 24, self.guid_sum);
        put_le_u64(&mut slot, 32, self.timestamp);
        put_le_u64(&mut slot, 40, self.root_bp);
        let crc = crc32c::crc32c(&slot[..CHECKSUM_OFFSET]);
        put_le_u64(&mut slot, CHECKSUM_OFFSET, u64::from(crc));
        slot
    }

    /// Decode and verify a slot image.
    ///
    /// Fails on short input, wrong magic, or checksum mismatch. A torn
    /// write shows up as one of the latter two and disqualifies the slot.
    pub fn decode(slot: &[u8]) -> Result<Self, CodecError> {
        if slot.len() < UBERBLOCK_SIZE as usize {
            return Err(CodecError::InsufficientData {
                needed: UBERBLOCK_SIZE as usize,
                offset: 0,
                actual: slot.len(),
            });
        }

        let magic = read_le_u64(slot, 0)?;
        if magic != UBERBLOCK_MAGIC {
            return Err(CodecError::InvalidMagic {
                expected: UBERBLOCK_MAGIC,
                actual: magic,
            });
        }

        let stored = read_le_u64(slot, CHECKSUM_OFFSET)?;
        let actual = crc32c::crc32c(&slot[..CHECKSUM_OFFSET]);
        #[expect(clippy::cast_possible_truncation)] // stored low 32 bits only
        let stored32 = stored as u32;
        if stored > u64::from(u32::MAX) || stored32 != actual {
            return Err(CodecError::BadChecksum {
                expected: stored32,
                actual,
            });
        }

        Ok(Self {
            version: read_le_u64(slot, 8)?,
            txg: Txg(read_le_u64(slot, 16)?),
            guid_sum: read_le_u64(slot, 24)?,
            timestamp: read_le_u64(slot, 32)?,
            root_bp: read_le_u64(slot, 40)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_types::POOL_VERSION;

    fn sample() -> Uberblock {
        Uberblock {
            version: POOL_VERSION,
            txg: Txg(42),
            guid_sum: 0xDEAD_BEEF_CAFE_F00D,
            timestamp: 1_700_000_000,
            root_bp: 524_288,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let ub = sample();
        let slot = ub.encode();
        assert_eq!(slot.len(), 1024);
        let decoded = Uberblock::decode(&slot).expect("decode");
        assert_eq!(decoded, ub);
        assert!(decoded.has_root());
    }

    #[test]
    fn nil_root_bp_round_trips() {
        let ub = Uberblock {
            root_bp: ROOT_BP_NIL,
            ..sample()
        };
        let decoded = Uberblock::decode(&ub.encode()).expect("decode");
        assert!(!decoded.has_root());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut slot = sample().encode();
        slot[0] ^= 0xFF;
        assert!(matches!(
            Uberblock::decode(&slot),
            Err(CodecError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn torn_write_fails_checksum() {
        let mut slot = sample().encode();
        // Flip a byte in the txg field; the magic still matches.
        slot[17] ^= 0x01;
        assert!(matches!(
            Uberblock::decode(&slot),
            Err(CodecError::BadChecksum { .. })
        ));
    }

    #[test]
    fn zeroed_slot_is_rejected() {
        let slot = [0_u8; 1024];
        assert!(matches!(
            Uberblock::decode(&slot),
            Err(CodecError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn short_slot_is_rejected() {
        assert!(matches!(
            Uberblock::decode(&[0_u8; 100]),
            Err(CodecError::InsufficientData { .. })
        ));
    }
}

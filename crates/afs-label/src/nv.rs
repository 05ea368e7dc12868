//! Name-value area codec.
//!
//! The pool's identity lives in a JSON object padded with NUL bytes to the
//! fixed name-value area size. No external consumer depends on the exact
//! encoding; it only has to round-trip.

use afs_error::{AfsError, Result};
use afs_types::NV_AREA_SIZE;
use serde::{Deserialize, Serialize};

/// Pool state recorded in the name-value area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Active,
}

/// Pool identity carried by every label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvData {
    pub pool_name: String,
    pub pool_guid: u64,
    pub version: u64,
    pub state: PoolState,
    pub creation_txg: u64,
    /// True intended device size. DAX character devices report no size, so
    /// the synthesized mapping size must never be inferred back from the
    /// device; it is recorded here instead.
    pub size: u64,
}

/// Serialize into a NUL-padded name-value area image.
pub fn encode_nv(nv: &NvData) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(nv)
        .map_err(|e| AfsError::Device(format!("encode name-value area: {e}")))?;
    if json.len() as u64 > NV_AREA_SIZE {
        return Err(AfsError::Device(format!(
            "name-value area overflow: {} bytes",
            json.len()
        )));
    }
    let mut area = vec![0_u8; NV_AREA_SIZE as usize];
    area[..json.len()].copy_from_slice(&json);
    Ok(area)
}

/// Decode a name-value area image (NUL padding trimmed).
pub fn decode_nv(area: &[u8]) -> Result<NvData> {
    let end = area.iter().position(|b| *b == 0).unwrap_or(area.len());
    serde_json::from_slice(&area[..end])
        .map_err(|e| AfsError::Corrupt(format!("name-value area does not decode: {e}")))
}

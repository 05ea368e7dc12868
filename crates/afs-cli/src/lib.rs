#![forbid(unsafe_code)]
//! Shared plumbing for the AethelFS command-line tools.
//!
//! Candidate-device scanning, size parsing, log setup, and the daemon loop
//! used by both `aethelfsd` and `afs mount`. Pool state lives entirely on
//! the backing devices; there is no registry file, so pool-by-name
//! resolution always scans candidates.

use afs_dax::DaxDevice;
use afs_engine::Filesystem;
use afs_fuse::MountOptions;
use afs_label::{PoolInfo, probe_pool};
use afs_types::DEFAULT_MAX_DEVICE_SIZE;
use anyhow::{Context, Result, bail};
use nix::sys::signal::{SigSet, Signal};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Default backing-file size for `apool create` when the device does not
/// exist yet.
pub const DEFAULT_POOL_SIZE: u64 = 512 * 1024 * 1024;

/// Install the fmt subscriber. `--debug` drops the filter to DEBUG;
/// `RUST_LOG` still wins when set.
pub fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Parse a size argument: plain bytes or a K/M/G-suffixed value.
///
/// Shaped as a clap value parser, hence the `String` error.
pub fn parse_size_arg(input: &str) -> std::result::Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty size".to_owned());
    }
    let (digits, multiplier) = match input.as_bytes().last().map(u8::to_ascii_uppercase) {
        Some(b'K') => (&input[..input.len() - 1], 1024_u64),
        Some(b'M') => (&input[..input.len() - 1], 1024 * 1024),
        Some(b'G') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {input:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {input:?}"))
}

/// Render a byte count the way the tools print it.
#[must_use]
pub fn human_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [
        ("G", 1024 * 1024 * 1024),
        ("M", 1024 * 1024),
        ("K", 1024),
    ];
    for (suffix, unit) in UNITS {
        if bytes >= unit {
            #[expect(clippy::cast_precision_loss)] // display only
            let value = bytes as f64 / unit as f64;
            return format!("{value:.1}{suffix}");
        }
    }
    format!("{bytes}B")
}

/// Candidate devices for pool discovery: the explicit list, or every
/// `/dev/dax*` node when none are given.
#[must_use]
pub fn candidate_devices(explicit: &[PathBuf]) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("dax"))
        .map(|e| e.path())
        .collect();
    candidates.sort();
    candidates
}

/// One row of `apool list` output.
#[derive(Debug, Serialize)]
pub struct PoolListing {
    pub name: String,
    pub device: PathBuf,
    pub size: u64,
    pub filesystem: bool,
}

impl PoolListing {
    #[must_use]
    pub fn from_probe(device: &Path, info: &PoolInfo) -> Self {
        Self {
            name: info.name.clone(),
            device: device.to_owned(),
            size: info.size,
            filesystem: info.filesystem_present,
        }
    }
}

/// Scan candidates and report every pool found. Unreadable candidates are
/// skipped with a warning rather than aborting the listing.
pub fn scan_pools(candidates: &[PathBuf]) -> Vec<PoolListing> {
    let mut pools = Vec::new();
    for path in candidates {
        let dev = match DaxDevice::open(path, DEFAULT_MAX_DEVICE_SIZE) {
            Ok(dev) => dev,
            Err(e) => {
                warn!(device = %path.display(), error = %e, "skipping unreadable candidate");
                continue;
            }
        };
        match probe_pool(&dev) {
            Ok(Some(info)) => pools.push(PoolListing::from_probe(path, &info)),
            Ok(None) => {}
            Err(e) => warn!(device = %path.display(), error = %e, "probe failed"),
        }
    }
    pools
}

/// Resolve a pool name to its backing device.
pub fn find_pool(name: &str, candidates: &[PathBuf]) -> Result<PathBuf> {
    for path in candidates {
        let Ok(dev) = DaxDevice::open(path, DEFAULT_MAX_DEVICE_SIZE) else {
            continue;
        };
        if let Ok(Some(info)) = probe_pool(&dev) {
            if info.name == name {
                return Ok(path.clone());
            }
        }
    }
    bail!(
        "pool {name:?} not found (scanned {} candidate device(s); pass the device path explicitly)",
        candidates.len()
    )
}

/// Mount the filesystem and serve upcalls until SIGINT or SIGTERM.
///
/// Signals are blocked before the FUSE worker threads spawn so the mask is
/// inherited and `sigwait` sees the delivery. On shutdown the session drops
/// first (stops accepting upcalls and unmounts), then the engine does its
/// final write-back.
pub fn run_daemon(
    device: &Path,
    mountpoint: &Path,
    max_size: u64,
    allow_other: bool,
) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("block shutdown signals")?;

    let dev = Arc::new(
        DaxDevice::open(device, max_size)
            .with_context(|| format!("open backing device {}", device.display()))?,
    );
    let fs = Arc::new(Filesystem::mount(dev).context("mount filesystem")?);

    let st = fs.statfs();
    info!(
        mountpoint = %mountpoint.display(),
        free_mib = st.bfree * u64::from(st.bsize) / (1024 * 1024),
        "filesystem mounted; press Ctrl+C to exit"
    );

    let session = afs_fuse::mount_background(
        Arc::clone(&fs),
        mountpoint,
        &MountOptions {
            allow_other,
            auto_unmount: true,
        },
    )
    .with_context(|| format!("FUSE mount at {}", mountpoint.display()))?;

    let signal = mask.wait().context("wait for shutdown signal")?;
    info!(?signal, "unmounting filesystem");
    drop(session);

    if let Err(e) = fs.unmount() {
        warn!(error = %e, "final write-back failed");
        eprintln!(
            "warning: unmount was not clean; you may need to run 'fusermount -u {}' manually",
            mountpoint.display()
        );
    }
    Ok(())
}

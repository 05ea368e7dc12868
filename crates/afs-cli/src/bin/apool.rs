#![forbid(unsafe_code)]
//! `apool` — AethelFS pool management.

use afs_cli::{
    DEFAULT_POOL_SIZE, candidate_devices, find_pool, human_size, init_tracing, parse_size_arg,
    scan_pools,
};
use afs_dax::DaxDevice;
use afs_types::DEFAULT_MAX_DEVICE_SIZE;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apool", about = "AethelFS pool management")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a pool on a device, provisioning a backing file if needed.
    Create {
        /// Backing-file size when DEVICE does not exist yet (e.g. 512M, 4G).
        #[arg(short = 's', long = "size", value_parser = parse_size_arg)]
        size: Option<u64>,
        /// Pool name.
        name: String,
        /// Backing device or file path.
        device: PathBuf,
    },
    /// List pools on candidate devices (default: /dev/dax*).
    List {
        /// Output format.
        #[arg(short = 'p', long = "format", value_enum, default_value = "table")]
        format: OutputFormat,
        /// Candidate devices to scan.
        devices: Vec<PathBuf>,
    },
    /// Destroy a pool: invalidate its labels.
    Destroy {
        /// Pool name.
        name: String,
        /// Candidate devices to scan.
        devices: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() {
    init_tracing(false);
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create { size, name, device } => create(size, &name, &device),
        Command::List { format, devices } => list(format, &devices),
        Command::Destroy { name, devices } => destroy(&name, &devices),
    }
}

fn create(size: Option<u64>, name: &str, device: &PathBuf) -> Result<()> {
    if !device.exists() {
        let size = size.unwrap_or(DEFAULT_POOL_SIZE);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(device)
            .with_context(|| format!("provision backing file {}", device.display()))?;
        file.set_len(size)
            .with_context(|| format!("size backing file to {size} bytes"))?;
        file.set_permissions(std::fs::Permissions::from_mode(0o644))
            .context("chmod backing file")?;
    }

    let dev = DaxDevice::open(device, DEFAULT_MAX_DEVICE_SIZE)
        .with_context(|| format!("open {}", device.display()))?;
    let nv = afs_label::create_pool(&dev, name, dev.len()).context("write pool labels")?;

    println!(
        "created pool {:?} on {} ({}, guid {:016x})",
        nv.pool_name,
        device.display(),
        human_size(nv.size),
        nv.pool_guid,
    );
    Ok(())
}

fn list(format: OutputFormat, devices: &[PathBuf]) -> Result<()> {
    let pools = scan_pools(&candidate_devices(devices));
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&pools).context("serialize pool list")?
            );
        }
        OutputFormat::Table => {
            if pools.is_empty() {
                println!("no pools found");
                return Ok(());
            }
            println!("{:<16} {:<32} {:>8}  FILESYSTEM", "NAME", "DEVICE", "SIZE");
            for pool in &pools {
                println!(
                    "{:<16} {:<32} {:>8}  {}",
                    pool.name,
                    pool.device.display(),
                    human_size(pool.size),
                    if pool.filesystem { "yes" } else { "no" },
                );
            }
        }
    }
    Ok(())
}

fn destroy(name: &str, devices: &[PathBuf]) -> Result<()> {
    let path = find_pool(name, &candidate_devices(devices))?;
    let dev = DaxDevice::open(&path, DEFAULT_MAX_DEVICE_SIZE)
        .with_context(|| format!("open {}", path.display()))?;
    afs_label::destroy_pool(&dev).context("zero pool labels")?;
    println!("destroyed pool {name:?} on {}", path.display());
    Ok(())
}

#![forbid(unsafe_code)]
//! `aethelfsd` — the AethelFS daemon.
//!
//! Maps the backing device, mounts the committed filesystem root, and
//! serves FUSE upcalls until SIGINT or SIGTERM. Exit code 0 on clean
//! unmount, non-zero on mount or initialisation failure.

use afs_cli::{init_tracing, parse_size_arg, run_daemon};
use afs_types::DEFAULT_MAX_DEVICE_SIZE;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aethelfsd", about = "AethelFS filesystem daemon")]
struct Cli {
    /// Enable verbose logging.
    #[arg(long)]
    debug: bool,

    /// Mapping size for DAX devices that report no size (e.g. 64G).
    #[arg(long, value_parser = parse_size_arg, default_value_t = DEFAULT_MAX_DEVICE_SIZE)]
    max_size: u64,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Backing DAX device or file.
    device: PathBuf,

    /// Mountpoint directory.
    mountpoint: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    if let Err(error) = run(&cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    run_daemon(&cli.device, &cli.mountpoint, cli.max_size, cli.allow_other)
}

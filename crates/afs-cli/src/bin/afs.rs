#![forbid(unsafe_code)]
//! `afs` — AethelFS filesystem management.

use afs_cli::{candidate_devices, find_pool, init_tracing, run_daemon};
use afs_dax::DaxDevice;
use afs_engine::Filesystem;
use afs_types::DEFAULT_MAX_DEVICE_SIZE;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command as Process;

#[derive(Parser)]
#[command(name = "afs", about = "AethelFS filesystem management")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialise a filesystem on an existing pool.
    Create {
        /// Pool name.
        name: String,
        /// Candidate devices to scan.
        devices: Vec<PathBuf>,
    },
    /// Mount a pool's filesystem and serve it until interrupted.
    Mount {
        /// Pool name.
        name: String,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Candidate devices to scan.
        devices: Vec<PathBuf>,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
    },
    /// Unmount a mounted filesystem.
    Unmount {
        /// Mountpoint directory.
        mountpoint: PathBuf,
    },
    /// Reset a pool's filesystem to an empty root.
    Destroy {
        /// Pool name.
        name: String,
        /// Candidate devices to scan.
        devices: Vec<PathBuf>,
    },
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
        Command::Create { name, devices } => create(&name, &devices),
        Command::Mount {
            name,
            mountpoint,
            devices,
            allow_other,
        } => {
            let path = find_pool(&name, &candidate_devices(&devices))?;
            run_daemon(&path, &mountpoint, DEFAULT_MAX_DEVICE_SIZE, allow_other)
        }
        Command::Unmount { mountpoint } => unmount(&mountpoint),
        Command::Destroy { name, devices } => {
            // Destroying the filesystem reformats it to an empty root; the
            // pool and its labels stay (that is `apool destroy`).
            let path = format_pool(&name, &devices)?;
            println!("filesystem on pool {name:?} reset ({})", path.display());
            Ok(())
        }
    }
}

fn create(name: &str, devices: &[PathBuf]) -> Result<()> {
    let path = format_pool(name, devices)?;
    println!("filesystem ready on pool {name:?} ({})", path.display());
    Ok(())
}

fn format_pool(name: &str, devices: &[PathBuf]) -> Result<PathBuf> {
    let path = find_pool(name, &candidate_devices(devices))?;
    let dev = DaxDevice::open(&path, DEFAULT_MAX_DEVICE_SIZE)
        .with_context(|| format!("open {}", path.display()))?;
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    Filesystem::format(&dev, uid, gid).context("initialise filesystem")?;
    Ok(path)
}

fn unmount(mountpoint: &PathBuf) -> Result<()> {
    let status = Process::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .status()
        .context("run fusermount")?;
    if !status.success() {
        bail!("fusermount -u {} failed with {status}", mountpoint.display());
    }
    println!("unmounted {}", mountpoint.display());
    Ok(())
}

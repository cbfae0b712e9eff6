use anyhow::{bail, Context};
use blockbridge_core::{DeviceConfig, DeviceHandle, DiskCommand, DiskIo, DiskStatus, Drive};
use blockbridge_filesystems::probe;
use blockbridge_platform::{capabilities, UsbdevfsOp};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockbridge")]
#[command(about = "Sector-level access to block devices and disk images", long_about = None)]
struct Cli {
    /// Log dispatch details (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DeviceArgs {
    /// Device node or image file
    device: Option<PathBuf>,
    /// JSON device configuration; explicit flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Open without write access and with a shared lock
    #[arg(long)]
    read_only: bool,
    /// Sector size to assume for images
    #[arg(long)]
    sector_size: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show geometry and drive status
    Info {
        #[command(flatten)]
        device: DeviceArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Hex dump a range of sectors
    Read {
        #[command(flatten)]
        device: DeviceArgs,
        #[arg(short, long, default_value_t = 0)]
        sector: u64,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Fill a range of sectors with one byte value
    Fill {
        #[command(flatten)]
        device: DeviceArgs,
        #[arg(short, long)]
        sector: u64,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Byte value, decimal or 0x-prefixed hex
        #[arg(short, long, value_parser = parse_byte)]
        byte: u8,
    },
    /// Identify the filesystem in sector 0
    Probe {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Resolve usbdevfs capability codes
    Caps {
        /// Operation names (all when omitted)
        names: Vec<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

const DRIVE: u8 = 0;

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

fn load_config(args: &DeviceArgs) -> anyhow::Result<DeviceConfig> {
    let mut config = match (&args.config, &args.device) {
        (Some(file), _) => DeviceConfig::from_json_file(file)?,
        (None, Some(path)) => DeviceConfig::new(path),
        (None, None) => bail!("a device path or --config is required"),
    };
    if let (Some(_), Some(path)) = (&args.config, &args.device) {
        config.path = path.clone();
    }
    if args.read_only {
        config.read_only = true;
        config.exclusive = false;
    }
    if args.sector_size.is_some() {
        config.sector_size = args.sector_size;
    }
    config.validate()?;
    debug!("device config: {:?}", config);
    Ok(config)
}

#[cfg(unix)]
fn open_disks(args: &DeviceArgs) -> anyhow::Result<DiskIo> {
    use blockbridge_platform::FileBackend;

    let config = load_config(args)?;
    let handle = DeviceHandle::new(FileBackend::from_config(&config));
    let mut disks = DiskIo::new();
    disks.attach(DRIVE, Drive::new(handle, config.open_flags()))?;

    let status = disks.initialize(DRIVE);
    if !status.is_ready() {
        let reason = disks
            .drive(DRIVE)
            .and_then(|drive| drive.last_error())
            .map(|kind| format!("{:?}", kind))
            .unwrap_or_else(|| "unknown".to_string());
        bail!("{}: not ready (status {:#04x}, {})", config.path.display(), status.bits(), reason);
    }
    Ok(disks)
}

#[cfg(not(unix))]
fn open_disks(args: &DeviceArgs) -> anyhow::Result<DiskIo> {
    let config = load_config(args)?;
    bail!("{}: device access is only available on Unix", config.path.display())
}

fn hex_dump(base: u64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  |{}|", base + (i * 16) as u64, hex.join(" "), ascii);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Info { device, json } => {
            let disks = open_disks(&device)?;
            let drive = disks.drive(DRIVE).context("drive vanished after attach")?;
            let stat = drive.handle().stat()?;
            let status = disks.status(DRIVE);
            if json {
                let value = serde_json::json!({
                    "device": drive.handle().name(),
                    "stat": stat,
                    "status": status.bits(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Device: {}", drive.handle().name());
                println!("  Medium: {:?}", stat.medium);
                println!("  Size: {} bytes", stat.size_bytes);
                println!("  Sectors: {} x {} bytes", stat.sector_count, stat.sector_size);
                println!("  Read-only: {}", if stat.read_only { "Yes" } else { "No" });
                println!(
                    "  Write protected: {}",
                    if status.contains(DiskStatus::WRITE_PROTECTED) { "Yes" } else { "No" }
                );
            }
        }
        Commands::Read { device, sector, count } => {
            let mut disks = open_disks(&device)?;
            let sector_size = disks.control(DRIVE, u8::from(DiskCommand::GetSectorSize))?;
            let mut buf = vec![0u8; sector_size as usize * count as usize];
            disks
                .read_sectors(DRIVE, &mut buf, sector, count)
                .with_context(|| format!("reading sectors {}..{}", sector, sector.saturating_add(u64::from(count))))?;
            hex_dump(sector * sector_size, &buf);
        }
        Commands::Fill { device, sector, count, byte } => {
            let mut disks = open_disks(&device)?;
            let sector_size = disks.control(DRIVE, u8::from(DiskCommand::GetSectorSize))?;
            let buf = vec![byte; sector_size as usize * count as usize];
            disks
                .write_sectors(DRIVE, &buf, sector, count)
                .with_context(|| format!("writing sectors {}..{}", sector, sector.saturating_add(u64::from(count))))?;
            disks.control(DRIVE, u8::from(DiskCommand::Sync))?;
            println!("Filled {} sector(s) from {} with {:#04x}", count, sector, byte);
        }
        Commands::Probe { device } => {
            let mut disks = open_disks(&device)?;
            let report = probe(&mut disks, DRIVE)?;
            match report.bytes_per_sector {
                Some(bps) => println!("{} ({} bytes/sector)", report.kind, bps),
                None => println!("{}", report.kind),
            }
        }
        Commands::Caps { names, json } => {
            let table = capabilities();
            let ops: Vec<UsbdevfsOp> = if names.is_empty() {
                UsbdevfsOp::ALL.to_vec()
            } else {
                names
                    .iter()
                    .map(|n| n.parse::<UsbdevfsOp>())
                    .collect::<blockbridge_core::Result<Vec<_>>>()?
            };

            if json {
                let entries: Vec<_> = ops
                    .iter()
                    .map(|op| {
                        serde_json::json!({
                            "name": op.name(),
                            "kernel_name": op.kernel_name(),
                            "code": table.code(*op).ok(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Source: {}", table.source());
                for op in ops {
                    match table.code(op) {
                        Ok(code) => println!("  {:<20} {:#010x}", op.name(), code),
                        Err(e) => println!("  {:<20} unavailable ({})", op.name(), e),
                    }
                }
            }
        }
    }

    Ok(())
}

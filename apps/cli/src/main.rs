use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, Subcommand};
use picoflash_core::events::{ChannelObserver, FlashEvent, FlashObserver, TracingObserver};
use picoflash_core::image::{self, ParsedImage, Uf2Record};
use picoflash_core::planner::{erase_len, plan_erase, plan_write};
use picoflash_core::session::{FlashReport, FlashSession, SessionConfig, SessionError};
use picoflash_core::{NusbTransport, binary_info};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "PICOBOOT flashing tool for RP2040/RP2350", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for a BOOTSEL device to appear
    #[arg(long, global = true)]
    wait: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect a UF2 file without touching a device
    Info {
        /// Path to the UF2 image
        image: PathBuf,
    },
    /// Erase, program and reboot into a UF2 image
    Flash {
        /// Path to the UF2 image
        image: PathBuf,
        /// Stay in BOOTSEL mode after writing
        #[arg(long)]
        no_reboot: bool,
        /// Read back every page after writing it
        #[arg(long)]
        verify: bool,
    },
    /// Identify the firmware currently in the device's flash
    Identity,
    /// Reboot the device into the application in flash
    Reboot,
    /// Print the status of the device's last command
    Status,
    /// Write the effective configuration to a TOML file
    SaveConfig {
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        if let Some(hint) = remediation(&e) {
            error!("{}", hint);
        }
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(wait) = args.wait {
        config.wait_timeout_secs = wait;
    }

    match args.command {
        Commands::Info { image } => inspect(&image, &config),
        Commands::Flash {
            image,
            no_reboot,
            verify,
        } => {
            config.reboot &= !no_reboot;
            config.verify |= verify;
            flash(&image, config)
        }
        Commands::Identity => {
            let mut session = connect(config)?;
            let identity = session.read_identity()?;
            if identity.is_empty() {
                println!("No binary info found in flash");
            } else {
                println!("{}", identity);
            }
            Ok(())
        }
        Commands::Reboot => {
            connect(config)?.reboot()?;
            info!("Reboot requested");
            Ok(())
        }
        Commands::Status => {
            let status = connect(config)?.command_status()?;
            println!("{}", status);
            Ok(())
        }
        Commands::SaveConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration saved");
            Ok(())
        }
    }
}

fn connect(config: SessionConfig) -> Result<FlashSession<NusbTransport>> {
    Ok(FlashSession::connect_usb(config, Arc::new(TracingObserver))?)
}

fn load_image(path: &Path) -> Result<ParsedImage> {
    ParsedImage::from_path(path).with_context(|| format!("parsing {}", path.display()))
}

fn inspect(path: &Path, config: &SessionConfig) -> Result<()> {
    let parsed = load_image(path)?;

    // Re-encoding must reproduce the same address -> bytes mapping
    let reparsed = image::parse(&image::encode_blocks(&parsed.blocks, parsed.family_id))?;
    ensure!(
        same_content(&parsed, &reparsed),
        "image does not survive re-encoding"
    );

    let skipped = parsed.records.iter().filter(|r| !r.is_flash_data()).count();
    println!("File:      {}", path.display());
    println!(
        "Records:   {} ({} not for main flash)",
        parsed.records.len(),
        skipped
    );
    println!(
        "Family:    {}",
        parsed
            .family_id
            .map(|id| format!("{} (0x{:08X})", image::family_name(id), id))
            .unwrap_or_else(|| "-".to_string())
    );
    if let (Some(first), Some(last)) = (parsed.blocks.first(), parsed.blocks.last()) {
        println!(
            "Span:      0x{:08X}..0x{:08X} ({} bytes)",
            first.address,
            last.end(),
            parsed.payload_len()
        );
    }
    if let Some(record) = out_of_sequence(&parsed.records) {
        println!(
            "Note:      record {} declares block {} of {}",
            record.index, record.block_no, record.num_blocks
        );
    }

    let ranges = plan_erase(&parsed.blocks);
    let chunks = plan_write(&parsed.blocks);
    println!(
        "Erase:     {} ranges, {} bytes",
        ranges.len(),
        erase_len(&ranges)
    );
    for range in &ranges {
        println!("           {}", range);
    }
    println!("Pages:     {}", chunks.len());

    let memory = picoflash_core::MemoryMap::from_blocks(&parsed.blocks);
    let identity = binary_info::identify(&memory, &config.product_tokens);
    println!();
    if identity.is_empty() {
        println!("No binary info found");
    } else {
        println!("{}", identity);
    }
    Ok(())
}

fn same_content(a: &ParsedImage, b: &ParsedImage) -> bool {
    a.blocks.len() == b.blocks.len()
        && a
            .blocks
            .iter()
            .zip(&b.blocks)
            .all(|(x, y)| x.address == y.address && x.data == y.data)
}

/// First record whose declared block number disagrees with its position.
fn out_of_sequence(records: &[Uf2Record]) -> Option<&Uf2Record> {
    records.iter().find(|r| r.block_no as usize != r.index)
}

fn flash(path: &Path, config: SessionConfig) -> Result<()> {
    let parsed = load_image(path)?;
    info!(
        path = %path.display(),
        blocks = parsed.blocks.len(),
        bytes = parsed.payload_len(),
        "Image loaded"
    );

    let (tx, rx) = mpsc::channel();
    let observer = Arc::new(ChannelObserver::new(tx));

    let handle = thread::spawn(move || -> Result<FlashReport, SessionError> {
        let mut session = FlashSession::connect_usb(config, observer)?;
        session.flash(&parsed)
    });

    // Ends once the worker drops its observer
    let logger = TracingObserver;
    for event in rx {
        match &event {
            FlashEvent::Progress {
                phase,
                current,
                total,
                ..
            } => {
                let pct = if *total > 0 { current * 100 / total } else { 100 };
                eprint!("\r{:<10} {:>3}%", phase.to_string(), pct);
                let _ = std::io::stderr().flush();
                if current == total {
                    eprintln!();
                }
            }
            other => logger.on_event(other),
        }
    }

    let report = handle
        .join()
        .map_err(|_| anyhow!("flash worker panicked"))??;

    println!(
        "Flashed {} bytes ({} pages, {} bytes erased{}{})",
        report.bytes_written,
        report.pages_written,
        report.bytes_erased,
        if report.verified { ", verified" } else { "" },
        if report.rebooted { ", rebooted" } else { "" },
    );
    if !report.identity.is_empty() {
        println!("{}", report.identity);
    }
    Ok(())
}

/// OS-specific advice for transport failures.
fn remediation(err: &anyhow::Error) -> Option<&'static str> {
    match err.downcast_ref::<SessionError>()? {
        SessionError::Transport(e) => e.remediation(),
        _ => None,
    }
}

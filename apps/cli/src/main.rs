use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use signet_core::device::{MockDevice, run_until_idle};
use signet_core::transfer::check_backup_len;
use signet_core::{DeviceSession, FirmwareImage, Operation, RecordingObserver, SessionConfig};
use tracing::{error, info};

/// Key the simulated device accepts.
const SIMULATED_KEY: &[u8] = b"simulated key";

#[derive(Parser, Debug)]
#[command(author, version, about = "Signet token host tool", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the sections, erase pages and write count of a firmware image
    InspectFirmware { image: PathBuf },
    /// Check that a backup file has the size a full backup produces
    CheckBackup { file: PathBuf },
    /// Write a default configuration file
    InitConfig { path: PathBuf },
    /// Drive a whole session against a simulated device
    Simulate {
        #[command(subcommand)]
        scenario: Scenario,
    },
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Back up the simulated device into a file
    Backup { output: PathBuf },
    /// Restore the simulated device from a backup file
    Restore { input: PathBuf },
    /// Flash a firmware image onto the simulated device
    UpdateFirmware { image: PathBuf },
    /// Wipe the simulated device
    Wipe,
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
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };

    match args.command {
        Commands::InspectFirmware { image } => inspect_firmware(&image),
        Commands::CheckBackup { file } => check_backup(&file, &config),
        Commands::InitConfig { path } => init_config(&path),
        Commands::Simulate { scenario } => simulate(scenario, config),
    }
}

fn inspect_firmware(path: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("Invalid firmware image {}", path.display()))?;

    println!("Sections:");
    for section in image.sections() {
        println!(
            "  {:<16} 0x{:08X}  {} bytes",
            section.name,
            section.load_address,
            section.len()
        );
    }
    println!("Total bytes:    {}", image.total_bytes());
    println!("Erase pages:    {:?}", image.erase_pages());
    println!("Write commands: {}", image.write_command_count());
    Ok(())
}

fn check_backup(path: &Path, config: &SessionConfig) -> Result<()> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let geometry = config.geometry();
    check_backup_len(len, &geometry)?;
    println!(
        "{}: {} blocks of {} bytes, size OK",
        path.display(),
        geometry.block_count(),
        geometry.block_size
    );
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    SessionConfig::default().save_to_file(path)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

fn simulate(scenario: Scenario, config: SessionConfig) -> Result<()> {
    let mut device = MockDevice::with_geometry(config.block_size, config.max_block_id);
    device.set_key(SIMULATED_KEY);
    let mut session = DeviceSession::new(config, device);
    let recorder = Arc::new(RecordingObserver::new());
    session.subscribe(recorder.clone());

    session.connect()?;
    run_until_idle(&mut session)?;
    info!(state = %session.state(), "Simulated device connected");

    let operation = match scenario {
        Scenario::Backup { output } => {
            session.login(SIMULATED_KEY)?;
            run_until_idle(&mut session)?;
            session.accounts_loaded()?;
            session.backup(&output)?;
            Operation::Backup
        }
        Scenario::Restore { input } => {
            session.restore(&input)?;
            Operation::Restore
        }
        Scenario::UpdateFirmware { image } => {
            session.update_firmware_from_file(&image)?;
            Operation::FirmwareUpdate
        }
        Scenario::Wipe => {
            session.wipe()?;
            Operation::Wipe
        }
    };
    let handled = run_until_idle(&mut session)?;

    let outcome = recorder
        .outcomes()
        .into_iter()
        .rev()
        .find(|(op, _)| *op == operation)
        .map(|(_, outcome)| outcome);
    match outcome {
        Some(outcome) if outcome.is_success() => {
            info!(
                operation = %operation,
                responses = handled,
                state = %session.state(),
                "Simulation finished"
            );
            Ok(())
        }
        Some(outcome) => bail!("{} {}", operation, outcome),
        None => bail!("{} did not finish", operation),
    }
}

//! retrodock - desktop manager for game emulators
//!
//! Installs, updates, and launches emulators from their GitHub releases,
//! scans ROM directories, and manages the artifact cache.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use retrodock::cache::CacheIndex;
use retrodock::config::{ManagerConfig, Settings};
use retrodock::emulators::{EmulatorKind, EmulatorManager};
use retrodock::events::{OperationHooks, OperationOutput, ThreadEventManager};
use retrodock::fileops::{self, OpReport, OpStatus, PathFilter};
use retrodock::progress::ProgressHandler;

/// UI poll interval for background operations.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "retrodock")]
#[command(version)]
#[command(about = "Desktop manager for game emulators - download, install, update, launch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and install the latest release of an emulator
    Install {
        #[arg(value_enum)]
        emulator: EmulatorKind,
    },

    /// Update an emulator if a newer release is available
    Update {
        #[arg(value_enum)]
        emulator: EmulatorKind,
    },

    /// Launch an installed emulator, optionally booting a ROM
    Launch {
        #[arg(value_enum)]
        emulator: EmulatorKind,

        /// ROM file to boot
        #[arg(short, long)]
        rom: Option<PathBuf>,
    },

    /// Scan the ROM directory and list games for an emulator
    Games {
        #[arg(value_enum)]
        emulator: EmulatorKind,

        /// Override the configured ROM directory
        #[arg(long)]
        roms: Option<PathBuf>,
    },

    /// Copy a directory tree with progress (e.g. back up emulator saves)
    Backup {
        /// Directory to copy from
        source: PathBuf,

        /// Directory to copy into
        dest: PathBuf,

        /// Only copy paths containing one of these directory names
        #[arg(long)]
        include: Vec<String>,

        /// Skip paths containing one of these directory names
        #[arg(long)]
        exclude: Vec<String>,
    },

    /// Inspect or reset the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Reset the cache index to an empty document
    Reset,

    /// Print the cached JSON value for a key
    Get { key: String },

    /// Remove a key from the cache
    Remove {
        key: String,

        /// Also delete the backing file
        #[arg(long)]
        delete_file: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "retrodock=debug"
            } else {
                "retrodock=info"
            })
        }))
        .init();

    let settings = Settings::load();
    let mut config = ManagerConfig::from_settings(&settings)?;

    match cli.command {
        Commands::Install { emulator } => {
            let manager = EmulatorManager::new(config)?;
            let progress = ProgressHandler::new();
            let worker = progress.clone();
            run_managed(emulator.id(), &progress, move || {
                into_output(manager.install(emulator, &worker)?)
            })
        }
        Commands::Update { emulator } => {
            let manager = EmulatorManager::new(config)?;
            let progress = ProgressHandler::new();
            let worker = progress.clone();
            run_managed(emulator.id(), &progress, move || {
                into_output(manager.update(emulator, &worker)?)
            })
        }
        Commands::Launch { emulator, rom } => {
            let manager = EmulatorManager::new(config)?;
            manager.launch(emulator, rom.as_deref())
        }
        Commands::Games { emulator, roms } => {
            if roms.is_some() {
                config.rom_dir = roms;
            }
            let manager = EmulatorManager::new(config)?;
            let games = manager.scan_games(emulator)?;
            for game in &games {
                println!("{}", game.display());
            }
            println!("{} games found", games.len());
            Ok(())
        }
        Commands::Backup {
            source,
            dest,
            include,
            exclude,
        } => {
            let filter = PathFilter { include, exclude };
            let progress = ProgressHandler::new();
            let worker = progress.clone();
            run_managed("backup", &progress, move || {
                into_output(fileops::copy_dir_with_progress(
                    &source, &dest, &filter, &worker,
                ))
            })
        }
        Commands::Cache { command } => {
            let cache = CacheIndex::new(&config.cache_dir)?;
            match command {
                CacheCommands::Reset => {
                    cache.reset()?;
                    println!("cache reset");
                }
                CacheCommands::Get { key } => match cache.get_json(&key) {
                    Some((value, time)) => {
                        println!("{}", serde_json::to_string_pretty(&value)?);
                        println!("written at unix time {:.0}", time);
                    }
                    None => println!("no cached value for '{}'", key),
                },
                CacheCommands::Remove { key, delete_file } => {
                    cache.remove(&key, delete_file)?;
                    println!("removed '{}'", key);
                }
            }
            Ok(())
        }
    }
}

/// Fold a file-operation report into a worker output: completed and cancelled
/// operations dispatch normally, failures take the error path.
fn into_output(report: OpReport) -> Result<OperationOutput> {
    match report.status {
        OpStatus::Completed | OpStatus::Cancelled => Ok(OperationOutput::with_result(json!({
            "status": format!("{:?}", report.status),
            "message": report.message,
            "processed": report.processed,
        }))),
        OpStatus::CorruptArchive | OpStatus::Failed => bail!("{}", report.message),
    }
}

/// Run one background operation to completion, rendering its progress on a
/// terminal bar from the polling loop.
fn run_managed<F>(id: &str, progress: &ProgressHandler, job: F) -> Result<()>
where
    F: FnOnce() -> Result<OperationOutput> + Send + 'static,
{
    let mut events = ThreadEventManager::new();
    // Hooks run on this thread during poll(), so Rc/Cell is enough.
    let failed = Rc::new(Cell::new(false));

    let hooks = OperationHooks::new()
        .on_error({
            let failed = failed.clone();
            move || failed.set(true)
        })
        .on_result(|value| {
            if let Some(message) = value["message"].as_str() {
                println!("{}", message);
            }
        });
    events.submit(id, job, hooks);

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}",
        )?
        .progress_chars("#>-"),
    );

    while events.active_count() > 0 {
        events.poll();
        let snap = progress.snapshot();
        if snap.total_units > 0 {
            bar.set_length(snap.total_units);
        }
        bar.set_position(snap.completed_units);
        bar.set_message(format!("{} | ETA {}", snap.unit_label, snap.eta));
        std::thread::sleep(POLL_INTERVAL);
    }
    bar.finish_and_clear();

    if failed.get() {
        let snap = progress.snapshot();
        match snap.error {
            Some(error) => bail!("{}", error),
            None => bail!("operation '{}' failed", id),
        }
    }
    Ok(())
}

mod settings;
mod ui;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use imprint_core::backend::SystemBackend;
use imprint_core::cancel::CancelToken;
use imprint_core::handle::DeviceBackend;
use imprint_core::image::{Preparation, is_compressed};
use imprint_core::manifest::ChunkManifest;
use imprint_core::plan::ChunkPlan;
use imprint_core::state::{JsonFileStore, StateStore};
use imprint_core::thermal::SysinfoSensor;
use imprint_core::{ImageSource, JobContext, JobOutcome, TargetDevice, platform, start_job};
use indicatif::ProgressBar;
use settings::Overrides;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use ui::{JobBars, TermRestorer};

#[derive(Parser)]
#[command(name = "imprint")]
#[command(about = "Write bootable images to removable drives, verified and resumable", version)]
struct Cli {
    /// Job options file (TOML). Defaults to the per-user config file if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding resumable transfer records
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to one or more devices
    Write {
        /// Image file to write (.img, .iso, or compressed .gz/.xz/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device; repeat to write several devices at once.
        /// Prompts for a selection when omitted
        #[arg(short, long = "device")]
        devices: Vec<PathBuf>,

        /// Skip read-back verification (fast, unsafe)
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Chunk size, e.g. 4M or 16M
        #[arg(long, value_parser = settings::parse_size)]
        chunk_size: Option<u64>,

        /// Start from scratch even if an earlier run can be resumed
        #[arg(long)]
        no_resume: bool,

        /// Stop every device as soon as one fails
        #[arg(long)]
        cancel_all: bool,

        /// Pause every device while any one is paused for temperature
        #[arg(long)]
        pause_all: bool,

        /// Write at most this many devices at the same time
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Per-chunk digest manifest to check the image against
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Allow targets the system does not report as removable
        #[arg(long)]
        allow_fixed: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Compute a per-chunk digest manifest for an image
    Manifest {
        #[arg(required = true)]
        image: PathBuf,

        /// Output file; defaults to <image>.manifest.json
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Chunk size, e.g. 4M; must match the chunk size used for writing
        #[arg(long, value_parser = settings::parse_size)]
        chunk_size: Option<u64>,
    },
    /// List available removable devices
    List,
    /// Show interrupted transfers that can be resumed
    Status,
}

struct WriteArgs {
    image: PathBuf,
    devices: Vec<PathBuf>,
    manifest: Option<PathBuf>,
    yes: bool,
    overrides: Overrides,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();
}

fn state_store(dir: Option<PathBuf>) -> Result<JsonFileStore> {
    let dir = dir.unwrap_or_else(settings::default_state_dir);
    JsonFileStore::new(&dir)
        .with_context(|| format!("failed to open state directory {}", dir.display()))
}

/// Looks the requested paths up among the discovered devices. Paths that
/// discovery doesn't know about are probed directly and marked as fixed.
fn resolve_devices(paths: &[PathBuf]) -> Result<Vec<TargetDevice>> {
    let discovered = platform::get_removable_devices().unwrap_or_else(|e| {
        log::debug!("device discovery failed: {e:#}");
        Vec::new()
    });
    paths
        .iter()
        .map(|path| {
            if let Some(d) = discovered.iter().find(|d| &d.path == path) {
                return Ok(d.clone());
            }
            let probe = TargetDevice::new(path, 0, false);
            let size = SystemBackend
                .open(&probe)
                .and_then(|dev| dev.size())
                .with_context(|| format!("cannot open {}", path.display()))?;
            Ok(TargetDevice::new(path, size, false))
        })
        .collect()
}

fn open_image(path: &Path, cancel: &CancelToken) -> Result<ImageSource> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ui::spinner_style());
    pb.set_prefix(if is_compressed(path) { "Decompress" } else { "Checksum" });
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut step = if is_compressed(path) {
        Preparation::Decompress
    } else {
        Preparation::Checksum
    };
    let image = ImageSource::open_with_progress(path, cancel, |prep, bytes| {
        if prep != step {
            step = prep;
            pb.set_prefix("Checksum");
            pb.reset();
        }
        pb.set_position(bytes);
    });
    match &image {
        Ok(img) => pb.finish_with_message(format!("sha256 {}", img.checksum_hex())),
        Err(_) => pb.finish_and_clear(),
    }
    image.with_context(|| format!("failed to prepare image {}", path.display()))
}

fn write(args: WriteArgs, config: Option<&Path>, state_dir: Option<PathBuf>) -> Result<bool> {
    let mut options = settings::load_options(config)?;
    args.overrides.apply(&mut options);

    let targets = if args.devices.is_empty() {
        let devices = platform::get_removable_devices()?;
        ui::select_devices(&devices, "Select the target devices to WRITE to (space to toggle)")?
    } else {
        resolve_devices(&args.devices)?
    };

    ui::print_warning(&targets, &args.image);
    if !args.yes && !ui::confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(true);
    }
    println!();

    // Ctrl+C first stops image preparation, then asks the job to stop.
    let cancel = CancelToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || c.cancel())?;

    let mut image = open_image(&args.image, &cancel)?;
    if let Some(path) = &args.manifest {
        let manifest = ChunkManifest::load(path)
            .with_context(|| format!("failed to load manifest {}", path.display()))?;
        image = image.with_manifest(manifest);
    }

    let store = state_store(state_dir)?;
    let ctx = JobContext::new(Arc::new(SystemBackend), Arc::new(store))
        .with_sensor(SysinfoSensor::new());
    let total = image.size();
    let job = start_job(Arc::new(image), targets.clone(), options, ctx)?;

    // Only warnings and errors while the bars are on screen.
    let level = log::max_level();
    log::set_max_level(level.min(log::LevelFilter::Warn));

    let mut bars = JobBars::new(&targets, total);
    let events = job.subscribe_progress();
    let mut cancel_sent = false;
    loop {
        if cancel.is_cancelled() && !cancel_sent {
            bars.suspend(|| println!("{}", style("Stopping after the current chunk...").yellow()));
            job.cancel();
            cancel_sent = true;
        }
        match events.next_timeout(Duration::from_millis(200)) {
            Ok(Some(event)) => bars.update(&event),
            Ok(None) => {}
            Err(()) => break,
        }
    }
    bars.finish();
    log::set_max_level(level);

    let report = job.wait();
    println!();
    for result in &report.results {
        let line = result.to_string();
        match result.outcome {
            JobOutcome::Completed => println!("✨ {}", style(line).green()),
            JobOutcome::UserCancelled | JobOutcome::ThermalAbort => {
                println!("⏸  {}", style(line).yellow())
            }
            _ => println!("❌ {}", style(line).red()),
        }
    }
    if report.results.iter().any(|r| r.resumable && !r.is_success()) {
        println!("\nRun the same command again to resume where the write stopped.");
    }
    Ok(report.is_success())
}

fn manifest(image: &Path, output: Option<PathBuf>, chunk_size: Option<u64>, config: Option<&Path>) -> Result<()> {
    let mut options = settings::load_options(config)?;
    if let Some(size) = chunk_size {
        options.chunk_size_bytes = size;
    }
    options.validate()?;

    let source = open_image(image, &CancelToken::new())?;
    let plan = ChunkPlan::new(source.size(), options.chunk_size_bytes)?;
    let manifest = ChunkManifest::compute(&source, &plan)
        .with_context(|| format!("failed to read {}", image.display()))?;

    let output = output.unwrap_or_else(|| {
        let mut name = image.as_os_str().to_owned();
        name.push(".manifest.json");
        PathBuf::from(name)
    });
    manifest.save(&output)?;
    println!(
        "Wrote {} chunk digests ({} bytes each) to {}",
        manifest.digests.len(),
        manifest.chunk_size,
        style(output.display()).cyan()
    );
    Ok(())
}

fn list() -> Result<()> {
    let devices = platform::get_removable_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = if device.mount_points.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device.mount_points.join(", ")
        };
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.path.display(),
            device.name,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn status(state_dir: Option<PathBuf>) -> Result<()> {
    let store = state_store(state_dir)?;
    let keys = store.keys()?;
    if keys.is_empty() {
        println!("No unfinished transfers.");
        return Ok(());
    }
    for key in keys {
        let Some(state) = store.load(&key)? else {
            continue;
        };
        let pct = if state.chunk_count == 0 {
            100.0
        } else {
            state.written_count() as f64 * 100.0 / state.chunk_count as f64
        };
        let note = if state.verification_skipped { ", verification skipped" } else { "" };
        println!(
            "  {:<16} image {}  {:>5.1}% written, {}/{} chunks verified ({}{note})",
            key.device_id,
            &key.image_checksum[..key.image_checksum.len().min(12)],
            pct,
            state.verified_count(),
            state.chunk_count,
            state.phase
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();
    init_logging();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Write {
            image,
            devices,
            no_verify,
            chunk_size,
            no_resume,
            cancel_all,
            pause_all,
            max_concurrent,
            manifest,
            allow_fixed,
            yes,
        } => {
            let args = WriteArgs {
                image,
                devices,
                manifest,
                yes,
                overrides: Overrides {
                    no_verify,
                    chunk_size,
                    no_resume,
                    cancel_all,
                    pause_all,
                    max_concurrent,
                    allow_fixed,
                },
            };
            if !write(args, config, cli.state_dir)? {
                return Err(anyhow!("not every device was written successfully"));
            }
        }
        Commands::Manifest {
            image,
            output,
            chunk_size,
        } => manifest(&image, output, chunk_size, config)?,
        Commands::List => list()?,
        Commands::Status => status(cli.state_dir)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn write_accepts_several_devices() {
        let cli = Cli::try_parse_from([
            "imprint", "write", "os.img", "-d", "/dev/sdb", "-d", "/dev/sdc", "--chunk-size", "8M", "-y",
        ])
        .unwrap();
        match cli.command {
            Commands::Write {
                devices,
                chunk_size,
                yes,
                ..
            } => {
                assert_eq!(devices.len(), 2);
                assert_eq!(chunk_size, Some(8 << 20));
                assert!(yes);
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn unknown_device_paths_are_probed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stick.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let devices = resolve_devices(&[path.clone()]).unwrap();
        assert_eq!(devices[0].path, path);
        assert_eq!(devices[0].capacity_bytes, 4096);
        assert!(!devices[0].removable);
        assert!(resolve_devices(&[dir.path().join("missing.img")]).is_err());
    }

    #[test]
    fn missing_image_is_reported() {
        let err = open_image(Path::new("/nonexistent/os.img"), &CancelToken::new()).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/os.img"));
    }

    #[test]
    fn manifest_is_written_next_to_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        std::fs::write(&image, vec![7u8; 3 * 1024]).unwrap();
        let config = dir.path().join("none.toml");
        std::fs::write(&config, "").unwrap();

        manifest(&image, None, Some(1024), Some(&config)).unwrap();
        let saved = ChunkManifest::load(&dir.path().join("os.img.manifest.json")).unwrap();
        assert_eq!(saved.digests.len(), 3);
        assert_eq!(saved.chunk_size, 1024);
    }
}

//! mosca command line.
//!
//! ```bash
//! # Registered drivers and their parameters
//! mosca list
//!
//! # Acquire channels 0 and 2 for three seconds and record them
//! mosca run --seconds 3 --channels 0,2 --save
//!
//! # Shape and first rows of a recording
//! mosca inspect wave_001.npy
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mosca::config::{Settings, DEFAULT_CONFIG_PATH};
use mosca::driver::{Driver, SamplingConfig};
use mosca::manager::StopReport;
use mosca::parameter::Configurable;
use mosca::storage::{read_npy, SinkSummary, StorageDriver};
use mosca::DaqContext;

#[derive(Parser)]
#[command(name = "mosca")]
#[command(about = "Multi-channel acquisition with live view and NPY recording")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List acquisition and storage drivers with their parameters
    List,
    /// Run one acquisition
    Run(RunArgs),
    /// Print the shape and first rows of an NPY recording
    Inspect {
        file: PathBuf,
        /// Rows to print
        #[arg(short, long, default_value_t = 5)]
        rows: usize,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Acquisition length in seconds
    #[arg(short, long, default_value_t = 1.0)]
    seconds: f64,

    /// Record the run with the current storage driver
    #[arg(long)]
    save: bool,

    /// Acquisition driver to use instead of the configured default
    #[arg(short, long)]
    driver: Option<String>,

    /// Channel indices to enable, e.g. `0,2`
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<usize>>,

    /// Sampling rate in Hz
    #[arg(long)]
    rate: Option<i64>,

    /// Samples per block
    #[arg(long)]
    interval: Option<i64>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct RunSummary {
    driver: String,
    save: bool,
    sampling: SamplingSummary,
    channels: Vec<String>,
    blocks_received: u64,
    last_block_shape: Option<(usize, usize)>,
    file: Option<SinkSummary>,
    stop: StopReport,
}

#[derive(Serialize)]
struct SamplingSummary {
    rate_hz: u64,
    interval: u64,
}

impl From<SamplingConfig> for SamplingSummary {
    fn from(sampling: SamplingConfig) -> Self {
        Self {
            rate_hz: sampling.rate_hz,
            interval: sampling.interval,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { file, rows } => {
            init_tracing("info");
            inspect(&file, rows)
        }
        Command::List => {
            let settings = load_settings(&cli.config)?;
            init_tracing(&settings.application.log_level);
            list(DaqContext::new(settings)?)
        }
        Command::Run(args) => {
            let settings = load_settings(&cli.config)?;
            init_tracing(&settings.application.log_level);
            run(DaqContext::new(settings)?, &args)
        }
    }
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn print_params(indent: &str, target: &dyn Configurable) {
    for spec in target.config_map() {
        let value = target.get_param(spec.key).unwrap_or_default();
        println!("{indent}{:<28} {value}", spec.label);
    }
}

fn list(ctx: DaqContext) -> Result<()> {
    println!("Acquisition drivers:");
    ctx.devices().map_drivers(|driver: &dyn Driver, current| {
        let marker = if current { "*" } else { " " };
        println!("{marker} {} [{}]", driver.name(), driver.kind());
        print_params("    ", driver.core());
        for channel in driver.channels().iter() {
            println!("    {}", channel.name());
            print_params("      ", channel);
        }
    });
    println!("Storage drivers:");
    ctx.storage().map_drivers(|storage: &dyn StorageDriver, current| {
        let marker = if current { "*" } else { " " };
        println!("{marker} {} [{}]", storage.name(), storage.kind());
        print_params("    ", storage.target());
    });
    ctx.shutdown()?;
    Ok(())
}

fn run(ctx: DaqContext, args: &RunArgs) -> Result<()> {
    if !(args.seconds.is_finite() && args.seconds >= 0.0) {
        bail!("--seconds must be a non-negative number");
    }
    if let Some(name) = &args.driver {
        ctx.devices().set_driver(name)?;
    }
    ctx.devices().with_current(|driver| configure(driver, args))??;

    let run = ctx.start(args.save)?;
    info!(seconds = args.seconds, save = args.save, "acquiring");
    thread::sleep(Duration::from_secs_f64(args.seconds));
    let stop = ctx.stop()?;

    let frame = ctx.view().latest();
    let summary = RunSummary {
        driver: run.driver.clone(),
        save: run.save,
        sampling: run.sampling.into(),
        channels: run.channels.iter().map(|c| c.name().to_string()).collect(),
        blocks_received: frame.blocks_received,
        last_block_shape: frame.last_block_shape,
        file: if run.save { ctx.storage().last_file() } else { None },
        stop,
    };
    ctx.shutdown()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("driver      {}", summary.driver);
        println!(
            "sampling    {} Hz, {} samples/block",
            summary.sampling.rate_hz, summary.sampling.interval
        );
        println!("channels    {}", summary.channels.join(", "));
        println!("blocks      {}", summary.blocks_received);
        if let Some(file) = &summary.file {
            println!("file        {} ({} x {})", file.path.display(), file.rows, file.cols);
        }
        if !summary.stop.is_clean() {
            println!("warning     a consumer did not finish before the stop timeout");
        }
    }
    Ok(())
}

fn configure(driver: &mut dyn Driver, args: &RunArgs) -> mosca::AppResult<()> {
    if args.rate.is_some() || args.interval.is_some() {
        let current = driver.sampling();
        // configured values are range-checked i64s, so they fit
        driver.configure(
            args.rate.unwrap_or(current.rate_hz as i64),
            args.interval.unwrap_or(current.interval as i64),
        )?;
    }
    if let Some(indices) = &args.channels {
        let names: Vec<String> = driver.channels().names().into_iter().map(String::from).collect();
        for index in indices {
            if *index >= names.len() {
                return Err(mosca::DaqError::NotFound(format!("channel index {index}")));
            }
        }
        let channels = driver.channels_mut();
        for (i, name) in names.iter().enumerate() {
            channels.set_in_use(name, indices.contains(&i))?;
        }
    }
    Ok(())
}

fn inspect(path: &Path, rows: usize) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let array = read_npy(file)?;
    println!("{}", path.display());
    println!("shape       ({}, {})", array.rows, array.cols);
    println!("header      {} bytes", array.header_len + 10);
    for row in 0..array.rows.min(rows) {
        let values: Vec<String> = array.row(row).iter().map(|v| format!("{v:>12.6}")).collect();
        println!("{}", values.join(" "));
    }
    Ok(())
}

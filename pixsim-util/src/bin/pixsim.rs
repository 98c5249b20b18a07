//! Pixsim command-line runner.
//!
//! Runs the simulation described by a configuration file, with the helper
//! modules of this crate registered.
//!
//! # Example
//!
//! ```bash
//! # Run a configuration with its own settings
//! pixsim run.conf
//!
//! # Override the event and worker counts
//! pixsim run.conf --events 10000 --workers 8
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pixsim::config::{ConfigManager, Configuration};
use pixsim::registry::ModuleRegistry;
use pixsim::simulation::{SimInit, SimulationError};
use pixsim_util::register_helper_modules;

/// Pixsim runner
///
/// Executes the module pipeline of a configuration file. The log filter is
/// taken from `RUST_LOG`, then `--log-level`, then the `log_level` key of the
/// global section. The `log_level` key is read verbatim, so a directive list
/// such as `log_level = info,pixsim=debug` needs no quotes.
#[derive(Parser, Debug)]
#[command(name = "pixsim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    config: PathBuf,

    /// Number of events, overriding `number_of_events`
    #[arg(short = 'e', long)]
    events: Option<u64>,

    /// Number of workers, overriding `workers`
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Seed of the random engines, overriding `random_seed`
    #[arg(long)]
    seed: Option<u64>,

    /// Log filter used when `RUST_LOG` is not set
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match ConfigManager::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| log_filter(config.global()));
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .with_thread_names(true)
        .init();

    let global = config.global_mut();
    if let Some(events) = args.events {
        global.set("number_of_events", events);
    }
    if let Some(workers) = args.workers {
        global.set("workers", workers);
    }
    if let Some(seed) = args.seed {
        global.set("random_seed", seed);
    }

    let mut registry = ModuleRegistry::new();
    if let Err(descriptor) = register_helper_modules(&mut registry) {
        error!("module {} is registered twice", descriptor.name());
        return ExitCode::FAILURE;
    }

    match run(registry, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns the log filter directives of the global section, `info` if unset.
fn log_filter(global: &Configuration) -> String {
    match global.get_text("log_level") {
        Ok(text) => text.trim().trim_matches('"').to_string(),
        Err(_) => "info".to_string(),
    }
}

fn run(registry: ModuleRegistry, config: ConfigManager) -> Result<(), SimulationError> {
    let simulation = SimInit::new(registry, config).init()?;
    info!(
        modules = simulation.modules().len(),
        workers = simulation.workers(),
        "simulation initialized"
    );
    let summary = simulation.run()?;
    info!(
        completed = summary.completed_events,
        skipped = summary.skipped_events,
        "simulation done"
    );

    Ok(())
}

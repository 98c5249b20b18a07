//! Simulation setup and execution.
//!
//! # Setup
//!
//! A [`SimInit`] builder takes a [`ModuleRegistry`](crate::registry::ModuleRegistry),
//! a [`ConfigManager`](crate::config::ConfigManager) and optionally a
//! [`GeometryManager`](crate::geometry::GeometryManager). Calling
//! [`SimInit::init`] on the builder:
//!
//! 1. instantiates the configured modules in configuration order, resolving
//!    per-detector and per-detector-type modules to one instance per match,
//! 2. calls [`Module::init`](crate::module::Module::init) on every instance
//!    in that order,
//! 3. reports configuration keys that no module ever read,
//! 4. freezes the detector setup and the subscription table.
//!
//! Any failure during setup is reported as a [`SetupError`] before any event
//! is processed.
//!
//! # Execution
//!
//! [`Simulation::run`] starts a pool of workers. Each worker owns an event
//! buffer and repeatedly claims the next event index from a shared counter,
//! runs every module on that event in configuration order, then clears its
//! buffer. Events are thus processed concurrently but each one is processed
//! by exactly one worker, and within an event modules always run in the same
//! order.
//!
//! A module returning [`ModuleError::SkipEvent`] abandons the rest of the
//! current event, which is counted as skipped. Any other error stops the
//! run: workers finish the events they are processing but claim no new ones.
//! In all cases [`Module::finalize`](crate::module::Module::finalize) is
//! then called on every module, in configuration order, from the calling
//! thread.
//!
//! The number of workers is the `workers` value of the global section,
//! falling back to a single worker if `multithreading` is disabled or if any
//! module does not support concurrent events, and never exceeding the number
//! of events.

mod event;
mod sim_init;
mod worker;

use std::thread;

use thiserror::Error;
use tracing::{error, info, info_span};

use crate::config::{ConfigError, Configuration, GlobalSettings};
use crate::geometry::{GeometryError, GeometryManager};
use crate::messenger::Messenger;
use crate::module::{ModuleError, ModuleIdentifier};
use crate::registry::ModuleInstance;

pub use event::Event;
pub use sim_init::SimInit;

use worker::{run_worker, Shared};

/// Error raised while setting up a simulation.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The configuration could not be read or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The detector setup is invalid.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// No registered module matches a section name.
    #[error("section [{section}]: no module named '{name}' is registered")]
    UnresolvedModule {
        /// Section identifier.
        section: String,
        /// Requested module name.
        name: String,
    },
    /// Several registered modules match a section name.
    #[error("section [{section}]: module name '{name}' is ambiguous between {}", .candidates.join(", "))]
    AmbiguousModule {
        /// Section identifier.
        section: String,
        /// Requested module name.
        name: String,
        /// Matching registered names.
        candidates: Vec<String>,
    },
    /// A section targets a detector that does not exist.
    #[error("section [{section}]: detector '{detector}' does not exist")]
    UnknownDetector {
        /// Section identifier.
        section: String,
        /// Requested detector.
        detector: String,
    },
    /// Two module instances share the same identity.
    #[error("module instance {identifier} is configured more than once")]
    DuplicateInstance {
        /// Identity of the duplicated instance.
        identifier: String,
    },
    /// A section binding is incompatible with the module scope.
    #[error("section [{section}]: {reason}")]
    InvalidBinding {
        /// Section identifier.
        section: String,
        /// What is wrong.
        reason: String,
    },
    /// A module constructor failed.
    #[error("could not construct module {module}: {source}")]
    Construction {
        /// Module instance identifier.
        module: String,
        /// Error returned by the constructor.
        source: ModuleError,
    },
    /// A module rejected its configuration during initialization.
    #[error("could not initialize module {module}: {source}")]
    InvalidConfiguration {
        /// Module instance identifier.
        module: String,
        /// Error returned by `init`.
        source: ModuleError,
    },
}

/// Error raised while running a simulation.
///
/// Modules have been finalized when this error is returned.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A module reported a fatal error.
    #[error("module {module} failed in event {event}: {source}")]
    ModuleFatal {
        /// Module instance identifier.
        module: String,
        /// Index of the event being processed.
        event: u64,
        /// Error returned by the module.
        source: ModuleError,
        /// Statistics of the interrupted run.
        summary: RunSummary,
    },
    /// A worker thread panicked.
    #[error("worker {worker} panicked")]
    WorkerPanic {
        /// Worker index.
        worker: usize,
        /// Statistics of the interrupted run.
        summary: RunSummary,
    },
    /// A worker thread could not be started.
    #[error("worker {worker} could not be started: {source}")]
    WorkerSpawn {
        /// Worker index.
        worker: usize,
        /// Error returned by the operating system.
        source: std::io::Error,
        /// Statistics of the interrupted run.
        summary: RunSummary,
    },
}

impl ExecutionError {
    /// Returns the statistics of the interrupted run.
    pub fn summary(&self) -> &RunSummary {
        match self {
            Self::ModuleFatal { summary, .. }
            | Self::WorkerPanic { summary, .. }
            | Self::WorkerSpawn { summary, .. } => summary,
        }
    }
}

/// Error raised by a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The setup failed.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// The run failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Statistics of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunSummary {
    /// Number of events requested in the configuration.
    pub requested_events: u64,
    /// Number of events processed by all modules.
    pub completed_events: u64,
    /// Number of events abandoned by a module.
    pub skipped_events: u64,
    /// Number of workers that processed events.
    pub workers: usize,
    /// Whether the run was stopped by an error.
    pub failed: bool,
}

impl RunSummary {
    /// Returns the number of events that were never processed because the
    /// run was stopped.
    pub fn unprocessed_events(&self) -> u64 {
        self.requested_events
            .saturating_sub(self.completed_events + self.skipped_events)
    }
}

/// An initialized simulation, ready to run.
#[derive(Debug)]
pub struct Simulation {
    modules: Vec<ModuleInstance>,
    messenger: Messenger,
    geometry: GeometryManager,
    global: Configuration,
    settings: GlobalSettings,
    workers: usize,
}

impl Simulation {
    /// Returns the module instances in execution order.
    pub fn modules(&self) -> &[ModuleInstance] {
        &self.modules
    }

    /// Returns the identifiers of the module instances in execution order.
    pub fn module_identifiers(&self) -> Vec<&ModuleIdentifier> {
        self.modules.iter().map(ModuleInstance::identifier).collect()
    }

    /// Returns the detector setup.
    pub fn geometry(&self) -> &GeometryManager {
        &self.geometry
    }

    /// Returns the subscription table.
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Returns the global configuration section, including values written
    /// back during setup.
    pub fn global_config(&self) -> &Configuration {
        &self.global
    }

    /// Returns the run-wide settings.
    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    /// Returns the number of workers that will process events.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes all events, then finalizes every module.
    pub fn run(mut self) -> Result<RunSummary, ExecutionError> {
        let number_of_events = self.settings.number_of_events;
        info!(
            events = number_of_events,
            workers = self.workers,
            seed = self.settings.random_seed,
            "starting run"
        );

        let shared = Shared::new(
            &self.modules,
            &self.messenger,
            number_of_events,
            self.settings.random_seed,
        );
        let fault = thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers)
                .map(|id| {
                    let shared = &shared;
                    thread::Builder::new()
                        .name(format!("pixsim-worker-{id}"))
                        .spawn_scoped(s, move || run_worker(id, shared))
                })
                .collect();

            let outcomes: Vec<_> = handles
                .into_iter()
                .enumerate()
                .map(|(id, handle)| match handle {
                    Ok(handle) => match handle.join() {
                        Ok(()) => WorkerOutcome::Completed,
                        Err(_) => WorkerOutcome::Panicked,
                    },
                    Err(e) => {
                        error!(worker = id, "could not spawn worker thread: {}", e);
                        shared.stop();
                        WorkerOutcome::NotSpawned(e)
                    }
                })
                .collect();

            first_fault(outcomes)
        });

        let failure = shared.take_failure();
        let summary = RunSummary {
            requested_events: number_of_events,
            completed_events: shared.completed(),
            skipped_events: shared.skipped(),
            workers: self.workers,
            failed: failure.is_some() || fault.is_some(),
        };
        drop(shared);

        self.finalize();
        info!(
            completed = summary.completed_events,
            skipped = summary.skipped_events,
            "run finished"
        );

        if let Some(failure) = failure {
            return Err(ExecutionError::ModuleFatal {
                module: failure.module,
                event: failure.event,
                source: failure.source,
                summary,
            });
        }
        if let Some(fault) = fault {
            return Err(fault.into_error(summary));
        }

        Ok(summary)
    }

    /// Finalizes every module in execution order.
    fn finalize(&mut self) {
        for instance in &mut self.modules {
            let _span = info_span!("module", name = %instance.identifier).entered();
            if let Err(e) = instance.module.finalize() {
                error!("finalization failed: {}", e);
            }
        }
    }
}

/// How a worker thread ended.
#[derive(Debug)]
enum WorkerOutcome {
    Completed,
    Panicked,
    NotSpawned(std::io::Error),
}

/// Worker failure reported to the caller.
#[derive(Debug)]
enum WorkerFault {
    Panic(usize),
    Spawn(usize, std::io::Error),
}

impl WorkerFault {
    fn into_error(self, summary: RunSummary) -> ExecutionError {
        match self {
            Self::Panic(worker) => ExecutionError::WorkerPanic { worker, summary },
            Self::Spawn(worker, source) => ExecutionError::WorkerSpawn {
                worker,
                source,
                summary,
            },
        }
    }
}

/// Returns the fault of the lowest-indexed worker that did not complete.
fn first_fault(outcomes: Vec<WorkerOutcome>) -> Option<WorkerFault> {
    outcomes
        .into_iter()
        .enumerate()
        .find_map(|(id, outcome)| match outcome {
            WorkerOutcome::Completed => None,
            WorkerOutcome::Panicked => Some(WorkerFault::Panic(id)),
            WorkerOutcome::NotSpawned(e) => Some(WorkerFault::Spawn(id, e)),
        })
}

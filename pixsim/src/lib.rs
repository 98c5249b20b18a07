//! A multithreaded module runtime for configuration-driven detector
//! simulation pipelines.
//!
//! Pixsim runs a simulation as an ordered sequence of independent processing
//! units, the *modules*, which cooperate on each simulated *event* by
//! exchanging typed messages rather than by calling each other. Which modules
//! run, in which order, and for which detectors is entirely decided by a
//! configuration file.
//!
//! The physics and geometry computations themselves are out of scope: they
//! are provided by modules. This crate is concerned with how modules are
//! registered, instantiated, sequenced, and allowed to exchange data safely
//! while events are processed concurrently by several worker threads.
//!
//! # A practical overview
//!
//! Running a simulation involves three activities:
//!
//! 1. writing modules and registering them in a
//!    [`ModuleRegistry`](registry::ModuleRegistry),
//! 2. describing the run in a configuration file: the global `[Pixsim]`
//!    section, the detector setup and one section per module,
//! 3. initializing and running the simulation.
//!
//! ## Writing modules
//!
//! A module implements the [`Module`](module::Module) trait. It is built by
//! a constructor that reads the module's configuration section and declares
//! the message types the module consumes, and is then called once per event
//! with an [`Event`](simulation::Event) context through which it fetches
//! received messages and dispatches new ones.
//!
//! Each module type has a [`Scope`](module::Scope): a *global* module is
//! instantiated once, a *per-detector* module once for every matching
//! detector, and a *per-detector-type* module once for every model type of
//! the setup.
//!
//! ## Configuration
//!
//! The configuration is a sequence of `[Section]` or `[Section:detector]`
//! headers followed by `key = value` lines; see the [`config`] module. The
//! order of module sections is the execution order of modules within every
//! event.
//!
//! ## Running
//!
//! A [`SimInit`](simulation::SimInit) builder instantiates and initializes
//! the modules, then [`Simulation::run`](simulation::Simulation::run)
//! processes all events and finalizes the modules.
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! use pixsim::config::ConfigManager;
//! use pixsim::geometry::{Assembly, DetectorModel, GeometryManager};
//! use pixsim::messenger::{Flags, Message};
//! use pixsim::module::{Module, ModuleError, Scope};
//! use pixsim::registry::{ModuleDescriptor, ModuleRegistry};
//! use pixsim::simulation::{Event, SimInit};
//!
//! // Payload exchanged between the modules.
//! struct Deposit(f64);
//!
//! // Produces one deposit for every detector in each event.
//! struct Source;
//!
//! impl Module for Source {
//!     fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
//!         for detector in event.detectors().to_vec() {
//!             event.dispatch(Message::for_detector(Deposit(1.5), detector));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! // Accumulates the deposits of its own detector.
//! struct Sum {
//!     total: Arc<AtomicU64>,
//! }
//!
//! impl Module for Sum {
//!     fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
//!         let deposit = event.fetch::<Deposit>()?;
//!         self.total.fetch_add((deposit.0 * 10.0) as u64, Ordering::Relaxed);
//!         Ok(())
//!     }
//! }
//!
//! let total = Arc::new(AtomicU64::new(0));
//!
//! let mut registry = ModuleRegistry::new();
//! registry
//!     .add(ModuleDescriptor::new("Source", Scope::PerDetectorType, |_| Ok(Source)).with_multithreading())
//!     .unwrap();
//! registry
//!     .add(
//!         ModuleDescriptor::new("Sum", Scope::PerDetector, {
//!             let total = total.clone();
//!             move |cx| {
//!                 let filter = cx.own_detector_filter();
//!                 cx.subscribe::<Deposit>(filter, Flags::REQUIRED);
//!                 Ok(Sum { total: total.clone() })
//!             }
//!         })
//!         .with_multithreading(),
//!     )
//!     .unwrap();
//!
//! let mut geometry = GeometryManager::new();
//! geometry
//!     .add_model(DetectorModel::new("mono", [64, 64], [0.03, 0.03], 0.05, Assembly::Monolithic))
//!     .unwrap();
//! geometry.add_detector("upstream", "mono", [0.0, 0.0, 0.0], [0.0; 3]).unwrap();
//! geometry.add_detector("downstream", "mono", [0.0, 0.0, 50.0], [0.0; 3]).unwrap();
//!
//! let config = ConfigManager::parse(
//!     "[Pixsim]\n\
//!      number_of_events = 20\n\
//!      workers = 2\n\
//!      random_seed = 1\n\
//!      [Source]\n\
//!      [Sum]\n",
//! )
//! .unwrap();
//!
//! let simulation = SimInit::new(registry, config)
//!     .with_geometry(geometry)
//!     .init()
//!     .unwrap();
//! let summary = simulation.run().unwrap();
//!
//! assert_eq!(summary.completed_events, 20);
//! assert_eq!(total.load(Ordering::Relaxed), 20 * 2 * 15);
//! ```
//!
//! # Concurrency
//!
//! Events are independent: each worker thread owns an
//! [`EventBuffer`](messenger::EventBuffer) holding the messages of the event
//! it processes, and messages never cross workers. The configuration, the
//! detector setup and the subscription table are frozen during setup and
//! shared read-only by all workers. Modules are shared as well, so that
//! [`Module::run`](module::Module::run) takes `&self`; a module that
//! accumulates results across events keeps them behind atomics or a mutex.
//!
//! A module type must opt in to concurrent execution with
//! [`ModuleDescriptor::with_multithreading`](registry::ModuleDescriptor::with_multithreading).
//! If any configured module does not, all events are processed by a single
//! worker.
//!
//! Within an event, modules run in configuration order and message dispatch
//! is synchronous, so a module always sees the messages dispatched by the
//! modules before it. Across events nothing is ordered.
//!
//! # Logging
//!
//! Pixsim emits [`tracing`](https://docs.rs/tracing) events and spans for
//! setup, workers (`worker`), events (`event`) and modules (`module`). No
//! subscriber is installed by the library.
//!
//! # Cargo feature flags
//!
//! ## Serde
//!
//! The `serde` feature derives `Serialize` for
//! [`RunSummary`](simulation::RunSummary) and the geometry model types:
//!
//! ```toml
//! [dependencies]
//! pixsim = { version = "0.1.0", features = ["serde"] }
//! ```
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod geometry;
pub mod messenger;
pub mod module;
pub mod registry;
pub mod simulation;

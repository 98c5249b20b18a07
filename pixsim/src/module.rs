//! Module contract and setup contexts.
//!
//! # Life cycle
//!
//! A module goes through the following states:
//!
//! 1. *constructed*: the constructor registered in the
//!    [`ModuleRegistry`](crate::registry::ModuleRegistry) builds the module
//!    from its configuration section through a [`BuildContext`],
//! 2. *initialized*: [`Module::init`] has run, in configuration order, on the
//!    setup thread,
//! 3. *running*: [`Module::run`] is called once per event, possibly from
//!    several worker threads at once,
//! 4. *finalized*: [`Module::finalize`] has run, in configuration order, once
//!    all workers are done.
//!
//! Because `run` takes `&self`, state that must be updated while events are
//! processed is owned by the module behind its own synchronization (atomics
//! or a mutex); results are never merged back by the runtime.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! use pixsim::messenger::{Filter, Flags};
//! use pixsim::module::{BuildContext, Module, ModuleError};
//! use pixsim::simulation::Event;
//!
//! pub struct Energy(pub f64);
//!
//! /// Counts events where a deposit exceeds a threshold.
//! pub struct Trigger {
//!     threshold: f64,
//!     triggers: AtomicU64,
//! }
//!
//! impl Trigger {
//!     pub fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
//!         cx.subscribe::<Energy>(Filter::Any, Flags::REQUIRED);
//!
//!         Ok(Self {
//!             threshold: cx.config().get_or("threshold", 1.0)?,
//!             triggers: AtomicU64::new(0),
//!         })
//!     }
//! }
//!
//! impl Module for Trigger {
//!     fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
//!         if event.fetch::<Energy>()?.0 > self.threshold {
//!             self.triggers.fetch_add(1, Ordering::Relaxed);
//!         }
//!
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, Configuration};
use crate::geometry::{Detector, GeometryError, GeometryManager};
use crate::messenger::{Filter, Flags, Message, MessageError, Messenger};
use crate::simulation::Event;

/// A unit of simulation behavior.
///
/// Modules never call each other: all data flows through typed messages.
pub trait Module: Send + Sync + 'static {
    /// Prepares the module once before the first event.
    ///
    /// Subscriptions may still be registered at this point. An error aborts
    /// the setup.
    fn init(&mut self, cx: &mut InitContext) -> Result<(), ModuleError> {
        let _ = cx;

        Ok(())
    }

    /// Processes one event.
    ///
    /// A [`ModuleError::SkipEvent`] abandons the rest of the event; any other
    /// error stops the run.
    fn run(&self, event: &mut Event) -> Result<(), ModuleError>;

    /// Releases resources and reports results once after the last event.
    ///
    /// Errors are logged and do not prevent other modules from finalizing.
    fn finalize(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Error returned by a module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The module configuration is invalid.
    #[error(transparent)]
    InvalidConfiguration(#[from] ConfigError),
    /// A geometry lookup failed.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// The current event should be abandoned; the run continues.
    #[error("event skipped: {0}")]
    SkipEvent(String),
    /// The run must be stopped.
    #[error("{0}")]
    Fatal(String),
    /// A message could not be retrieved.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    /// Creates a [`ModuleError::SkipEvent`] error.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::SkipEvent(reason.into())
    }

    /// Creates a [`ModuleError::Fatal`] error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Checks whether the error only affects the current event.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::SkipEvent(_))
    }
}

/// Index of a module instance in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
    /// Returns the position of the module in execution order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Instantiation policy of a module type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A single instance.
    Global,
    /// One instance per matching detector.
    ///
    /// A section with a detector qualifier (`[Module:det]`) targets that
    /// detector only; otherwise an optional `type` key restricts instances to
    /// detectors of that model type.
    PerDetector,
    /// One instance per distinct model type present in the setup.
    PerDetectorType,
}

/// What a module instance is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Binding {
    /// Not bound to any detector.
    Global,
    /// Bound to the named detector.
    Detector(String),
    /// Bound to all detectors of the named model type.
    DetectorType(String),
}

/// Identity of a module instance: the module type name and its binding.
///
/// No two instances of a simulation may share an identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdentifier {
    name: String,
    binding: Binding,
}

impl ModuleIdentifier {
    /// Creates an identifier.
    pub fn new(name: impl Into<String>, binding: Binding) -> Self {
        Self {
            name: name.into(),
            binding,
        }
    }

    /// Returns the module type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the binding of the instance.
    pub fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            Binding::Global => f.write_str(&self.name),
            Binding::Detector(label) | Binding::DetectorType(label) => {
                write!(f, "{}:{}", self.name, label)
            }
        }
    }
}

/// Life-cycle state of a module instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    /// Built but not initialized.
    Constructed,
    /// Initialized and ready to process events.
    Initialized,
}

/// Context available to a module constructor.
pub struct BuildContext<'a> {
    pub(crate) id: ModuleId,
    pub(crate) identifier: &'a ModuleIdentifier,
    pub(crate) config: &'a mut Configuration,
    pub(crate) detectors: &'a [Arc<Detector>],
    pub(crate) geometry: &'a GeometryManager,
    pub(crate) messenger: &'a mut Messenger,
}

impl<'a> BuildContext<'a> {
    /// Returns the execution-order index of the module being built.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Returns the identifier of the module being built.
    pub fn identifier(&self) -> &ModuleIdentifier {
        self.identifier
    }

    /// Returns the configuration section of the module.
    pub fn config(&self) -> &Configuration {
        &*self.config
    }

    /// Returns the configuration section of the module for write-back.
    pub fn config_mut(&mut self) -> &mut Configuration {
        &mut *self.config
    }

    /// Returns the detector of a per-detector module.
    pub fn detector(&self) -> Option<&Arc<Detector>> {
        match self.identifier.binding() {
            Binding::Detector(_) => self.detectors.first(),
            _ => None,
        }
    }

    /// Returns the detectors the module is bound to.
    ///
    /// This is empty for global modules, and holds all detectors of the model
    /// type for per-detector-type modules.
    pub fn detectors(&self) -> &[Arc<Detector>] {
        self.detectors
    }

    /// Returns the detector registry.
    pub fn geometry(&self) -> &GeometryManager {
        self.geometry
    }

    /// Returns a filter accepting only messages for the module's own
    /// detector, or any message for modules not bound to a single detector.
    pub fn own_detector_filter(&self) -> Filter {
        own_detector_filter(self.identifier)
    }

    /// Subscribes the module to messages with payload `T`.
    pub fn subscribe<T>(&mut self, filter: Filter, flags: Flags)
    where
        T: Send + Sync + 'static,
    {
        self.messenger.subscribe::<T>(self.id, filter, flags);
    }

    /// Subscribes the module to messages with payload `T`, calling `handler`
    /// on every delivery.
    pub fn subscribe_with<T, F>(&mut self, filter: Filter, flags: Flags, handler: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Message<T>) + Send + Sync + 'static,
    {
        self.messenger
            .subscribe_with::<T, F>(self.id, filter, flags, handler);
    }

    /// Returns the subscription table built so far.
    pub fn messenger(&self) -> &Messenger {
        &*self.messenger
    }
}

impl fmt::Debug for BuildContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("id", &self.id)
            .field("identifier", &self.identifier.to_string())
            .finish_non_exhaustive()
    }
}

/// Context available to [`Module::init`].
pub struct InitContext<'a> {
    pub(crate) id: ModuleId,
    pub(crate) identifier: &'a ModuleIdentifier,
    pub(crate) config: &'a Configuration,
    pub(crate) detectors: &'a [Arc<Detector>],
    pub(crate) geometry: &'a GeometryManager,
    pub(crate) messenger: &'a mut Messenger,
    pub(crate) global: &'a mut Configuration,
}

impl<'a> InitContext<'a> {
    /// Returns the execution-order index of the module.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Returns the identifier of the module.
    pub fn identifier(&self) -> &ModuleIdentifier {
        self.identifier
    }

    /// Returns the configuration section of the module.
    pub fn config(&self) -> &Configuration {
        self.config
    }

    /// Returns the global section.
    pub fn global_config(&self) -> &Configuration {
        &*self.global
    }

    /// Returns the global section for write-back to modules initialized
    /// later.
    pub fn global_config_mut(&mut self) -> &mut Configuration {
        &mut *self.global
    }

    /// Returns the detectors the module is bound to.
    pub fn detectors(&self) -> &[Arc<Detector>] {
        self.detectors
    }

    /// Returns the detector registry.
    ///
    /// External objects can still be attached to detectors at this stage.
    pub fn geometry(&self) -> &GeometryManager {
        self.geometry
    }

    /// Returns a filter accepting only messages for the module's own
    /// detector, or any message for modules not bound to a single detector.
    pub fn own_detector_filter(&self) -> Filter {
        own_detector_filter(self.identifier)
    }

    /// Subscribes the module to messages with payload `T`.
    pub fn subscribe<T>(&mut self, filter: Filter, flags: Flags)
    where
        T: Send + Sync + 'static,
    {
        self.messenger.subscribe::<T>(self.id, filter, flags);
    }

    /// Subscribes the module to messages with payload `T`, calling `handler`
    /// on every delivery.
    pub fn subscribe_with<T, F>(&mut self, filter: Filter, flags: Flags, handler: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Message<T>) + Send + Sync + 'static,
    {
        self.messenger
            .subscribe_with::<T, F>(self.id, filter, flags, handler);
    }
}

impl fmt::Debug for InitContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitContext")
            .field("id", &self.id)
            .field("identifier", &self.identifier.to_string())
            .finish_non_exhaustive()
    }
}

fn own_detector_filter(identifier: &ModuleIdentifier) -> Filter {
    match identifier.binding() {
        Binding::Detector(name) => Filter::Detector(name.clone()),
        _ => Filter::Any,
    }
}

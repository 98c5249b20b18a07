//! Static registry of module types and instantiation of configured modules.
//!
//! Module types are made available by adding a [`ModuleDescriptor`] to a
//! [`ModuleRegistry`] before the simulation is set up. There is no dynamic
//! loading: the set of available modules is whatever the application
//! registered.
//!
//! ```
//! use pixsim::module::{Module, ModuleError, Scope};
//! use pixsim::registry::{ModuleDescriptor, ModuleRegistry};
//! use pixsim::simulation::Event;
//!
//! struct Idle;
//!
//! impl Module for Idle {
//!     fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = ModuleRegistry::new();
//! registry
//!     .add(ModuleDescriptor::new("Idle", Scope::PerDetector, |_| Ok(Idle)).with_multithreading())
//!     .unwrap();
//!
//! assert_eq!(registry.resolve("idle").unwrap().name(), "Idle");
//! ```

mod factory;
mod module_registry;

pub use factory::{instantiate, ModuleInstance};
pub use module_registry::{ModuleDescriptor, ModuleRegistry, ResolveError};

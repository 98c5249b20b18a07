use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

use crate::module::{BuildContext, Module, ModuleError, Scope};

/// A type-erased module constructor.
trait ConstructorAny: Send + Sync + 'static {
    fn construct(&self, cx: &mut BuildContext) -> Result<Box<dyn Module>, ModuleError>;
}

struct Constructor<F, M> {
    func: F,
    _module: PhantomData<fn() -> M>,
}

impl<F, M> ConstructorAny for Constructor<F, M>
where
    M: Module,
    F: Fn(&mut BuildContext) -> Result<M, ModuleError> + Send + Sync + 'static,
{
    fn construct(&self, cx: &mut BuildContext) -> Result<Box<dyn Module>, ModuleError> {
        (self.func)(cx).map(|module| Box::new(module) as Box<dyn Module>)
    }
}

/// Registration record of a module type: its name, instantiation policy and
/// constructor.
pub struct ModuleDescriptor {
    name: String,
    scope: Scope,
    multithreading: bool,
    constructor: Box<dyn ConstructorAny>,
}

impl ModuleDescriptor {
    /// Creates a descriptor for a module type.
    ///
    /// The module is assumed not to support concurrent calls to
    /// [`Module::run`] unless [`with_multithreading`](Self::with_multithreading)
    /// is called.
    pub fn new<M, F>(name: impl Into<String>, scope: Scope, constructor: F) -> Self
    where
        M: Module,
        F: Fn(&mut BuildContext) -> Result<M, ModuleError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            scope,
            multithreading: false,
            constructor: Box::new(Constructor {
                func: constructor,
                _module: PhantomData,
            }),
        }
    }

    /// Declares that instances of the module can process several events
    /// concurrently.
    pub fn with_multithreading(mut self) -> Self {
        self.multithreading = true;
        self
    }

    /// Returns the module type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instantiation policy.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Checks whether instances can process several events concurrently.
    pub fn allows_multithreading(&self) -> bool {
        self.multithreading
    }

    pub(crate) fn construct(&self, cx: &mut BuildContext) -> Result<Box<dyn Module>, ModuleError> {
        self.constructor.construct(cx)
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("multithreading", &self.multithreading)
            .finish_non_exhaustive()
    }
}

/// Failure to resolve a module name.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No registered module matches the name.
    #[error("no module named '{0}' is registered")]
    Unresolved(String),
    /// Several registered modules match the name when ignoring case, and none
    /// matches exactly.
    #[error("module name '{name}' is ambiguous between {}", .candidates.join(", "))]
    Ambiguous {
        /// Requested name.
        name: String,
        /// Matching registered names, sorted.
        candidates: Vec<String>,
    },
}

/// A static registry of module types, keyed by name.
#[derive(Default)]
pub struct ModuleRegistry(HashMap<String, ModuleDescriptor>);

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module type to the registry.
    ///
    /// If the name is already in use for another module type, the descriptor
    /// provided as argument is returned in the error.
    pub fn add(&mut self, descriptor: ModuleDescriptor) -> Result<(), ModuleDescriptor> {
        match self.0.entry(descriptor.name.clone()) {
            Entry::Vacant(s) => {
                s.insert(descriptor);

                Ok(())
            }
            Entry::Occupied(_) => Err(descriptor),
        }
    }

    /// Returns the descriptor registered under exactly this name.
    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.0.get(name)
    }

    /// Resolves a module name as written in a configuration section header.
    ///
    /// An exact match wins; otherwise the name may differ in ASCII case from
    /// exactly one registered name.
    pub fn resolve(&self, name: &str) -> Result<&ModuleDescriptor, ResolveError> {
        if let Some(descriptor) = self.get(name) {
            return Ok(descriptor);
        }

        let mut candidates: Vec<&ModuleDescriptor> = self
            .0
            .values()
            .filter(|descriptor| descriptor.name.eq_ignore_ascii_case(name))
            .collect();

        match candidates.len() {
            0 => Err(ResolveError::Unresolved(name.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => {
                let mut candidates: Vec<String> =
                    candidates.iter().map(|d| d.name.clone()).collect();
                candidates.sort();

                Err(ResolveError::Ambiguous {
                    name: name.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Returns the registered names in lexicographic order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();

        names
    }

    /// Returns the number of registered module types.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no module type is registered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ModuleRegistry ({} modules)", self.0.len())
    }
}

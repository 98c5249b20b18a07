use std::path::Path;

use tracing::{debug, info, info_span, warn};

use crate::config::{ConfigManager, ConfigReader, Configuration};
use crate::geometry::GeometryManager;
use crate::messenger::Messenger;
use crate::module::{InitContext, ModuleState};
use crate::registry::{instantiate, ModuleInstance, ModuleRegistry};

use super::{SetupError, Simulation};

/// Builder of a simulation.
///
/// The builder gathers the module registry, the configuration and the
/// detector setup. [`SimInit::init`] then instantiates and initializes all
/// modules on the calling thread and returns a [`Simulation`] ready to run.
#[derive(Debug)]
pub struct SimInit {
    registry: ModuleRegistry,
    config: ConfigManager,
    geometry: Option<GeometryManager>,
}

impl SimInit {
    /// Creates a builder from a module registry and a configuration.
    pub fn new(registry: ModuleRegistry, config: ConfigManager) -> Self {
        Self {
            registry,
            config,
            geometry: None,
        }
    }

    /// Creates a builder from a module registry and a configuration file.
    pub fn from_file(registry: ModuleRegistry, path: impl AsRef<Path>) -> Result<Self, SetupError> {
        Ok(Self::new(registry, ConfigManager::from_file(path)?))
    }

    /// Uses the specified detector setup.
    ///
    /// Without an explicit setup, detectors are loaded from the file named by
    /// the `detectors_file` key of the global section, and models from the
    /// file named by `models_file` or, if absent, from the sections of the
    /// detectors file that have no `type` key.
    pub fn with_geometry(mut self, geometry: GeometryManager) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Returns the global configuration section.
    pub fn global_config(&self) -> &Configuration {
        self.config.global()
    }

    /// Returns the global configuration section for modification.
    pub fn global_config_mut(&mut self) -> &mut Configuration {
        self.config.global_mut()
    }

    /// Instantiates and initializes all configured modules.
    pub fn init(self) -> Result<Simulation, SetupError> {
        let settings = self.config.settings()?;
        let (mut global, sections) = self.config.into_parts();
        let geometry = match self.geometry {
            Some(geometry) => geometry,
            None => load_geometry(&global)?,
        };
        info!(
            detectors = geometry.detectors().len(),
            models = geometry.models().len(),
            "detector setup loaded"
        );

        let mut messenger = Messenger::new();
        let mut modules = instantiate(&self.registry, &sections, &geometry, &mut messenger)?;
        info!(modules = modules.len(), "modules constructed");

        for instance in &mut modules {
            let _span = info_span!("module", name = %instance.identifier).entered();
            let mut cx = InitContext {
                id: instance.id,
                identifier: &instance.identifier,
                config: &instance.config,
                detectors: &instance.detectors,
                geometry: &geometry,
                messenger: &mut messenger,
                global: &mut global,
            };
            instance
                .module
                .init(&mut cx)
                .map_err(|source| SetupError::InvalidConfiguration {
                    module: instance.identifier.to_string(),
                    source,
                })?;
            instance.state = ModuleState::Initialized;
            debug!("module initialized");
        }

        report_unused_keys(&global, &modules);
        geometry.seal();

        let workers = effective_workers(
            settings.workers,
            settings.multithreading,
            settings.number_of_events,
            &modules,
        );

        Ok(Simulation {
            modules,
            messenger,
            geometry,
            global,
            settings,
            workers,
        })
    }
}

/// Loads the detector setup named by the global section, or returns an empty
/// setup if no detectors file is configured.
fn load_geometry(global: &Configuration) -> Result<GeometryManager, SetupError> {
    if !global.has("detectors_file") {
        debug!("no detectors file configured, the setup has no detector");
        return Ok(GeometryManager::new());
    }

    let detectors_file = global.get_path("detectors_file", true)?;
    let geometry = if global.has("models_file") {
        let models_file = global.get_path("models_file", true)?;
        GeometryManager::from_files(models_file, detectors_file)?
    } else {
        let (detectors, models): (Vec<_>, Vec<_>) = ConfigReader::from_file(&detectors_file)?
            .into_sections()
            .into_iter()
            .partition(|section| section.has("type"));
        GeometryManager::from_config(&models, &detectors)?
    };

    Ok(geometry)
}

fn report_unused_keys(global: &Configuration, modules: &[ModuleInstance]) {
    let sections = std::iter::once((global.identifier(), global))
        .chain(modules.iter().map(|m| (m.identifier.to_string(), &m.config)));

    for (section, config) in sections {
        for key in config.unused_keys() {
            warn!(section = %section, key = %key, "configuration key was never used");
        }
    }
}

/// Computes the number of workers actually started.
fn effective_workers(
    requested: usize,
    multithreading: bool,
    number_of_events: u64,
    modules: &[ModuleInstance],
) -> usize {
    let mut workers = requested.max(1);
    if workers > 1 && !multithreading {
        info!("multithreading disabled in the configuration, using a single worker");
        workers = 1;
    }
    if workers > 1 {
        let serial: Vec<String> = modules
            .iter()
            .filter(|m| !m.allows_multithreading())
            .map(|m| m.identifier.to_string())
            .collect();
        if !serial.is_empty() {
            warn!(
                modules = %serial.join(", "),
                "some modules do not support multithreading, using a single worker"
            );
            workers = 1;
        }
    }

    let cap = usize::try_from(number_of_events.max(1)).unwrap_or(usize::MAX);

    workers.min(cap)
}

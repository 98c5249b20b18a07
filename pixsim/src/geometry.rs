//! Detector and geometry model registry.
//!
//! The [`GeometryManager`] holds the detector instances of the setup and the
//! geometry models they share. It is populated during setup, either
//! programmatically or from configuration sections, and is read-only once the
//! simulation is initialized: detectors are then shared by reference across
//! all workers.
//!
//! Detectors are described by sections named after the detector:
//!
//! ```text
//! [dut]
//! type = "timepix"
//! position = 0, 0, 10
//! orientation = 0, 0, 0
//! ```
//!
//! and models by sections named after the model type:
//!
//! ```text
//! [timepix]
//! assembly = hybrid
//! number_of_pixels = 256, 256
//! pixel_size = 0.055, 0.055
//! sensor_thickness = 0.3
//! chip_thickness = 0.7
//! ```

mod detector;
mod external;
mod model;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ConfigReader, Configuration};

pub use detector::Detector;
pub use model::{Assembly, DetectorModel};

/// Error raised by the geometry registry.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// A detector with this name already exists.
    #[error("detector '{0}' is defined more than once")]
    DuplicateDetector(String),
    /// A model with this type name already exists.
    #[error("detector model '{0}' is defined more than once")]
    DuplicateModel(String),
    /// A detector refers to a model type that was never added.
    #[error("detector '{detector}' refers to unknown model type '{model}'")]
    UnknownModel {
        /// Detector name.
        detector: String,
        /// Missing model type.
        model: String,
    },
    /// No detector with this name exists.
    #[error("detector '{0}' does not exist")]
    UnknownDetector(String),
    /// No external object is attached under this key.
    #[error("detector '{detector}' has no external object '{key}'")]
    MissingExternalObject {
        /// Detector name.
        detector: String,
        /// Requested key.
        key: String,
    },
    /// The external object does not have the requested type.
    #[error("external object '{key}' of detector '{detector}' is not of type {expected}")]
    ExternalObjectType {
        /// Detector name.
        detector: String,
        /// Requested key.
        key: String,
        /// Requested type.
        expected: &'static str,
    },
    /// External objects cannot be attached once the simulation is initialized.
    #[error("cannot attach external object '{key}' to detector '{detector}' after setup")]
    ExternalObjectsSealed {
        /// Detector name.
        detector: String,
        /// Rejected key.
        key: String,
    },
    /// Detectors and models cannot be added once the simulation is initialized.
    #[error("the geometry is sealed")]
    Sealed,
    /// A detector or model section is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Registry of detectors and their geometry models.
#[derive(Debug, Default)]
pub struct GeometryManager {
    models: Vec<Arc<DetectorModel>>,
    detectors: Vec<Arc<Detector>>,
    index: HashMap<String, usize>,
    sealed: AtomicBool,
}

impl GeometryManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads models and detectors from parsed configuration sections.
    ///
    /// Every model section must come with a unique type name; detector
    /// sections refer to models through their `type` key.
    pub fn from_config(
        models: &[Configuration],
        detectors: &[Configuration],
    ) -> Result<Self, GeometryError> {
        let mut geometry = Self::new();
        for section in models {
            geometry.add_model(DetectorModel::from_config(section)?)?;
        }
        for section in detectors {
            let model: String = section.get("type")?;
            geometry.add_detector(
                section.name(),
                &model,
                section.get_or("position", [0.0; 3])?,
                section.get_or("orientation", [0.0; 3])?,
            )?;
        }

        Ok(geometry)
    }

    /// Loads models and detectors from a models file and a detectors file.
    pub fn from_files(
        models_file: impl AsRef<std::path::Path>,
        detectors_file: impl AsRef<std::path::Path>,
    ) -> Result<Self, GeometryError> {
        let models = ConfigReader::from_file(models_file)?;
        let detectors = ConfigReader::from_file(detectors_file)?;

        Self::from_config(models.sections(), detectors.sections())
    }

    /// Adds a geometry model and returns a shared handle to it.
    pub fn add_model(&mut self, model: DetectorModel) -> Result<Arc<DetectorModel>, GeometryError> {
        self.check_open()?;
        if self.model(model.type_name()).is_some() {
            return Err(GeometryError::DuplicateModel(model.type_name().to_string()));
        }
        let model = Arc::new(model);
        self.models.push(model.clone());

        Ok(model)
    }

    /// Adds a detector of an already registered model type.
    pub fn add_detector(
        &mut self,
        name: &str,
        model: &str,
        position: [f64; 3],
        orientation: [f64; 3],
    ) -> Result<Arc<Detector>, GeometryError> {
        self.check_open()?;
        if self.index.contains_key(name) {
            return Err(GeometryError::DuplicateDetector(name.to_string()));
        }
        let model = self
            .model(model)
            .cloned()
            .ok_or_else(|| GeometryError::UnknownModel {
                detector: name.to_string(),
                model: model.to_string(),
            })?;

        debug!(detector = name, model = model.type_name(), "adding detector");
        let detector = Arc::new(Detector::new(
            name.to_string(),
            model,
            position,
            orientation,
        ));
        self.index.insert(name.to_string(), self.detectors.len());
        self.detectors.push(detector.clone());

        Ok(detector)
    }

    /// Returns all detectors in registration order.
    pub fn detectors(&self) -> &[Arc<Detector>] {
        &self.detectors
    }

    /// Returns the detector with the specified name.
    pub fn detector(&self, name: &str) -> Result<&Arc<Detector>, GeometryError> {
        self.index
            .get(name)
            .map(|&i| &self.detectors[i])
            .ok_or_else(|| GeometryError::UnknownDetector(name.to_string()))
    }

    /// Checks whether a detector with the specified name exists.
    pub fn has_detector(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the detectors of the specified model type in registration
    /// order.
    pub fn detectors_by_type<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a Arc<Detector>> {
        self.detectors
            .iter()
            .filter(move |detector| detector.model_type() == model)
    }

    /// Returns the model with the specified type name.
    pub fn model(&self, type_name: &str) -> Option<&Arc<DetectorModel>> {
        self.models
            .iter()
            .find(|model| model.type_name() == type_name)
    }

    /// Returns the registered models.
    pub fn models(&self) -> &[Arc<DetectorModel>] {
        &self.models
    }

    /// Returns the distinct model types used by detectors, in order of first
    /// appearance.
    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = Vec::new();
        for detector in &self.detectors {
            if !types.contains(&detector.model_type()) {
                types.push(detector.model_type());
            }
        }

        types
    }

    /// Freezes the registry and the external-object tables of all detectors.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        for detector in &self.detectors {
            detector.seal();
        }
    }

    fn check_open(&self) -> Result<(), GeometryError> {
        if self.sealed.load(Ordering::Acquire) {
            Err(GeometryError::Sealed)
        } else {
            Ok(())
        }
    }
}

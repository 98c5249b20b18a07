use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::external::{ExternalObjectFault, ExternalObjects};
use super::{DetectorModel, GeometryError};

/// A named detector instance placed in the setup.
///
/// Position and orientation are fixed at setup. Orientation is given as
/// Euler angles in radians; their interpretation is left to the geometry
/// collaborators.
pub struct Detector {
    name: String,
    model: Arc<DetectorModel>,
    position: [f64; 3],
    orientation: [f64; 3],
    external: ExternalObjects,
}

impl Detector {
    pub(crate) fn new(
        name: String,
        model: Arc<DetectorModel>,
        position: [f64; 3],
        orientation: [f64; 3],
    ) -> Self {
        Self {
            name,
            model,
            position,
            orientation,
            external: ExternalObjects::default(),
        }
    }

    /// Returns the detector name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the geometry model.
    pub fn model(&self) -> &Arc<DetectorModel> {
        &self.model
    }

    /// Returns the model type name.
    pub fn model_type(&self) -> &str {
        self.model.type_name()
    }

    /// Returns the position of the detector center.
    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    /// Returns the orientation angles.
    pub fn orientation(&self) -> [f64; 3] {
        self.orientation
    }

    /// Attaches an opaque object to the detector under `key`.
    ///
    /// Only possible during setup: once the simulation is initialized the side
    /// table is sealed and this fails with [`GeometryError::ExternalObjectsSealed`].
    pub fn set_external_object<T>(&self, key: &str, object: T) -> Result<(), GeometryError>
    where
        T: Any + Send + Sync,
    {
        self.external
            .insert(key, object)
            .map_err(|fault| self.external_error(key, fault))
    }

    /// Returns the object attached under `key`, which must be of type `T`.
    pub fn external_object<T>(&self, key: &str) -> Result<Arc<T>, GeometryError>
    where
        T: Any + Send + Sync,
    {
        self.external
            .get(key)
            .map_err(|fault| self.external_error(key, fault))
    }

    /// Checks whether an object is attached under `key`.
    pub fn has_external_object(&self, key: &str) -> bool {
        self.external.contains(key)
    }

    pub(crate) fn seal(&self) {
        self.external.seal();
    }

    fn external_error(&self, key: &str, fault: ExternalObjectFault) -> GeometryError {
        let detector = self.name.clone();
        let key = key.to_string();
        match fault {
            ExternalObjectFault::Missing => GeometryError::MissingExternalObject { detector, key },
            ExternalObjectFault::TypeMismatch { expected } => {
                GeometryError::ExternalObjectType {
                    detector,
                    key,
                    expected,
                }
            }
            ExternalObjectFault::Sealed => GeometryError::ExternalObjectsSealed { detector, key },
        }
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("name", &self.name)
            .field("model", &self.model.type_name())
            .field("position", &self.position)
            .field("orientation", &self.orientation)
            .field("external", &self.external)
            .finish()
    }
}

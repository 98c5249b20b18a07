use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Configuration;
use crate::geometry::{Detector, GeometryManager};
use crate::messenger::Messenger;
use crate::module::{
    Binding, BuildContext, Module, ModuleId, ModuleIdentifier, ModuleState, Scope,
};
use crate::simulation::SetupError;

use super::{ModuleRegistry, ResolveError};

/// A constructed module together with its identity, configuration and bound
/// detectors.
pub struct ModuleInstance {
    pub(crate) id: ModuleId,
    pub(crate) identifier: ModuleIdentifier,
    pub(crate) module: Box<dyn Module>,
    pub(crate) config: Configuration,
    pub(crate) detectors: Vec<Arc<Detector>>,
    pub(crate) multithreading: bool,
    pub(crate) state: ModuleState,
}

impl ModuleInstance {
    /// Returns the execution-order index of the instance.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Returns the identity of the instance.
    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    /// Returns the configuration section of the instance.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Returns the detectors the instance is bound to.
    pub fn detectors(&self) -> &[Arc<Detector>] {
        &self.detectors
    }

    /// Checks whether the instance can process several events concurrently.
    pub fn allows_multithreading(&self) -> bool {
        self.multithreading
    }

    /// Returns the life-cycle state of the instance.
    pub fn state(&self) -> ModuleState {
        self.state
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("identifier", &self.identifier.to_string())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Builds the ordered list of module instances from configuration sections.
///
/// Sections are processed in order and each yields zero or more instances
/// according to the scope of its module type:
///
/// * a global module yields one instance,
/// * a per-detector module yields one instance for the detector named in the
///   section header, or otherwise one instance per detector in registration
///   order, optionally restricted to the model types listed in the `type`
///   key,
/// * a per-detector-type module yields one instance per model type in order
///   of first appearance, optionally restricted by the `type` key.
///
/// The resulting order is the execution order of every event. Subscriptions
/// made by constructors are registered in `messenger`.
pub fn instantiate(
    registry: &ModuleRegistry,
    sections: &[Configuration],
    geometry: &GeometryManager,
    messenger: &mut Messenger,
) -> Result<Vec<ModuleInstance>, SetupError> {
    let mut instances: Vec<ModuleInstance> = Vec::new();
    let mut identifiers = HashSet::new();

    for section in sections {
        let descriptor = registry.resolve(section.name()).map_err(|e| match e {
            ResolveError::Unresolved(name) => SetupError::UnresolvedModule {
                section: section.identifier(),
                name,
            },
            ResolveError::Ambiguous { name, candidates } => SetupError::AmbiguousModule {
                section: section.identifier(),
                name,
                candidates,
            },
        })?;

        let bindings = bindings(descriptor.scope(), section, geometry)?;
        if bindings.is_empty() {
            info!(
                section = %section.identifier(),
                "no detector matches the module, no instance created"
            );
        }

        for (binding, detectors) in bindings {
            let identifier = ModuleIdentifier::new(descriptor.name(), binding);
            if !identifiers.insert(identifier.clone()) {
                return Err(SetupError::DuplicateInstance {
                    identifier: identifier.to_string(),
                });
            }

            let id = ModuleId(instances.len());
            let mut config = section.clone();
            debug!(module = %identifier, id = id.index(), "constructing module");

            let mut cx = BuildContext {
                id,
                identifier: &identifier,
                config: &mut config,
                detectors: &detectors,
                geometry,
                messenger: &mut *messenger,
            };
            let module = descriptor
                .construct(&mut cx)
                .map_err(|source| SetupError::Construction {
                    module: identifier.to_string(),
                    source,
                })?;

            instances.push(ModuleInstance {
                id,
                identifier,
                module,
                config,
                detectors,
                multithreading: descriptor.allows_multithreading(),
                state: ModuleState::Constructed,
            });
        }
    }

    Ok(instances)
}

/// Computes the bindings of a section and the detectors of each binding.
fn bindings(
    scope: Scope,
    section: &Configuration,
    geometry: &GeometryManager,
) -> Result<Vec<(Binding, Vec<Arc<Detector>>)>, SetupError> {
    let invalid = |reason: &str| SetupError::InvalidBinding {
        section: section.identifier(),
        reason: reason.to_string(),
    };

    if scope == Scope::Global {
        if section.detector_name().is_some() {
            return Err(invalid("a global module cannot target a detector"));
        }

        return Ok(vec![(Binding::Global, Vec::new())]);
    }

    let types: Option<Vec<String>> = section.get_opt("type")?;
    let type_matches = |model: &str| {
        types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == model))
    };

    if scope == Scope::PerDetectorType {
        if section.detector_name().is_some() {
            return Err(invalid("a per-detector-type module cannot target a detector"));
        }

        return Ok(geometry
            .model_types()
            .into_iter()
            .filter(|model| type_matches(model))
            .map(|model| {
                let detectors = geometry.detectors_by_type(model).cloned().collect();
                (Binding::DetectorType(model.to_string()), detectors)
            })
            .collect());
    }

    if let Some(name) = section.detector_name() {
        if types.is_some() {
            return Err(invalid(
                "a detector qualifier cannot be combined with a 'type' restriction",
            ));
        }
        let detector = geometry
            .detector(name)
            .map_err(|_| SetupError::UnknownDetector {
                section: section.identifier(),
                detector: name.to_string(),
            })?;

        return Ok(vec![(
            Binding::Detector(name.to_string()),
            vec![detector.clone()],
        )]);
    }

    Ok(geometry
        .detectors()
        .iter()
        .filter(|detector| type_matches(detector.model_type()))
        .map(|detector| {
            (
                Binding::Detector(detector.name().to_string()),
                vec![detector.clone()],
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigReader;
    use crate::geometry::{Assembly, DetectorModel};
    use crate::messenger::Flags;
    use crate::module::ModuleError;
    use crate::registry::ModuleDescriptor;
    use crate::simulation::Event;

    struct Probe;

    impl Module for Probe {
        fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .add(ModuleDescriptor::new("Source", Scope::Global, |_| Ok(Probe)))
            .unwrap();
        registry
            .add(ModuleDescriptor::new("Digitizer", Scope::PerDetector, |cx| {
                let filter = cx.own_detector_filter();
                cx.subscribe::<u32>(filter, Flags::NONE);
                Ok(Probe)
            }))
            .unwrap();
        registry
            .add(ModuleDescriptor::new(
                "Calibration",
                Scope::PerDetectorType,
                |_| Ok(Probe),
            ))
            .unwrap();
        registry
            .add(ModuleDescriptor::new("Broken", Scope::Global, |cx| {
                let _: f64 = cx.config().get("gain")?;
                Ok(Probe)
            }))
            .unwrap();
        registry
    }

    fn geometry() -> GeometryManager {
        let mut geometry = GeometryManager::new();
        for model in ["alpide", "timepix"] {
            geometry
                .add_model(DetectorModel::new(
                    model,
                    [8, 8],
                    [0.03, 0.03],
                    0.05,
                    Assembly::Monolithic,
                ))
                .unwrap();
        }
        geometry.add_detector("plane0", "alpide", [0.0; 3], [0.0; 3]).unwrap();
        geometry.add_detector("dut", "timepix", [0.0; 3], [0.0; 3]).unwrap();
        geometry.add_detector("plane1", "alpide", [0.0; 3], [0.0; 3]).unwrap();
        geometry
    }

    fn build(text: &str) -> Result<(Vec<ModuleInstance>, Messenger), SetupError> {
        let sections = ConfigReader::parse(text).unwrap().into_sections();
        let mut messenger = Messenger::new();
        let instances = instantiate(&registry(), &sections, &geometry(), &mut messenger)?;

        Ok((instances, messenger))
    }

    fn names(instances: &[ModuleInstance]) -> Vec<String> {
        instances.iter().map(|i| i.identifier().to_string()).collect()
    }

    #[test]
    fn instances_follow_file_and_registry_order() {
        let (instances, messenger) = build("[Source]\n[Digitizer]\n[Calibration]\n").unwrap();
        assert_eq!(
            names(&instances),
            [
                "Source",
                "Digitizer:plane0",
                "Digitizer:dut",
                "Digitizer:plane1",
                "Calibration:alpide",
                "Calibration:timepix",
            ]
        );
        for (index, instance) in instances.iter().enumerate() {
            assert_eq!(instance.id().index(), index);
            assert_eq!(instance.state(), ModuleState::Constructed);
        }
        assert_eq!(messenger.subscription_count(), 3);

        let calibration = &instances[4];
        let bound: Vec<_> = calibration.detectors().iter().map(|d| d.name()).collect();
        assert_eq!(bound, ["plane0", "plane1"]);
    }

    #[test]
    fn qualifiers_and_type_restrictions() {
        let (instances, _) =
            build("[Digitizer:dut]\n[Digitizer]\ntype = alpide\n[Calibration]\ntype = timepix\n")
                .unwrap();
        assert_eq!(
            names(&instances),
            [
                "Digitizer:dut",
                "Digitizer:plane0",
                "Digitizer:plane1",
                "Calibration:timepix"
            ]
        );

        let (instances, _) = build("[Digitizer]\ntype = mimosa\n").unwrap();
        assert!(instances.is_empty());
    }

    #[test]
    fn names_are_resolved_ignoring_case() {
        let (instances, _) = build("[source]\n").unwrap();
        assert_eq!(names(&instances), ["Source"]);
        assert_eq!(instances[0].config().name(), "source");
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        match build("[Source]\n[Source]\n") {
            Err(SetupError::DuplicateInstance { identifier }) => assert_eq!(identifier, "Source"),
            other => panic!("unexpected result: {other:?}"),
        }
        match build("[Digitizer]\n[Digitizer:dut]\n") {
            Err(SetupError::DuplicateInstance { identifier }) => {
                assert_eq!(identifier, "Digitizer:dut")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn setup_errors_name_the_section() {
        match build("[Source]\n[Unknown]\n") {
            Err(SetupError::UnresolvedModule { section, name }) => {
                assert_eq!(section, "Unknown");
                assert_eq!(name, "Unknown");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match build("[Digitizer:dtu]\n") {
            Err(SetupError::UnknownDetector { section, detector }) => {
                assert_eq!(section, "Digitizer:dtu");
                assert_eq!(detector, "dtu");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            build("[Source:dut]\n"),
            Err(SetupError::InvalidBinding { .. })
        ));
        match build("[Broken]\n") {
            Err(SetupError::Construction { module, source }) => {
                assert_eq!(module, "Broken");
                assert!(matches!(source, ModuleError::InvalidConfiguration(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

//! Example: a two-stage pipeline on a pair of detectors.
//!
//! This example demonstrates in particular:
//!
//! * per-detector-type and per-detector module instantiation,
//! * detector-addressed messages and own-detector filters,
//! * required subscriptions,
//! * per-event random engines,
//! * accumulation of results across workers.
//!
//! ```text
//!                ┏━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┓
//!                ┃ Event                                   ┃
//!                ┃              Energy     ┌─────────────┐ ┃
//!                ┃   ┌────────┐ [dut] ────►│ Trigger:dut │ ┃
//!                ┃   │ Source ├──┤         └─────────────┘ ┃
//!                ┃   └────────┘ [ref] ────►┌─────────────┐ ┃
//!                ┃                         │ Trigger:ref │ ┃
//!                ┃                         └─────────────┘ ┃
//!                ┗━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┛
//! ```

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use pixsim::config::ConfigManager;
use pixsim::geometry::{Assembly, DetectorModel, GeometryManager};
use pixsim::messenger::{Flags, Message};
use pixsim::module::{BuildContext, Module, ModuleError, Scope};
use pixsim::registry::{ModuleDescriptor, ModuleRegistry};
use pixsim::simulation::{Event, SimInit};

const CONFIG: &str = r#"
[Pixsim]
number_of_events = 10000
workers = 4
random_seed = 12345

[Source]
max_energy = 100.0

[Trigger:dut]
threshold = 30.0

[Trigger:ref]
threshold = 60.0
"#;

/// Energy deposited in one detector.
#[derive(Debug)]
struct Energy(f64);

/// Produces a uniformly distributed energy deposit in every detector.
struct Source {
    max_energy: f64,
}

impl Source {
    fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
        let max_energy: f64 = cx.config().get("max_energy")?;
        if max_energy <= 0.0 {
            return Err(cx
                .config()
                .invalid_value("max_energy", "must be positive")
                .into());
        }

        Ok(Self { max_energy })
    }
}

impl Module for Source {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        for detector in event.detectors().to_vec() {
            let energy = event.rng().gen_range(0.0..self.max_energy);
            event.dispatch(Message::for_detector(Energy(energy), detector));
        }

        Ok(())
    }
}

/// Counts the events whose deposit exceeds a threshold.
struct Trigger {
    name: String,
    threshold: f64,
    triggers: AtomicU64,
}

impl Trigger {
    fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
        let filter = cx.own_detector_filter();
        cx.subscribe::<Energy>(filter, Flags::REQUIRED);

        Ok(Self {
            name: cx.identifier().to_string(),
            threshold: cx.config().get("threshold")?,
            triggers: AtomicU64::new(0),
        })
    }
}

impl Module for Trigger {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if event.fetch::<Energy>()?.0 > self.threshold {
            self.triggers.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        println!(
            "{}: {} triggers above {}",
            self.name,
            self.triggers.load(Ordering::Relaxed),
            self.threshold
        );

        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // ---------------
    // Bench assembly.
    // ---------------

    let mut registry = ModuleRegistry::new();
    registry
        .add(ModuleDescriptor::new("Source", Scope::PerDetectorType, Source::new).with_multithreading())
        .unwrap();
    registry
        .add(ModuleDescriptor::new("Trigger", Scope::PerDetector, Trigger::new).with_multithreading())
        .unwrap();

    let mut geometry = GeometryManager::new();
    geometry.add_model(DetectorModel::new(
        "timepix",
        [256, 256],
        [0.055, 0.055],
        0.3,
        Assembly::Hybrid {
            chip_thickness: 0.7,
            bump_height: 0.02,
        },
    ))?;
    geometry.add_detector("ref", "timepix", [0.0, 0.0, 0.0], [0.0; 3])?;
    geometry.add_detector("dut", "timepix", [0.0, 0.0, 100.0], [0.0; 3])?;

    // -----------
    // Simulation.
    // -----------

    let simulation = SimInit::new(registry, ConfigManager::parse(CONFIG)?)
        .with_geometry(geometry)
        .init()?;
    let summary = simulation.run()?;

    println!(
        "{} events processed by {} workers",
        summary.completed_events, summary.workers
    );

    Ok(())
}

//! Example: a beam telescope assembled from the helper modules.
//!
//! Six monolithic planes surround a hybrid device under test. Every plane
//! receives random charge deposits which are digitized and counted. The
//! generic digitizer section is restricted to the telescope model so that the
//! device under test can be given its own threshold.
//!
//! ```text
//! ┌─────────────────┐  DepositedCharges  ┌────────────────────┐  PixelHits  ┌────────────┐
//! │ ChargeDepositor ├───────────────────►│ ThresholdDigitizer ├────────────►│ HitCounter │
//! └─────────────────┘  [per detector]    └────────────────────┘             └────────────┘
//! ```

use std::error::Error;

use pixsim::config::ConfigManager;
use pixsim::geometry::{Assembly, DetectorModel, GeometryManager};
use pixsim::registry::ModuleRegistry;
use pixsim::simulation::SimInit;
use pixsim_util::register_helper_modules;

const CONFIG: &str = r#"
[Pixsim]
number_of_events = 5000
random_seed = 42

[ChargeDepositor]
pixels_per_event = 8
mean_charge = 4000
spread = 1500

[ThresholdDigitizer]
type = "mimosa26"
threshold = 2500

[ThresholdDigitizer:dut]
threshold = 4500

[HitCounter]
"#;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut geometry = GeometryManager::new();
    geometry.add_model(DetectorModel::new(
        "mimosa26",
        [1152, 576],
        [0.0184, 0.0184],
        0.05,
        Assembly::Monolithic,
    ))?;
    geometry.add_model(DetectorModel::new(
        "timepix3",
        [256, 256],
        [0.055, 0.055],
        0.3,
        Assembly::Hybrid {
            chip_thickness: 0.7,
            bump_height: 0.02,
        },
    ))?;
    for (i, z) in [0.0, 150.0, 300.0].into_iter().enumerate() {
        geometry.add_detector(&format!("plane{i}"), "mimosa26", [0.0, 0.0, z], [0.0; 3])?;
    }
    geometry.add_detector("dut", "timepix3", [0.0, 0.0, 450.0], [0.0, 0.0, 0.0])?;
    for (i, z) in [600.0, 750.0, 900.0].into_iter().enumerate() {
        geometry.add_detector(&format!("plane{}", i + 3), "mimosa26", [0.0, 0.0, z], [0.0; 3])?;
    }

    let mut registry = ModuleRegistry::new();
    register_helper_modules(&mut registry).unwrap();

    let simulation = SimInit::new(registry, ConfigManager::parse(CONFIG)?)
        .with_geometry(geometry)
        .init()?;
    println!(
        "running {} module instances on {} workers",
        simulation.modules().len(),
        simulation.workers()
    );
    let summary = simulation.run()?;
    println!("{} events completed", summary.completed_events);

    Ok(())
}

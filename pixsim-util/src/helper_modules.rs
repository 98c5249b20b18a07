//! Helper modules.
//!
//! This module contains a minimal detector chain useful for simulation bench
//! assembly and for exercising the runtime:
//!
//! * [`ChargeDepositor`] generates random charge deposits in the pixels of
//!   its detector,
//! * [`ThresholdDigitizer`] keeps the pixels whose charge passes a threshold,
//! * [`HitCounter`] accumulates the digitized hits of all detectors.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use pixsim::geometry::Detector;
use pixsim::messenger::{Filter, Flags, Message};
use pixsim::module::{BuildContext, Module, ModuleError, Scope};
use pixsim::registry::{ModuleDescriptor, ModuleRegistry};
use pixsim::simulation::Event;

use crate::messages::{DepositedCharges, PixelCharge, PixelHits};

/// Registers all helper modules.
///
/// Fails with the rejected descriptor if a module of the same name is already
/// registered.
pub fn register_helper_modules(registry: &mut ModuleRegistry) -> Result<(), ModuleDescriptor> {
    registry.add(
        ModuleDescriptor::new("ChargeDepositor", Scope::PerDetector, ChargeDepositor::new)
            .with_multithreading(),
    )?;
    registry.add(
        ModuleDescriptor::new(
            "ThresholdDigitizer",
            Scope::PerDetector,
            ThresholdDigitizer::new,
        )
        .with_multithreading(),
    )?;
    registry.add(
        ModuleDescriptor::new("HitCounter", Scope::Global, HitCounter::new).with_multithreading(),
    )?;

    Ok(())
}

fn bound_detector(cx: &BuildContext) -> Result<Arc<Detector>, ModuleError> {
    cx.detector().cloned().ok_or_else(|| {
        ModuleError::fatal(format!("{} is not bound to a detector", cx.identifier()))
    })
}

/// Deposits normally distributed charges in randomly chosen pixels.
///
/// Configuration keys:
///
/// * `pixels_per_event` (default 10),
/// * `mean_charge` in electrons (default 5000),
/// * `spread` in electrons (default 1000).
#[derive(Debug)]
pub struct ChargeDepositor {
    detector: Arc<Detector>,
    pixels_per_event: usize,
    charge: Normal<f64>,
}

impl ChargeDepositor {
    /// Builds the module from its configuration section.
    pub fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
        let detector = bound_detector(cx)?;
        let config = cx.config();
        let pixels_per_event = config.get_or("pixels_per_event", 10)?;
        let mean_charge: f64 = config.get_or("mean_charge", 5000.0)?;
        let spread: f64 = config.get_or("spread", 1000.0)?;
        if spread < 0.0 {
            return Err(config
                .invalid_value("spread", "spread cannot be negative")
                .into());
        }
        let charge = Normal::new(mean_charge, spread)
            .map_err(|e| config.invalid_value("spread", e.to_string()))?;

        Ok(Self {
            detector,
            pixels_per_event,
            charge,
        })
    }
}

impl Module for ChargeDepositor {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if !event.has_subscribers::<DepositedCharges>(Some(self.detector.name())) {
            return Ok(());
        }

        let [columns, rows] = self.detector.model().number_of_pixels();
        let rng = event.rng();
        let charges = (0..self.pixels_per_event)
            .map(|_| PixelCharge {
                pixel: [rng.gen_range(0..columns), rng.gen_range(0..rows)],
                charge: self.charge.sample(&mut *rng).max(0.0),
            })
            .collect();

        event.dispatch(Message::for_detector(
            DepositedCharges { charges },
            self.detector.clone(),
        ));

        Ok(())
    }
}

/// Converts deposited charges into hits above a threshold.
///
/// Configuration keys:
///
/// * `threshold` in electrons (default 1000),
/// * `on_empty`: what to do with an event where no pixel passes the
///   threshold, one of `keep` (default, an empty hit list is dispatched),
///   `skip` (the event is skipped) or `abort` (the run is stopped).
#[derive(Debug)]
pub struct ThresholdDigitizer {
    detector: Arc<Detector>,
    threshold: f64,
    on_empty: OnEmpty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OnEmpty {
    Keep,
    Skip,
    Abort,
}

impl ThresholdDigitizer {
    /// Builds the module from its configuration section.
    pub fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
        let detector = bound_detector(cx)?;
        let threshold: f64 = cx.config().get_or("threshold", 1000.0)?;
        if threshold < 0.0 {
            return Err(cx
                .config()
                .invalid_value("threshold", "threshold cannot be negative")
                .into());
        }
        let on_empty = if cx.config().has("on_empty") {
            match cx
                .config()
                .get_choice("on_empty", &["keep", "skip", "abort"])?
            {
                "skip" => OnEmpty::Skip,
                "abort" => OnEmpty::Abort,
                _ => OnEmpty::Keep,
            }
        } else {
            OnEmpty::Keep
        };
        let filter = cx.own_detector_filter();
        cx.subscribe::<DepositedCharges>(filter, Flags::REQUIRED);

        Ok(Self {
            detector,
            threshold,
            on_empty,
        })
    }
}

impl Module for ThresholdDigitizer {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        let deposits = event.fetch::<DepositedCharges>()?;
        let hits: Vec<PixelCharge> = deposits
            .charges
            .iter()
            .filter(|c| c.charge >= self.threshold)
            .copied()
            .collect();
        debug!(
            detector = self.detector.name(),
            deposits = deposits.charges.len(),
            hits = hits.len(),
            "digitized"
        );
        if hits.is_empty() {
            match self.on_empty {
                OnEmpty::Keep => {}
                OnEmpty::Skip => return Err(ModuleError::skip("no pixel above threshold")),
                OnEmpty::Abort => {
                    return Err(ModuleError::fatal(format!(
                        "no pixel of {} above threshold in event {}",
                        self.detector.name(),
                        event.index()
                    )))
                }
            }
        }

        event.dispatch(Message::for_detector(
            PixelHits { hits },
            self.detector.clone(),
        ));

        Ok(())
    }
}

/// Counts the digitized hits of every detector.
///
/// Configuration keys:
///
/// * `output_file` (optional): file to which the per-detector counts are
///   written at finalization, relative to the configuration file.
#[derive(Debug)]
pub struct HitCounter {
    output_file: Option<PathBuf>,
    events_with_hits: AtomicU64,
    hits: Mutex<BTreeMap<String, u64>>,
}

impl HitCounter {
    /// Builds the module from its configuration section.
    pub fn new(cx: &mut BuildContext) -> Result<Self, ModuleError> {
        let output_file = if cx.config().has("output_file") {
            Some(cx.config().get_path("output_file", false)?)
        } else {
            None
        };
        cx.subscribe::<PixelHits>(Filter::Any, Flags::NONE);

        Ok(Self {
            output_file,
            events_with_hits: AtomicU64::new(0),
            hits: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the number of events in which at least one pixel was hit.
    pub fn events_with_hits(&self) -> u64 {
        self.events_with_hits.load(Ordering::Relaxed)
    }

    /// Returns the accumulated hit count of each detector.
    pub fn hits(&self) -> BTreeMap<String, u64> {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_report(&self, path: &Path) -> Result<(), ModuleError> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# detector hits")?;
        for (detector, hits) in self.hits() {
            writeln!(out, "{detector} {hits}")?;
        }
        writeln!(out, "# events with hits: {}", self.events_with_hits())?;
        out.flush()?;

        Ok(())
    }
}

impl Module for HitCounter {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        let messages = event.fetch_all::<PixelHits>()?;
        if messages.iter().any(|m| !m.is_empty()) {
            self.events_with_hits.fetch_add(1, Ordering::Relaxed);
        }

        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        for message in messages {
            let detector = message.detector_name().unwrap_or("global");
            *hits.entry(detector.to_string()).or_default() += message.len() as u64;
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        for (detector, hits) in self.hits() {
            info!(detector = %detector, hits, "hit count");
        }
        if let Some(path) = &self.output_file {
            self.write_report(path)?;
            info!(path = %path.display(), "hit counts written");
        }

        Ok(())
    }
}

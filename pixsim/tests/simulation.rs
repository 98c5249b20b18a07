//! End-to-end runs of small module pipelines.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use pixsim::config::ConfigManager;
use pixsim::geometry::{Assembly, DetectorModel, GeometryError, GeometryManager};
use pixsim::messenger::{Filter, Flags, Message, MessageError};
use pixsim::module::{InitContext, Module, ModuleError, ModuleState, Scope};
use pixsim::registry::{ModuleDescriptor, ModuleRegistry};
use pixsim::simulation::{Event, ExecutionError, SetupError, SimInit, Simulation};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct Ping(u64);

fn geometry() -> GeometryManager {
    let mut geometry = GeometryManager::new();
    geometry
        .add_model(DetectorModel::new(
            "test",
            [32, 32],
            [0.05, 0.05],
            0.3,
            Assembly::Monolithic,
        ))
        .unwrap();
    geometry
        .add_detector("det1", "test", [0.0, 0.0, 0.0], [0.0; 3])
        .unwrap();
    geometry
        .add_detector("det2", "test", [0.0, 0.0, 20.0], [0.0; 3])
        .unwrap();

    geometry
}

fn build(registry: ModuleRegistry, text: &str) -> Result<Simulation, SetupError> {
    SimInit::new(registry, ConfigManager::parse(text)?)
        .with_geometry(geometry())
        .init()
}

fn lines(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Dispatches a global `Ping` carrying the event index.
struct Emitter {
    deliveries: Arc<AtomicUsize>,
    every: u64,
}

impl Module for Emitter {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if event.index() % self.every == 0 {
            let deliveries = event.dispatch(Message::global(Ping(event.index())));
            self.deliveries.fetch_add(deliveries, Ordering::Relaxed);
        }

        Ok(())
    }
}

fn emitter(every: u64, deliveries: Arc<AtomicUsize>) -> ModuleDescriptor {
    ModuleDescriptor::new("Emitter", Scope::Global, move |_| {
        Ok(Emitter {
            deliveries: deliveries.clone(),
            every,
        })
    })
    .with_multithreading()
}

/// Logs every `Ping` it receives and its finalization.
struct Receiver {
    name: String,
    log: Log,
}

impl Module for Receiver {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        for ping in event.fetch_all::<Ping>()? {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} got {}", self.name, ping.0));
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("finalize {}", self.name));

        Ok(())
    }
}

fn receiver(name: &str, scope: Scope, flags: Flags, log: Log) -> ModuleDescriptor {
    ModuleDescriptor::new(name, scope, move |cx| {
        cx.subscribe::<Ping>(Filter::Any, flags);
        Ok(Receiver {
            name: cx.identifier().to_string(),
            log: log.clone(),
        })
    })
    .with_multithreading()
}

#[test]
fn global_message_reaches_every_detector_instance() {
    let log = Log::default();
    let deliveries = Arc::new(AtomicUsize::new(0));

    let mut registry = ModuleRegistry::new();
    registry.add(emitter(1, deliveries.clone())).unwrap();
    registry
        .add(receiver("Receiver", Scope::PerDetector, Flags::NONE, log.clone()))
        .unwrap();

    let simulation = build(
        registry,
        "[Pixsim]\nnumber_of_events = 1\n[Emitter]\n[Receiver]\n",
    )
    .unwrap();
    let order: Vec<String> = simulation
        .module_identifiers()
        .iter()
        .map(|identifier| identifier.to_string())
        .collect();
    assert_eq!(order, ["Emitter", "Receiver:det1", "Receiver:det2"]);

    let summary = simulation.run().unwrap();
    assert_eq!(summary.completed_events, 1);
    assert_eq!(deliveries.load(Ordering::Relaxed), 2);
    assert_eq!(
        lines(&log),
        [
            "Receiver:det1 got 0",
            "Receiver:det2 got 0",
            "finalize Receiver:det1",
            "finalize Receiver:det2",
        ]
    );
}

/// Dispatches one `Ping` per bound detector, addressed to that detector.
struct Pulser;

impl Module for Pulser {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        for (i, detector) in event.detectors().to_vec().into_iter().enumerate() {
            event.dispatch(Message::for_detector(Ping(i as u64), detector));
        }
        event.dispatch(Message::global(Ping(99)));

        Ok(())
    }
}

#[test]
fn detector_filters_isolate_instances() {
    let log = Log::default();

    let mut registry = ModuleRegistry::new();
    registry
        .add(ModuleDescriptor::new("Pulser", Scope::PerDetectorType, |_| {
            Ok(Pulser)
        }))
        .unwrap();
    registry
        .add(ModuleDescriptor::new("Listener", Scope::PerDetector, {
            let log = log.clone();
            move |cx| {
                let filter = cx.own_detector_filter();
                cx.subscribe::<Ping>(filter, Flags::NONE);
                Ok(Receiver {
                    name: cx.identifier().to_string(),
                    log: log.clone(),
                })
            }
        }))
        .unwrap();

    let simulation = build(
        registry,
        "[Pixsim]\nnumber_of_events = 1\n[Pulser]\n[Listener]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 1);
    simulation.run().unwrap();

    assert_eq!(
        lines(&log),
        [
            "Listener:det1 got 0",
            "Listener:det2 got 1",
            "finalize Listener:det1",
            "finalize Listener:det2",
        ]
    );
}

/// Skips one event.
struct Skipper {
    at: u64,
}

impl Module for Skipper {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if event.index() == self.at {
            return Err(ModuleError::skip("noisy event"));
        }

        Ok(())
    }
}

/// Counts the events it runs on and reports the count at finalization.
struct Counter {
    runs: AtomicU64,
    report: Arc<AtomicU64>,
}

impl Module for Counter {
    fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
        self.runs.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        self.report
            .store(self.runs.load(Ordering::Relaxed), Ordering::Relaxed);

        Ok(())
    }
}

fn counter(name: &str, report: Arc<AtomicU64>) -> ModuleDescriptor {
    ModuleDescriptor::new(name, Scope::Global, move |_| {
        Ok(Counter {
            runs: AtomicU64::new(0),
            report: report.clone(),
        })
    })
    .with_multithreading()
}

#[test]
fn skipped_event_does_not_stop_the_run() {
    let report = Arc::new(AtomicU64::new(0));

    let mut registry = ModuleRegistry::new();
    registry
        .add(
            ModuleDescriptor::new("Skipper", Scope::Global, |cx| {
                Ok(Skipper {
                    at: cx.config().get("skip_event")?,
                })
            })
            .with_multithreading(),
        )
        .unwrap();
    registry.add(counter("Counter", report.clone())).unwrap();

    let simulation = build(
        registry,
        "[Pixsim]\nnumber_of_events = 10\nworkers = 3\n[Skipper]\nskip_event = 6\n[Counter]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 3);

    let summary = simulation.run().unwrap();
    assert_eq!(summary.completed_events, 9);
    assert_eq!(summary.skipped_events, 1);
    assert!(!summary.failed);
    assert_eq!(report.load(Ordering::Relaxed), 9);
}

/// Fails fatally on one event and slows down all others.
struct Failing {
    at: u64,
    log: Log,
}

impl Module for Failing {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if event.index() == self.at {
            return Err(ModuleError::fatal("readout desynchronized"));
        }
        thread::sleep(Duration::from_millis(2));

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        self.log.lock().unwrap().push("finalize Failing".to_string());

        Ok(())
    }
}

/// Counts started events.
struct Started {
    count: Arc<AtomicU64>,
    log: Log,
}

impl Module for Started {
    fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
        self.count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        self.log.lock().unwrap().push("finalize Started".to_string());

        Ok(())
    }
}

#[test]
fn fatal_error_stops_all_workers() {
    let log = Log::default();
    let started = Arc::new(AtomicU64::new(0));

    let mut registry = ModuleRegistry::new();
    registry
        .add(
            ModuleDescriptor::new("Started", Scope::Global, {
                let (count, log) = (started.clone(), log.clone());
                move |_| {
                    Ok(Started {
                        count: count.clone(),
                        log: log.clone(),
                    })
                }
            })
            .with_multithreading(),
        )
        .unwrap();
    registry
        .add(
            ModuleDescriptor::new("Failing", Scope::Global, {
                let log = log.clone();
                move |_| {
                    Ok(Failing {
                        at: 3,
                        log: log.clone(),
                    })
                }
            })
            .with_multithreading(),
        )
        .unwrap();

    let simulation = build(
        registry,
        "[Pixsim]\nnumber_of_events = 100\nworkers = 4\n[Started]\n[Failing]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 4);

    match simulation.run() {
        Err(ExecutionError::ModuleFatal {
            module,
            event,
            source,
            summary,
        }) => {
            assert_eq!(module, "Failing");
            assert_eq!(event, 3);
            assert!(matches!(source, ModuleError::Fatal(_)));
            assert!(summary.failed);

            let started = started.load(Ordering::Relaxed);
            assert_eq!(started, summary.completed_events + 1);
            assert!(started < 100);
            assert!(summary.unprocessed_events() > 0);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(lines(&log), ["finalize Started", "finalize Failing"]);
}

/// Records the index and the first random draw of every event.
struct Sampler {
    draws: Arc<Mutex<BTreeMap<u64, u64>>>,
}

impl Module for Sampler {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        let draw: u64 = event.rng().gen();
        let previous = self.draws.lock().unwrap().insert(event.index(), draw);
        assert!(previous.is_none(), "event {} ran twice", event.index());

        Ok(())
    }
}

fn sample(workers: usize) -> (BTreeMap<u64, u64>, usize) {
    let draws = Arc::new(Mutex::new(BTreeMap::new()));

    let mut registry = ModuleRegistry::new();
    registry
        .add(
            ModuleDescriptor::new("Sampler", Scope::Global, {
                let draws = draws.clone();
                move |_| {
                    Ok(Sampler {
                        draws: draws.clone(),
                    })
                }
            })
            .with_multithreading(),
        )
        .unwrap();

    let text = format!(
        "[Pixsim]\nnumber_of_events = 500\nworkers = {workers}\nrandom_seed = 2024\n[Sampler]\n"
    );
    let summary = build(registry, &text).unwrap().run().unwrap();
    let draws = draws.lock().unwrap().clone();

    (draws, summary.workers)
}

#[test]
fn every_event_runs_exactly_once() {
    let (draws, workers) = sample(4);
    assert_eq!(workers, 4);
    assert!(draws.keys().copied().eq(0..500));
}

#[test]
fn random_draws_do_not_depend_on_workers() {
    let (serial, _) = sample(1);
    let (parallel, _) = sample(4);
    assert_eq!(serial, parallel);
}

#[test]
fn required_messages_gate_modules() {
    let log = Log::default();

    let mut registry = ModuleRegistry::new();
    registry
        .add(emitter(2, Arc::new(AtomicUsize::new(0))))
        .unwrap();
    registry
        .add(receiver("Receiver", Scope::Global, Flags::REQUIRED, log.clone()))
        .unwrap();

    build(
        registry,
        "[Pixsim]\nnumber_of_events = 6\nworkers = 1\n[Emitter]\n[Receiver]\n",
    )
    .unwrap()
    .run()
    .unwrap();

    assert_eq!(
        lines(&log),
        [
            "Receiver got 0",
            "Receiver got 2",
            "Receiver got 4",
            "finalize Receiver"
        ]
    );
}

/// Fetches a message type it never subscribed to.
struct Careless;

impl Module for Careless {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        event.fetch::<Ping>()?;

        Ok(())
    }
}

#[test]
fn unexpected_message_is_fatal() {
    let mut registry = ModuleRegistry::new();
    registry
        .add(ModuleDescriptor::new("Careless", Scope::Global, |_| {
            Ok(Careless)
        }))
        .unwrap();

    let result = build(registry, "[Pixsim]\nnumber_of_events = 5\n[Careless]\n")
        .unwrap()
        .run();
    match result {
        Err(ExecutionError::ModuleFatal { source, event, .. }) => {
            assert_eq!(event, 0);
            assert!(matches!(
                source,
                ModuleError::Message(MessageError::Unexpected { .. })
            ));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Rejects its configuration at initialization.
struct Picky;

impl Module for Picky {
    fn init(&mut self, cx: &mut InitContext) -> Result<(), ModuleError> {
        let gain: f64 = cx.config().get_or("gain", 1.0)?;
        if gain <= 0.0 {
            return Err(cx.config().invalid_value("gain", "gain must be positive").into());
        }

        Ok(())
    }

    fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
        Ok(())
    }
}

fn setup_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .add(ModuleDescriptor::new("Picky", Scope::Global, |_| Ok(Picky)))
        .unwrap();
    registry
        .add(receiver("Receiver", Scope::PerDetector, Flags::NONE, Log::default()))
        .unwrap();

    registry
}

#[test]
fn setup_errors_abort_before_any_event() {
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\n[Picky]\ngain = -2\n"),
        Err(SetupError::InvalidConfiguration { module, .. }) if module == "Picky"
    ));
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\n[Picky]\ngain = high\n"),
        Err(SetupError::InvalidConfiguration { .. })
    ));
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\n[Digitizer]\n"),
        Err(SetupError::UnresolvedModule { .. })
    ));
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\n[Receiver:det3]\n"),
        Err(SetupError::UnknownDetector { detector, .. }) if detector == "det3"
    ));
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\n[Picky]\n[Picky]\n"),
        Err(SetupError::DuplicateInstance { identifier }) if identifier == "Picky"
    ));
    assert!(matches!(
        build(setup_registry(), "[Pixsim]\nnumber_of_events = many\n[Picky]\n"),
        Err(SetupError::Config(_))
    ));
}

#[test]
fn worker_count_fallbacks() {
    // `Picky` does not support multithreading.
    let simulation = build(
        setup_registry(),
        "[Pixsim]\nnumber_of_events = 10\nworkers = 4\n[Picky]\n[Receiver]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 1);

    let simulation = build(
        setup_registry(),
        "[Pixsim]\nnumber_of_events = 10\nworkers = 4\nmultithreading = false\n[Receiver]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 1);

    let simulation = build(
        setup_registry(),
        "[Pixsim]\nnumber_of_events = 2\nworkers = 8\n[Receiver]\n",
    )
    .unwrap();
    assert_eq!(simulation.workers(), 2);
}

/// Publishes setup data for later modules.
struct FieldMap;

impl Module for FieldMap {
    fn init(&mut self, cx: &mut InitContext) -> Result<(), ModuleError> {
        cx.global_config_mut().set("magnetic_field", 1.5);
        cx.geometry()
            .detector("det1")?
            .set_external_object("field_map", vec![0.5, 1.0])?;

        Ok(())
    }

    fn run(&self, _: &mut Event) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Consumes setup data published by `FieldMap`.
struct FieldUser {
    field: f64,
    log: Log,
}

impl Module for FieldUser {
    fn init(&mut self, cx: &mut InitContext) -> Result<(), ModuleError> {
        self.field = cx.global_config().get("magnetic_field")?;

        Ok(())
    }

    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        let detector = &event.detectors()[0];
        let map = detector.external_object::<Vec<f64>>("field_map")?;
        let late = detector.set_external_object("late", 0_u8);
        assert!(matches!(
            late,
            Err(GeometryError::ExternalObjectsSealed { .. })
        ));

        self.log
            .lock()
            .unwrap()
            .push(format!("{} {:?}", self.field, map));

        Ok(())
    }
}

#[test]
fn setup_data_flows_to_later_modules() {
    let log = Log::default();

    let mut registry = ModuleRegistry::new();
    registry
        .add(ModuleDescriptor::new("FieldMap", Scope::Global, |_| {
            Ok(FieldMap)
        }))
        .unwrap();
    registry
        .add(ModuleDescriptor::new("FieldUser", Scope::PerDetector, {
            let log = log.clone();
            move |_| {
                Ok(FieldUser {
                    field: 0.0,
                    log: log.clone(),
                })
            }
        }))
        .unwrap();

    let simulation = build(
        registry,
        "[Pixsim]\nnumber_of_events = 1\n[FieldMap]\n[FieldUser:det1]\n",
    )
    .unwrap();
    assert_eq!(
        simulation
            .global_config()
            .get::<f64>("magnetic_field")
            .unwrap(),
        1.5
    );
    assert!(simulation
        .modules()
        .iter()
        .all(|instance| instance.state() == ModuleState::Initialized));
    simulation.run().unwrap();

    assert_eq!(lines(&log), ["1.5 [0.5, 1.0]"]);
}

/// Panics on one event.
struct Unstable {
    log: Log,
}

impl Module for Unstable {
    fn run(&self, event: &mut Event) -> Result<(), ModuleError> {
        if event.index() == 1 {
            panic!("corrupted state");
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ModuleError> {
        self.log.lock().unwrap().push("finalize Unstable".to_string());

        Ok(())
    }
}

#[test]
fn worker_panic_is_reported() {
    let log = Log::default();

    let mut registry = ModuleRegistry::new();
    registry
        .add(
            ModuleDescriptor::new("Unstable", Scope::Global, {
                let log = log.clone();
                move |_| Ok(Unstable { log: log.clone() })
            })
            .with_multithreading(),
        )
        .unwrap();

    let result = build(
        registry,
        "[Pixsim]\nnumber_of_events = 50\nworkers = 2\n[Unstable]\n",
    )
    .unwrap()
    .run();

    match result {
        Err(error @ ExecutionError::WorkerPanic { .. }) => {
            assert!(error.summary().failed);
            assert!(error.summary().completed_events < 50);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(lines(&log), ["finalize Unstable"]);
}

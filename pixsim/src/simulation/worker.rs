use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crossbeam_utils::CachePadded;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, debug_span, error, info_span, trace, trace_span};

use crate::messenger::{EventBuffer, Messenger};
use crate::module::ModuleError;
use crate::registry::ModuleInstance;

use super::Event;

/// First fatal error of a run.
#[derive(Debug)]
pub(crate) struct Failure {
    pub(crate) module: String,
    pub(crate) event: u64,
    pub(crate) source: ModuleError,
}

/// State shared by all workers of a run.
pub(crate) struct Shared<'a> {
    modules: &'a [ModuleInstance],
    names: Vec<String>,
    required: Vec<bool>,
    messenger: &'a Messenger,
    number_of_events: u64,
    seed: u64,
    next_event: CachePadded<AtomicU64>,
    stop: AtomicBool,
    completed: AtomicU64,
    skipped: AtomicU64,
    failure: Mutex<Option<Failure>>,
}

impl<'a> Shared<'a> {
    pub(crate) fn new(
        modules: &'a [ModuleInstance],
        messenger: &'a Messenger,
        number_of_events: u64,
        seed: u64,
    ) -> Self {
        Self {
            modules,
            names: modules.iter().map(|m| m.identifier().to_string()).collect(),
            required: modules.iter().map(|m| messenger.has_required(m.id)).collect(),
            messenger,
            number_of_events,
            seed,
            next_event: CachePadded::new(AtomicU64::new(0)),
            stop: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn take_failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Requests all workers to stop claiming events.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Claims the next event index, or returns `None` once all events are
    /// claimed or a stop was requested.
    fn claim(&self) -> Option<u64> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        let index = self.next_event.fetch_add(1, Ordering::Relaxed);

        (index < self.number_of_events).then_some(index)
    }

    fn fail(&self, failure: Failure) {
        self.stop();
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(failure);
        }
    }
}

/// Sets the stop flag if the worker unwinds.
struct PanicGuard<'a, 'b>(&'a Shared<'b>);

impl Drop for PanicGuard<'_, '_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.stop();
        }
    }
}

/// Claims and processes events until none is left or the run is stopped.
pub(crate) fn run_worker(id: usize, shared: &Shared) {
    let _guard = PanicGuard(shared);
    let _span = info_span!("worker", id).entered();
    let mut buffer = shared.messenger.event_buffer();
    let mut processed = 0u64;

    while let Some(index) = shared.claim() {
        let result = process_event(index, shared, &mut buffer);
        buffer.clear();
        processed += 1;

        match result {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err((module, e)) if e.is_skip() => {
                debug!(event = index, module = %shared.names[module], "{}", e);
                shared.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err((module, e)) => {
                error!(event = index, module = %shared.names[module], "{}", e);
                shared.fail(Failure {
                    module: shared.names[module].clone(),
                    event: index,
                    source: e,
                });
                break;
            }
        }
    }

    debug!(processed, "worker finished");
}

/// Runs every module on one event, in order.
///
/// On error, returns the position of the failing module.
fn process_event(
    index: u64,
    shared: &Shared,
    buffer: &mut EventBuffer,
) -> Result<(), (usize, ModuleError)> {
    let _span = debug_span!("event", index).entered();
    let mut rng = StdRng::seed_from_u64(event_seed(shared.seed, index));

    for (position, instance) in shared.modules.iter().enumerate() {
        let name = &shared.names[position];
        if shared.required[position] {
            if let Some(missing) = shared.messenger.missing_required(buffer, instance.id) {
                trace!(module = %name, message = missing, "required message not received, module not run");
                continue;
            }
        }

        let _span = trace_span!("module", name = %name).entered();
        let mut event = Event {
            index,
            module: instance.id,
            origin: name,
            detectors: &instance.detectors,
            messenger: shared.messenger,
            buffer: &mut *buffer,
            rng: &mut rng,
        };
        instance
            .module
            .run(&mut event)
            .map_err(|e| (position, e))?;
    }

    Ok(())
}

/// Derives the seed of an event from the run seed (splitmix64 finalizer).
pub(crate) fn event_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed.wrapping_add(index.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);

    z ^ (z >> 31)
}

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::geometry::Detector;
use crate::messenger::{EventBuffer, Message, MessageError, MessageRecord, Messenger};
use crate::module::ModuleId;

/// Per-event context handed to [`Module::run`](crate::module::Module::run).
///
/// The context gives access to the messages received by the running module
/// in the current event, lets the module dispatch new messages, and provides
/// the random engine of the event. It offers no way to subscribe: the
/// subscription table is frozen once the simulation is initialized.
pub struct Event<'a> {
    pub(crate) index: u64,
    pub(crate) module: ModuleId,
    pub(crate) origin: &'a str,
    pub(crate) detectors: &'a [Arc<Detector>],
    pub(crate) messenger: &'a Messenger,
    pub(crate) buffer: &'a mut EventBuffer,
    pub(crate) rng: &'a mut StdRng,
}

impl Event<'_> {
    /// Returns the zero-based index of the event.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Returns the random engine of the event.
    ///
    /// The engine is seeded from the run seed and the event index, so draws
    /// do not depend on which worker processes the event. Modules of an event
    /// share the engine in execution order.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    /// Returns the identifier of the running module.
    pub fn module(&self) -> &str {
        self.origin
    }

    /// Returns the detectors the running module is bound to.
    pub fn detectors(&self) -> &[Arc<Detector>] {
        self.detectors
    }

    /// Dispatches a message and returns the number of subscriptions it was
    /// delivered to.
    pub fn dispatch<T>(&mut self, message: Message<T>) -> usize
    where
        T: Send + Sync + 'static,
    {
        self.dispatch_shared(&Arc::new(message))
    }

    /// Dispatches an already shared message.
    ///
    /// This makes it possible to dispatch the same message several times.
    pub fn dispatch_shared<T>(&mut self, message: &Arc<Message<T>>) -> usize
    where
        T: Send + Sync + 'static,
    {
        self.messenger
            .dispatch(&mut *self.buffer, self.origin, message.clone())
    }

    /// Returns the latest message with payload `T` received in this event.
    ///
    /// Fails with [`MessageError::Unexpected`] if the module never subscribed
    /// to `T`, and with [`MessageError::Missing`] if nothing was received.
    pub fn fetch<T>(&self) -> Result<Arc<Message<T>>, MessageError>
    where
        T: Send + Sync + 'static,
    {
        self.messenger.fetch(&*self.buffer, self.module)
    }

    /// Returns all messages with payload `T` received in this event, in
    /// dispatch order.
    pub fn fetch_all<T>(&self) -> Result<Vec<Arc<Message<T>>>, MessageError>
    where
        T: Send + Sync + 'static,
    {
        self.messenger.fetch_all(&*self.buffer, self.module)
    }

    /// Checks whether a message with payload `T` addressed to `detector`
    /// would reach any subscription.
    pub fn has_subscribers<T: 'static>(&self, detector: Option<&str>) -> bool {
        self.messenger.has_subscribers_for::<T>(detector)
    }

    /// Returns the messages dispatched so far in this event.
    pub fn records(&self) -> &[MessageRecord] {
        self.buffer.records()
    }
}

impl fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("index", &self.index)
            .field("module", &self.origin)
            .field("messages", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

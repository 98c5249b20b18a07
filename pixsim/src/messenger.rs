//! Typed publish/subscribe message bus.
//!
//! # Subscriptions
//!
//! Modules declare the message types they consume while they are being built
//! or initialized, through [`BuildContext::subscribe`] and
//! [`InitContext::subscribe`]. A subscription binds a payload type, a
//! [`Filter`] and a set of [`Flags`] to the subscribing module. Once the
//! simulation is initialized the subscription table is frozen and shared by
//! reference across all workers; the per-event [`Event`] context exposes no
//! way to subscribe.
//!
//! # Delivery
//!
//! A message dispatched during an event is delivered synchronously, in
//! subscription order, to every subscription of the same payload type whose
//! filter accepts the message:
//!
//! * [`Filter::Any`] accepts all messages of the type,
//! * [`Filter::Detector`] accepts only messages addressed to that detector,
//!   never global messages.
//!
//! Deliveries are kept in the [`EventBuffer`] of the worker until the end of
//! the event. Dispatching the same message twice delivers it twice.
//!
//! A subscription flagged [`Flags::REQUIRED`] makes the message mandatory:
//! a module is not run in an event where one of its required subscriptions
//! received nothing.
//!
//! [`BuildContext::subscribe`]: crate::module::BuildContext::subscribe
//! [`InitContext::subscribe`]: crate::module::InitContext::subscribe
//! [`Event`]: crate::simulation::Event

mod event_buffer;
mod message;

use std::any::{self, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::module::ModuleId;

pub use event_buffer::{EventBuffer, MessageRecord};
pub use message::Message;

use event_buffer::AnyMessage;

/// Error raised by message delivery or retrieval.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The module fetched a message type it never subscribed to.
    #[error("module fetched message type {type_name} without subscribing to it")]
    Unexpected {
        /// Requested payload type.
        type_name: &'static str,
    },
    /// A dispatched message reached no subscription.
    #[error("message of type {type_name} dispatched by {origin} has no subscriber")]
    NoSubscriber {
        /// Payload type.
        type_name: &'static str,
        /// Identifier of the dispatching module.
        origin: String,
    },
    /// No message of the subscribed type was received in this event.
    #[error("no message of type {type_name} was received in this event")]
    Missing {
        /// Requested payload type.
        type_name: &'static str,
    },
}

/// Detector filter of a subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Accepts every message of the subscribed type.
    #[default]
    Any,
    /// Accepts only messages addressed to the named detector.
    Detector(String),
}

impl Filter {
    /// Creates a filter for the named detector.
    pub fn detector(name: impl Into<String>) -> Self {
        Self::Detector(name.into())
    }

    /// Checks whether a message addressed to `detector` passes the filter.
    pub fn accepts(&self, detector: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Detector(name) => detector == Some(name.as_str()),
        }
    }
}

/// Delivery flags of a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No flag.
    pub const NONE: Self = Self(0);
    /// The module is skipped in events where the subscription received
    /// nothing.
    pub const REQUIRED: Self = Self(1);

    /// Checks whether all flags of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

type Handler = Box<dyn Fn(&AnyMessage) + Send + Sync>;

struct Subscription {
    module: ModuleId,
    type_name: &'static str,
    filter: Filter,
    flags: Flags,
    handler: Option<Handler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("module", &self.module)
            .field("type_name", &self.type_name)
            .field("filter", &self.filter)
            .field("flags", &self.flags)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// The subscription table of a simulation.
///
/// The table is filled during setup and only read once events are processed.
/// Message storage lives in the [`EventBuffer`] owned by each worker, which
/// is created with [`Messenger::event_buffer`].
#[derive(Debug, Default)]
pub struct Messenger {
    subscriptions: Vec<Subscription>,
    by_type: HashMap<TypeId, Vec<usize>>,
    /// Payload type and origin of the undelivered messages already warned of.
    unmatched: Mutex<HashSet<(&'static str, String)>>,
}

impl Messenger {
    /// Creates an empty subscription table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription of `module` to messages with payload `T`.
    pub(crate) fn subscribe<T>(&mut self, module: ModuleId, filter: Filter, flags: Flags)
    where
        T: Send + Sync + 'static,
    {
        self.add::<T>(module, filter, flags, None);
    }

    /// Registers a subscription whose handler is called synchronously on
    /// every delivery, within the dispatching module's `run`.
    pub(crate) fn subscribe_with<T, F>(
        &mut self,
        module: ModuleId,
        filter: Filter,
        flags: Flags,
        handler: F,
    ) where
        T: Send + Sync + 'static,
        F: Fn(&Message<T>) + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |message: &AnyMessage| {
            if let Some(message) = message.downcast_ref::<Message<T>>() {
                handler(message);
            }
        });
        self.add::<T>(module, filter, flags, Some(handler));
    }

    fn add<T: 'static>(
        &mut self,
        module: ModuleId,
        filter: Filter,
        flags: Flags,
        handler: Option<Handler>,
    ) {
        let type_name = any::type_name::<T>();
        trace!(module = module.index(), message = type_name, ?filter, "subscribing");

        let index = self.subscriptions.len();
        self.subscriptions.push(Subscription {
            module,
            type_name,
            filter,
            flags,
            handler,
        });
        self.by_type.entry(TypeId::of::<T>()).or_default().push(index);
    }

    /// Checks whether any subscription exists for payload type `T`.
    ///
    /// Producers can use this to avoid building messages nobody consumes.
    pub fn has_subscribers<T: 'static>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Checks whether a message with payload `T` addressed to `detector`
    /// would be delivered anywhere.
    pub fn has_subscribers_for<T: 'static>(&self, detector: Option<&str>) -> bool {
        self.subscriptions_of::<T>()
            .iter()
            .any(|&i| self.subscriptions[i].filter.accepts(detector))
    }

    /// Returns the total number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Creates an empty event buffer sized for this table.
    pub fn event_buffer(&self) -> EventBuffer {
        EventBuffer::new(self.subscriptions.len())
    }

    /// Delivers a message to all matching subscriptions and records it in the
    /// buffer.
    ///
    /// Returns the number of deliveries. A message without any delivery is
    /// logged as a warning the first time its payload type is dispatched
    /// without delivery by a given origin, and at debug level afterwards.
    pub(crate) fn dispatch<T>(
        &self,
        buffer: &mut EventBuffer,
        origin: &str,
        message: Arc<Message<T>>,
    ) -> usize
    where
        T: Send + Sync + 'static,
    {
        let type_name = any::type_name::<T>();
        let detector = message.detector_name().map(str::to_string);
        let sequence = buffer.record(MessageRecord {
            type_name,
            detector: detector.clone(),
            origin: origin.to_string(),
            deliveries: 0,
        });
        let detector = detector.as_deref();

        let message: AnyMessage = message;
        let mut deliveries = 0;
        for &i in self.subscriptions_of::<T>() {
            let subscription = &self.subscriptions[i];
            if !subscription.filter.accepts(detector) {
                continue;
            }
            if let Some(handler) = &subscription.handler {
                handler(&message);
            }
            buffer.deliver(i, sequence, message.clone());
            deliveries += 1;
        }
        buffer.record_mut(sequence).deliveries = deliveries;

        if deliveries == 0 {
            let error = MessageError::NoSubscriber {
                type_name,
                origin: origin.to_string(),
            };
            if self.first_unmatched(type_name, origin) {
                warn!(detector, "{}", error);
            } else {
                debug!(detector, "{}", error);
            }
        } else {
            trace!(message = type_name, detector, deliveries, "dispatched");
        }

        deliveries
    }

    /// Returns the latest message with payload `T` received by `module` in
    /// this event.
    pub(crate) fn fetch<T>(
        &self,
        buffer: &EventBuffer,
        module: ModuleId,
    ) -> Result<Arc<Message<T>>, MessageError>
    where
        T: Send + Sync + 'static,
    {
        let latest = self
            .deliveries::<T>(buffer, module)?
            .max_by_key(|(sequence, _)| *sequence)
            .map(|(_, message)| message);

        match latest {
            Some(message) => downcast(message),
            None => Err(MessageError::Missing {
                type_name: any::type_name::<T>(),
            }),
        }
    }

    /// Returns all messages with payload `T` received by `module` in this
    /// event, in dispatch order.
    pub(crate) fn fetch_all<T>(
        &self,
        buffer: &EventBuffer,
        module: ModuleId,
    ) -> Result<Vec<Arc<Message<T>>>, MessageError>
    where
        T: Send + Sync + 'static,
    {
        let mut deliveries: Vec<_> = self.deliveries::<T>(buffer, module)?.collect();
        deliveries.sort_by_key(|(sequence, _)| *sequence);

        deliveries
            .into_iter()
            .map(|(_, message)| downcast(message))
            .collect()
    }

    /// Returns the payload type of the first required subscription of
    /// `module` that received nothing in this event.
    pub(crate) fn missing_required(
        &self,
        buffer: &EventBuffer,
        module: ModuleId,
    ) -> Option<&'static str> {
        self.subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.module == module && s.flags.contains(Flags::REQUIRED))
            .find(|(i, _)| buffer.inbox(*i).is_empty())
            .map(|(_, s)| s.type_name)
    }

    /// Checks whether `module` has any required subscription.
    pub(crate) fn has_required(&self, module: ModuleId) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.module == module && s.flags.contains(Flags::REQUIRED))
    }

    /// Records an undelivered message and checks whether it is the first one
    /// with this payload type and origin.
    fn first_unmatched(&self, type_name: &'static str, origin: &str) -> bool {
        let mut unmatched = self.unmatched.lock().unwrap_or_else(PoisonError::into_inner);
        if unmatched.contains(&(type_name, origin.to_string())) {
            return false;
        }
        unmatched.insert((type_name, origin.to_string()))
    }

    fn subscriptions_of<T: 'static>(&self) -> &[usize] {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn deliveries<'a, T: 'static>(
        &'a self,
        buffer: &'a EventBuffer,
        module: ModuleId,
    ) -> Result<impl Iterator<Item = (usize, &'a AnyMessage)> + 'a, MessageError> {
        let owned: Vec<usize> = self
            .subscriptions_of::<T>()
            .iter()
            .copied()
            .filter(|&i| self.subscriptions[i].module == module)
            .collect();
        if owned.is_empty() {
            return Err(MessageError::Unexpected {
                type_name: any::type_name::<T>(),
            });
        }

        Ok(owned.into_iter().flat_map(move |i| {
            buffer
                .inbox(i)
                .iter()
                .map(|(sequence, message)| (*sequence, message))
        }))
    }
}

fn downcast<T>(message: &AnyMessage) -> Result<Arc<Message<T>>, MessageError>
where
    T: Send + Sync + 'static,
{
    message
        .clone()
        .downcast::<Message<T>>()
        .map_err(|_| MessageError::Unexpected {
            type_name: any::type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::geometry::{Assembly, DetectorModel, GeometryManager};

    #[derive(Debug, PartialEq)]
    struct Charge(f64);

    #[derive(Debug)]
    struct Hits(u32);

    fn geometry() -> GeometryManager {
        let mut geometry = GeometryManager::new();
        geometry
            .add_model(DetectorModel::new(
                "test",
                [16, 16],
                [0.05, 0.05],
                0.3,
                Assembly::Monolithic,
            ))
            .unwrap();
        geometry.add_detector("det1", "test", [0.0; 3], [0.0; 3]).unwrap();
        geometry.add_detector("det2", "test", [0.0; 3], [0.0; 3]).unwrap();
        geometry
    }

    #[test]
    fn filters_select_detectors() {
        let geometry = geometry();
        let det1 = geometry.detector("det1").unwrap().clone();
        let det2 = geometry.detector("det2").unwrap().clone();

        let mut messenger = Messenger::new();
        messenger.subscribe::<Charge>(ModuleId(0), Filter::Any, Flags::NONE);
        messenger.subscribe::<Charge>(ModuleId(1), Filter::detector("det1"), Flags::NONE);
        let mut buffer = messenger.event_buffer();

        let global = Arc::new(Message::global(Charge(1.0)));
        assert_eq!(messenger.dispatch(&mut buffer, "Source", global), 1);
        let first = Arc::new(Message::for_detector(Charge(2.0), det1));
        assert_eq!(messenger.dispatch(&mut buffer, "Source", first), 2);
        let second = Arc::new(Message::for_detector(Charge(3.0), det2));
        assert_eq!(messenger.dispatch(&mut buffer, "Source", second), 1);

        let any: Vec<f64> = messenger
            .fetch_all::<Charge>(&buffer, ModuleId(0))
            .unwrap()
            .iter()
            .map(|m| m.0)
            .collect();
        assert_eq!(any, [1.0, 2.0, 3.0]);

        let filtered = messenger.fetch_all::<Charge>(&buffer, ModuleId(1)).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].detector_name(), Some("det1"));
        assert_eq!(**filtered[0], Charge(2.0));
    }

    #[test]
    fn repeated_dispatch_delivers_twice() {
        let mut messenger = Messenger::new();
        messenger.subscribe::<Hits>(ModuleId(3), Filter::Any, Flags::NONE);
        let mut buffer = messenger.event_buffer();

        let message = Arc::new(Message::global(Hits(4)));
        messenger.dispatch(&mut buffer, "Source", message.clone());
        messenger.dispatch(&mut buffer, "Source", message);

        let received = messenger.fetch_all::<Hits>(&buffer, ModuleId(3)).unwrap();
        assert_eq!(received.len(), 2);
        assert!(Arc::ptr_eq(&received[0], &received[1]));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.records()[1].origin(), "Source");
    }

    #[test]
    fn fetch_errors() {
        let mut messenger = Messenger::new();
        messenger.subscribe::<Hits>(ModuleId(0), Filter::Any, Flags::NONE);
        let mut buffer = messenger.event_buffer();

        assert!(matches!(
            messenger.fetch::<Charge>(&buffer, ModuleId(0)),
            Err(MessageError::Unexpected { .. })
        ));
        assert!(matches!(
            messenger.fetch::<Hits>(&buffer, ModuleId(0)),
            Err(MessageError::Missing { .. })
        ));

        messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Hits(1))));
        messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Hits(2))));
        assert_eq!(messenger.fetch::<Hits>(&buffer, ModuleId(0)).unwrap().0, 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(matches!(
            messenger.fetch::<Hits>(&buffer, ModuleId(0)),
            Err(MessageError::Missing { .. })
        ));
    }

    #[test]
    fn unsubscribed_dispatch_is_not_an_error() {
        let messenger = Messenger::new();
        let mut buffer = messenger.event_buffer();

        assert!(!messenger.has_subscribers::<Hits>());
        let deliveries =
            messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Hits(1))));
        assert_eq!(deliveries, 0);
        assert_eq!(buffer.records()[0].deliveries(), 0);
    }

    #[test]
    fn undelivered_messages_are_reported_once_per_origin() {
        let messenger = Messenger::new();
        let mut buffer = messenger.event_buffer();

        for _ in 0..3 {
            messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Hits(1))));
        }
        assert!(!messenger.first_unmatched(any::type_name::<Hits>(), "Source"));
        assert!(messenger.first_unmatched(any::type_name::<Hits>(), "Other"));
        assert!(messenger.first_unmatched(any::type_name::<Charge>(), "Source"));
        assert!(!messenger.first_unmatched(any::type_name::<Charge>(), "Source"));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn required_subscriptions_and_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut messenger = Messenger::new();
        messenger.subscribe::<Hits>(ModuleId(0), Filter::Any, Flags::REQUIRED);
        messenger.subscribe_with::<Charge, _>(ModuleId(1), Filter::Any, Flags::NONE, {
            let calls = calls.clone();
            move |message: &Message<Charge>| {
                assert_eq!(message.0, 7.0);
                calls.fetch_add(1, Ordering::Relaxed);
            }
        });
        let mut buffer = messenger.event_buffer();

        assert!(messenger.has_required(ModuleId(0)));
        assert!(!messenger.has_required(ModuleId(1)));
        assert_eq!(
            messenger.missing_required(&buffer, ModuleId(0)),
            Some(any::type_name::<Hits>())
        );

        messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Hits(1))));
        messenger.dispatch(&mut buffer, "Source", Arc::new(Message::global(Charge(7.0))));
        assert_eq!(messenger.missing_required(&buffer, ModuleId(0)), None);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}

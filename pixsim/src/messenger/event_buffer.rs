use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub(crate) type AnyMessage = Arc<dyn Any + Send + Sync>;

/// A message received by a subscription, tagged with the position of the
/// message in the dispatch order of the event.
pub(crate) type Delivery = (usize, AnyMessage);

/// Per-worker storage of the messages dispatched during one event.
///
/// Every dispatched message is recorded in dispatch order, and every delivery
/// is appended to the inbox of the receiving subscription. A worker owns
/// exactly one buffer and clears it between events, so messages never outlive
/// their event and never cross workers.
pub struct EventBuffer {
    records: Vec<MessageRecord>,
    inboxes: Vec<Vec<Delivery>>,
}

impl EventBuffer {
    /// Creates an empty buffer with one inbox per subscription.
    pub(crate) fn new(subscriptions: usize) -> Self {
        Self {
            records: Vec::new(),
            inboxes: (0..subscriptions).map(|_| Vec::new()).collect(),
        }
    }

    /// Returns the messages dispatched so far in this event, in dispatch
    /// order.
    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    /// Returns the number of messages dispatched so far in this event.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no message was dispatched in this event.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops all messages and deliveries.
    ///
    /// Inbox allocations are kept for the next event.
    pub fn clear(&mut self) {
        self.records.clear();
        for inbox in &mut self.inboxes {
            inbox.clear();
        }
    }

    /// Records a dispatched message and returns its sequence number.
    pub(crate) fn record(&mut self, record: MessageRecord) -> usize {
        self.records.push(record);

        self.records.len() - 1
    }

    pub(crate) fn deliver(&mut self, subscription: usize, sequence: usize, message: AnyMessage) {
        self.inboxes[subscription].push((sequence, message));
    }

    pub(crate) fn inbox(&self, subscription: usize) -> &[Delivery] {
        &self.inboxes[subscription]
    }

    pub(crate) fn record_mut(&mut self, sequence: usize) -> &mut MessageRecord {
        &mut self.records[sequence]
    }
}

impl fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

/// Trace of a dispatched message.
#[derive(Clone, Debug)]
pub struct MessageRecord {
    pub(crate) type_name: &'static str,
    pub(crate) detector: Option<String>,
    pub(crate) origin: String,
    pub(crate) deliveries: usize,
}

impl MessageRecord {
    /// Returns the name of the payload type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the name of the detector the message was addressed to.
    pub fn detector(&self) -> Option<&str> {
        self.detector.as_deref()
    }

    /// Returns the identifier of the module that dispatched the message.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns the number of subscriptions that received the message.
    pub fn deliveries(&self) -> usize {
        self.deliveries
    }
}

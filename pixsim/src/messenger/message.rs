use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::geometry::Detector;

/// An immutable typed payload exchanged between modules within one event.
///
/// A message is either global or addressed to a single detector. Global
/// messages only reach unfiltered subscriptions; detector messages reach
/// unfiltered subscriptions and those filtering on that detector.
///
/// Messages are shared through `Arc` between the event buffer and every
/// subscription that received them, and are released when the event buffer
/// is cleared at the end of the event.
pub struct Message<T> {
    payload: T,
    detector: Option<Arc<Detector>>,
}

impl<T> Message<T> {
    /// Creates a message that is not bound to any detector.
    pub fn global(payload: T) -> Self {
        Self {
            payload,
            detector: None,
        }
    }

    /// Creates a message addressed to a detector.
    pub fn for_detector(payload: T, detector: Arc<Detector>) -> Self {
        Self {
            payload,
            detector: Some(detector),
        }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns the detector the message is addressed to, if any.
    pub fn detector(&self) -> Option<&Arc<Detector>> {
        self.detector.as_ref()
    }

    /// Returns the name of the detector the message is addressed to, if any.
    pub fn detector_name(&self) -> Option<&str> {
        self.detector.as_deref().map(Detector::name)
    }
}

impl<T> Deref for Message<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("detector", &self.detector_name())
            .finish()
    }
}

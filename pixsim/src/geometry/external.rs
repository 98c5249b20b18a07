use std::any::{self, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Failure to attach or retrieve an external object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExternalObjectFault {
    Missing,
    TypeMismatch { expected: &'static str },
    Sealed,
}

/// A side table of opaque, type-erased objects keyed by name.
///
/// Objects are attached during setup by collaborators that need to cache
/// handles against a detector; the table is sealed before workers start, after
/// which it can only be read.
#[derive(Default)]
pub(crate) struct ExternalObjects {
    objects: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    sealed: AtomicBool,
}

impl ExternalObjects {
    /// Attaches an object, replacing any previous object with the same key.
    pub(crate) fn insert<T>(&self, key: &str, object: T) -> Result<(), ExternalObjectFault>
    where
        T: Any + Send + Sync,
    {
        if self.sealed.load(Ordering::Acquire) {
            return Err(ExternalObjectFault::Sealed);
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(object));

        Ok(())
    }

    /// Returns a shared handle to the object if it exists and has type `T`.
    pub(crate) fn get<T>(&self, key: &str) -> Result<Arc<T>, ExternalObjectFault>
    where
        T: Any + Send + Sync,
    {
        let object = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or(ExternalObjectFault::Missing)?;

        object
            .downcast::<T>()
            .map_err(|_| ExternalObjectFault::TypeMismatch {
                expected: any::type_name::<T>(),
            })
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ExternalObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = objects.keys().collect();
        keys.sort();

        write!(f, "ExternalObjects {keys:?}")
    }
}

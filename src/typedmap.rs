//! Typed per-session user data.
//!
//! Each [`Key<T>`] binds its value type at construction, so lookups are
//! type-checked at the call site instead of downcast-and-hope at runtime.
//! Keys are cheap to copy and are usually created once as statics by the
//! application.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// A typed key into a [`TypedMap`].
pub struct Key<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Key {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

/// Heterogeneous map keyed by [`Key<T>`]. The dynamic cast is an internal
/// detail; it cannot fail for values stored through the typed interface.
#[derive(Default)]
pub struct TypedMap {
    entries: HashMap<u64, Box<dyn Any + Send + Sync>>,
}

impl TypedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, key: Key<T>, value: T) {
        self.entries.insert(key.id, Box::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: Key<T>) -> Option<&T> {
        self.entries.get(&key.id).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self, key: Key<T>) -> Option<&mut T> {
        self.entries.get_mut(&key.id).and_then(|v| v.downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self, key: Key<T>) -> Option<T> {
        self.entries
            .remove(&key.id)
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Callback registries for status and event notifications.
//!
//! Every registration returns a [`Subscription`] that removes the callback
//! again. Callbacks run outside any internal lock, one after another, and a
//! panicking callback is logged without keeping the others from running.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified with values of type `T`.
pub struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().callbacks.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Invoke every registered callback with `value`.
    pub fn notify(&self, value: &T) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let callbacks: Vec<Callback<T>> = self
            .registry
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                error!("Observer callback panicked, continuing with remaining observers");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by every registration.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Remove the callback. Safe to call after the source is gone.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

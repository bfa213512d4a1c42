//! Observer lists with handle-based unregistration.
//!
//! Channels and presence trackers expose multicast notifications ("a message
//! arrived for event X", "the channel errored", "presence synced"). Each
//! registration returns an [`ObserverId`] that can later be passed to
//! `unregister`/`off`.
//!
//! Callbacks are invoked synchronously on the notifying task, outside of any
//! registry lock, so a callback may register or unregister observers. A
//! callback that panics is logged and skipped; the remaining callbacks still
//! run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared callback type.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Unique identifier for a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obs_{}", self.0)
    }
}

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Callback panics are isolated with `catch_unwind`, so poisoning only means
/// a panic happened somewhere while the lock was held; the data is still the
/// last consistent write.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invoke `callback`, logging instead of propagating a panic.
///
/// Returns `true` if the callback completed normally.
fn invoke<T>(label: &str, id: ObserverId, callback: &Callback<T>, arg: &T) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(arg))) {
        Ok(()) => true,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("[Observers] Callback {} for '{}' panicked: {}", id, label, detail);
            false
        }
    }
}

/// A single notification list.
pub struct Observers<T> {
    label: &'static str,
    callbacks: Mutex<Vec<(ObserverId, Callback<T>)>>,
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("label", &self.label)
            .field("count", &self.len())
            .finish()
    }
}

impl<T> Observers<T> {
    /// Create an empty list. `label` names it in log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback.
    pub fn register(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId::next();
        lock(&self.callbacks).push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if `id` was not registered here.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Invoke every callback with `arg`, in registration order.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn notify(&self, arg: &T) -> usize {
        let snapshot: Vec<(ObserverId, Callback<T>)> = lock(&self.callbacks).clone();
        snapshot
            .iter()
            .filter(|(id, callback)| invoke(self.label, *id, callback, arg))
            .count()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callbacks keyed by event name.
///
/// Each event name maps to a list of `(id, callback)` pairs.
pub struct EventCallbacks<T> {
    callbacks: Mutex<HashMap<String, Vec<(ObserverId, Callback<T>)>>>,
}

impl<T> std::fmt::Debug for EventCallbacks<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = lock(&self.callbacks);
        f.debug_struct("EventCallbacks")
            .field("event_count", &callbacks.len())
            .field(
                "total_callbacks",
                &callbacks.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl<T> Default for EventCallbacks<T> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> EventCallbacks<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `event`.
    pub fn register(
        &self,
        event: &str,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId::next();
        lock(&self.callbacks)
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        log::debug!("Registered event callback '{}' for '{}'", id, event);
        id
    }

    /// Remove a callback from `event`. Returns `false` if it was not there.
    pub fn unregister(&self, event: &str, id: ObserverId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let Some(list) = callbacks.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            callbacks.remove(event);
        }
        removed
    }

    /// Invoke every callback registered for `event`.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn emit(&self, event: &str, arg: &T) -> usize {
        let snapshot: Vec<(ObserverId, Callback<T>)> = lock(&self.callbacks)
            .get(event)
            .cloned()
            .unwrap_or_default();
        snapshot
            .iter()
            .filter(|(id, callback)| invoke(event, *id, callback, arg))
            .count()
    }

    /// Check if any callbacks are registered for an event.
    pub fn has_callbacks(&self, event: &str) -> bool {
        lock(&self.callbacks)
            .get(event)
            .is_some_and(|list| !list.is_empty())
    }
}

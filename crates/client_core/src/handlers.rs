use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use serde_json::Value;
use tracing::trace;

pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, EventHandler)>>,
}

/// Inbound event handlers keyed by case-folded event name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: EventHandler) -> Subscription {
        let key = event.to_ascii_lowercase();
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_event
            .entry(key.clone())
            .or_default()
            .push((id, handler));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            event: key,
            id,
            active: true,
        }
    }

    /// Runs every handler registered for `event`; returns how many ran.
    pub fn dispatch(&self, event: &str, arguments: &[Value]) -> usize {
        // Snapshot first so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = lock(&self.inner)
            .by_event
            .get(&event.to_ascii_lowercase())
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!(event, "hub: no handler for event");
        }
        for handler in &handlers {
            handler(arguments);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.inner)
            .by_event
            .get(&event.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner);
        f.debug_map()
            .entries(registry.by_event.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

/// Keeps one handler registered. Dropping it unregisters the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Leaves the handler registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(entries) = registry.by_event.get_mut(&self.event) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                registry.by_event.remove(&self.event);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

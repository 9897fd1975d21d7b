//! Keyed publish/subscribe for per-user presence observers.
//!
//! The bus never invokes handlers itself: [`EventBus::emit`] hands back a
//! [`Delivery`] that the caller runs once its own locks are released, so a
//! handler is free to call back into the presence facade.

use std::{collections::HashMap, hash::Hash, sync::Arc};

pub type Handler<V> = Arc<dyn Fn(V) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration<V> {
    id: ListenerId,
    handler: Handler<V>,
    once: bool,
}

pub struct EventBus<K, V> {
    handlers: HashMap<K, Vec<Registration<V>>>,
    next_id: u64,
}

impl<K, V> Default for EventBus<K, V> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K, V> EventBus<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, key: K, handler: Handler<V>) -> ListenerId {
        self.register(key, handler, false)
    }

    /// Registers a handler that is dropped after its first delivery.
    pub fn once(&mut self, key: K, handler: Handler<V>) -> ListenerId {
        self.register(key, handler, true)
    }

    /// Removes one handler. Returns false when it was not registered (for
    /// instance a `once` handler that already fired).
    pub fn off(&mut self, key: &K, id: ListenerId) -> bool {
        let Some(registrations) = self.handlers.get_mut(key) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            self.handlers.remove(key);
        }
        removed
    }

    /// Collects the handlers currently registered for `key`, in registration
    /// order, and unregisters the `once` ones.
    pub fn emit(&mut self, key: &K, payload: V) -> Delivery<V> {
        let Some(registrations) = self.handlers.get_mut(key) else {
            return Delivery::empty(payload);
        };

        let handlers = registrations
            .iter()
            .map(|registration| Arc::clone(&registration.handler))
            .collect();
        registrations.retain(|registration| !registration.once);
        if registrations.is_empty() {
            self.handlers.remove(key);
        }

        Delivery { handlers, payload }
    }

    pub fn has(&self, key: &K) -> bool {
        self.handlers
            .get(key)
            .is_some_and(|registrations| !registrations.is_empty())
    }

    pub fn keys(&self) -> Vec<K> {
        self.handlers.keys().cloned().collect()
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.handlers.get(key).map_or(0, Vec::len)
    }

    fn register(&mut self, key: K, handler: Handler<V>, once: bool) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.handlers.entry(key).or_default().push(Registration {
            id,
            handler,
            once,
        });
        id
    }
}

/// Handlers captured by one `emit`, ready to run outside any lock.
#[must_use = "a delivery does nothing until it is delivered"]
pub struct Delivery<V> {
    handlers: Vec<Handler<V>>,
    payload: V,
}

impl<V: Clone> Delivery<V> {
    pub fn empty(payload: V) -> Self {
        Self {
            handlers: Vec::new(),
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn deliver(self) {
        for handler in self.handlers {
            handler(self.payload.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;

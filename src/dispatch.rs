//! Dispatch registry — routes inbound messages to subscribers.
//!
//! DESIGN
//! ======
//! An explicit table from message type to an ordered list of handlers, plus
//! the wildcard list under `"*"`. Every registration gets its own id, so the
//! same closure registered twice runs twice and each registration can be
//! removed on its own.
//!
//! Delivery snapshots the handler list under the lock, releases it, then
//! invokes handlers one by one. Handlers may subscribe or unsubscribe from
//! inside a callback without deadlocking; such changes take effect from the
//! next message.
//!
//! ERROR HANDLING
//! ==============
//! A handler that panics is caught at the delivery boundary and logged. The
//! remaining handlers, including the wildcard group, still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use frames::Message;
use tracing::error;

/// Type key that receives every message.
pub const WILDCARD: &str = "*";

/// A registered callback.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Registry shared between a connection's handles and its driver.
pub type SharedRegistry = Arc<Mutex<DispatchRegistry>>;

#[derive(Default)]
pub struct DispatchRegistry {
    next_id: u64,
    routes: HashMap<String, Vec<(u64, Handler)>>,
}

impl DispatchRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `kind` and return its registration id.
    pub fn insert(&mut self, kind: &str, handler: Handler) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.routes.entry(kind.to_owned()).or_default().push((id, handler));
        id
    }

    /// Remove one registration. Returns `false` if it was already gone.
    pub fn remove(&mut self, kind: &str, id: u64) -> bool {
        let Some(list) = self.routes.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.routes.remove(kind);
        }
        removed
    }

    /// Handlers for `kind` in registration order, followed by wildcard handlers.
    #[must_use]
    pub fn handlers_for(&self, kind: &str) -> Vec<Handler> {
        let typed = if kind == WILDCARD { None } else { self.routes.get(kind) };
        typed
            .into_iter()
            .chain(self.routes.get(WILDCARD))
            .flatten()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    /// Number of registrations under exactly `kind`.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.routes.get(kind).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Deliver `message` to every matching handler, isolating panics.
pub fn deliver(registry: &Mutex<DispatchRegistry>, message: &Message) -> Delivery {
    let handlers = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handlers_for(&message.kind);

    let mut outcome = Delivery::default();
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(()) => outcome.delivered += 1,
            Err(panic) => {
                outcome.failed += 1;
                error!(kind = %message.kind, reason = panic_reason(panic.as_ref()), "subscriber panicked");
            }
        }
    }
    outcome
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Handle for one registration. Dropping it leaves the callback registered;
/// call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<DispatchRegistry>>,
    kind: String,
    id: u64,
}

impl Subscription {
    pub(crate) fn register(registry: &SharedRegistry, kind: &str, handler: Handler) -> Self {
        let id = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
        Self { registry: Arc::downgrade(registry), kind: kind.to_owned(), id }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Remove this registration only. A no-op once the registry is gone.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.kind, self.id);
        }
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;

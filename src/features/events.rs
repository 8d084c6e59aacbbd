//! Domain-event fan-out into an application store.

use std::sync::Arc;

use frames::Message;
use serde_json::Value;
use tracing::debug;

use crate::dispatch::Subscription;
use crate::session::{SessionBinding, SessionError};

/// Passive receiver of decoded payloads, typically the application store.
///
/// Called on the channel's driver task; implementations should hand work
/// off rather than block. A panic here is caught and logged by the dispatch
/// layer and does not affect other subscribers.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, kind: &str, payload: &Value);
}

/// Forwards the payload of every subscribed message type to one sink.
pub struct EventFanout {
    subscriptions: Vec<Subscription>,
}

impl EventFanout {
    /// Subscribe `sink` to each type in `kinds`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] if the binding has no channel.
    pub fn attach<I, S>(session: &SessionBinding, kinds: I, sink: Arc<dyn EventSink>) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channel = session.handle()?;
        let mut fanout = Self { subscriptions: Vec::new() };
        for kind in kinds {
            let sink = Arc::clone(&sink);
            let subscription = channel.subscribe(kind.as_ref(), move |message: &Message| {
                sink.publish(&message.kind, &message.payload);
            })?;
            fanout.subscriptions.push(subscription);
        }
        debug!(kinds = fanout.subscriptions.len(), "events: fan-out attached");
        Ok(fanout)
    }

    /// Message types currently forwarded, in subscription order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.subscriptions.iter().map(Subscription::kind).collect()
    }

    /// Stop forwarding.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

impl Drop for EventFanout {
    fn drop(&mut self) {
        self.release();
    }
}

//! Document sync — a local snapshot kept current from server pushes.
//!
//! `document:state` replaces the snapshot wholesale; `document:update`
//! merges the top-level keys of its `changes` object into it. Updates that
//! arrive before the first snapshot have nothing to merge into and are
//! dropped; the server's next `document:state` supersedes them anyway.

use std::sync::{Arc, Mutex, PoisonError};

use frames::Message;
use serde_json::{Value, json};
use tracing::debug;

use super::{addressed_to, unwind};
use crate::connection::{Announcement, ChannelError, ChannelHandle};
use crate::dispatch::Subscription;
use crate::session::{SessionBinding, SessionError};

pub const DOCUMENT_SUBSCRIBE: &str = "document:subscribe";
pub const DOCUMENT_UNSUBSCRIBE: &str = "document:unsubscribe";
pub const DOCUMENT_STATE: &str = "document:state";
pub const DOCUMENT_UPDATE: &str = "document:update";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentState {
    /// Latest known document, `None` until the first `document:state`.
    pub snapshot: Option<Value>,
    /// Count of pushes applied locally. Not a server revision.
    pub revision: u64,
}

impl DocumentState {
    /// Fold one push into the state. Returns `false` when it was ignored.
    pub fn apply(&mut self, document_id: &str, message: &Message) -> bool {
        if !addressed_to(&message.payload, "documentId", document_id) {
            return false;
        }
        match message.kind.as_str() {
            DOCUMENT_STATE => {
                // Servers send either `{documentId, state}` or the bare document.
                let snapshot = message.payload.get("state").unwrap_or(&message.payload);
                self.snapshot = Some(snapshot.clone());
                self.revision += 1;
                true
            }
            DOCUMENT_UPDATE => {
                let Some(Value::Object(snapshot)) = self.snapshot.as_mut() else {
                    return false;
                };
                let Some(Value::Object(changes)) = message.payload.get("changes") else {
                    return false;
                };
                for (key, value) in changes {
                    snapshot.insert(key.clone(), value.clone());
                }
                self.revision += 1;
                true
            }
            _ => false,
        }
    }
}

/// Subscription to one document. Leaving (explicitly or by drop) withdraws
/// the subscribe announcement, sends `document:unsubscribe` and stops
/// tracking.
pub struct DocumentSession {
    document_id: String,
    channel: ChannelHandle,
    state: Arc<Mutex<DocumentState>>,
    subscriptions: Vec<Subscription>,
    subscribe: Option<Announcement>,
}

impl DocumentSession {
    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] if the binding has no channel.
    pub fn open(session: &SessionBinding, document_id: impl Into<String>) -> Result<Self, SessionError> {
        let document_id = document_id.into();
        let channel = session.handle()?;
        let state = Arc::new(Mutex::new(DocumentState::default()));

        let mut subscriptions = Vec::with_capacity(2);
        for kind in [DOCUMENT_STATE, DOCUMENT_UPDATE] {
            let state = Arc::clone(&state);
            let id = document_id.clone();
            let registered = channel.subscribe(kind, move |message: &Message| {
                let applied = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(&id, message);
                if !applied {
                    debug!(kind = %message.kind, document_id = %id, "document: push ignored");
                }
            });
            match registered {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => return Err(unwind(subscriptions, e)),
            }
        }
        let subscribe = match channel.announce(DOCUMENT_SUBSCRIBE, json!({ "documentId": document_id })) {
            Ok(subscribe) => subscribe,
            Err(e) => return Err(unwind(subscriptions, e)),
        };

        Ok(Self { document_id, channel, state, subscriptions, subscribe: Some(subscribe) })
    }

    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Send `changes` to the server. The local snapshot changes only when
    /// the server pushes the update back.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] once the channel has shut down.
    pub fn update_document(&self, changes: Value) -> Result<(), SessionError> {
        let payload = json!({ "documentId": self.document_id, "changes": changes });
        Ok(self.channel.send(DOCUMENT_UPDATE, payload)?)
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if the unsubscribe could not be
    /// handed to the channel.
    pub fn leave(mut self) -> Result<(), SessionError> {
        Ok(self.release()?)
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        let Some(subscribe) = self.subscribe.take() else {
            return Ok(());
        };
        subscribe.withdraw();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.channel.send(DOCUMENT_UNSUBSCRIBE, json!({ "documentId": self.document_id }))
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!(document_id = %self.document_id, error = %e, "document: unsubscribe not sent");
        }
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;

//! Session binding — ties one channel's lifetime to a caller's scope.
//!
//! `attach` builds a [`ChannelConnection`], installs a wildcard listener that
//! republishes every inbound message as "last message seen", and connects.
//! `detach` (or dropping the binding) removes the listener and shuts the
//! connection down. Attaching again tears the previous connection down
//! first, so a binding never owns more than one.

use std::sync::{Arc, Mutex, PoisonError};

use frames::Message;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ChannelConfig, ConfigError};
use crate::connection::{ChannelConnection, ChannelError, ChannelHandle};
use crate::dispatch::{Subscription, WILDCARD};
use crate::state::ConnectionState;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not attached to a channel")]
    Detached,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid channel config: {0}")]
    Config(#[from] ConfigError),
}

struct Attached {
    connection: ChannelConnection,
    listener: Subscription,
}

/// "Last message seen", writable only by the currently attached channel.
///
/// A delivery already running on an old driver can outlive its listener's
/// unsubscribe, so every write names its channel and is dropped unless that
/// channel still owns the slot. Ownership changes and writes share one lock.
struct LastMessage {
    owner: Mutex<Option<Uuid>>,
    value: watch::Sender<Option<Message>>,
}

impl LastMessage {
    fn new() -> Self {
        let (value, _) = watch::channel(None);
        Self { owner: Mutex::new(None), value }
    }

    fn publish(&self, from: Uuid, message: &Message) -> bool {
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner != Some(from) {
            return false;
        }
        self.value.send_replace(Some(message.clone()));
        true
    }

    /// Hand the slot to `owner`, clearing the value for a new channel. With
    /// `None` the last value stays readable but nothing may overwrite it.
    fn reassign(&self, owner: Option<Uuid>) {
        let mut current = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        *current = owner;
        if owner.is_some() {
            self.value.send_replace(None);
        }
    }
}

pub struct SessionBinding {
    transport: Arc<dyn Transport>,
    attached: Option<Attached>,
    last_message: Arc<LastMessage>,
}

impl SessionBinding {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, attached: None, last_message: Arc::new(LastMessage::new()) }
    }

    /// Start a channel for `config` and connect it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for an invalid config; the binding
    /// is left detached in that case.
    pub fn attach(&mut self, config: ChannelConfig) -> Result<(), SessionError> {
        self.detach();
        let connection = ChannelConnection::new(config, Arc::clone(&self.transport))?;
        let handle = connection.handle();
        let id = handle.id();
        self.last_message.reassign(Some(id));

        let last = Arc::clone(&self.last_message);
        let listener = handle.subscribe(WILDCARD, move |message: &Message| {
            if !last.publish(id, message) {
                debug!(channel = %id, kind = %message.kind, "session: stale delivery ignored");
            }
        })?;
        handle.connect()?;

        info!(channel = %handle.id(), "session: attached");
        self.attached = Some(Attached { connection, listener });
        Ok(())
    }

    /// Remove the listener and shut the channel down. Safe to call twice.
    pub fn detach(&mut self) {
        if let Some(Attached { connection, listener }) = self.attached.take() {
            info!(channel = %connection.handle().id(), "session: detached");
            self.last_message.reassign(None);
            listener.unsubscribe();
            drop(connection);
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// State of the attached channel; `disconnected` while detached.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.attached
            .as_ref()
            .map_or(ConnectionState::Disconnected, |a| a.connection.handle().state())
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] while detached.
    pub fn watch_state(&self) -> Result<watch::Receiver<ConnectionState>, SessionError> {
        Ok(self.channel()?.watch_state())
    }

    /// Most recent inbound message of any type since the last attach.
    #[must_use]
    pub fn last_message(&self) -> Option<Message> {
        self.last_message.value.borrow().clone()
    }

    #[must_use]
    pub fn watch_last_message(&self) -> watch::Receiver<Option<Message>> {
        self.last_message.value.subscribe()
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] while detached, or the channel's
    /// error for an empty type or a stopped driver.
    pub fn send_message(&self, kind: &str, payload: Value) -> Result<(), SessionError> {
        Ok(self.channel()?.send(kind, payload)?)
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] while detached.
    pub fn subscribe<F>(&self, kind: &str, callback: F) -> Result<Subscription, SessionError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Ok(self.channel()?.subscribe(kind, callback)?)
    }

    /// Channel handle for feature sessions built on this binding.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] while detached.
    pub fn handle(&self) -> Result<ChannelHandle, SessionError> {
        self.channel().cloned()
    }

    fn channel(&self) -> Result<&ChannelHandle, SessionError> {
        self.attached
            .as_ref()
            .map(|a| a.connection.handle())
            .ok_or(SessionError::Detached)
    }
}

impl Drop for SessionBinding {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

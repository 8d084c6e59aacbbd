//! Room presence — who is in a room and where their cursors are.
//!
//! Joining announces `join:room` so the channel replays it after every
//! reconnect. Participant and cursor maps are rebuilt purely from
//! `user:joined`, `user:left` and `cursor:move` pushes; membership is what
//! this client believes, not a server-confirmed roster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use frames::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{addressed_to, unwind};
use crate::connection::{Announcement, ChannelError, ChannelHandle};
use crate::dispatch::Subscription;
use crate::session::{SessionBinding, SessionError};

pub const JOIN_ROOM: &str = "join:room";
pub const LEAVE_ROOM: &str = "leave:room";
pub const USER_JOINED: &str = "user:joined";
pub const USER_LEFT: &str = "user:left";
pub const CURSOR_MOVE: &str = "cursor:move";

/// Logical room identifier, serialized as `{resourceType, resourceId}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl RoomKey {
    #[must_use]
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), resource_id: resource_id.into() }
    }

    fn payload(&self) -> Value {
        json!({ "resourceType": self.resource_type, "resourceId": self.resource_id })
    }

    fn addresses(&self, payload: &Value) -> bool {
        addressed_to(payload, "resourceType", &self.resource_type)
            && addressed_to(payload, "resourceId", &self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Locally known room membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomState {
    /// Participant id → the payload of their `user:joined` push.
    pub participants: BTreeMap<String, Value>,
    pub cursors: BTreeMap<String, CursorPosition>,
}

impl RoomState {
    /// Fold one push into the state. Returns `false` when the message was
    /// ignored: another room, no user id, or a malformed cursor.
    pub fn apply(&mut self, key: &RoomKey, message: &Message) -> bool {
        if !key.addresses(&message.payload) {
            return false;
        }
        let Some(user) = user_id(message) else {
            return false;
        };
        match message.kind.as_str() {
            USER_JOINED => {
                self.participants.insert(user, message.payload.clone());
                true
            }
            USER_LEFT => {
                self.cursors.remove(&user);
                self.participants.remove(&user).is_some()
            }
            CURSOR_MOVE => {
                let x = message.payload.get("x").and_then(Value::as_f64);
                let y = message.payload.get("y").and_then(Value::as_f64);
                let (Some(x), Some(y)) = (x, y) else {
                    return false;
                };
                self.cursors.insert(user, CursorPosition { x, y });
                true
            }
            _ => false,
        }
    }
}

/// Sender of a push: the envelope's `userId`, else the payload's.
fn user_id(message: &Message) -> Option<String> {
    message
        .user_id
        .clone()
        .or_else(|| message.payload_str("userId").map(ToOwned::to_owned))
}

/// Membership in one room. Leaving (explicitly or by drop) withdraws the
/// join, sends `leave:room` and stops tracking.
pub struct RoomSession {
    key: RoomKey,
    channel: ChannelHandle,
    state: Arc<Mutex<RoomState>>,
    subscriptions: Vec<Subscription>,
    join: Option<Announcement>,
}

impl RoomSession {
    /// # Errors
    ///
    /// Returns [`SessionError::Detached`] if the binding has no channel.
    pub fn join(session: &SessionBinding, key: RoomKey) -> Result<Self, SessionError> {
        let channel = session.handle()?;
        let state = Arc::new(Mutex::new(RoomState::default()));

        let mut subscriptions = Vec::with_capacity(3);
        for kind in [USER_JOINED, USER_LEFT, CURSOR_MOVE] {
            let state = Arc::clone(&state);
            let room = key.clone();
            let registered = channel.subscribe(kind, move |message: &Message| {
                let applied = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(&room, message);
                if !applied {
                    debug!(kind = %message.kind, resource_id = %room.resource_id, "room: push ignored");
                }
            });
            match registered {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => return Err(unwind(subscriptions, e)),
            }
        }
        let join = match channel.announce(JOIN_ROOM, key.payload()) {
            Ok(join) => join,
            Err(e) => return Err(unwind(subscriptions, e)),
        };

        Ok(Self { key, channel, state, subscriptions, join: Some(join) })
    }

    #[must_use]
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Snapshot of the current membership.
    #[must_use]
    pub fn state(&self) -> RoomState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] once the channel has shut down.
    pub fn broadcast_cursor_position(&self, x: f64, y: f64) -> Result<(), SessionError> {
        let payload = json!({
            "x": x,
            "y": y,
            "resourceType": self.key.resource_type,
            "resourceId": self.key.resource_id,
        });
        Ok(self.channel.send(CURSOR_MOVE, payload)?)
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Channel`] if `leave:room` could not be handed
    /// to the channel.
    pub fn leave(mut self) -> Result<(), SessionError> {
        Ok(self.release()?)
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.withdraw();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.channel.send(LEAVE_ROOM, self.key.payload())
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!(resource_id = %self.key.resource_id, error = %e, "room: leave not sent");
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;

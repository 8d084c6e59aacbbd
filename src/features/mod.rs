//! Feature sessions layered over a [`SessionBinding`](crate::session::SessionBinding).
//!
//! Each feature opens a logical topic with a control message, keeps local
//! state derived only from inbound pushes, and exposes a few outbound
//! actions that go through the channel's `send`. Reconnect, queueing and
//! join replay all belong to the channel; features never retry on their own.

pub mod document;
pub mod events;
pub mod room;

#[cfg(test)]
#[path = "testkit_test.rs"]
pub(crate) mod testkit;

use serde_json::Value;

use crate::connection::ChannelError;
use crate::dispatch::Subscription;
use crate::session::SessionError;

/// True unless `payload` names a different value for `field` than `expected`.
/// Pushes that omit the field are accepted.
fn addressed_to(payload: &Value, field: &str, expected: &str) -> bool {
    payload
        .get(field)
        .and_then(Value::as_str)
        .is_none_or(|value| value == expected)
}

/// Remove the handlers a half-built feature session registered, then hand
/// back the error that stopped it.
fn unwind(subscriptions: Vec<Subscription>, err: ChannelError) -> SessionError {
    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    err.into()
}

//! Resilient real-time messaging client.
//!
//! A [`ChannelConnection`] keeps one WebSocket-style channel alive across
//! network loss: it queues sends while offline, retries on a fixed schedule,
//! sends heartbeats while connected and routes inbound messages to
//! subscribers by type. A [`SessionBinding`] scopes a channel to a caller's
//! lifetime, and the [`features`] build rooms, document sync and event
//! fan-out on top of it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use livewire::{ChannelConfig, SessionBinding, WsTransport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = SessionBinding::new(Arc::new(WsTransport::new()));
//! session.attach(ChannelConfig::new("wss://example.com/ws"))?;
//! let _sub = session.subscribe("chat:message", |m| println!("{}", m.payload))?;
//! session.send_message("chat:message", serde_json::json!({ "text": "hi" }))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod features;
pub mod queue;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{ChannelConfig, ConfigError};
pub use connection::{Announcement, ChannelConnection, ChannelError, ChannelHandle};
pub use dispatch::{Subscription, WILDCARD};
pub use frames::{CodecError, Message};
pub use session::{SessionBinding, SessionError};
pub use state::ConnectionState;
pub use transport::{Transport, TransportError, WsTransport};

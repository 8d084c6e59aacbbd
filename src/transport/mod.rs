//! Transport seam — how a channel opens a full-duplex text socket.
//!
//! ARCHITECTURE
//! ============
//! A [`Transport`] turns an endpoint into a [`Link`]: a pair of channels,
//! one carrying outbound frames to the socket writer and one carrying
//! inbound events from the socket reader. The connection driver only ever
//! talks to those channels, so the WebSocket implementation (`ws`) and the
//! in-memory test double are interchangeable.
//!
//! A returned `Link` means the transport is open. Every link ends with
//! exactly one [`TransportEvent::Closed`]; a reader that vanishes without
//! reporting one is treated by the driver as an unclean close.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

pub mod ws;

#[cfg(test)]
#[path = "mock_test.rs"]
pub(crate) mod mock;

pub use ws::WsTransport;

/// Normal closure code sent on an explicit disconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Where to connect and which sub-protocols to offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub protocols: Vec<String>,
}

/// Frame handed to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// How a link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// True when the closing handshake happened (a close frame was received).
    pub clean: bool,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn unclean(reason: impl Into<String>) -> Self {
        Self { clean: false, code: None, reason: reason.into() }
    }
}

/// Event produced by the socket reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed(CloseInfo),
}

/// An open transport connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Link {
    /// Hand a text frame to the writer. `false` means the writer is gone.
    pub fn transmit(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Ask the writer to send a close frame. Best effort.
    pub fn close(&self, code: u16, reason: &str) {
        if self.outbound.send(Outbound::Close { code, reason: reason.to_owned() }).is_err() {
            debug!(code, "link: writer already gone, close frame dropped");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid websocket request: {0}")]
    InvalidRequest(String),
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Opens links to endpoints. One transport may serve many connections; each
/// call to [`Transport::open`] yields an independent link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link, TransportError>;
}

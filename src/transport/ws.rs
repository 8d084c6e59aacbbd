//! WebSocket transport over `tokio-tungstenite`.
//!
//! DESIGN
//! ======
//! After the handshake the stream is split. A writer task drains the
//! outbound channel into the sink; a reader task forwards text frames and
//! the final close event. Either task ends when its channel peer is dropped,
//! so dropping a `Link` tears the socket down. Once the link is gone the
//! reader waits at most [`CLOSE_GRACE`] for the peer's close reply, then
//! drops its half; a silent peer cannot keep the socket open.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use super::{CloseInfo, Endpoint, Link, Outbound, Transport, TransportError, TransportEvent};

/// How long a dropped link waits for the peer to answer our close frame.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Build the handshake request, offering sub-protocols when configured.
pub(crate) fn build_request(endpoint: &Endpoint) -> Result<Request, TransportError> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    if !endpoint.protocols.is_empty() {
        let offered = HeaderValue::from_str(&endpoint.protocols.join(", "))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
    }
    Ok(request)
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        let request = build_request(endpoint)?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!(error = %e, "ws: write failed");
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "ws: close frame not sent");
                        }
                        break;
                    }
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "ws: sink close failed");
            }
        });

        tokio::spawn(async move {
            let close = loop {
                let next = tokio::select! {
                    next = source.next() => next,
                    () = in_tx.closed() => {
                        await_close_reply(&mut source).await;
                        debug!("ws: link dropped, reader finished");
                        return;
                    }
                };
                let Some(msg) = next else {
                    break CloseInfo::unclean("stream ended");
                };
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(len = bytes.len(), "ws: dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        break CloseInfo { clean: true, code, reason };
                    }
                    Ok(_) => continue,
                    Err(e) => break CloseInfo::unclean(e.to_string()),
                };
                if in_tx.send(TransportEvent::Text(text)).is_err() {
                    return;
                }
            };
            debug!(clean = close.clean, reason = %close.reason, "ws: reader finished");
            // The driver may already have dropped the link.
            in_tx.send(TransportEvent::Closed(close)).ok();
        });

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}

/// Read until the peer's close frame or end of stream, bounded by
/// [`CLOSE_GRACE`]. Anything else the peer sends meanwhile is discarded.
async fn await_close_reply<S>(source: &mut S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let replied = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(msg)) = source.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    if replied.is_err() {
        debug!(grace_ms = CLOSE_GRACE.as_millis(), "ws: peer never answered close, dropping socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, protocols: &[&str]) -> Endpoint {
        Endpoint { url: url.to_owned(), protocols: protocols.iter().map(|p| (*p).to_owned()).collect() }
    }

    #[test]
    fn build_request_offers_protocols() {
        let request = build_request(&endpoint("ws://localhost:3000/ws", &["livewire.v2", "livewire.v1"]))
            .expect("request");
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        assert_eq!(offered, Some("livewire.v2, livewire.v1"));
    }

    #[test]
    fn build_request_without_protocols_omits_header() {
        let request = build_request(&endpoint("ws://localhost:3000/ws", &[])).expect("request");
        assert!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn build_request_rejects_garbage_url() {
        let err = build_request(&endpoint("not a url", &[])).expect_err("bad url");
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn open_refused_port_reports_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = WsTransport::new()
            .open(&endpoint(&format!("ws://{addr}/ws"), &[]))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, TransportError::Connect(_)));
    }
}

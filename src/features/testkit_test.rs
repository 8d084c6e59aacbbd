//! Attached session over the mock transport, for feature tests.

use std::sync::Arc;
use std::time::Duration;

use frames::Message;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ChannelConfig;
use crate::dispatch::{Subscription, WILDCARD};
use crate::session::SessionBinding;
use crate::transport::mock::{MockPeer, MockTransport, next_peer};

const WAIT: Duration = Duration::from_secs(60);

pub(crate) struct Live {
    pub(crate) session: SessionBinding,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) peer: MockPeer,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    probe: mpsc::UnboundedReceiver<Message>,
    _probe_sub: Subscription,
}

/// Attach a session and wait until its channel is connected.
pub(crate) async fn live() -> Live {
    let (transport, mut peers) = MockTransport::new();
    let transport = Arc::new(transport);
    let mut session = SessionBinding::new(transport.clone());
    session
        .attach(
            ChannelConfig::new("ws://livewire.test/ws")
                .with_reconnect_interval(Duration::from_millis(500))
                .with_heartbeat_interval(Duration::from_secs(3_600)),
        )
        .expect("attach");

    // Wildcard handlers run after typed ones, so the probe marks a finished delivery.
    let (tx, probe) = mpsc::unbounded_channel();
    let probe_sub = session
        .subscribe(WILDCARD, move |m: &Message| {
            tx.send(m.clone()).ok();
        })
        .expect("probe");

    let peer = next_peer(&mut peers).await;
    let live = Live { session, transport, peer, peers, probe, _probe_sub: probe_sub };
    live.wait_connected().await;
    live
}

impl Live {
    pub(crate) async fn wait_connected(&self) {
        let mut rx = self.session.watch_state().expect("attached");
        timeout(WAIT, rx.wait_for(|s| s.is_connected()))
            .await
            .expect("timed out waiting for connect")
            .expect("driver alive");
    }

    /// Push `message` from the server and wait until every handler saw it.
    pub(crate) async fn deliver(&mut self, message: Message) {
        self.peer.push(&message);
        let seen = timeout(WAIT, self.probe.recv())
            .await
            .expect("timed out waiting for dispatch")
            .expect("probe open");
        assert_eq!(seen.kind, message.kind);
    }

    /// Drop the link uncleanly and wait for the channel to come back.
    pub(crate) async fn bounce(&mut self) {
        self.peer.close(false);
        self.peer = next_peer(&mut self.peers).await;
        self.wait_connected().await;
    }

    /// Next message the client wrote on the current link.
    pub(crate) async fn sent(&mut self) -> Message {
        self.peer.next_message().await
    }
}

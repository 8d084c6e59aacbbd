//! Channel connection — one resilient link to one endpoint.
//!
//! DESIGN
//! ======
//! Each [`ChannelConnection`] spawns a driver task that owns everything
//! mutable about the link: the open transport, the outbound queue, the
//! reconnect deadline, the heartbeat interval, the in-flight open and the
//! announcement list. Callers talk to it through a cloneable
//! [`ChannelHandle`] that sends commands over an unbounded channel, so sends
//! from any task are serialized in call order.
//!
//! The driver is a single `select!` loop over:
//! - caller commands
//! - transport events from the live link
//! - the in-flight open
//! - the reconnect deadline
//! - the heartbeat tick
//!
//! After every turn it derives the public [`ConnectionState`] from its own
//! fields and publishes it on a `watch` channel. Timers are plain values
//! held in `Option`s; cancelling one means dropping it.
//!
//! LIFECYCLE
//! =========
//! 1. `connect()` → open in flight (`connecting`)
//! 2. Open succeeds → reset retries, start heartbeat, send announcements,
//!    flush the queue (`connected`)
//! 3. Open fails → `error`, retry after the fixed interval
//! 4. Unclean close → `disconnected`, retry after the fixed interval
//! 5. Clean close or `disconnect()` → `disconnected`, no retry
//! 6. Retries exhausted → `error` until the next explicit `connect()`
//!
//! ERROR HANDLING
//! ==============
//! Transport failures never surface as errors to callers; they show up as
//! state transitions. Malformed inbound frames are logged and dropped.
//! Handle methods fail only with [`ChannelError::Closed`] once the driver
//! has stopped, or [`ChannelError::EmptyType`] for an unroutable message.

use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use frames::Message;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{ChannelConfig, ConfigError};
use crate::dispatch::{self, DispatchRegistry, SharedRegistry, Subscription};
use crate::queue::OutboundQueue;
use crate::state::ConnectionState;
use crate::transport::{CLOSE_NORMAL, CloseInfo, Endpoint, Link, Transport, TransportError, TransportEvent};

/// Reason sent with the close frame on an explicit disconnect.
const DISCONNECT_REASON: &str = "client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel has been shut down")]
    Closed,
    #[error("message type must not be empty")]
    EmptyType,
}

enum Command {
    Connect,
    Disconnect,
    Send(Message),
    Announce { id: Uuid, message: Message },
    Withdraw(Uuid),
    Shutdown,
}

// =============================================================================
// HANDLES
// =============================================================================

/// Owns a channel's driver task. Dropping it disconnects and stops the
/// driver; handles cloned from it then report [`ChannelError::Closed`].
pub struct ChannelConnection {
    handle: ChannelHandle,
    driver: Option<JoinHandle<()>>,
}

impl ChannelConnection {
    /// Validate `config` and spawn the driver. The channel starts
    /// `disconnected`; nothing is opened until [`ChannelHandle::connect`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate.
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let registry: SharedRegistry = Arc::new(Mutex::new(DispatchRegistry::new()));

        let span = info_span!("channel", %id, url = %config.url);
        let driver = Driver {
            endpoint: Endpoint { url: config.url, protocols: config.protocols },
            max_attempts: config.reconnect_attempts,
            reconnect_interval: config.reconnect_interval,
            heartbeat_interval: config.heartbeat_interval,
            transport,
            registry: Arc::clone(&registry),
            state_tx,
            link: None,
            opening: None,
            retry_at: None,
            heartbeat: None,
            failed: false,
            attempts: 0,
            queue: OutboundQueue::new(),
            announcements: Vec::new(),
        };
        let task = tokio::spawn(driver.run(commands_rx).instrument(span));

        Ok(Self {
            handle: ChannelHandle { id, commands: commands_tx, registry, state: state_rx },
            driver: Some(task),
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Disconnect and wait for the driver task to finish.
    pub async fn shutdown(mut self) {
        self.handle.request(Command::Shutdown).ok();
        if let Some(task) = self.driver.take() {
            if let Err(e) = task.await {
                error!(id = %self.handle.id, error = %e, "channel: driver task failed");
            }
        }
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.handle.request(Command::Shutdown).ok();
        }
    }
}

/// Cheap, cloneable access to a running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    registry: SharedRegistry,
    state: watch::Receiver<ConnectionState>,
}

impl ChannelHandle {
    /// Identifier of this channel, also recorded on its tracing span.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Open the transport. A no-op while connected or connecting; otherwise
    /// any scheduled retry is replaced by an immediate attempt with a fresh
    /// retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the driver has stopped.
    pub fn connect(&self) -> Result<(), ChannelError> {
        self.request(Command::Connect)
    }

    /// Close the transport with the normal close code and cancel any retry,
    /// heartbeat or in-flight open. Queued messages are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the driver has stopped.
    pub fn disconnect(&self) -> Result<(), ChannelError> {
        self.request(Command::Disconnect)
    }

    /// Build a message stamped now and transmit it, or queue it until the
    /// next successful open.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::EmptyType`] for an empty `kind`, and
    /// [`ChannelError::Closed`] once the driver has stopped.
    pub fn send(&self, kind: &str, payload: Value) -> Result<(), ChannelError> {
        self.send_message(Message::new(kind, payload))
    }

    /// Like [`ChannelHandle::send`] for a prebuilt message.
    ///
    /// # Errors
    ///
    /// See [`ChannelHandle::send`].
    pub fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        if message.kind.is_empty() {
            return Err(ChannelError::EmptyType);
        }
        self.request(Command::Send(message))
    }

    /// Register `callback` for messages of `kind` (or `"*"` for all).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the driver has stopped.
    pub fn subscribe<F>(&self, kind: &str, callback: F) -> Result<Subscription, ChannelError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if self.commands.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(Subscription::register(&self.registry, kind, Arc::new(callback)))
    }

    /// Register a message to send now (or on the next open) and again,
    /// restamped, after every later open ahead of the queued backlog.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::EmptyType`] for an empty `kind`, and
    /// [`ChannelError::Closed`] once the driver has stopped.
    pub fn announce(&self, kind: &str, payload: Value) -> Result<Announcement, ChannelError> {
        if kind.is_empty() {
            return Err(ChannelError::EmptyType);
        }
        let id = Uuid::new_v4();
        self.request(Command::Announce { id, message: Message::new(kind, payload) })?;
        Ok(Announcement { id, kind: kind.to_owned(), commands: self.commands.clone() })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stream of state changes. The receiver closes when the driver stops.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Number of live subscriptions for `kind` (use [`WILDCARD`](crate::WILDCARD) for the wildcard group).
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).count(kind)
    }

    fn request(&self, command: Command) -> Result<(), ChannelError> {
        self.commands.send(command).map_err(|_| ChannelError::Closed)
    }
}

/// A message replayed on every open until withdrawn. Dropping the handle
/// keeps the announcement registered.
pub struct Announcement {
    id: Uuid,
    kind: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl Announcement {
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Stop replaying this announcement. Nothing is sent to the server.
    pub fn withdraw(self) {
        // A stopped driver has nothing left to replay.
        self.commands.send(Command::Withdraw(self.id)).ok();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

type PendingOpen = BoxFuture<'static, Result<Link, TransportError>>;

struct Driver {
    endpoint: Endpoint,
    max_attempts: u32,
    reconnect_interval: Duration,
    heartbeat_interval: Duration,
    transport: Arc<dyn Transport>,
    registry: SharedRegistry,
    state_tx: watch::Sender<ConnectionState>,

    link: Option<Link>,
    opening: Option<PendingOpen>,
    retry_at: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    /// Last open failed, or retries ran out.
    failed: bool,
    attempts: u32,
    queue: OutboundQueue,
    announcements: Vec<(Uuid, Message)>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.disconnect();
                        self.publish();
                        debug!("channel: driver stopped");
                        return;
                    }
                    Some(command) => self.on_command(command),
                },
                result = open_result(&mut self.opening) => {
                    self.opening = None;
                    self.on_open(result);
                }
                event = next_event(&mut self.link) => match event {
                    Some(TransportEvent::Text(text)) => self.on_text(&text),
                    Some(TransportEvent::Closed(info)) => self.on_closed(&info),
                    None => self.on_closed(&CloseInfo::unclean("transport reader stopped")),
                },
                () = deadline(&mut self.retry_at) => {
                    self.retry_at = None;
                    self.start_open();
                }
                () = tick(&mut self.heartbeat) => self.send_heartbeat(),
            }
            self.publish();
        }
    }

    fn state(&self) -> ConnectionState {
        if self.link.is_some() {
            ConnectionState::Connected
        } else if self.opening.is_some() {
            ConnectionState::Connecting
        } else if self.failed {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish(&self) {
        let next = self.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = %next, attempts = self.attempts, queued = self.queue.len(), "channel: state changed");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Send(message) => {
                self.queue.push(message);
                self.flush();
            }
            Command::Announce { id, message } => {
                if let Some(link) = &self.link {
                    transmit(link, &message);
                }
                self.announcements.push((id, message));
            }
            Command::Withdraw(id) => self.announcements.retain(|(existing, _)| *existing != id),
            // Handled by the loop before dispatching here.
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self) {
        if self.link.is_some() || self.opening.is_some() {
            debug!("channel: connect ignored, already {}", self.state());
            return;
        }
        self.attempts = 0;
        self.retry_at = None;
        self.start_open();
    }

    fn start_open(&mut self) {
        self.failed = false;
        info!(attempt = self.attempts, "channel: opening transport");
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        self.opening = Some(Box::pin(async move { transport.open(&endpoint).await }));
    }

    fn disconnect(&mut self) {
        self.retry_at = None;
        self.opening = None;
        self.heartbeat = None;
        self.failed = false;
        if let Some(link) = self.link.take() {
            info!("channel: closing transport");
            link.close(CLOSE_NORMAL, DISCONNECT_REASON);
        }
    }

    fn on_open(&mut self, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                info!(announcements = self.announcements.len(), queued = self.queue.len(), "channel: transport open");
                self.attempts = 0;
                self.failed = false;
                let period = self.heartbeat_interval;
                let mut heartbeat = interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);

                for (_, message) in &self.announcements {
                    transmit(&link, &message.restamped());
                }
                self.link = Some(link);
                self.flush();
            }
            Err(e) => {
                warn!(error = %e, "channel: open failed");
                self.schedule_retry(true);
            }
        }
    }

    fn on_closed(&mut self, info: &CloseInfo) {
        self.link = None;
        self.heartbeat = None;
        if info.clean {
            info!(code = ?info.code, reason = %info.reason, "channel: closed by peer");
            self.failed = false;
            return;
        }
        warn!(reason = %info.reason, "channel: connection lost");
        self.schedule_retry(false);
    }

    fn schedule_retry(&mut self, open_failed: bool) {
        self.heartbeat = None;
        if self.attempts >= self.max_attempts {
            self.failed = true;
            warn!(attempts = self.attempts, "channel: reconnect attempts exhausted");
            return;
        }
        self.attempts += 1;
        self.failed = open_failed;
        info!(
            attempt = self.attempts,
            max = self.max_attempts,
            delay_ms = self.reconnect_interval.as_millis(),
            "channel: reconnect scheduled"
        );
        self.retry_at = Some(Box::pin(sleep(self.reconnect_interval)));
    }

    fn on_text(&self, text: &str) {
        let message = match frames::decode_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = text.len(), "channel: dropping malformed frame");
                return;
            }
        };
        let outcome = dispatch::deliver(&self.registry, &message);
        debug!(kind = %message.kind, delivered = outcome.delivered, failed = outcome.failed, "channel: dispatched");
    }

    fn send_heartbeat(&self) {
        if let Some(link) = &self.link {
            transmit(link, &Message::heartbeat());
        }
    }

    fn flush(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        let sent = self.queue.drain_into(|message| match frames::encode_message(message) {
            Ok(text) => link.transmit(text),
            Err(e) => {
                error!(kind = %message.kind, error = %e, "channel: dropping unencodable message");
                true
            }
        });
        if sent > 0 {
            debug!(sent, remaining = self.queue.len(), "channel: flushed queue");
        }
    }
}

/// Send one message outside the queue. Losing it to a dying writer is fine:
/// the close event that follows triggers the replay path.
fn transmit(link: &Link, message: &Message) {
    match frames::encode_message(message) {
        Ok(text) => {
            if !link.transmit(text) {
                debug!(kind = %message.kind, "channel: writer gone, message not sent");
            }
        }
        Err(e) => error!(kind = %message.kind, error = %e, "channel: dropping unencodable message"),
    }
}

// =============================================================================
// OPTIONAL FUTURES
// =============================================================================

async fn open_result(opening: &mut Option<PendingOpen>) -> Result<Link, TransportError> {
    match opening {
        Some(open) => open.await,
        None => pending().await,
    }
}

async fn next_event(link: &mut Option<Link>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn deadline(retry_at: &mut Option<Pin<Box<Sleep>>>) {
    match retry_at {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;

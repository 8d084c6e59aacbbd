use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use livewire::config::{
    ENV_HEARTBEAT_INTERVAL_MS, ENV_PROTOCOLS, ENV_RECONNECT_ATTEMPTS, ENV_RECONNECT_INTERVAL_MS, ENV_URL,
};
use livewire::features::document::{DOCUMENT_STATE, DOCUMENT_UPDATE, DocumentSession};
use livewire::features::room::{CURSOR_MOVE, RoomKey, RoomSession, USER_JOINED, USER_LEFT};
use livewire::{
    ChannelConfig, ChannelConnection, ChannelError, ChannelHandle, CodecError, ConfigError, ConnectionState, Message,
    SessionBinding, SessionError, WILDCARD, WsTransport,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Level;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("input line {line}: {message}")]
    InvalidInput { line: usize, message: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not connected after {0}s (last state: {1})")]
    ConnectTimeout(u64, ConnectionState),
}

/// Connection flags override the matching `LIVEWIRE_*` variables; anything
/// left unset falls back to the environment, then to the library defaults.
#[derive(Parser, Debug)]
#[command(name = "livewire", about = "Resilient realtime channel client")]
struct Cli {
    /// Endpoint URL (`ws://` or `wss://`). Falls back to `LIVEWIRE_URL`.
    #[arg(long)]
    url: Option<String>,

    /// Sub-protocol to offer; repeat for several, in preference order.
    #[arg(long = "protocol", value_delimiter = ',')]
    protocols: Vec<String>,

    #[arg(long)]
    reconnect_attempts: Option<u32>,

    #[arg(long)]
    reconnect_interval_ms: Option<u64>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    #[arg(long, default_value_t = 10, help = "Seconds to wait for the first connect")]
    connect_timeout: u64,

    #[arg(long, env = "LIVEWIRE_LOG", default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn channel_config<F>(&self, env: F) -> Result<ChannelConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        ChannelConfig::from_lookup(|key| self.flag(key).or_else(|| env(key)))
    }

    /// Flag value for one config variable, rendered as the environment would hold it.
    fn flag(&self, key: &str) -> Option<String> {
        match key {
            ENV_URL => self.url.clone(),
            ENV_PROTOCOLS => (!self.protocols.is_empty()).then(|| self.protocols.join(",")),
            ENV_RECONNECT_ATTEMPTS => self.reconnect_attempts.map(|v| v.to_string()),
            ENV_RECONNECT_INTERVAL_MS => self.reconnect_interval_ms.map(|v| v.to_string()),
            ENV_HEARTBEAT_INTERVAL_MS => self.heartbeat_interval_ms.map(|v| v.to_string()),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print inbound messages as JSON lines until interrupted.
    Tail(TailArgs),
    /// Send one message, or a JSON-lines stream of messages.
    Send(SendArgs),
    /// Join a room and print the roster as it changes.
    Room(RoomArgs),
    /// Follow a document and print each new snapshot.
    Doc(DocArgs),
}

#[derive(Args, Debug)]
struct TailArgs {
    /// Only print these types; repeat for several. Default: everything.
    #[arg(long = "type")]
    kinds: Vec<String>,

    #[arg(long, help = "Exit after this many messages")]
    count: Option<usize>,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Message type. Omit to read `{type, payload}` lines from --input.
    kind: Option<String>,

    #[arg(long, default_value = "null")]
    data: String,

    #[arg(long)]
    user_id: Option<String>,

    #[arg(long, default_value = "-", help = "JSON-lines input path, or - for stdin")]
    input: String,

    #[arg(long, default_value_t = 250, help = "Milliseconds to let the socket drain before exit")]
    linger_ms: u64,
}

#[derive(Args, Debug)]
struct RoomArgs {
    resource_type: String,
    resource_id: String,

    #[arg(long, help = "Broadcast this cursor position once joined, as x,y")]
    cursor: Option<String>,
}

#[derive(Args, Debug)]
struct DocArgs {
    document_id: String,

    #[arg(long, help = "JSON object of changes to send once subscribed")]
    update: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(cli.log_level)
        .init();

    let config = cli.channel_config(|key| std::env::var(key).ok())?;
    let connect_timeout = Duration::from_secs(cli.connect_timeout);
    match cli.command {
        Command::Tail(args) => run_tail(config, connect_timeout, args).await,
        Command::Send(args) => run_send(config, connect_timeout, args).await,
        Command::Room(args) => run_room(config, args).await,
        Command::Doc(args) => run_doc(config, args).await,
    }
}

async fn run_tail(config: ChannelConfig, connect_timeout: Duration, args: TailArgs) -> Result<(), CliError> {
    let connection = ChannelConnection::new(config, Arc::new(WsTransport::new()))?;
    let channel = connection.handle();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let kinds = if args.kinds.is_empty() { vec![WILDCARD.to_owned()] } else { args.kinds };
    let mut subscriptions = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        let tx = tx.clone();
        subscriptions.push(channel.subscribe(kind, move |message: &Message| {
            tx.send(message.clone()).ok();
        })?);
    }

    channel.connect()?;
    wait_connected(channel, connect_timeout).await?;
    eprintln!("tailing {} ({})", kinds.join(", "), channel.id());

    let mut printed = 0_usize;
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                println!("{}", frames::encode_message(&message)?);
                printed += 1;
                if args.count.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    connection.shutdown().await;
    eprintln!("tail complete: printed={printed}");
    Ok(())
}

async fn run_send(config: ChannelConfig, connect_timeout: Duration, args: SendArgs) -> Result<(), CliError> {
    let messages = match &args.kind {
        Some(kind) => vec![build_message(kind, serde_json::from_str(&args.data)?, args.user_id.as_deref())],
        None => read_messages(&args.input, args.user_id.as_deref())?,
    };

    let connection = ChannelConnection::new(config, Arc::new(WsTransport::new()))?;
    let channel = connection.handle();
    // Queued before connecting; the channel flushes them in order on open.
    for message in &messages {
        channel.send_message(message.clone())?;
    }
    channel.connect()?;
    wait_connected(channel, connect_timeout).await?;

    channel.disconnect()?;
    tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
    connection.shutdown().await;
    eprintln!("send complete: sent={}", messages.len());
    Ok(())
}

async fn run_room(config: ChannelConfig, args: RoomArgs) -> Result<(), CliError> {
    let mut session = SessionBinding::new(Arc::new(WsTransport::new()));
    session.attach(config)?;
    let room = RoomSession::join(&session, RoomKey::new(args.resource_type, args.resource_id))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriptions = Vec::new();
    for kind in [USER_JOINED, USER_LEFT, CURSOR_MOVE] {
        let tx = tx.clone();
        subscriptions.push(session.subscribe(kind, move |_: &Message| {
            tx.send(()).ok();
        })?);
    }

    if let Some(raw) = &args.cursor {
        let (x, y) = parse_cursor(raw)?;
        room.broadcast_cursor_position(x, y)?;
    }

    loop {
        tokio::select! {
            changed = rx.recv() => {
                if changed.is_none() {
                    break;
                }
                let state = room.state();
                let roster: Vec<&str> = state.participants.keys().map(String::as_str).collect();
                println!(
                    "{}/{} [{}] participants={} cursors={}",
                    room.key().resource_type,
                    room.key().resource_id,
                    session.connection_state(),
                    roster.join(","),
                    state.cursors.len()
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    room.leave()?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    session.detach();
    Ok(())
}

async fn run_doc(config: ChannelConfig, args: DocArgs) -> Result<(), CliError> {
    let mut session = SessionBinding::new(Arc::new(WsTransport::new()));
    session.attach(config)?;
    let document = DocumentSession::open(&session, args.document_id)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriptions = Vec::new();
    for kind in [DOCUMENT_STATE, DOCUMENT_UPDATE] {
        let tx = tx.clone();
        subscriptions.push(session.subscribe(kind, move |_: &Message| {
            tx.send(()).ok();
        })?);
    }

    if let Some(raw) = &args.update {
        document.update_document(serde_json::from_str(raw)?)?;
    }

    let mut last_revision = 0;
    loop {
        tokio::select! {
            changed = rx.recv() => {
                if changed.is_none() {
                    break;
                }
                let state = document.state();
                if state.revision == last_revision {
                    continue;
                }
                last_revision = state.revision;
                if let Some(snapshot) = &state.snapshot {
                    print_json(snapshot)?;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    document.leave()?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    session.detach();
    Ok(())
}

/// Wait until `channel` is connected. Open failures keep retrying in the
/// background, so only the deadline ends the wait early.
async fn wait_connected(channel: &ChannelHandle, timeout: Duration) -> Result<(), CliError> {
    let mut state = channel.watch_state();
    let connected = tokio::time::timeout(timeout, state.wait_for(|s| s.is_connected())).await;
    match connected {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(ChannelError::Closed.into()),
        Err(_) => Err(CliError::ConnectTimeout(timeout.as_secs(), channel.state())),
    }
}

fn build_message(kind: &str, payload: Value, user_id: Option<&str>) -> Message {
    let message = Message::new(kind, payload);
    match user_id {
        Some(user) => message.with_user_id(user),
        None => message,
    }
}

fn read_messages(input: &str, user_id: Option<&str>) -> Result<Vec<Message>, CliError> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(input)?))
    };

    let mut messages = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        if let Some(message) = parse_jsonl_message_line(index + 1, &line?, user_id)? {
            messages.push(message);
        }
    }
    Ok(messages)
}

/// Parse one `{ "type": ..., "payload": ... }` line. Blank lines are skipped.
fn parse_jsonl_message_line(line_no: usize, line: &str, user_id: Option<&str>) -> Result<Option<Message>, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut value = serde_json::from_str::<Value>(trimmed)?;
    let Some(map) = value.as_object_mut() else {
        return Err(CliError::InvalidInput { line: line_no, message: "expected a JSON object".to_owned() });
    };
    let kind = match map.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => kind.to_owned(),
        _ => {
            return Err(CliError::InvalidInput { line: line_no, message: "missing `type`".to_owned() });
        }
    };
    let payload = map.remove("payload").unwrap_or(Value::Null);
    Ok(Some(build_message(&kind, payload, user_id)))
}

fn parse_cursor(raw: &str) -> Result<(f64, f64), CliError> {
    let invalid = || CliError::InvalidInput { line: 0, message: format!("cursor must be x,y, got `{raw}`") };
    let (x, y) = raw.split_once(',').ok_or_else(invalid)?;
    let x = x.trim().parse::<f64>().map_err(|_| invalid())?;
    let y = y.trim().parse::<f64>().map_err(|_| invalid())?;
    Ok((x, y))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonl_line_becomes_message() {
        let message = parse_jsonl_message_line(1, r#"{"type":"chat:message","payload":{"text":"hi"}}"#, Some("u1"))
            .expect("parse")
            .expect("message");
        assert_eq!(message.kind, "chat:message");
        assert_eq!(message.payload, json!({ "text": "hi" }));
        assert_eq!(message.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn blank_line_is_skipped_and_missing_type_rejected() {
        assert!(parse_jsonl_message_line(1, "   ", None).expect("parse").is_none());
        let err = parse_jsonl_message_line(3, r#"{"payload":1}"#, None).expect_err("no type");
        assert!(matches!(err, CliError::InvalidInput { line: 3, .. }));
        assert!(parse_jsonl_message_line(4, "[1,2]", None).is_err());
    }

    #[test]
    fn payload_defaults_to_null() {
        let message = parse_jsonl_message_line(1, r#"{"type":"ping"}"#, None).expect("parse").expect("message");
        assert_eq!(message.payload, Value::Null);
    }

    #[test]
    fn cursor_parses_pair() {
        assert_eq!(parse_cursor("10, 20.5").expect("cursor"), (10.0, 20.5));
        assert!(parse_cursor("10").is_err());
        assert!(parse_cursor("a,b").is_err());
    }

    #[test]
    fn config_comes_from_flags() {
        let cli = Cli::parse_from([
            "livewire",
            "--url",
            "ws://localhost:3000/ws",
            "--protocol",
            "a.v1,b.v1",
            "--reconnect-attempts",
            "2",
            "tail",
        ]);
        let config = cli.channel_config(|_| None).expect("valid");
        assert_eq!(config.protocols, vec!["a.v1", "b.v1"]);
        assert_eq!(config.reconnect_attempts, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
    }

    #[test]
    fn environment_fills_gaps_and_flags_win() {
        let cli = Cli::parse_from(["livewire", "--reconnect-attempts", "2", "tail"]);
        let env = |key: &str| match key {
            ENV_URL => Some("wss://example.test/ws".to_owned()),
            ENV_RECONNECT_ATTEMPTS => Some("7".to_owned()),
            ENV_HEARTBEAT_INTERVAL_MS => Some("1000".to_owned()),
            _ => None,
        };
        let config = cli.channel_config(env).expect("valid");
        assert_eq!(config.url, "wss://example.test/ws");
        assert_eq!(config.reconnect_attempts, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1_000));
        assert_eq!(config.reconnect_interval, Duration::from_millis(3_000));
    }

    #[test]
    fn missing_url_is_reported() {
        let cli = Cli::parse_from(["livewire", "tail"]);
        assert!(matches!(cli.channel_config(|_| None), Err(ConfigError::MissingUrl { .. })));
    }

    #[test]
    fn non_ws_url_is_rejected() {
        let cli = Cli::parse_from(["livewire", "--url", "http://localhost:3000", "tail"]);
        assert!(matches!(cli.channel_config(|_| None), Err(ConfigError::InvalidUrl { .. })));
    }
}

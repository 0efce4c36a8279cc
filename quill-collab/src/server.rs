//! WebSocket gateway: one connection per participant, routed by path to a
//! document coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/documents/{id}
//!            ├── connection task ──Command──► DocumentHub ──► Coordinator(id)
//! Client B ──┘        ▲                                          │
//!                     └──────── outbound queue (per participant) ◄┘
//! ```
//!
//! Each connection task owns its participant's outbound queue and
//! multiplexes it with inbound frames. The first message must be `join`
//! (or the path carries `?user_id=` which joins implicitly). Every inbound
//! message, including WebSocket pings, refreshes presence. A participant
//! the presence sweep dropped gets `session_expired` and must join again.
//! Errors are reported to the sender only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coordinator::{CoordinatorConfig, CoordinatorHandle};
use crate::error::{CollabError, CollabResult};
use crate::hub::DocumentHub;
use crate::operation::{now_millis, DocumentId, UserId};
use crate::presence::Outbound;
use crate::protocol::{ClientMessage, ProtocolError, ServerEvent};
use crate::storage::CheckpointStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per participant
    pub outbound_capacity: usize,
    /// RocksDB directory used by the binary
    pub storage_path: PathBuf,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            storage_path: PathBuf::from("quill_data"),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 64,
            storage_path: PathBuf::from("quill_test_data"),
            coordinator: CoordinatorConfig::for_testing(),
        }
    }

    /// Defaults overridden by `QUILL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for:
    ///
    /// | Key | Meaning |
    /// |-----|---------|
    /// | `QUILL_BIND_ADDR` | listen address |
    /// | `QUILL_STORAGE_PATH` | RocksDB directory |
    /// | `QUILL_OUTBOUND_CAPACITY` | per-participant queue |
    /// | `QUILL_IDLE_TIMEOUT_SECS` | eviction after last leave |
    /// | `QUILL_PRESENCE_TIMEOUT_SECS` | silent participant timeout |
    /// | `QUILL_CHECKPOINT_INTERVAL_SECS` | autosave period, `0` disables |
    /// | `QUILL_RETAIN_AFTER_CHECKPOINT` | replayable log entries kept |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("QUILL_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(n) = parse(&lookup, "QUILL_OUTBOUND_CAPACITY")? {
            if n == 0 {
                return Err(invalid("QUILL_OUTBOUND_CAPACITY", "0"));
            }
            config.outbound_capacity = n as usize;
        }

        let c = &mut config.coordinator;
        if let Some(secs) = parse(&lookup, "QUILL_IDLE_TIMEOUT_SECS")? {
            c.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "QUILL_PRESENCE_TIMEOUT_SECS")? {
            c.presence_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "QUILL_CHECKPOINT_INTERVAL_SECS")? {
            c.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse(&lookup, "QUILL_RETAIN_AFTER_CHECKPOINT")? {
            c.retain_after_checkpoint = n as usize;
        }

        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|raw| raw.trim().parse::<u64>().map_err(|_| invalid(key, &raw)))
        .transpose()
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
}

/// Target of a connection, taken from the request path and query.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    document_id: DocumentId,
    user_id: Option<UserId>,
    username: Option<String>,
}

impl Route {
    /// Accepts `/documents/{id}` and `/ws/documents/{id}`.
    fn parse(uri: &Uri) -> Option<Self> {
        let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();
        let document_id = match segments.as_slice() {
            ["documents", id] | ["ws", "documents", id] => *id,
            _ => return None,
        };

        let mut route = Route {
            document_id: document_id.to_string(),
            user_id: None,
            username: None,
        };
        for pair in uri.query().unwrap_or_default().split('&') {
            match pair.split_once('=') {
                Some(("user_id", v)) if !v.is_empty() => route.user_id = Some(v.to_string()),
                Some(("username", v)) if !v.is_empty() => route.username = Some(v.to_string()),
                _ => {}
            }
        }
        Some(route)
    }
}

/// A joined participant on this connection.
struct Session {
    handle: CoordinatorHandle,
    user_id: UserId,
}

/// What the connection does after a message was handled.
enum Flow {
    Continue,
    Reply(ServerEvent),
    Close,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<DocumentHub>,
    counters: Arc<Counters>,
}

impl CollabServer {
    /// Create a server over `store`. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let hub = Arc::new(DocumentHub::new(store, config.coordinator.clone()));
        Self {
            config,
            hub,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = Arc::clone(&self.hub);
            let counters = Arc::clone(&self.counters);
            let outbound_capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, hub, Arc::clone(&counters), outbound_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.counters.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            active_documents: self.hub.active_documents().await.len(),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<DocumentHub>,
    counters: Arc<Counters>,
    outbound_capacity: usize,
) -> Result<(), BoxError> {
    let mut route = None;
    let accepted = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match Route::parse(req.uri()) {
            Some(r) => {
                route = Some(r);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("unknown path".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    })
    .await;

    let (ws_stream, route) = match (accepted, route) {
        (Ok(ws), Some(route)) => (ws, route),
        (Err(e), _) => {
            counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            log::debug!("Handshake from {addr} rejected: {e}");
            return Ok(());
        }
        (Ok(_), None) => return Ok(()),
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel(outbound_capacity);
    let connection_id = Uuid::new_v4();
    let mut session: Option<Session> = None;

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("WebSocket connection from {addr} for document {}", route.document_id);

    if let Some(user_id) = route.user_id.clone() {
        let implicit = ClientMessage::Join {
            user_id,
            username: route.username.clone(),
        };
        if let Err(e) = dispatch(&hub, &route, &mut session, &outbound, connection_id, implicit).await {
            ws_sender.send(event_frame(&ServerEvent::error(&e))?).await?;
        }
    }

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let flow = match msg {
                        Some(Ok(Message::Text(text))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            match ClientMessage::decode(text.as_str()) {
                                Ok(msg) => {
                                    log::trace!("{addr} → {msg:?}");
                                    dispatch(&hub, &route, &mut session, &outbound, connection_id, msg).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Err(e.into())
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => Err(ProtocolError::BinaryFrame.into()),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            keep_alive(&session).await
                        }
                        Some(Ok(Message::Pong(_))) => keep_alive(&session).await,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => Ok(Flow::Continue),
                    };

                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Reply(event)) => ws_sender.send(event_frame(&event)?).await?,
                        Ok(Flow::Close) => {
                            ws_sender.send(Message::Close(None)).await?;
                            break;
                        }
                        Err(e) => {
                            if matches!(e, CollabError::DocumentClosed(_)) {
                                session = None;
                            }
                            log::debug!("Rejected message from {addr}: {e}");
                            ws_sender.send(event_frame(&ServerEvent::error(&e))?).await?;
                        }
                    }
                }

                Some(event) = outbound_rx.recv() => {
                    if let ServerEvent::SessionExpired { user_id } = &*event {
                        if session.as_ref().is_some_and(|s| &s.user_id == user_id) {
                            log::info!("Session of {user_id} from {addr} expired");
                            session = None;
                        }
                    }
                    ws_sender.send(event_frame(&event)?).await?;
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    if let Some(s) = session.take() {
        if let Err(e) = s.handle.disconnect(&s.user_id, connection_id).await {
            log::debug!("Disconnect of {} after close: {e}", s.user_id);
        }
    }
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// WebSocket-level pings and pongs count as activity too.
async fn keep_alive(session: &Option<Session>) -> CollabResult<Flow> {
    if let Some(s) = session {
        s.handle.mark_active(&s.user_id).await?;
    }
    Ok(Flow::Continue)
}

fn event_frame(event: &ServerEvent) -> Result<Message, ProtocolError> {
    Ok(Message::Text(event.encode()?.into()))
}

async fn dispatch(
    hub: &DocumentHub,
    route: &Route,
    session: &mut Option<Session>,
    outbound: &Outbound,
    connection_id: Uuid,
    msg: ClientMessage,
) -> CollabResult<Flow> {
    if let Some(s) = session.as_ref() {
        s.handle.mark_active(&s.user_id).await?;
    }

    let msg = match msg {
        ClientMessage::Ping => return Ok(Flow::Reply(ServerEvent::Pong)),
        ClientMessage::Join { user_id, username } => {
            if let Some(s) = session {
                return Err(ProtocolError::AlreadyJoined(s.user_id.clone()).into());
            }
            let display_name = username.unwrap_or_else(|| user_id.clone());
            let (handle, snapshot) = hub
                .join(&route.document_id, &user_id, &display_name, outbound.clone(), connection_id)
                .await?;
            log::debug!(
                "{user_id} joined {} at v{} over connection {connection_id}",
                route.document_id,
                snapshot.version
            );
            *session = Some(Session { handle, user_id });
            return Ok(Flow::Continue);
        }
        other => other,
    };

    let Some(s) = session.as_ref() else {
        return Err(ProtocolError::NotJoined.into());
    };
    let user = s.user_id.as_str();

    match msg {
        ClientMessage::EditOperation { op, client_version } => {
            let op = op.into_operation(user, now_millis())?;
            s.handle.submit_operation(user, op, client_version).await?;
        }
        ClientMessage::CursorPosition { position, selection } => {
            s.handle.update_cursor(user, position, selection).await?;
        }
        ClientMessage::Recover { last_known_version } => {
            s.handle.recover(user, last_known_version).await?;
        }
        ClientMessage::Undo => {
            s.handle.undo(user).await?;
        }
        ClientMessage::Redo => {
            s.handle.redo(user).await?;
        }
        ClientMessage::Save => {
            s.handle.save_checkpoint(user).await?;
        }
        ClientMessage::Leave => {
            s.handle.leave(user).await?;
            *session = None;
            return Ok(Flow::Close);
        }
        ClientMessage::Join { .. } | ClientMessage::Ping => {}
    }
    Ok(Flow::Continue)
}

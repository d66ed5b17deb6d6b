//! WebSocket sync server: one task per connection, one serializer per board.
//!
//! Architecture:
//! ```text
//! ws://host/<board>?user=<id>
//!        │
//!        ▼
//! Connection task ──submit/undo/redo/clear──► SessionCoordinator ──► ActionStore
//!   │     ▲                                         │
//!   │     │ committed / undone / redone             ▼
//!   │     └──────────── Subscription ◄──────── BroadcastRouter
//!   │
//!   └── join / resync / lag ──► CatchUpProducer ──► init_state
//! ```
//!
//! A connection subscribes before its snapshot is taken, so it never misses
//! a commit. A connection that falls behind the broadcast buffer gets a
//! fresh `init_state` instead of the events it lost. When the last
//! connection of a board leaves, the board is evicted from memory.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::action::{BoardId, ConnectionId, UserId};
use crate::auth::{AllowAll, Authorizer};
use crate::broadcast::{BroadcastRouter, SubscriptionError};
use crate::catchup::{CatchUp, CatchUpProducer};
use crate::config::ServerConfig;
use crate::coordinator::{Participant, SessionCoordinator};
use crate::protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
use crate::storage::{ActionStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejections: u64,
    pub catch_ups: u64,
    pub active_boards: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejections: AtomicU64,
    catch_ups: AtomicU64,
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    producer: CatchUpProducer,
    stats: AtomicServerStats,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self, ServerError> {
        let store: Arc<dyn ActionStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured; boards live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store, authorizer))
    }

    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn ActionStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let router = Arc::new(BroadcastRouter::new(config.broadcast_capacity));
        let coordinator = Arc::new(SessionCoordinator::new(
            router.clone(),
            store,
            authorizer,
            config.redo_policy,
        ));
        let producer = CatchUpProducer::with_max_subscribers(router, config.max_connections_per_board);
        Self {
            shared: Arc::new(Shared {
                config,
                coordinator,
                producer,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    /// Default configuration, in-memory storage, everyone may edit.
    pub fn with_defaults() -> Self {
        Self::with_store(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
        )
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        shared: Arc<Shared>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut path = String::new();
        let mut query = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let connection_id = Uuid::new_v4();
        let result = match parse_target(&path, query.as_deref()) {
            Ok((board_id, user_id)) => {
                log::info!("{user_id} connected to board {board_id} from {addr}");
                let participant = Participant::new(user_id).on_connection(connection_id);
                Self::run_session(
                    &shared,
                    &mut ws_sender,
                    &mut ws_receiver,
                    board_id,
                    participant,
                )
                .await
            }
            Err(reason) => {
                log::warn!("Refusing {addr}: {reason}");
                Self::refuse(&mut ws_sender, reason).await
            }
        };

        // Leave the board however the session ended.
        let router = shared.coordinator.router();
        if let Some(board_id) = router.unsubscribe(connection_id).await {
            shared.coordinator.forget_connection(board_id, connection_id).await;
            shared.coordinator.evict_if_idle(board_id).await;
        }
        shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} from {addr} closed");

        result
    }

    async fn run_session(
        shared: &Shared,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        board_id: BoardId,
        participant: Participant,
    ) -> Result<(), ServerError> {
        let coordinator = &shared.coordinator;
        let connection_id = participant.connection_id.unwrap_or_else(Uuid::nil);

        let mut catch_up = match Self::catch_up(shared, ws_sender, board_id, connection_id).await? {
            Some(catch_up) => catch_up,
            None => return Ok(()),
        };

        let heartbeat_secs = shared.config.heartbeat_interval_secs;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            shared.stats.total_bytes.fetch_add(text.as_str().len() as u64, Ordering::Relaxed);

                            let request = match ClientMessage::decode(text.as_str()) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("Undecodable message from {connection_id}: {e}");
                                    Self::reject(shared, ws_sender, None, RejectReason::MalformedPayload).await?;
                                    continue;
                                }
                            };

                            match request {
                                ClientMessage::Submit { kind, payload, client_temp_id } => {
                                    let result = coordinator
                                        .submit(board_id, &participant, Some(client_temp_id.clone()), kind, payload)
                                        .await;
                                    if let Err(reason) = result {
                                        Self::reject(shared, ws_sender, Some(client_temp_id), reason).await?;
                                    }
                                }
                                ClientMessage::Undo => {
                                    if let Err(reason) = coordinator.undo(board_id, &participant).await {
                                        Self::reject(shared, ws_sender, None, reason).await?;
                                    }
                                }
                                ClientMessage::Redo => {
                                    if let Err(reason) = coordinator.redo(board_id, &participant).await {
                                        Self::reject(shared, ws_sender, None, reason).await?;
                                    }
                                }
                                ClientMessage::Clear => {
                                    if let Err(reason) = coordinator.clear(board_id, &participant).await {
                                        Self::reject(shared, ws_sender, None, reason).await?;
                                    }
                                }
                                ClientMessage::Resync => {
                                    log::debug!("Resync requested by {connection_id}");
                                    match Self::catch_up(shared, ws_sender, board_id, connection_id).await? {
                                        Some(fresh) => catch_up = fresh,
                                        None => return Ok(()),
                                    }
                                }
                                ClientMessage::Ping => {
                                    send(ws_sender, &ServerMessage::Pong).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            Self::reject(shared, ws_sender, None, RejectReason::MalformedPayload).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {connection_id} closed by peer");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {connection_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                event = catch_up.next_event() => {
                    match event {
                        Ok(event) => {
                            send(ws_sender, &ServerMessage::from_commit(&event, connection_id)).await?;
                        }
                        Err(SubscriptionError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} events; resending state");
                            match Self::catch_up(shared, ws_sender, board_id, connection_id).await? {
                                Some(fresh) => catch_up = fresh,
                                None => return Ok(()),
                            }
                        }
                        Err(SubscriptionError::Closed) => {
                            log::debug!("Subscription for {connection_id} closed");
                            return Ok(());
                        }
                    }
                }

                _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Subscribe, snapshot, send `init_state`. `None` when the board is
    /// unavailable (the client has been told).
    async fn catch_up(
        shared: &Shared,
        ws_sender: &mut WsSink,
        board_id: BoardId,
        connection_id: ConnectionId,
    ) -> Result<Option<CatchUp>, ServerError> {
        match shared
            .producer
            .catch_up(&shared.coordinator, board_id, connection_id)
            .await
        {
            Ok(mut catch_up) => {
                shared.stats.catch_ups.fetch_add(1, Ordering::Relaxed);
                let confirmed = std::mem::take(&mut catch_up.confirmed);
                send(ws_sender, &ServerMessage::init_state(&catch_up.snapshot, confirmed)).await?;
                Ok(Some(catch_up))
            }
            Err(e) => {
                Self::refuse(ws_sender, e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn reject(
        shared: &Shared,
        ws_sender: &mut WsSink,
        client_temp_id: Option<String>,
        reason: RejectReason,
    ) -> Result<(), ServerError> {
        shared.stats.rejections.fetch_add(1, Ordering::Relaxed);
        send(ws_sender, &ServerMessage::rejected(client_temp_id, reason)).await
    }

    /// Tell the client the board cannot be served, then close.
    async fn refuse(ws_sender: &mut WsSink, reason: String) -> Result<(), ServerError> {
        send(ws_sender, &ServerMessage::Unavailable { reason }).await?;
        ws_sender.send(Message::Close(None)).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let stats = &self.shared.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            rejections: stats.rejections.load(Ordering::Relaxed),
            catch_ups: stats.catch_ups.load(Ordering::Relaxed),
            active_boards: self.shared.coordinator.board_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.shared.coordinator
    }
}

async fn send(ws_sender: &mut WsSink, message: &ServerMessage) -> Result<(), ServerError> {
    let text = message.encode()?;
    ws_sender.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Board id from the request path, user id from `?user=`.
fn parse_target(path: &str, query: Option<&str>) -> Result<(BoardId, UserId), String> {
    let raw = path.trim_matches('/');
    let board_id = Uuid::parse_str(raw).map_err(|_| format!("invalid board id {raw:?}"))?;

    let user_id = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    Ok((board_id, user_id))
}

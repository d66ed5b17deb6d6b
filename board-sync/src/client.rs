//! WebSocket sync client for drawing on a shared board.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A [`ClientReplica`] kept in step with the server's log
//! - Automatic resync requests when the live stream has a gap
//! - Expiry of submissions the server never answered

use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::action::{ActionId, ActionPayload, BoardId, UserId};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::replica::{ClientReplica, RenderFrame, ReplicaConfig, ReplicaError, ReplicaEvent, ReplicaState};

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The replica changed
    Replica(ReplicaEvent),
}

/// The sync client.
///
/// Owns the WebSocket connection for one board and feeds everything the
/// server sends into a shared [`ClientReplica`].
pub struct SyncClient {
    user_id: UserId,
    board_id: BoardId,
    server_url: String,
    replica: Arc<Mutex<ClientReplica>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(user_id: impl Into<UserId>, board_id: BoardId, server_url: impl Into<String>) -> Self {
        Self::with_config(user_id, board_id, server_url, ReplicaConfig::default())
    }

    pub fn with_config(
        user_id: impl Into<UserId>,
        board_id: BoardId,
        server_url: impl Into<String>,
        config: ReplicaConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            board_id,
            server_url: server_url.into(),
            replica: Arc::new(Mutex::new(ClientReplica::with_config(board_id, config))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns a writer, a reader and a sweeper for unanswered submissions.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.stop_tasks();
        let events = self.replica.lock().await.connecting();
        forward(&self.event_tx, events);

        let url = format!(
            "{}/{}?user={}",
            self.server_url.trim_end_matches('/'),
            self.board_id,
            self.user_id
        );
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                let events = self.replica.lock().await.connection_lost();
                forward(&self.event_tx, events);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode {message:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }));

        let events = self.replica.lock().await.connected();
        notify(&self.event_tx, SyncEvent::Connected);
        forward(&self.event_tx, events);

        // Reader task: feed server messages into the replica
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        let resync_tx = out_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let message = match ServerMessage::decode(text.as_str()) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("Ignoring undecodable server message: {e}");
                                continue;
                            }
                        };
                        let events = replica.lock().await.handle(message);
                        if events.contains(&ReplicaEvent::ResyncRequired) {
                            let _ = resync_tx.send(ClientMessage::Resync).await;
                        }
                        forward(&event_tx, events);
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            let events = replica.lock().await.connection_lost();
            forward(&event_tx, events);
            notify(&event_tx, SyncEvent::Disconnected);
        }));

        // Sweeper task: roll back submissions that were never answered
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        let period = {
            let timeout = self.replica.lock().await.ack_timeout();
            (timeout / 4).max(Duration::from_millis(50))
        };
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if out_tx.is_closed() {
                    break;
                }
                let events = replica.lock().await.expire_pending(Instant::now());
                forward(&event_tx, events);
            }
        }));

        Ok(())
    }

    /// Draw locally and send the action. Returns its temp id.
    pub async fn submit(&self, payload: ActionPayload) -> Result<String, ReplicaError> {
        let message = self.replica.lock().await.submit_local(payload)?;
        let temp_id = match &message {
            ClientMessage::Submit { client_temp_id, .. } => client_temp_id.clone(),
            _ => String::new(),
        };
        self.send(message).await?;
        Ok(temp_id)
    }

    pub async fn undo(&self) -> Result<(), ReplicaError> {
        let message = self.replica.lock().await.undo()?;
        self.send(message).await
    }

    pub async fn redo(&self) -> Result<(), ReplicaError> {
        let message = self.replica.lock().await.redo()?;
        self.send(message).await
    }

    pub async fn clear(&self) -> Result<(), ReplicaError> {
        let message = self.replica.lock().await.clear()?;
        self.send(message).await
    }

    /// Ask the server for a fresh `init_state`.
    pub async fn resync(&self) -> Result<(), ReplicaError> {
        self.send(ClientMessage::Resync).await
    }

    /// Send an application-level ping.
    pub async fn send_ping(&self) -> Result<(), ReplicaError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ReplicaError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(message).await.map_err(|_| ReplicaError::NotConnected),
            None => Err(ReplicaError::NotConnected),
        }
    }

    /// What to draw right now.
    pub async fn frame(&self) -> RenderFrame {
        self.replica.lock().await.frame()
    }

    pub async fn state(&self) -> ReplicaState {
        self.replica.lock().await.state()
    }

    /// Ids of the confirmed actions, in commit order.
    pub async fn action_ids(&self) -> Vec<ActionId> {
        self.replica.lock().await.action_ids()
    }

    pub async fn seq(&self) -> u64 {
        self.replica.lock().await.seq()
    }

    pub async fn pending_count(&self) -> usize {
        self.replica.lock().await.pending().len()
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Drop the connection. Pending submissions are discarded.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.stop_tasks();
        let events = self.replica.lock().await.connection_lost();
        forward(&self.event_tx, events);
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn forward(event_tx: &mpsc::Sender<SyncEvent>, events: Vec<ReplicaEvent>) {
    for event in events {
        notify(event_tx, SyncEvent::Replica(event));
    }
}

/// Never waits. A consumer that stops draining its events loses the
/// overflow instead of stalling the reader.
fn notify(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event channel full; dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

//! JSON wire protocol between board clients and the sync server.
//!
//! Wire format (one JSON object per WebSocket text frame, `type` discriminates):
//! ```text
//! client ──► server   submit │ undo │ redo │ clear │ resync │ ping
//! server ──► client   committed │ undone │ redone │ rejected
//!                     init_state │ unavailable │ pong
//! ```
//!
//! Every event that changes a board carries `seq`, the board's log version.
//! Replicas use it to fence catch-up snapshots and to detect gaps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::action::{
    Action, ActionId, ActionKind, ActionPayload, BoardId, CommitEvent, ConnectionId, LogEvent,
    Snapshot, UserId, ViewTransform,
};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Submit {
        kind: ActionKind,
        #[serde(default)]
        payload: Value,
        #[serde(rename = "clientTempId")]
        client_temp_id: String,
    },
    Undo,
    Redo,
    Clear,
    /// Ask for a fresh `init_state` (after a detected gap).
    Resync,
    Ping,
}

impl ClientMessage {
    pub fn submit(payload: &ActionPayload, client_temp_id: impl Into<String>) -> Self {
        ClientMessage::Submit {
            kind: payload.kind(),
            payload: payload.to_wire(),
            client_temp_id: client_temp_id.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Why a mutation was refused. Reported to the requesting connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("permission denied")]
    PermissionDenied,
    #[error("malformed payload")]
    MalformedPayload,
    #[error("unknown board")]
    UnknownBoard,
    #[error("nothing to undo")]
    EmptyUndo,
    #[error("nothing to redo")]
    EmptyRedo,
    /// The event could not be made durable; the board is unchanged.
    #[error("storage unavailable")]
    StorageUnavailable,
}

/// A commit made by this connection, echoed in `init_state` so a replica
/// that missed the `committed` frame can still settle its pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub client_temp_id: String,
    pub id: ActionId,
}

/// An action as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: Value,
    pub author_id: UserId,
    pub committed_at: u64,
}

impl From<&Action> for WireAction {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id,
            kind: action.kind(),
            payload: action.payload.to_wire(),
            author_id: action.author_id.clone(),
            committed_at: action.committed_at,
        }
    }
}

impl WireAction {
    /// Rebuild the typed action on the receiving side.
    pub fn into_action(self, board_id: BoardId) -> Result<Action, ProtocolError> {
        let payload = ActionPayload::from_wire(self.kind, self.payload)?;
        Ok(Action {
            id: self.id,
            board_id,
            author_id: self.author_id,
            committed_at: self.committed_at,
            payload,
        })
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Committed {
        seq: u64,
        id: ActionId,
        kind: ActionKind,
        payload: Value,
        author_id: UserId,
        committed_at: u64,
        /// Present only on the copy sent to the originating connection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<String>,
    },
    Undone {
        seq: u64,
        id: ActionId,
    },
    Redone {
        seq: u64,
        action: WireAction,
    },
    Rejected {
        #[serde(default)]
        client_temp_id: Option<String>,
        reason: RejectReason,
    },
    InitState {
        seq: u64,
        actions: Vec<WireAction>,
        #[serde(default)]
        view_transform: Option<ViewTransform>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        confirmed: Vec<Confirmation>,
    },
    /// The board cannot be served (storage down, bad board id). Fatal for
    /// this connection.
    Unavailable {
        reason: String,
    },
    Pong,
}

impl ServerMessage {
    /// Render a commit event for one recipient. `clientTempId` is only
    /// echoed back to the connection that submitted the action.
    pub fn from_commit(event: &CommitEvent, recipient: ConnectionId) -> Self {
        match &event.event {
            LogEvent::Committed(action) => {
                let client_temp_id = event
                    .origin
                    .as_ref()
                    .filter(|o| o.connection_id == recipient)
                    .and_then(|o| o.client_temp_id.clone());
                ServerMessage::Committed {
                    seq: event.seq,
                    id: action.id,
                    kind: action.kind(),
                    payload: action.payload.to_wire(),
                    author_id: action.author_id.clone(),
                    committed_at: action.committed_at,
                    client_temp_id,
                }
            }
            LogEvent::Undone(id) => ServerMessage::Undone {
                seq: event.seq,
                id: *id,
            },
            LogEvent::Redone(action) => ServerMessage::Redone {
                seq: event.seq,
                action: WireAction::from(action),
            },
        }
    }

    pub fn init_state(snapshot: &Snapshot, confirmed: Vec<Confirmation>) -> Self {
        ServerMessage::InitState {
            seq: snapshot.seq,
            actions: snapshot.actions.iter().map(WireAction::from).collect(),
            view_transform: snapshot.view_transform,
            confirmed,
        }
    }

    pub fn rejected(client_temp_id: Option<String>, reason: RejectReason) -> Self {
        ServerMessage::Rejected {
            client_temp_id,
            reason,
        }
    }

    /// Log version carried by board-changing messages.
    pub fn seq(&self) -> Option<u64> {
        match self {
            ServerMessage::Committed { seq, .. }
            | ServerMessage::Undone { seq, .. }
            | ServerMessage::Redone { seq, .. }
            | ServerMessage::InitState { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: ActionKind, reason: String },
    #[error("unsupported frame")]
    UnsupportedFrame,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

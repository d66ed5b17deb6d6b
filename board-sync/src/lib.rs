//! # board-sync: Real-time sync engine for shared whiteboards
//!
//! Every board has one authoritative, totally ordered action log on the
//! server. Clients draw optimistically and converge on that log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │
//! │ (per user)   │     JSON frames    │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                   ┌───────────────────┐     ┌─────────────┐
//! │ClientReplica │                   │SessionCoordinator │ ──► │ ActionStore │
//! │ (mirror +    │                   │ (one ActionLog    │     │ (RocksDB)   │
//! │  pending)    │                   │  per board)       │     └─────────────┘
//! └──────────────┘                   └───────┬───────────┘
//!                                            │
//!                               ┌────────────┴────────────┐
//!                               │ BroadcastRouter         │
//!                               │ + CatchUpProducer       │
//!                               └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`action`]: Action payloads, log events, snapshots
//! - [`action_log`]: Per-board ordered log with undo/redo
//! - [`coordinator`]: Serializes mutations per board, persists, publishes
//! - [`broadcast`]: Per-board fan-out of committed events
//! - [`catchup`]: Snapshot plus fenced live stream for joiners
//! - [`replica`]: Client-side mirror with optimistic submissions
//! - [`protocol`]: JSON wire messages
//! - [`server`] / [`client`]: WebSocket transport
//! - [`storage`]: Durable log storage
//! - [`auth`]: Edit permissions
//! - [`config`]: Server configuration

pub mod action;
pub mod action_log;
pub mod auth;
pub mod broadcast;
pub mod catchup;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use action::{
    Action, ActionId, ActionKind, ActionPayload, Attachment, BoardId, CirclePayload,
    CommitEvent, ConnectionId, ErasePayload, LogEvent, Origin, Point, RectPayload, Snapshot,
    StrokePayload, TextPayload, UserId, ViewTransform,
};
pub use action_log::{ActionLog, LogError, RedoPolicy};
pub use auth::{AllowAll, Authorizer, PermissionError, PermissionTable};
pub use broadcast::{BroadcastRouter, BroadcastStats, Subscription, SubscriptionError};
pub use catchup::{CatchUp, CatchUpError, CatchUpProducer, PendingCatchUp, SnapshotFence};
pub use client::{SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use coordinator::{Commit, CoordinatorError, CoordinatorStats, Participant, SessionCoordinator};
pub use protocol::{
    ClientMessage, Confirmation, ProtocolError, RejectReason, ServerMessage, WireAction,
};
pub use replica::{
    ClientReplica, PendingSubmission, RenderFrame, ReplicaConfig, ReplicaError, ReplicaEvent,
    ReplicaState,
};
pub use server::{ServerError, ServerStats, SyncServer};
pub use storage::{
    ActionStore, BoardMetadata, MemoryStore, RocksStore, StoreConfig, StoreError,
};

//! Client-side mirror of a board with optimistic local edits.
//!
//! Transport-free: the owner feeds it [`ServerMessage`]s and connection
//! lifecycle calls, and gets back [`ReplicaEvent`]s plus the
//! [`ClientMessage`]s to send.
//!
//! ```text
//!  Disconnected ──connecting()──► Connecting ──connected()──► CatchingUp
//!       ▲                                                       │  ▲
//!       │ connection_lost() / unavailable          init_state   │  │ gap
//!       └───────────────────────────────────────────────────── Live ┘
//! ```
//!
//! While catching up, live events are buffered and replayed once the
//! snapshot is installed, skipping those the snapshot already contains.
//! Once live, events must arrive with consecutive `seq`; anything older is a
//! duplicate, anything further ahead is a gap and forces a resync.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::action::{Action, ActionId, ActionKind, ActionPayload, BoardId, ViewTransform};
use crate::protocol::{
    ClientMessage, Confirmation, ProtocolError, RejectReason, ServerMessage, WireAction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Disconnected,
    Connecting,
    CatchingUp,
    Live,
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long a submission may wait for `committed`/`rejected`
    pub ack_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicaError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
}

/// A locally drawn action the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
    pub client_temp_id: String,
    pub payload: ActionPayload,
    pub submitted_at: Instant,
}

/// What changed as a result of a call into the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    StateChanged(ReplicaState),
    /// A snapshot was installed.
    Synced { seq: u64, actions: usize },
    /// The confirmed board changed; redraw.
    Applied { seq: u64 },
    /// A pending submission became action `id`.
    Confirmed { client_temp_id: String, id: ActionId },
    Rejected {
        client_temp_id: Option<String>,
        reason: RejectReason,
    },
    /// A pending submission got no answer in time and was rolled back.
    PendingExpired { client_temp_id: String },
    /// Pending submissions dropped with the connection.
    PendingDiscarded { client_temp_ids: Vec<String> },
    /// A gap was detected; send [`ClientMessage::Resync`].
    ResyncRequired,
    Unavailable { reason: String },
}

/// Input to a renderer: a pure function of this value yields the picture.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderFrame {
    /// Drawable payloads from the last `Clear` onwards, pending ones last.
    pub actions: Vec<ActionPayload>,
    pub view_transform: ViewTransform,
}

pub struct ClientReplica {
    board_id: BoardId,
    config: ReplicaConfig,
    state: ReplicaState,
    /// Log version of the mirror
    seq: u64,
    /// Confirmed active drawable actions, by id (= commit order)
    actions: BTreeMap<ActionId, Action>,
    view_transform: Option<ViewTransform>,
    /// Submission order
    pending: Vec<PendingSubmission>,
    /// Live events held back until the snapshot is in place
    buffered: Vec<ServerMessage>,
    next_temp_id: u64,
}

impl ClientReplica {
    pub fn new(board_id: BoardId) -> Self {
        Self::with_config(board_id, ReplicaConfig::default())
    }

    pub fn with_config(board_id: BoardId, config: ReplicaConfig) -> Self {
        Self {
            board_id,
            config,
            state: ReplicaState::Disconnected,
            seq: 0,
            actions: BTreeMap::new(),
            view_transform: None,
            pending: Vec::new(),
            buffered: Vec::new(),
            next_temp_id: 1,
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Confirmed active drawable actions in commit order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> + '_ {
        self.actions.values()
    }

    pub fn action_ids(&self) -> Vec<ActionId> {
        self.actions.keys().copied().collect()
    }

    pub fn view_transform(&self) -> Option<ViewTransform> {
        self.view_transform
    }

    pub fn pending(&self) -> &[PendingSubmission] {
        &self.pending
    }

    pub fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    pub fn connecting(&mut self) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        if self.state != ReplicaState::Connecting {
            self.discard_pending(&mut events);
            self.buffered.clear();
            self.set_state(ReplicaState::Connecting, &mut events);
        }
        events
    }

    /// Transport is up; the server's `init_state` is on its way.
    pub fn connected(&mut self) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        self.buffered.clear();
        self.set_state(ReplicaState::CatchingUp, &mut events);
        events
    }

    /// Transport dropped. Unconfirmed edits are gone; the mirror is kept for
    /// display until the next snapshot replaces it.
    pub fn connection_lost(&mut self) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        self.discard_pending(&mut events);
        self.buffered.clear();
        self.set_state(ReplicaState::Disconnected, &mut events);
        events
    }

    // ─── Local requests ───────────────────────────────────────────────

    /// Show `payload` immediately and produce the `submit` to send.
    pub fn submit_local(&mut self, payload: ActionPayload) -> Result<ClientMessage, ReplicaError> {
        self.submit_local_at(payload, Instant::now())
    }

    pub fn submit_local_at(
        &mut self,
        payload: ActionPayload,
        now: Instant,
    ) -> Result<ClientMessage, ReplicaError> {
        self.ensure_connected()?;
        payload.validate()?;

        let client_temp_id = format!("t{}", self.next_temp_id);
        self.next_temp_id += 1;

        let message = ClientMessage::submit(&payload, client_temp_id.clone());
        self.pending.push(PendingSubmission {
            client_temp_id,
            payload,
            submitted_at: now,
        });
        Ok(message)
    }

    pub fn undo(&self) -> Result<ClientMessage, ReplicaError> {
        self.ensure_connected()?;
        Ok(ClientMessage::Undo)
    }

    pub fn redo(&self) -> Result<ClientMessage, ReplicaError> {
        self.ensure_connected()?;
        Ok(ClientMessage::Redo)
    }

    pub fn clear(&self) -> Result<ClientMessage, ReplicaError> {
        self.ensure_connected()?;
        Ok(ClientMessage::Clear)
    }

    fn ensure_connected(&self) -> Result<(), ReplicaError> {
        match self.state {
            ReplicaState::CatchingUp | ReplicaState::Live => Ok(()),
            ReplicaState::Disconnected | ReplicaState::Connecting => Err(ReplicaError::NotConnected),
        }
    }

    /// Roll back submissions that waited longer than `ack_timeout`. They
    /// are not resent.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<ReplicaEvent> {
        let timeout = self.config.ack_timeout;
        let mut events = Vec::new();
        self.pending.retain(|p| {
            let expired = now.saturating_duration_since(p.submitted_at) >= timeout;
            if expired {
                log::warn!("Submission {} timed out", p.client_temp_id);
                events.push(ReplicaEvent::PendingExpired {
                    client_temp_id: p.client_temp_id.clone(),
                });
            }
            !expired
        });
        events
    }

    // ─── Server messages ──────────────────────────────────────────────

    pub fn handle(&mut self, message: ServerMessage) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();

        if matches!(
            self.state,
            ReplicaState::Disconnected | ReplicaState::Connecting
        ) {
            log::debug!("Ignoring server message while {:?}", self.state);
            return events;
        }

        match message {
            ServerMessage::InitState {
                seq,
                actions,
                view_transform,
                confirmed,
            } => self.install_snapshot(seq, actions, view_transform, confirmed, &mut events),

            ServerMessage::Committed { .. }
            | ServerMessage::Undone { .. }
            | ServerMessage::Redone { .. } => {
                if self.state == ReplicaState::CatchingUp {
                    self.buffered.push(message);
                } else {
                    self.apply_live(message, &mut events);
                }
            }

            ServerMessage::Rejected {
                client_temp_id,
                reason,
            } => {
                if let Some(temp_id) = &client_temp_id {
                    self.pending.retain(|p| &p.client_temp_id != temp_id);
                }
                events.push(ReplicaEvent::Rejected {
                    client_temp_id,
                    reason,
                });
            }

            ServerMessage::Unavailable { reason } => {
                log::warn!("Board {} unavailable: {reason}", self.board_id);
                self.discard_pending(&mut events);
                self.buffered.clear();
                self.set_state(ReplicaState::Disconnected, &mut events);
                events.push(ReplicaEvent::Unavailable { reason });
            }

            ServerMessage::Pong => {}
        }

        events
    }

    fn install_snapshot(
        &mut self,
        seq: u64,
        actions: Vec<WireAction>,
        view_transform: Option<ViewTransform>,
        confirmed: Vec<Confirmation>,
        events: &mut Vec<ReplicaEvent>,
    ) {
        let mut mirror = BTreeMap::new();
        for wire in actions {
            match wire.into_action(self.board_id) {
                Ok(action) => {
                    mirror.insert(action.id, action);
                }
                Err(e) => {
                    log::warn!("Unusable snapshot for board {}: {e}", self.board_id);
                    self.request_resync(events);
                    return;
                }
            }
        }

        self.actions = mirror;
        self.view_transform = view_transform;
        self.seq = seq;
        self.set_state(ReplicaState::Live, events);
        events.push(ReplicaEvent::Synced {
            seq,
            actions: self.actions.len(),
        });

        // Commits whose `committed` frame this replica never saw.
        for confirmation in confirmed {
            self.confirm(confirmation.client_temp_id, confirmation.id, events);
        }

        for message in std::mem::take(&mut self.buffered) {
            if self.state != ReplicaState::Live {
                break;
            }
            self.apply_live(message, events);
        }
    }

    fn apply_live(&mut self, message: ServerMessage, events: &mut Vec<ReplicaEvent>) {
        let Some(seq) = message.seq() else {
            return;
        };

        if seq <= self.seq {
            // Already reflected (snapshot overlap or redelivery). A commit of
            // ours may still be waiting on its confirmation.
            if let ServerMessage::Committed {
                id,
                client_temp_id: Some(temp_id),
                ..
            } = message
            {
                self.confirm(temp_id, id, events);
            }
            return;
        }

        if seq > self.seq + 1 {
            log::warn!(
                "Gap on board {}: have seq {}, got {seq}",
                self.board_id,
                self.seq
            );
            self.request_resync(events);
            return;
        }

        match message {
            ServerMessage::Committed {
                id,
                kind,
                payload,
                author_id,
                committed_at,
                client_temp_id,
                ..
            } => {
                let wire = WireAction {
                    id,
                    kind,
                    payload,
                    author_id,
                    committed_at,
                };
                match wire.into_action(self.board_id) {
                    Ok(action) => self.insert(action),
                    Err(e) => {
                        log::warn!("Unusable commit {id} on board {}: {e}", self.board_id);
                        self.request_resync(events);
                        return;
                    }
                }
                if let Some(temp_id) = client_temp_id {
                    self.confirm(temp_id, id, events);
                }
            }
            ServerMessage::Undone { id, .. } => {
                self.actions.remove(&id);
            }
            ServerMessage::Redone { action, .. } => match action.into_action(self.board_id) {
                Ok(action) => self.insert(action),
                Err(e) => {
                    log::warn!("Unusable redo on board {}: {e}", self.board_id);
                    self.request_resync(events);
                    return;
                }
            },
            _ => return,
        }

        self.seq = seq;
        events.push(ReplicaEvent::Applied { seq });
    }

    fn insert(&mut self, action: Action) {
        match action.payload {
            ActionPayload::ViewTransform(vt) => self.view_transform = Some(vt),
            _ => {
                self.actions.insert(action.id, action);
            }
        }
    }

    fn confirm(&mut self, client_temp_id: String, id: ActionId, events: &mut Vec<ReplicaEvent>) {
        let before = self.pending.len();
        self.pending.retain(|p| p.client_temp_id != client_temp_id);
        if self.pending.len() < before {
            events.push(ReplicaEvent::Confirmed { client_temp_id, id });
        }
    }

    fn request_resync(&mut self, events: &mut Vec<ReplicaEvent>) {
        self.buffered.clear();
        self.set_state(ReplicaState::CatchingUp, events);
        events.push(ReplicaEvent::ResyncRequired);
    }

    fn discard_pending(&mut self, events: &mut Vec<ReplicaEvent>) {
        if self.pending.is_empty() {
            return;
        }
        let client_temp_ids = self.pending.drain(..).map(|p| p.client_temp_id).collect();
        events.push(ReplicaEvent::PendingDiscarded { client_temp_ids });
    }

    fn set_state(&mut self, state: ReplicaState, events: &mut Vec<ReplicaEvent>) {
        if self.state != state {
            log::debug!("Replica for {}: {:?} -> {:?}", self.board_id, self.state, state);
            self.state = state;
            events.push(ReplicaEvent::StateChanged(state));
        }
    }

    // ─── Rendering ────────────────────────────────────────────────────

    /// Confirmed drawing followed by pending edits, cut at the last `Clear`.
    pub fn frame(&self) -> RenderFrame {
        let mut view_transform = self.view_transform.unwrap_or_default();
        let mut actions: Vec<ActionPayload> =
            self.actions.values().map(|a| a.payload.clone()).collect();

        for pending in &self.pending {
            match &pending.payload {
                ActionPayload::ViewTransform(vt) => view_transform = *vt,
                payload => actions.push(payload.clone()),
            }
        }

        let start = actions
            .iter()
            .rposition(|p| p.kind() == ActionKind::Clear)
            .unwrap_or(0);
        actions.drain(..start);

        RenderFrame {
            actions,
            view_transform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Point, StrokePayload};
    use uuid::Uuid;

    fn stroke(x: f64) -> ActionPayload {
        ActionPayload::Stroke(StrokePayload {
            points: vec![Point::new(0.0, 0.0), Point::new(x, x)],
            color: "#123".into(),
            width: 1.0,
        })
    }

    fn wire(id: ActionId, payload: &ActionPayload) -> WireAction {
        WireAction {
            id,
            kind: payload.kind(),
            payload: payload.to_wire(),
            author_id: "bob".into(),
            committed_at: 0,
        }
    }

    fn committed(seq: u64, id: ActionId, payload: &ActionPayload, temp: Option<&str>) -> ServerMessage {
        ServerMessage::Committed {
            seq,
            id,
            kind: payload.kind(),
            payload: payload.to_wire(),
            author_id: "bob".into(),
            committed_at: 0,
            client_temp_id: temp.map(String::from),
        }
    }

    fn live_replica() -> ClientReplica {
        let mut replica = ClientReplica::new(Uuid::new_v4());
        replica.connecting();
        replica.connected();
        replica.handle(ServerMessage::InitState {
            seq: 0,
            actions: vec![],
            view_transform: None,
            confirmed: vec![],
        });
        replica
    }

    #[test]
    fn test_state_machine() {
        let mut replica = ClientReplica::new(Uuid::new_v4());
        assert_eq!(replica.state(), ReplicaState::Disconnected);

        assert_eq!(
            replica.connecting(),
            vec![ReplicaEvent::StateChanged(ReplicaState::Connecting)]
        );
        replica.connected();
        assert_eq!(replica.state(), ReplicaState::CatchingUp);

        let events = replica.handle(ServerMessage::InitState {
            seq: 3,
            actions: vec![wire(1, &stroke(1.0))],
            view_transform: None,
            confirmed: vec![],
        });
        assert_eq!(replica.state(), ReplicaState::Live);
        assert!(events.contains(&ReplicaEvent::Synced { seq: 3, actions: 1 }));

        replica.connection_lost();
        assert_eq!(replica.state(), ReplicaState::Disconnected);
    }

    #[test]
    fn test_messages_ignored_while_disconnected() {
        let mut replica = ClientReplica::new(Uuid::new_v4());
        assert!(replica.handle(committed(1, 1, &stroke(1.0), None)).is_empty());
        assert_eq!(replica.seq(), 0);
        assert_eq!(replica.submit_local(stroke(1.0)), Err(ReplicaError::NotConnected));
    }

    #[test]
    fn test_optimistic_submit_confirmed() {
        let mut replica = live_replica();
        let msg = replica.submit_local(stroke(2.0)).unwrap();
        let temp_id = match msg {
            ClientMessage::Submit { client_temp_id, .. } => client_temp_id,
            other => panic!("expected submit, got {other:?}"),
        };
        assert_eq!(temp_id, "t1");
        assert_eq!(replica.frame().actions, vec![stroke(2.0)]);

        let events = replica.handle(committed(1, 1, &stroke(2.0), Some("t1")));
        assert!(events.contains(&ReplicaEvent::Confirmed {
            client_temp_id: "t1".into(),
            id: 1
        }));
        assert!(replica.pending().is_empty());
        // Same picture before and after confirmation.
        assert_eq!(replica.frame().actions, vec![stroke(2.0)]);
    }

    #[test]
    fn test_rejected_submission_removed() {
        let mut replica = live_replica();
        replica.submit_local(stroke(1.0)).unwrap();

        let events = replica.handle(ServerMessage::rejected(
            Some("t1".into()),
            RejectReason::PermissionDenied,
        ));
        assert_eq!(
            events,
            vec![ReplicaEvent::Rejected {
                client_temp_id: Some("t1".into()),
                reason: RejectReason::PermissionDenied
            }]
        );
        assert!(replica.pending().is_empty());
        assert!(replica.frame().actions.is_empty());
        assert!(replica.actions().next().is_none());
    }

    #[test]
    fn test_invalid_local_payload() {
        let mut replica = live_replica();
        let bad = ActionPayload::Stroke(StrokePayload {
            points: vec![],
            color: "#000".into(),
            width: 1.0,
        });
        assert!(matches!(replica.submit_local(bad), Err(ReplicaError::Invalid(_))));
        assert!(replica.pending().is_empty());
    }

    #[test]
    fn test_remote_undo_redo() {
        let mut replica = live_replica();
        replica.handle(committed(1, 1, &stroke(1.0), None));
        replica.handle(committed(2, 2, &stroke(2.0), None));

        replica.handle(ServerMessage::Undone { seq: 3, id: 2 });
        assert_eq!(replica.action_ids(), vec![1]);

        replica.handle(ServerMessage::Redone {
            seq: 4,
            action: wire(2, &stroke(2.0)),
        });
        assert_eq!(replica.action_ids(), vec![1, 2]);
        assert_eq!(replica.seq(), 4);
    }

    #[test]
    fn test_duplicate_ignored_gap_resyncs() {
        let mut replica = live_replica();
        replica.handle(committed(1, 1, &stroke(1.0), None));

        assert!(replica.handle(committed(1, 1, &stroke(1.0), None)).is_empty());
        assert_eq!(replica.action_ids(), vec![1]);

        let events = replica.handle(committed(3, 3, &stroke(3.0), None));
        assert!(events.contains(&ReplicaEvent::ResyncRequired));
        assert_eq!(replica.state(), ReplicaState::CatchingUp);
        assert_eq!(replica.action_ids(), vec![1]);
    }

    #[test]
    fn test_live_events_buffered_during_catch_up() {
        let mut replica = ClientReplica::new(Uuid::new_v4());
        replica.connecting();
        replica.connected();

        // Seq 2 is already in the snapshot; seq 3 is not.
        replica.handle(committed(2, 2, &stroke(2.0), None));
        replica.handle(committed(3, 3, &stroke(3.0), None));
        assert_eq!(replica.seq(), 0);

        replica.handle(ServerMessage::InitState {
            seq: 2,
            actions: vec![wire(1, &stroke(1.0)), wire(2, &stroke(2.0))],
            view_transform: None,
            confirmed: vec![],
        });
        assert_eq!(replica.action_ids(), vec![1, 2, 3]);
        assert_eq!(replica.seq(), 3);
    }

    #[test]
    fn test_own_commit_inside_snapshot_still_confirms() {
        let mut replica = ClientReplica::new(Uuid::new_v4());
        replica.connecting();
        replica.connected();
        replica.submit_local(stroke(1.0)).unwrap();

        replica.handle(committed(1, 1, &stroke(1.0), Some("t1")));
        let events = replica.handle(ServerMessage::InitState {
            seq: 1,
            actions: vec![wire(1, &stroke(1.0))],
            view_transform: None,
            confirmed: vec![],
        });

        assert!(events.contains(&ReplicaEvent::Confirmed {
            client_temp_id: "t1".into(),
            id: 1
        }));
        assert_eq!(replica.frame().actions, vec![stroke(1.0)]);
    }

    #[test]
    fn test_resync_snapshot_confirms_missed_commit() {
        let mut replica = live_replica();
        let start = Instant::now();
        replica.submit_local_at(stroke(1.0), start).unwrap();

        // Our `committed` frame was lost; the next event reveals the gap.
        let events = replica.handle(committed(2, 2, &stroke(2.0), None));
        assert!(events.contains(&ReplicaEvent::ResyncRequired));

        let events = replica.handle(ServerMessage::InitState {
            seq: 2,
            actions: vec![wire(1, &stroke(1.0)), wire(2, &stroke(2.0))],
            view_transform: None,
            confirmed: vec![Confirmation {
                client_temp_id: "t1".into(),
                id: 1,
            }],
        });
        assert!(events.contains(&ReplicaEvent::Confirmed {
            client_temp_id: "t1".into(),
            id: 1
        }));
        assert!(replica.pending().is_empty());
        assert_eq!(replica.frame().actions, vec![stroke(1.0), stroke(2.0)]);
        assert!(replica.expire_pending(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_pending_expires_without_retry() {
        let mut replica = ClientReplica::with_config(
            Uuid::new_v4(),
            ReplicaConfig {
                ack_timeout: Duration::from_millis(100),
            },
        );
        replica.connecting();
        replica.connected();
        let start = Instant::now();
        replica.submit_local_at(stroke(1.0), start).unwrap();
        replica
            .submit_local_at(stroke(2.0), start + Duration::from_millis(80))
            .unwrap();

        let events = replica.expire_pending(start + Duration::from_millis(120));
        assert_eq!(
            events,
            vec![ReplicaEvent::PendingExpired {
                client_temp_id: "t1".into()
            }]
        );
        assert_eq!(replica.pending().len(), 1);
        assert_eq!(replica.pending()[0].client_temp_id, "t2");
    }

    #[test]
    fn test_connection_lost_discards_pending() {
        let mut replica = live_replica();
        replica.submit_local(stroke(1.0)).unwrap();
        replica.submit_local(stroke(2.0)).unwrap();

        let events = replica.connection_lost();
        assert!(events.contains(&ReplicaEvent::PendingDiscarded {
            client_temp_ids: vec!["t1".into(), "t2".into()]
        }));
        assert!(replica.pending().is_empty());

        // The next snapshot replaces the mirror wholesale.
        replica.connecting();
        replica.connected();
        replica.handle(ServerMessage::InitState {
            seq: 9,
            actions: vec![wire(4, &stroke(4.0))],
            view_transform: None,
            confirmed: vec![],
        });
        assert_eq!(replica.action_ids(), vec![4]);
    }

    #[test]
    fn test_frame_cuts_at_last_clear() {
        let mut replica = live_replica();
        replica.handle(committed(1, 1, &stroke(1.0), None));
        replica.handle(committed(2, 2, &ActionPayload::Clear, None));
        replica.handle(committed(3, 3, &stroke(3.0), None));

        assert_eq!(
            replica.frame().actions,
            vec![ActionPayload::Clear, stroke(3.0)]
        );

        // A pending clear hides everything confirmed.
        replica.submit_local(ActionPayload::Clear).unwrap();
        assert_eq!(replica.frame().actions, vec![ActionPayload::Clear]);
    }

    #[test]
    fn test_view_transform_tracking() {
        let mut replica = live_replica();
        let pan = ViewTransform {
            scale: 1.5,
            offset_x: 10.0,
            offset_y: -3.0,
            page: Some(2),
        };
        replica.handle(committed(1, 1, &ActionPayload::ViewTransform(pan), None));

        assert_eq!(replica.view_transform(), Some(pan));
        assert!(replica.actions().next().is_none());
        assert_eq!(replica.frame().view_transform, pan);
    }

    #[test]
    fn test_unavailable_disconnects() {
        let mut replica = live_replica();
        let events = replica.handle(ServerMessage::Unavailable {
            reason: "storage down".into(),
        });
        assert_eq!(replica.state(), ReplicaState::Disconnected);
        assert!(events.contains(&ReplicaEvent::Unavailable {
            reason: "storage down".into()
        }));
    }
}

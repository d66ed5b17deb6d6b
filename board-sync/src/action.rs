//! Board actions: the immutable values committed to a board's log.
//!
//! ```text
//! ActionPayload ──► Action (id, author, committed_at)
//!                      │
//!                      ▼
//!                  LogEvent ──► CommitEvent (seq, origin) ──► broadcast
//!                      │
//!                      └──────► ActionStore (bincode + LZ4)
//! ```
//!
//! Everything in here is also persisted through bincode, so these types
//! must not depend on a self-describing format. Wire-only JSON shapes live
//! in [`crate::protocol`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

use crate::protocol::ProtocolError;

pub type BoardId = Uuid;
pub type ConnectionId = Uuid;
/// Per-board sequence number, starting at 1. Never reused.
pub type ActionId = u64;
pub type UserId = String;

/// Discriminant of an [`ActionPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Stroke,
    Erase,
    Rect,
    Circle,
    Text,
    Clear,
    ViewTransform,
}

impl ActionKind {
    /// Whether the action contributes to the drawing (and to undo history).
    ///
    /// View transforms are shared pan/zoom state, not drawing history.
    pub fn is_drawable(self) -> bool {
        !matches!(self, ActionKind::ViewTransform)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Stroke => "stroke",
            ActionKind::Erase => "erase",
            ActionKind::Rect => "rect",
            ActionKind::Circle => "circle",
            ActionKind::Text => "text",
            ActionKind::Clear => "clear",
            ActionKind::ViewTransform => "view_transform",
        }
    }
}

/// 2D position in board (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Freehand pen stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokePayload {
    pub points: Vec<Point>,
    pub color: String,
    pub width: f64,
}

/// Freehand eraser path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErasePayload {
    pub points: Vec<Point>,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectPayload {
    pub x: f64,
    pub y: f64,
    /// May be negative when the rectangle was dragged up or left.
    pub width: f64,
    pub height: f64,
    pub color: String,
    pub line_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CirclePayload {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub color: String,
    pub line_width: f64,
}

/// Opaque renderable payload produced by document ingestion.
///
/// Transported and ordered, never parsed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    /// Base64 body as handed over by the ingestion service.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// Shared pan/zoom state, plus the document page being shown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    #[serde(default)]
    pub page: Option<u32>,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            page: None,
        }
    }
}

/// Kind-specific action data.
///
/// The kind is derived from the variant, so a committed action's kind and
/// payload can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    Stroke(StrokePayload),
    Erase(ErasePayload),
    Rect(RectPayload),
    Circle(CirclePayload),
    Text(TextPayload),
    Clear,
    ViewTransform(ViewTransform),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Stroke(_) => ActionKind::Stroke,
            ActionPayload::Erase(_) => ActionKind::Erase,
            ActionPayload::Rect(_) => ActionKind::Rect,
            ActionPayload::Circle(_) => ActionKind::Circle,
            ActionPayload::Text(_) => ActionKind::Text,
            ActionPayload::Clear => ActionKind::Clear,
            ActionPayload::ViewTransform(_) => ActionKind::ViewTransform,
        }
    }

    /// Decode and validate a JSON payload received for `kind`.
    pub fn from_wire(kind: ActionKind, payload: Value) -> Result<Self, ProtocolError> {
        let parsed = match kind {
            ActionKind::Stroke => ActionPayload::Stroke(decode(kind, payload)?),
            ActionKind::Erase => ActionPayload::Erase(decode(kind, payload)?),
            ActionKind::Rect => ActionPayload::Rect(decode(kind, payload)?),
            ActionKind::Circle => ActionPayload::Circle(decode(kind, payload)?),
            ActionKind::Text => ActionPayload::Text(decode(kind, payload)?),
            // Clear carries no data; whatever was sent alongside is ignored.
            ActionKind::Clear => ActionPayload::Clear,
            ActionKind::ViewTransform => ActionPayload::ViewTransform(decode(kind, payload)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// JSON body for the wire (`payload` field of `committed`).
    pub fn to_wire(&self) -> Value {
        let value = match self {
            ActionPayload::Stroke(p) => serde_json::to_value(p),
            ActionPayload::Erase(p) => serde_json::to_value(p),
            ActionPayload::Rect(p) => serde_json::to_value(p),
            ActionPayload::Circle(p) => serde_json::to_value(p),
            ActionPayload::Text(p) => serde_json::to_value(p),
            ActionPayload::Clear => return Value::Object(Default::default()),
            ActionPayload::ViewTransform(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }

    /// Reject payloads no renderer could draw deterministically.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        let malformed = |reason: &str| {
            Err(ProtocolError::MalformedPayload {
                kind,
                reason: reason.to_string(),
            })
        };

        match self {
            ActionPayload::Stroke(p) => {
                if p.points.len() < 2 {
                    return malformed("stroke needs at least two points");
                }
                if !p.points.iter().all(Point::is_finite) {
                    return malformed("non-finite point");
                }
                if !non_negative(p.width) {
                    return malformed("width must be a finite, non-negative number");
                }
            }
            ActionPayload::Erase(p) => {
                if p.points.is_empty() {
                    return malformed("erase needs at least one point");
                }
                if !p.points.iter().all(Point::is_finite) {
                    return malformed("non-finite point");
                }
                if !non_negative(p.width) {
                    return malformed("width must be a finite, non-negative number");
                }
            }
            ActionPayload::Rect(p) => {
                if ![p.x, p.y, p.width, p.height].iter().all(|v| v.is_finite()) {
                    return malformed("non-finite geometry");
                }
                if !non_negative(p.line_width) {
                    return malformed("lineWidth must be a finite, non-negative number");
                }
            }
            ActionPayload::Circle(p) => {
                if !p.x.is_finite() || !p.y.is_finite() || !non_negative(p.radius) {
                    return malformed("invalid center or radius");
                }
                if !non_negative(p.line_width) {
                    return malformed("lineWidth must be a finite, non-negative number");
                }
            }
            ActionPayload::Text(p) => {
                if p.x.is_some_and(|v| !v.is_finite()) || p.y.is_some_and(|v| !v.is_finite()) {
                    return malformed("non-finite text position");
                }
            }
            ActionPayload::Clear => {}
            ActionPayload::ViewTransform(p) => {
                if !(p.scale.is_finite() && p.scale > 0.0) {
                    return malformed("scale must be positive");
                }
                if !p.offset_x.is_finite() || !p.offset_y.is_finite() {
                    return malformed("non-finite offset");
                }
            }
        }
        Ok(())
    }
}

fn non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

fn decode<T: DeserializeOwned>(kind: ActionKind, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::MalformedPayload {
        kind,
        reason: e.to_string(),
    })
}

/// A committed action. Immutable once it leaves the [`crate::ActionLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub board_id: BoardId,
    pub author_id: UserId,
    /// Unix milliseconds at commit time (informational; order is `id`).
    pub committed_at: u64,
    pub payload: ActionPayload,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

/// One mutation of a board's log: the unit that is persisted, broadcast
/// and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEvent {
    Committed(Action),
    Undone(ActionId),
    /// Carries the whole action so a replica that joined after the undo can
    /// re-insert it.
    Redone(Action),
}

impl LogEvent {
    /// Id of the action this event is about.
    pub fn action_id(&self) -> ActionId {
        match self {
            LogEvent::Committed(a) | LogEvent::Redone(a) => a.id,
            LogEvent::Undone(id) => *id,
        }
    }
}

/// Which connection (and which of its pending submissions) caused a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub connection_id: ConnectionId,
    pub client_temp_id: Option<String>,
}

/// A [`LogEvent`] stamped with its position in the board's commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub board_id: BoardId,
    /// Log version after this event; consecutive per board.
    pub seq: u64,
    pub event: LogEvent,
    pub origin: Option<Origin>,
}

/// Point-in-time state of a board, enough to rebuild the picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub board_id: BoardId,
    /// Log version the snapshot reflects.
    pub seq: u64,
    /// Active drawable actions, commit order.
    pub actions: Vec<Action>,
    /// Latest active pan/zoom, if any was ever committed.
    pub view_transform: Option<ViewTransform>,
}

impl Snapshot {
    pub fn action_ids(&self) -> Vec<ActionId> {
        self.actions.iter().map(|a| a.id).collect()
    }
}

/// Wall-clock commit stamp in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

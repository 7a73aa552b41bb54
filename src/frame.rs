//! Frame — the universal message type for AirChat.
//!
//! ARCHITECTURE
//! ============
//! Every communication in AirChat is a Frame. Clients send request frames
//! over WebSocket, the server dispatches by syscall prefix, and responses flow
//! back as item/done/error frames. Server-initiated traffic (chat deltas,
//! stage updates, notices) arrives as item frames with no parent.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`, never nested.
//! - Responses correlate to requests via `parent_id`.
//! - The WS handler routes on `syscall` prefix ("room:", "stage:", etc.)
//!   and never inspects `data`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame in a request/response stream.
///
/// Every exchange is `request → item* → done` or `request → error`.
/// No special cases, no "ok" shortcut. A client may abandon its own
/// request early by sending a `cancel` frame that names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Item,
    Done,
    Error,
    Cancel,
}

impl Status {
    /// Terminal statuses end a response stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error | Status::Cancel)
    }
}

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame. Entry point for every syscall.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create a server-initiated item frame with no parent request.
    ///
    /// Used for live deltas pushed to subscribers: chat messages, stage
    /// updates, presence changes, notices.
    pub fn push(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Item,
            data,
        }
    }

    /// Create an item response carrying one result.
    #[must_use]
    pub fn item(&self, data: Data) -> Self {
        self.reply(Status::Item, data)
    }

    /// Create a done response. Terminal, carries no data.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    /// Create a done response carrying a final payload. Terminal.
    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create an error response from a plain string. Terminal.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(Status::Error, data)
    }

    /// Create a structured error response from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    /// Build a reply frame. Inherits `parent_id`, `room_id`, and `syscall`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room_id: self.room_id,
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room_id(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// Extract the syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sets_fields() {
        let frame = Frame::request("room:join", Data::new());
        assert_eq!(frame.syscall, "room:join");
        assert_eq!(frame.status, Status::Request);
        assert!(frame.parent_id.is_none());
        assert!(frame.room_id.is_none());
        assert!(frame.ts > 0);
    }

    #[test]
    fn push_is_item_with_no_parent() {
        let frame = Frame::push("notice:push", Data::new());
        assert_eq!(frame.status, Status::Item);
        assert!(frame.parent_id.is_none());
    }

    #[test]
    fn reply_inherits_context() {
        let room_id = Uuid::new_v4();
        let req = Frame::request("chat:send", Data::new()).with_room_id(room_id);
        let item = req.item(Data::new());

        assert_eq!(item.parent_id, Some(req.id));
        assert_eq!(item.room_id, Some(room_id));
        assert_eq!(item.syscall, "chat:send");
        assert_eq!(item.status, Status::Item);
    }

    #[test]
    fn done_is_terminal() {
        assert!(Status::Done.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(Status::Cancel.is_terminal());
        assert!(!Status::Request.is_terminal());
        assert!(!Status::Item.is_terminal());
    }

    #[test]
    fn done_with_carries_payload() {
        let req = Frame::request("stage:request_seat", Data::new());
        let done = req.done_with(Data::from([("seat".to_string(), serde_json::json!(2))]));

        assert_eq!(done.status, Status::Done);
        assert_eq!(done.data.get("seat").and_then(serde_json::Value::as_i64), Some(2));
    }

    #[test]
    fn prefix_extraction() {
        let frame = Frame::request("stage:leave_seat", Data::new());
        assert_eq!(frame.prefix(), "stage");

        let frame = Frame::request("noseparator", Data::new());
        assert_eq!(frame.prefix(), "noseparator");
    }

    #[test]
    fn json_round_trip() {
        let room_id = Uuid::new_v4();
        let original = Frame::request("room:join", Data::new())
            .with_room_id(room_id)
            .with_from("test-user")
            .with_data("key", "value");

        let json = serde_json::to_string(&original).expect("serialize");
        let restored: Frame = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.room_id, Some(room_id));
        assert_eq!(restored.syscall, "room:join");
        assert_eq!(restored.from.as_deref(), Some("test-user"));
        assert_eq!(restored.data.get("key").and_then(|v| v.as_str()), Some("value"));
    }

    #[test]
    fn error_from_typed() {
        #[derive(Debug, thiserror::Error)]
        #[error("all seats are taken")]
        struct StageFull;

        impl ErrorCode for StageFull {
            fn error_code(&self) -> &'static str {
                "E_STAGE_FULL"
            }
        }

        let req = Frame::request("stage:request_seat", Data::new());
        let err = req.error_from(&StageFull);

        assert_eq!(err.status, Status::Error);
        assert_eq!(err.data.get("code").and_then(|v| v.as_str()), Some("E_STAGE_FULL"));
        assert_eq!(err.data.get("message").and_then(|v| v.as_str()), Some("all seats are taken"));
        assert_eq!(
            err.data
                .get("retryable")
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );
    }
}

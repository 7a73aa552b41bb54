//! User-facing notices, rendered client-side as transient toasts.
//!
//! Request failures already travel back on the error frame of the request
//! itself. Notices cover everything out-of-band: a friend request arriving,
//! a reset email being sent, a seat being revoked while the user is away
//! from the stage panel.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::AppState;

use super::subscription::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// How long the client should keep the toast up. `None` means sticky:
    /// error notices stay until the user dismisses them.
    #[must_use]
    pub fn auto_dismiss_ms(self) -> Option<u64> {
        match self {
            Severity::Info | Severity::Success => Some(4_000),
            Severity::Warning => Some(8_000),
            Severity::Error => None,
        }
    }
}

/// Build a `notice:push` frame.
#[must_use]
pub fn notice_frame(severity: Severity, message: &str) -> Frame {
    let mut data = Data::new();
    data.insert("severity".into(), serde_json::json!(severity));
    data.insert("message".into(), serde_json::Value::String(message.to_string()));
    if let Some(ms) = severity.auto_dismiss_ms() {
        data.insert("auto_dismiss_ms".into(), serde_json::json!(ms));
    }
    Frame::push("notice:push", data)
}

/// Push a notice to every connection a user has open.
pub async fn notify_user(state: &AppState, user_id: Uuid, severity: Severity, message: &str) {
    let frame = notice_frame(severity, message);
    state.subs.publish(Topic::User(user_id), &frame).await;
}

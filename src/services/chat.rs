//! Chat service — room messages and direct messages.
//!
//! DESIGN
//! ======
//! Every message lives in the `messages` table under a canonical conversation
//! id. Room feeds use `room:{room_id}`. Direct messages use `dm:{low}:{high}`
//! with the participant ids sorted, so both sides compute the same id and a
//! pair never splits across two conversations.
//!
//! Feeds load the newest [`FEED_LIMIT`] messages and present them in
//! ascending send order. Messages are immutable once sent; the only
//! post-send mutation is the recipient's read mark.
//!
//! DM deltas are published here (both participants' user topics) because the
//! websocket Outcome layer only fans out to the current room. Room message
//! fan-out stays with the dispatch layer.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::state::AppState;

use super::friend;
use super::subscription::Topic;

/// Maximum messages returned per feed load.
pub const FEED_LIMIT: i64 = 50;

/// Maximum message length in characters.
pub const MAX_BODY_CHARS: usize = 4000;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    /// Set for direct messages, `None` for room messages.
    pub recipient_id: Option<Uuid>,
    pub body: String,
    /// Milliseconds since Unix epoch.
    pub sent_at: i64,
    /// Read mark, also epoch milliseconds. Only meaningful for DMs.
    pub read_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message body is empty")]
    EmptyBody,
    #[error("message body exceeds {max} characters")]
    BodyTooLong { max: usize },
    #[error("you can only message friends")]
    NotFriends,
    #[error("cannot message this user")]
    Blocked,
    #[error("not a participant in this conversation")]
    NotParticipant,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyBody => "E_EMPTY_BODY",
            Self::BodyTooLong { .. } => "E_BODY_TOO_LONG",
            Self::NotFriends => "E_NOT_FRIENDS",
            Self::Blocked => "E_BLOCKED",
            Self::NotParticipant => "E_NOT_PARTICIPANT",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

// =============================================================================
// CONVERSATION IDS (pure)
// =============================================================================

/// Canonical conversation id for a DM pair. Order-insensitive.
#[must_use]
pub fn dm_conversation_id(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{low}:{high}")
}

/// Conversation id for a room feed.
#[must_use]
pub fn room_conversation_id(room_id: Uuid) -> String {
    format!("room:{room_id}")
}

/// Parse the participant pair out of a DM conversation id.
#[must_use]
pub fn dm_participants(conversation_id: &str) -> Option<(Uuid, Uuid)> {
    let rest = conversation_id.strip_prefix("dm:")?;
    let (low, high) = rest.split_once(':')?;
    let (low, high) = (low.parse().ok()?, high.parse().ok()?);
    if low > high {
        return None;
    }
    Some((low, high))
}

/// Order messages the way feeds render them: oldest first, message id as a
/// stable tiebreaker for identical timestamps.
pub(crate) fn ascending_by_time(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
}

fn validate_body(body: &str) -> Result<&str, ChatError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyBody);
    }
    if trimmed.chars().count() > MAX_BODY_CHARS {
        return Err(ChatError::BodyTooLong { max: MAX_BODY_CHARS });
    }
    Ok(trimmed)
}

/// DM feeds are private: reject read-state access from outside the
/// participant pair. Room feeds are open to the room.
fn ensure_participant(conversation_id: &str, user_id: Uuid) -> Result<(), ChatError> {
    if let Some((low, high)) = dm_participants(conversation_id) {
        if user_id != low && user_id != high {
            return Err(ChatError::NotParticipant);
        }
    }
    Ok(())
}

// =============================================================================
// SEND
// =============================================================================

/// Persist a room message. The dispatch layer broadcasts it to the room.
pub async fn send_room_message(
    pool: &PgPool,
    room_id: Uuid,
    sender_id: Uuid,
    sender_name: &str,
    body: &str,
) -> Result<ChatMessage, ChatError> {
    let body = validate_body(body)?;
    let message = ChatMessage {
        id: Uuid::new_v4(),
        conversation_id: room_conversation_id(room_id),
        sender_id,
        sender_name: sender_name.to_string(),
        recipient_id: None,
        body: body.to_string(),
        sent_at: now_ms(),
        read_at: None,
    };
    insert_message(pool, &message).await?;
    Ok(message)
}

/// Persist a direct message and push it to both participants' connections.
///
/// `origin_conn` is excluded from the sender-side push; that connection gets
/// the message back on its request's done frame instead.
///
/// # Errors
///
/// `NotFriends` unless a friend edge exists, `Blocked` if either side has
/// blocked the other.
pub async fn send_dm(
    state: &AppState,
    sender_id: Uuid,
    sender_name: &str,
    recipient_id: Uuid,
    body: &str,
    origin_conn: Option<Uuid>,
) -> Result<ChatMessage, ChatError> {
    let body = validate_body(body)?;

    if friend::either_blocked(&state.pool, sender_id, recipient_id).await? {
        return Err(ChatError::Blocked);
    }
    if !friend::are_friends(&state.pool, sender_id, recipient_id).await? {
        return Err(ChatError::NotFriends);
    }

    let message = ChatMessage {
        id: Uuid::new_v4(),
        conversation_id: dm_conversation_id(sender_id, recipient_id),
        sender_id,
        sender_name: sender_name.to_string(),
        recipient_id: Some(recipient_id),
        body: body.to_string(),
        sent_at: now_ms(),
        read_at: None,
    };
    insert_message(&state.pool, &message).await?;

    let push = Frame::push("dm:message", message_data(&message));
    state.subs.publish(Topic::User(recipient_id), &push).await;
    state
        .subs
        .publish_excluding(Topic::User(sender_id), &push, origin_conn)
        .await;

    Ok(message)
}

async fn insert_message(pool: &PgPool, message: &ChatMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_id, recipient_id, body, sent_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(message.id)
    .bind(&message.conversation_id)
    .bind(message.sender_id)
    .bind(message.recipient_id)
    .bind(&message.body)
    .bind(message.sent_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flatten a message into frame data.
pub(crate) fn message_data(message: &ChatMessage) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(message.id));
    data.insert("conversation_id".into(), serde_json::json!(message.conversation_id));
    data.insert("sender_id".into(), serde_json::json!(message.sender_id));
    data.insert("sender_name".into(), serde_json::json!(message.sender_name));
    data.insert("recipient_id".into(), serde_json::json!(message.recipient_id));
    data.insert("body".into(), serde_json::json!(message.body));
    data.insert("sent_at".into(), serde_json::json!(message.sent_at));
    data.insert("read_at".into(), serde_json::json!(message.read_at));
    data
}

// =============================================================================
// FEED
// =============================================================================

/// Load the newest [`FEED_LIMIT`] messages of a conversation, oldest first.
pub async fn recent_messages(pool: &PgPool, conversation_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
    let rows = sqlx::query(
        r"SELECT m.id, m.conversation_id, m.sender_id, m.recipient_id, m.body, m.sent_at, m.read_at,
                 u.display_name AS sender_name
          FROM messages m
          JOIN users u ON u.id = m.sender_id
          WHERE m.conversation_id = $1
          ORDER BY m.sent_at DESC, m.id DESC
          LIMIT $2",
    )
    .bind(conversation_id)
    .bind(FEED_LIMIT)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<ChatMessage> = rows
        .into_iter()
        .map(|r| ChatMessage {
            id: r.get("id"),
            conversation_id: r.get("conversation_id"),
            sender_id: r.get("sender_id"),
            sender_name: r.get("sender_name"),
            recipient_id: r.get("recipient_id"),
            body: r.get("body"),
            sent_at: r.get("sent_at"),
            read_at: r.get("read_at"),
        })
        .collect();
    ascending_by_time(&mut messages);
    Ok(messages)
}

/// Mark every unread message addressed to `reader` in a conversation as read.
/// Returns the number of messages marked.
pub async fn mark_read(pool: &PgPool, conversation_id: &str, reader_id: Uuid) -> Result<u64, ChatError> {
    ensure_participant(conversation_id, reader_id)?;
    let result = sqlx::query(
        "UPDATE messages SET read_at = $1
         WHERE conversation_id = $2 AND recipient_id = $3 AND read_at IS NULL",
    )
    .bind(now_ms())
    .bind(conversation_id)
    .bind(reader_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Unread DM count for a conversation, for client-side badges.
pub async fn unread_count(pool: &PgPool, conversation_id: &str, reader_id: Uuid) -> Result<i64, ChatError> {
    ensure_participant(conversation_id, reader_id)?;
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM messages
         WHERE conversation_id = $1 AND recipient_id = $2 AND read_at IS NULL",
    )
    .bind(conversation_id)
    .bind(reader_id)
    .fetch_one(pool)
    .await?;
    Ok(row.get("n"))
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;

//! Room service — create/list/join/part and the live roster.
//!
//! DESIGN
//! ======
//! Rooms are persistent rows; live membership is in-memory only, keyed by
//! connection id so one user with several tabs holds several entries. The
//! roster shown to clients is deduplicated by user. A room's in-memory state
//! is evicted when the last connection parts; Postgres stays authoritative
//! for the room itself, its feed, and its stage.
//!
//! Join replies with one full snapshot (recent messages, sorted roster,
//! current stage document) so the client renders from a single consistent
//! read instead of stitching partial updates.

use std::collections::{HashMap, HashSet};

use sqlx::Row;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{AppState, RoomMember};

use super::chat::{self, ChatError, ChatMessage};
use super::presence::{self, RosterEntry};
use super::stage::{self, StageDoc, StageError};
use super::subscription::Topic;

const MAX_NAME_CHARS: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub member_count: usize,
}

/// Everything a client needs to render a room it just joined.
#[derive(Debug, serde::Serialize)]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub name: String,
    pub messages: Vec<ChatMessage>,
    pub roster: Vec<RosterEntry>,
    pub stage: StageDoc,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room name is empty")]
    EmptyName,
    #[error("room name too long (max {max} characters)")]
    NameTooLong { max: usize },
    #[error("room not found: {0}")]
    RoomNotFound(Uuid),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyName => "E_EMPTY_NAME",
            Self::NameTooLong { .. } => "E_NAME_TOO_LONG",
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::Stage(e) => e.error_code(),
            Self::Chat(e) => e.error_code(),
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Stage(e) => e.retryable(),
            Self::Chat(e) => e.retryable(),
            _ => false,
        }
    }
}

fn validate_name(name: &str) -> Result<&str, RoomError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RoomError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(RoomError::NameTooLong { max: MAX_NAME_CHARS });
    }
    Ok(name)
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Create a room and its stage document in one transaction.
pub async fn create_room(state: &AppState, name: &str, created_by: Uuid) -> Result<RoomSummary, RoomError> {
    let name = validate_name(name)?;
    let room_id = Uuid::new_v4();

    let mut tx = state.pool.begin().await?;
    sqlx::query("INSERT INTO rooms (id, name, created_by) VALUES ($1, $2, $3)")
        .bind(room_id)
        .bind(name)
        .bind(created_by)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("INSERT INTO stages (room_id, seats) VALUES ($1, $2)")
        .bind(room_id)
        .bind(sqlx::types::Json(stage::Seats::default()))
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    tracing::info!(%room_id, name, "room created");
    Ok(RoomSummary { id: room_id, name: name.to_string(), member_count: 0 })
}

/// All rooms with their live member counts, ordered by name.
pub async fn list_rooms(state: &AppState) -> Result<Vec<RoomSummary>, RoomError> {
    let rows = sqlx::query("SELECT id, name FROM rooms ORDER BY name, id")
        .fetch_all(&state.pool)
        .await?;

    let live = state.rooms.read().await;
    Ok(rows
        .into_iter()
        .map(|r| {
            let id: Uuid = r.get("id");
            let member_count = live.get(&id).map_or(0, |room| {
                room.members.values().map(|m| m.user_id).collect::<HashSet<_>>().len()
            });
            RoomSummary { id, name: r.get("name"), member_count }
        })
        .collect())
}

/// Join a room: register the connection, tell the room, and return the full
/// snapshot for the initial render.
pub async fn join_room(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    member: RoomMember,
) -> Result<RoomSnapshot, RoomError> {
    let row = sqlx::query("SELECT name FROM rooms WHERE id = $1")
        .bind(room_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(RoomError::RoomNotFound(room_id))?;
    let name: String = row.get("name");

    // Every fallible read comes before the membership write: a failed join
    // must leave no member behind.
    let messages = chat::recent_messages(&state.pool, &chat::room_conversation_id(room_id)).await?;
    let stage_doc = stage::snapshot(state.stage.as_ref(), room_id).await?;

    {
        let mut rooms = state.rooms.write().await;
        rooms.entry(room_id).or_default().members.insert(client_id, member);
    }
    broadcast_roster(state, room_id).await;
    let roster = roster(state, room_id).await;

    tracing::debug!(%room_id, %client_id, "room joined");
    Ok(RoomSnapshot { room_id, name, messages, roster, stage: stage_doc })
}

/// Remove a connection from a room. Returns false if it was not a member.
/// The room's in-memory state is evicted once the last connection is gone.
pub async fn part_room(state: &AppState, room_id: Uuid, client_id: Uuid) -> bool {
    {
        let mut rooms = state.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        if room.members.remove(&client_id).is_none() {
            return false;
        }
        if room.members.is_empty() {
            rooms.remove(&room_id);
        }
    }
    broadcast_roster(state, room_id).await;
    tracing::debug!(%room_id, %client_id, "room parted");
    true
}

// =============================================================================
// ROSTER
// =============================================================================

/// The room's member list in presentation order, deduplicated by user.
pub async fn roster(state: &AppState, room_id: Uuid) -> Vec<RosterEntry> {
    let users: HashMap<Uuid, RoomMember> = {
        let rooms = state.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return Vec::new();
        };
        room.members.values().map(|m| (m.user_id, m.clone())).collect()
    };

    let ids: Vec<Uuid> = users.keys().copied().collect();
    let online = presence::online_subset(state, &ids).await;

    let mut entries: Vec<RosterEntry> = users
        .into_values()
        .map(|m| RosterEntry {
            user_id: m.user_id,
            display_name: m.display_name,
            avatar_url: m.avatar_url,
            online: online.contains(&m.user_id),
        })
        .collect();
    presence::sort_roster(&mut entries);
    entries
}

/// Push the full sorted roster to everyone in the room. Total redraw: the
/// client replaces its list wholesale, so a replayed or stale update is
/// harmless.
async fn broadcast_roster(state: &AppState, room_id: Uuid) {
    let roster = roster(state, room_id).await;
    let mut data = Data::new();
    data.insert("roster".into(), serde_json::json!(roster));
    let push = Frame::push("roster:update", data).with_room_id(room_id);
    state.subs.publish(Topic::Room(room_id), &push).await;
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;

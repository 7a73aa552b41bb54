//! Online presence tracking and roster ordering.
//!
//! DESIGN
//! ======
//! A user is online while at least one websocket connection is open, so the
//! state keeps a connection count per user rather than a boolean. Only the
//! 0→1 and 1→0 transitions are broadcast; a second tab opening is invisible
//! to everyone else.

use std::collections::HashSet;

use sqlx::Row;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::AppState;

use super::subscription::Topic;

/// Record a new connection. Returns true if the user just came online.
pub async fn mark_online(state: &AppState, user_id: Uuid) -> bool {
    let mut online = state.online.write().await;
    let count = online.entry(user_id).or_insert(0);
    *count += 1;
    *count == 1
}

/// Record a closed connection. Returns true if the user just went offline.
pub async fn mark_offline(state: &AppState, user_id: Uuid) -> bool {
    let mut online = state.online.write().await;
    let Some(count) = online.get_mut(&user_id) else {
        return false;
    };
    *count = count.saturating_sub(1);
    if *count == 0 {
        online.remove(&user_id);
        return true;
    }
    false
}

pub async fn is_online(state: &AppState, user_id: Uuid) -> bool {
    state.online.read().await.contains_key(&user_id)
}

/// Filter the given ids down to those currently online.
pub async fn online_subset(state: &AppState, user_ids: &[Uuid]) -> HashSet<Uuid> {
    let online = state.online.read().await;
    user_ids
        .iter()
        .copied()
        .filter(|id| online.contains_key(id))
        .collect()
}

/// Push a `friend:presence` delta to every online friend of the user.
/// Called on the 0↔1 connection transitions only.
pub async fn broadcast_presence(state: &AppState, user_id: Uuid, online: bool) {
    let friend_ids = match friend_ids_of(state, user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(%user_id, error = %e, "presence: friend lookup failed, delta dropped");
            return;
        }
    };

    let mut data = Data::new();
    data.insert("user_id".into(), serde_json::json!(user_id));
    data.insert("online".into(), serde_json::json!(online));
    let push = Frame::push("friend:presence", data);

    for friend_id in online_subset(state, &friend_ids).await {
        state.subs.publish(Topic::User(friend_id), &push).await;
    }
}

async fn friend_ids_of(state: &AppState, user_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query("SELECT friend_id FROM friend_edges WHERE user_id = $1")
        .bind(user_id)
        .fetch_all(&state.pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get("friend_id")).collect())
}

// =============================================================================
// ROSTER ORDERING
// =============================================================================

/// One row in a friend list or room roster.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub online: bool,
}

/// Sort a roster in presentation order: online users first, then by display
/// name (case-insensitive), user id as the final tiebreaker so the order is
/// stable across refreshes.
pub fn sort_roster(entries: &mut [RosterEntry]) {
    entries.sort_by(|a, b| {
        b.online
            .cmp(&a.online)
            .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;

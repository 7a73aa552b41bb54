//! Friend service — requests, edges, blocks, and the directory listing.
//!
//! DESIGN
//! ======
//! A friendship is two symmetric rows in `friend_edges`, written in one
//! transaction when a request is accepted. The symmetry means membership
//! checks are a single-row lookup from either side. Pending requests live in
//! `friend_requests` until accepted (edges written, request deleted) or
//! rejected (request deleted, requester not told).
//!
//! Blocks are directional rows in `blocked_users`; a block in either
//! direction suppresses requests and DMs between the pair.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::AppState;

use super::notice::{self, Severity};
use super::presence::{self, RosterEntry};
use super::subscription::Topic;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct FriendRequest {
    pub id: Uuid,
    pub from_user: Uuid,
    pub from_display_name: String,
    pub to_user: Uuid,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserHit {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FriendError {
    #[error("cannot friend yourself")]
    SelfFriend,
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("already friends")]
    AlreadyFriends,
    #[error("a request between you already exists")]
    DuplicateRequest,
    #[error("friend request not found")]
    RequestNotFound,
    #[error("this request is not addressed to you")]
    Forbidden,
    #[error("not friends")]
    NotFriends,
    #[error("cannot send a request to this user")]
    Blocked,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for FriendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::SelfFriend => "E_SELF_FRIEND",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::AlreadyFriends => "E_ALREADY_FRIENDS",
            Self::DuplicateRequest => "E_DUPLICATE_REQUEST",
            Self::RequestNotFound => "E_REQUEST_NOT_FOUND",
            Self::Forbidden => "E_FORBIDDEN",
            Self::NotFriends => "E_NOT_FRIENDS",
            Self::Blocked => "E_BLOCKED",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

// =============================================================================
// CHECKS
// =============================================================================

/// Whether a friend edge exists. Symmetric: one direction is enough.
pub async fn are_friends(pool: &PgPool, a: Uuid, b: Uuid) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM friend_edges WHERE user_id = $1 AND friend_id = $2) AS yes")
        .bind(a)
        .bind(b)
        .fetch_one(pool)
        .await?;
    Ok(row.get("yes"))
}

/// Whether either side has blocked the other.
pub async fn either_blocked(pool: &PgPool, a: Uuid, b: Uuid) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS(
             SELECT 1 FROM blocked_users
             WHERE (blocker_id = $1 AND blocked_id = $2) OR (blocker_id = $2 AND blocked_id = $1)
         ) AS yes",
    )
    .bind(a)
    .bind(b)
    .fetch_one(pool)
    .await?;
    Ok(row.get("yes"))
}

async fn display_name_of(pool: &PgPool, user_id: Uuid) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT display_name FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("display_name")))
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Send a friend request and push it to the target's connections.
pub async fn send_request(state: &AppState, from: Uuid, to: Uuid) -> Result<FriendRequest, FriendError> {
    if from == to {
        return Err(FriendError::SelfFriend);
    }
    if display_name_of(&state.pool, to).await?.is_none() {
        return Err(FriendError::UserNotFound(to));
    }
    if either_blocked(&state.pool, from, to).await? {
        return Err(FriendError::Blocked);
    }
    if are_friends(&state.pool, from, to).await? {
        return Err(FriendError::AlreadyFriends);
    }

    let pending = sqlx::query(
        "SELECT EXISTS(
             SELECT 1 FROM friend_requests
             WHERE (from_user = $1 AND to_user = $2) OR (from_user = $2 AND to_user = $1)
         ) AS yes",
    )
    .bind(from)
    .bind(to)
    .fetch_one(&state.pool)
    .await?;
    if pending.get::<bool, _>("yes") {
        return Err(FriendError::DuplicateRequest);
    }

    let from_display_name = display_name_of(&state.pool, from)
        .await?
        .ok_or(FriendError::UserNotFound(from))?;

    // The symmetric pair index catches a crossing request that races past
    // the pending check above.
    let row = sqlx::query(
        "INSERT INTO friend_requests (from_user, to_user) VALUES ($1, $2)
         ON CONFLICT DO NOTHING
         RETURNING id",
    )
    .bind(from)
    .bind(to)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(FriendError::DuplicateRequest)?;
    let request = FriendRequest { id: row.get("id"), from_user: from, from_display_name, to_user: to };

    let mut data = Data::new();
    data.insert("request_id".into(), serde_json::json!(request.id));
    data.insert("from_user".into(), serde_json::json!(request.from_user));
    data.insert("from_display_name".into(), serde_json::json!(request.from_display_name));
    let push = Frame::push("friend:request", data);
    state.subs.publish(Topic::User(to), &push).await;
    notice::notify_user(
        state,
        to,
        Severity::Info,
        &format!("{} sent you a friend request", request.from_display_name),
    )
    .await;

    Ok(request)
}

/// Accept a pending request addressed to `acting_user`, creating both edges.
pub async fn accept_request(state: &AppState, request_id: Uuid, acting_user: Uuid) -> Result<(), FriendError> {
    // The acceptor's name rides along on the lookup; once the edges commit,
    // everything left is push-only.
    let row = sqlx::query(
        r"SELECT r.from_user, r.to_user, u.display_name AS to_display_name
          FROM friend_requests r
          JOIN users u ON u.id = r.to_user
          WHERE r.id = $1",
    )
    .bind(request_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(FriendError::RequestNotFound)?;
    let from_user: Uuid = row.get("from_user");
    let to_user: Uuid = row.get("to_user");
    let to_display_name: String = row.get("to_display_name");
    if to_user != acting_user {
        return Err(FriendError::Forbidden);
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "INSERT INTO friend_edges (user_id, friend_id) VALUES ($1, $2), ($2, $1)
         ON CONFLICT DO NOTHING",
    )
    .bind(from_user)
    .bind(to_user)
    .execute(tx.as_mut())
    .await?;
    sqlx::query("DELETE FROM friend_requests WHERE id = $1")
        .bind(request_id)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    for (user, other) in [(from_user, to_user), (to_user, from_user)] {
        let mut data = Data::new();
        data.insert("user_id".into(), serde_json::json!(other));
        let push = Frame::push("friend:added", data);
        state.subs.publish(Topic::User(user), &push).await;
    }
    notice::notify_user(
        state,
        from_user,
        Severity::Success,
        &format!("{to_display_name} accepted your friend request"),
    )
    .await;

    Ok(())
}

/// Reject a pending request addressed to `acting_user`. The requester is not
/// notified.
pub async fn reject_request(state: &AppState, request_id: Uuid, acting_user: Uuid) -> Result<(), FriendError> {
    let result = sqlx::query("DELETE FROM friend_requests WHERE id = $1 AND to_user = $2")
        .bind(request_id)
        .bind(acting_user)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(FriendError::RequestNotFound);
    }
    Ok(())
}

/// Incoming pending requests for a user.
pub async fn pending_requests(pool: &PgPool, user_id: Uuid) -> Result<Vec<FriendRequest>, FriendError> {
    let rows = sqlx::query(
        r"SELECT r.id, r.from_user, r.to_user, u.display_name AS from_display_name
          FROM friend_requests r
          JOIN users u ON u.id = r.from_user
          WHERE r.to_user = $1
          ORDER BY u.display_name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| FriendRequest {
            id: r.get("id"),
            from_user: r.get("from_user"),
            from_display_name: r.get("from_display_name"),
            to_user: r.get("to_user"),
        })
        .collect())
}

// =============================================================================
// EDGES
// =============================================================================

/// Remove a friendship from both sides.
pub async fn remove_friend(state: &AppState, user_id: Uuid, friend_id: Uuid) -> Result<(), FriendError> {
    let result = sqlx::query(
        "DELETE FROM friend_edges
         WHERE (user_id = $1 AND friend_id = $2) OR (user_id = $2 AND friend_id = $1)",
    )
    .bind(user_id)
    .bind(friend_id)
    .execute(&state.pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(FriendError::NotFriends);
    }

    for (user, other) in [(user_id, friend_id), (friend_id, user_id)] {
        let mut data = Data::new();
        data.insert("user_id".into(), serde_json::json!(other));
        let push = Frame::push("friend:removed", data);
        state.subs.publish(Topic::User(user), &push).await;
    }
    Ok(())
}

/// Block a user: drops any friendship and pending requests, then records the
/// block. Idempotent.
pub async fn block_user(state: &AppState, blocker: Uuid, blocked: Uuid) -> Result<(), FriendError> {
    if blocker == blocked {
        return Err(FriendError::SelfFriend);
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "DELETE FROM friend_edges
         WHERE (user_id = $1 AND friend_id = $2) OR (user_id = $2 AND friend_id = $1)",
    )
    .bind(blocker)
    .bind(blocked)
    .execute(tx.as_mut())
    .await?;
    sqlx::query(
        "DELETE FROM friend_requests
         WHERE (from_user = $1 AND to_user = $2) OR (from_user = $2 AND to_user = $1)",
    )
    .bind(blocker)
    .bind(blocked)
    .execute(tx.as_mut())
    .await?;
    sqlx::query("INSERT INTO blocked_users (blocker_id, blocked_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(blocker)
        .bind(blocked)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    Ok(())
}

/// Remove a block. Quietly succeeds if none exists.
pub async fn unblock_user(pool: &PgPool, blocker: Uuid, blocked: Uuid) -> Result<(), FriendError> {
    sqlx::query("DELETE FROM blocked_users WHERE blocker_id = $1 AND blocked_id = $2")
        .bind(blocker)
        .bind(blocked)
        .execute(pool)
        .await?;
    Ok(())
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// The user's friend list with live presence, in presentation order.
pub async fn list_friends(state: &AppState, user_id: Uuid) -> Result<Vec<RosterEntry>, FriendError> {
    let rows = sqlx::query(
        r"SELECT u.id, u.display_name, u.avatar_url
          FROM friend_edges e
          JOIN users u ON u.id = e.friend_id
          WHERE e.user_id = $1",
    )
    .bind(user_id)
    .fetch_all(&state.pool)
    .await?;

    let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
    let online = presence::online_subset(state, &ids).await;

    let mut roster: Vec<RosterEntry> = rows
        .into_iter()
        .map(|r| {
            let id: Uuid = r.get("id");
            RosterEntry {
                user_id: id,
                display_name: r.get("display_name"),
                avatar_url: r.get("avatar_url"),
                online: online.contains(&id),
            }
        })
        .collect();
    presence::sort_roster(&mut roster);
    Ok(roster)
}

/// Resolve a directory query to public profile summaries.
///
/// A query that parses as a user id or looks like an email resolves exactly;
/// anything else matches display names as a substring. Excludes the searcher
/// and anyone in a block relationship with them.
pub async fn search_users(pool: &PgPool, user_id: Uuid, query: &str) -> Result<Vec<UserHit>, FriendError> {
    let term = query.trim();
    if term.is_empty() {
        return Ok(Vec::new());
    }

    let base = r"SELECT u.id, u.display_name, u.avatar_url
          FROM users u
          WHERE u.id <> $1
            AND NOT EXISTS(
                SELECT 1 FROM blocked_users b
                WHERE (b.blocker_id = u.id AND b.blocked_id = $1)
                   OR (b.blocker_id = $1 AND b.blocked_id = u.id)
            )";

    let rows = if let Ok(exact_id) = term.parse::<Uuid>() {
        sqlx::query(&format!("{base} AND u.id = $2"))
            .bind(user_id)
            .bind(exact_id)
            .fetch_all(pool)
            .await?
    } else if term.contains('@') {
        sqlx::query(&format!("{base} AND u.email = $2"))
            .bind(user_id)
            .bind(term.to_lowercase())
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query(&format!("{base} AND u.display_name ILIKE '%' || $2 || '%' ORDER BY u.display_name LIMIT 20"))
            .bind(user_id)
            .bind(term)
            .fetch_all(pool)
            .await?
    };

    Ok(rows
        .into_iter()
        .map(|r| UserHit { user_id: r.get("id"), display_name: r.get("display_name"), avatar_url: r.get("avatar_url") })
        .collect())
}

#[cfg(test)]
#[path = "friend_test.rs"]
mod tests;

//! User profile routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use super::auth::AuthUser;
use crate::services::{account, presence, session};
use crate::state::AppState;

#[derive(Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub member_since: Option<String>,
    pub online: bool,
    pub friend_count: i64,
}

/// `GET /api/users/:id/profile` — public profile with presence and friend count.
pub async fn user_profile(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_row = sqlx::query(
        r"SELECT id, display_name, avatar_url,
                 to_char(created_at, 'YYYY-MM-DD') AS member_since
          FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    let friend_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM friend_edges WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&state.pool)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let profile = UserProfile {
        user_id: user_row.get("id"),
        display_name: user_row.get("display_name"),
        avatar_url: user_row.get("avatar_url"),
        member_since: user_row.get("member_since"),
        online: presence::is_online(&state, user_id).await,
        friend_count,
    };

    Ok(Json(profile))
}

#[derive(Deserialize)]
pub struct UpdateMeBody {
    display_name: Option<String>,
    avatar_url: Option<String>,
}

/// `PATCH /api/users/me` — update display name and/or avatar.
pub async fn update_me(State(state): State<AppState>, auth: AuthUser, Json(body): Json<UpdateMeBody>) -> Response {
    let result = account::update_profile(
        &state.pool,
        auth.user.id,
        body.display_name.as_deref(),
        body.avatar_url.as_deref(),
    )
    .await;

    if let Err(e) = result {
        return super::auth::account_error(&e);
    }

    match session::user_by_id(&state.pool, auth.user.id).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "user reload failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

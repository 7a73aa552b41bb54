//! Auth routes — signup/login, GitHub OAuth flow, password reset, WS tickets.

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use time::Duration;

use crate::frame::ErrorCode;
use crate::services::account::{self, AccountError};
use crate::services::password_reset::{self, PasswordResetError};
use crate::services::{oauth, session};
use crate::state::AppState;

const COOKIE_NAME: &str = "session_token";
const OAUTH_STATE_COOKIE_NAME: &str = "oauth_state";

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

pub(crate) fn cookie_secure() -> bool {
    if let Some(value) = env_bool("COOKIE_SECURE") {
        return value;
    }

    std::env::var("GITHUB_REDIRECT_URI")
        .map(|uri| uri.starts_with("https://"))
        .unwrap_or(false)
}

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the session cookie.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub user: session::SessionUser,
    pub token: String,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar.get(COOKIE_NAME).map(Cookie::value).unwrap_or_default();
        if token.is_empty() {
            return Err(StatusCode::UNAUTHORIZED);
        }

        let app_state = AppState::from_ref(state);
        let user = session::validate_session(&app_state.pool, token)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { user, token: token.to_owned() })
    }
}

// =============================================================================
// COOKIE + ERROR HELPERS
// =============================================================================

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(cookie_secure())
        .build()
}

fn clear_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(cookie_secure())
        .max_age(Duration::ZERO)
        .build()
}

/// Structured JSON error body, same `{code, message}` shape the frame layer
/// uses for websocket errors.
fn error_response(status: StatusCode, err: &(impl ErrorCode + ?Sized)) -> Response {
    let body = serde_json::json!({ "code": err.error_code(), "message": err.to_string() });
    (status, Json(body)).into_response()
}

pub(crate) fn account_error(err: &AccountError) -> Response {
    let status = match err {
        AccountError::DuplicateEmail => StatusCode::CONFLICT,
        AccountError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AccountError::UserNotFound(_) => StatusCode::NOT_FOUND,
        AccountError::InvalidEmail | AccountError::WeakPassword { .. } | AccountError::InvalidDisplayName => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        AccountError::Database(e) => {
            tracing::error!(error = %e, "account db error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err)
}

fn reset_error(err: &PasswordResetError) -> Response {
    let status = match err {
        PasswordResetError::UnknownAccount => StatusCode::NOT_FOUND,
        PasswordResetError::InvalidEmail | PasswordResetError::InvalidCode => StatusCode::UNPROCESSABLE_ENTITY,
        PasswordResetError::VerificationFailed => StatusCode::UNAUTHORIZED,
        PasswordResetError::Account(inner) => return account_error(inner),
        PasswordResetError::Db(e) => {
            tracing::error!(error = %e, "password reset db error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        PasswordResetError::EmailDelivery(e) => {
            tracing::error!(error = %e, "reset email delivery failed");
            StatusCode::BAD_GATEWAY
        }
    };
    error_response(status, err)
}

// =============================================================================
// EMAIL + PASSWORD
// =============================================================================

#[derive(Deserialize)]
pub struct CredentialsBody {
    email: String,
    password: String,
}

/// `POST /api/auth/signup` — create an account and sign it in.
pub async fn signup(State(state): State<AppState>, Json(body): Json<CredentialsBody>) -> Response {
    let user_id = match account::sign_up(&state.pool, &body.email, &body.password).await {
        Ok(id) => id,
        Err(e) => return account_error(&e),
    };

    let token = match session::create_session(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "session creation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create session").into_response();
        }
    };

    let jar = CookieJar::new().add(session_cookie(token));
    (StatusCode::CREATED, jar, Json(serde_json::json!({ "user_id": user_id }))).into_response()
}

/// `POST /api/auth/login` — verify credentials, set the session cookie.
pub async fn login(State(state): State<AppState>, Json(body): Json<CredentialsBody>) -> Response {
    let user_id = match account::sign_in(&state.pool, &body.email, &body.password).await {
        Ok(id) => id,
        Err(e) => return account_error(&e),
    };

    let user = match session::user_by_id(&state.pool, user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => return (StatusCode::INTERNAL_SERVER_ERROR, "user vanished during login").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "user load failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to load user").into_response();
        }
    };

    let token = match session::create_session(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "session creation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create session").into_response();
        }
    };

    let jar = CookieJar::new().add(session_cookie(token));
    (jar, Json(user)).into_response()
}

/// `GET /api/auth/me` — return current user.
pub async fn me(auth: AuthUser) -> Json<session::SessionUser> {
    Json(auth.user)
}

/// `POST /api/auth/logout` — delete session, clear cookie.
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    let _ = session::delete_session(&state.pool, &auth.token).await;

    let jar = CookieJar::new().add(clear_cookie(COOKIE_NAME));
    (jar, StatusCode::NO_CONTENT)
}

// =============================================================================
// GITHUB OAUTH
// =============================================================================

/// `GET /auth/github` — redirect to GitHub authorization page.
pub async fn github_redirect(State(state): State<AppState>) -> Response {
    let Some(config) = &state.github else {
        return (StatusCode::SERVICE_UNAVAILABLE, "GitHub OAuth not configured").into_response();
    };

    let oauth_state = session::generate_token();
    let cookie = Cookie::build((OAUTH_STATE_COOKIE_NAME, oauth_state.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(cookie_secure())
        .max_age(Duration::minutes(10));

    let jar = CookieJar::new().add(cookie);
    (jar, Redirect::temporary(&config.authorize_url(&oauth_state))).into_response()
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: Option<String>,
}

/// `GET /auth/github/callback` — exchange code, upsert user, set cookie, redirect to `/`.
pub async fn github_callback(
    State(state): State<AppState>,
    jar: CookieJar,
    axum::extract::Query(params): axum::extract::Query<CallbackQuery>,
) -> Response {
    let Some(config) = &state.github else {
        return (StatusCode::SERVICE_UNAVAILABLE, "GitHub OAuth not configured").into_response();
    };

    // Verify OAuth CSRF state from cookie.
    let Some(callback_state) = params.state.as_deref() else {
        return (StatusCode::BAD_REQUEST, "missing oauth state").into_response();
    };
    let expected_state = jar
        .get(OAUTH_STATE_COOKIE_NAME)
        .map(Cookie::value)
        .unwrap_or_default();
    if expected_state.is_empty() || expected_state != callback_state {
        return (StatusCode::UNAUTHORIZED, "invalid oauth state").into_response();
    }

    // Exchange code for access token.
    let access_token = match oauth::exchange_code(config, &params.code).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "oauth code exchange failed");
            return (StatusCode::BAD_GATEWAY, "OAuth code exchange failed").into_response();
        }
    };

    // Fetch GitHub user profile.
    let gh_user = match oauth::fetch_github_user(&access_token).await {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, "github user fetch failed");
            return (StatusCode::BAD_GATEWAY, "failed to fetch GitHub profile").into_response();
        }
    };

    // Upsert user in DB.
    let user_id = match oauth::upsert_user(&state.pool, &gh_user).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "user upsert failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create user").into_response();
        }
    };

    // Create session.
    let token = match session::create_session(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "session creation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create session").into_response();
        }
    };

    // Set HttpOnly cookie and redirect to the app.
    let jar = jar
        .add(session_cookie(token))
        .add(clear_cookie(OAUTH_STATE_COOKIE_NAME));
    (jar, Redirect::temporary("/")).into_response()
}

// =============================================================================
// PASSWORD RESET
// =============================================================================

#[derive(Deserialize)]
pub struct ResetRequestBody {
    email: String,
}

/// `POST /api/auth/reset/request` — email a single-use reset code.
///
/// Without mailer config the code is logged server-side instead, so local
/// setups can complete the flow from the logs.
pub async fn request_reset(State(state): State<AppState>, Json(body): Json<ResetRequestBody>) -> Response {
    let code = match password_reset::request_reset(&state.pool, &body.email).await {
        Ok(code) => code,
        Err(e) => return reset_error(&e),
    };

    if let Some(mailer) = &state.mailer {
        if let Err(e) = password_reset::send_reset_email(mailer, &body.email, &code).await {
            return reset_error(&e);
        }
    } else {
        tracing::info!(email = %body.email, code, "mailer not configured; reset code logged");
    }

    StatusCode::ACCEPTED.into_response()
}

#[derive(Deserialize)]
pub struct ResetConfirmBody {
    email: String,
    code: String,
    new_password: String,
}

/// `POST /api/auth/reset/confirm` — consume the code, set the new password.
pub async fn confirm_reset(State(state): State<AppState>, Json(body): Json<ResetConfirmBody>) -> Response {
    match password_reset::confirm_reset(&state.pool, &body.email, &body.code, &body.new_password).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => reset_error(&e),
    }
}

// =============================================================================
// WS TICKET
// =============================================================================

/// `POST /api/auth/ws-ticket` — create a one-time WS ticket.
pub async fn ws_ticket(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, StatusCode> {
    let ticket = session::create_ws_ticket(&state.pool, auth.user.id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;

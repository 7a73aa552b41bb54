//! Password account service — sign-up, sign-in, profile updates.
//!
//! DESIGN
//! ======
//! Passwords are stored as salted SHA-256: a random 16-byte hex salt per
//! account, hash = sha256(salt || password). Sign-in failures collapse to one
//! generic `InvalidCredentials` at the surface; whether the account was
//! unknown or the password wrong is visible only in debug logs, never to the
//! caller.

use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::session::bytes_to_hex;

const PASSWORD_MIN_CHARS: usize = 8;
const DISPLAY_NAME_MAX_CHARS: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password too short (min {min} characters)")]
    WeakPassword { min: usize },
    #[error("an account with this email already exists")]
    DuplicateEmail,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("display name is empty or too long")]
    InvalidDisplayName,
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for AccountError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "E_INVALID_EMAIL",
            Self::WeakPassword { .. } => "E_WEAK_PASSWORD",
            Self::DuplicateEmail => "E_DUPLICATE_EMAIL",
            Self::InvalidCredentials => "E_INVALID_CREDENTIALS",
            Self::InvalidDisplayName => "E_INVALID_DISPLAY_NAME",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

// =============================================================================
// VALIDATION + HASHING
// =============================================================================

#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_ascii_lowercase();
    if normalized.is_empty() || !normalized.contains('@') {
        return None;
    }
    let parts = normalized.split('@').collect::<Vec<_>>();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return None;
    }
    Some(normalized)
}

pub(crate) fn validate_password(password: &str) -> Result<(), AccountError> {
    if password.chars().count() < PASSWORD_MIN_CHARS {
        return Err(AccountError::WeakPassword { min: PASSWORD_MIN_CHARS });
    }
    Ok(())
}

fn validate_display_name(name: &str) -> Result<&str, AccountError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > DISPLAY_NAME_MAX_CHARS {
        return Err(AccountError::InvalidDisplayName);
    }
    Ok(name)
}

#[must_use]
pub(crate) fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

#[must_use]
pub(crate) fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    bytes_to_hex(&hasher.finalize())
}

fn name_from_email(email: &str) -> String {
    email
        .split('@')
        .next()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("user")
        .to_owned()
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Create a password account. The display name starts as the email's local
/// part and can be changed later.
pub async fn sign_up(pool: &PgPool, email: &str, password: &str) -> Result<Uuid, AccountError> {
    let email = normalize_email(email).ok_or(AccountError::InvalidEmail)?;
    validate_password(password)?;

    let salt = generate_salt();
    let hash = hash_password(&salt, password);

    let row = sqlx::query(
        r"INSERT INTO users (email, display_name, password_hash, password_salt)
          VALUES ($1, $2, $3, $4)
          ON CONFLICT (email) DO NOTHING
          RETURNING id",
    )
    .bind(&email)
    .bind(name_from_email(&email))
    .bind(hash)
    .bind(salt)
    .fetch_optional(pool)
    .await?
    .ok_or(AccountError::DuplicateEmail)?;

    let user_id: Uuid = row.get("id");
    tracing::info!(%user_id, "account created");
    Ok(user_id)
}

/// Verify email + password. Unknown accounts and wrong passwords both come
/// back as `InvalidCredentials`.
pub async fn sign_in(pool: &PgPool, email: &str, password: &str) -> Result<Uuid, AccountError> {
    let email = normalize_email(email).ok_or(AccountError::InvalidEmail)?;

    let row = sqlx::query("SELECT id, password_hash, password_salt FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        tracing::debug!("sign-in failed: unknown account");
        return Err(AccountError::InvalidCredentials);
    };
    let user_id: Uuid = row.get("id");
    let (Some(hash), Some(salt)): (Option<String>, Option<String>) =
        (row.get("password_hash"), row.get("password_salt"))
    else {
        tracing::debug!(%user_id, "sign-in failed: no password on account");
        return Err(AccountError::InvalidCredentials);
    };

    if hash_password(&salt, password) != hash {
        tracing::debug!(%user_id, "sign-in failed: wrong password");
        return Err(AccountError::InvalidCredentials);
    }
    Ok(user_id)
}

/// Replace the password on an existing account, rotating the salt.
pub async fn set_password(pool: &PgPool, user_id: Uuid, new_password: &str) -> Result<(), AccountError> {
    validate_password(new_password)?;
    let salt = generate_salt();
    let hash = hash_password(&salt, new_password);

    let result = sqlx::query("UPDATE users SET password_hash = $1, password_salt = $2 WHERE id = $3")
        .bind(hash)
        .bind(salt)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AccountError::UserNotFound(user_id));
    }
    Ok(())
}

/// Update display name and/or avatar. `None` leaves a field unchanged.
pub async fn update_profile(
    pool: &PgPool,
    user_id: Uuid,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
) -> Result<(), AccountError> {
    let display_name = display_name.map(validate_display_name).transpose()?;

    let result = sqlx::query(
        r"UPDATE users
          SET display_name = COALESCE($1, display_name),
              avatar_url = COALESCE($2, avatar_url)
          WHERE id = $3",
    )
    .bind(display_name)
    .bind(avatar_url)
    .bind(user_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AccountError::UserNotFound(user_id));
    }
    Ok(())
}

#[cfg(test)]
#[path = "account_test.rs"]
mod tests;

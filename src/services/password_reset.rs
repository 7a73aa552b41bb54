//! Password reset via emailed access codes.
//!
//! Creates and verifies short-lived six-character codes linked to an email.
//! Codes are stored hashed; five wrong guesses burn the code.

use rand::Rng;
use resend_rs::Resend;
use resend_rs::types::CreateEmailBaseOptions;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::account::{self, AccountError, normalize_email};

const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const MAX_FAILED_ATTEMPTS: i32 = 5;
const RESET_EMAIL_TEMPLATE: &str = include_str!("../../templates/password_reset.html");

/// Outbound email configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub resend_api_key: String,
    pub from_address: String,
}

impl MailerConfig {
    /// Load from `RESEND_API_KEY` and `RESEND_FROM`. Returns `None` if either
    /// is missing (password reset will be disabled).
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let resend_api_key = std::env::var("RESEND_API_KEY").ok()?;
        let from_address = std::env::var("RESEND_FROM").ok()?;
        Some(Self { resend_api_key, from_address })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordResetError {
    #[error("invalid email")]
    InvalidEmail,
    #[error("no account with this email")]
    UnknownAccount,
    #[error("invalid code")]
    InvalidCode,
    #[error("expired or incorrect code")]
    VerificationFailed,
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("email delivery failed: {0}")]
    EmailDelivery(String),
}

impl crate::frame::ErrorCode for PasswordResetError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "E_INVALID_EMAIL",
            Self::UnknownAccount => "E_UNKNOWN_ACCOUNT",
            Self::InvalidCode => "E_INVALID_CODE",
            Self::VerificationFailed => "E_VERIFICATION_FAILED",
            Self::Account(e) => e.error_code(),
            Self::Db(_) => "E_DATABASE",
            Self::EmailDelivery(_) => "E_EMAIL_DELIVERY",
        }
    }
}

// =============================================================================
// CODES
// =============================================================================

#[must_use]
pub fn normalize_code(code: &str) -> Option<String> {
    let normalized = code.trim().to_ascii_uppercase();
    if normalized.len() != CODE_LEN
        || !normalized
            .chars()
            .all(|c| CODE_ALPHABET.contains(&(c as u8)))
    {
        return None;
    }
    Some(normalized)
}

#[must_use]
pub fn generate_reset_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

#[must_use]
pub fn hash_reset_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    super::session::bytes_to_hex(&hasher.finalize())
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Issue a reset code for an existing account, invalidating any earlier
/// unconsumed code for the same email. Returns the plain code for delivery.
pub async fn request_reset(pool: &PgPool, email: &str) -> Result<String, PasswordResetError> {
    let normalized = normalize_email(email).ok_or(PasswordResetError::InvalidEmail)?;

    let account = sqlx::query("SELECT 1 FROM users WHERE email = $1")
        .bind(&normalized)
        .fetch_optional(pool)
        .await?;
    if account.is_none() {
        return Err(PasswordResetError::UnknownAccount);
    }

    sqlx::query("DELETE FROM password_reset_codes WHERE email = $1 AND consumed_at IS NULL")
        .bind(&normalized)
        .execute(pool)
        .await?;

    let code = generate_reset_code();
    sqlx::query("INSERT INTO password_reset_codes (email, code_hash) VALUES ($1, $2)")
        .bind(&normalized)
        .bind(hash_reset_code(&code))
        .execute(pool)
        .await?;

    tracing::info!("password reset code issued");
    Ok(code)
}

/// Verify a reset code and set the new password. The code is consumed on
/// success; a wrong guess bumps the attempt counter and the code burns after
/// five failures.
pub async fn confirm_reset(
    pool: &PgPool,
    email: &str,
    code: &str,
    new_password: &str,
) -> Result<Uuid, PasswordResetError> {
    let normalized_email = normalize_email(email).ok_or(PasswordResetError::InvalidEmail)?;
    let normalized_code = normalize_code(code).ok_or(PasswordResetError::InvalidCode)?;
    // Reject a weak replacement before the code is spent on it.
    account::validate_password(new_password)?;

    let code_hash = hash_reset_code(&normalized_code);
    let update = sqlx::query(
        r"UPDATE password_reset_codes
          SET consumed_at = now()
          WHERE id = (
              SELECT id
              FROM password_reset_codes
              WHERE email = $1
                AND consumed_at IS NULL
                AND expires_at > now()
              ORDER BY created_at DESC
              LIMIT 1
          )
          AND code_hash = $2
          RETURNING id",
    )
    .bind(&normalized_email)
    .bind(&code_hash)
    .fetch_optional(pool)
    .await?;

    if update.is_none() {
        sqlx::query(
            r"UPDATE password_reset_codes
              SET attempts = attempts + 1,
                  consumed_at = CASE WHEN attempts + 1 >= $2 THEN now() ELSE consumed_at END
              WHERE id = (
                  SELECT id
                  FROM password_reset_codes
                  WHERE email = $1
                    AND consumed_at IS NULL
                    AND expires_at > now()
                  ORDER BY created_at DESC
                  LIMIT 1
              )",
        )
        .bind(&normalized_email)
        .bind(MAX_FAILED_ATTEMPTS)
        .execute(pool)
        .await?;
        return Err(PasswordResetError::VerificationFailed);
    }

    let user_row = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&normalized_email)
        .fetch_optional(pool)
        .await?;
    let Some(user_row) = user_row else {
        return Err(PasswordResetError::VerificationFailed);
    };
    let user_id: Uuid = user_row.get("id");

    account::set_password(pool, user_id, new_password).await?;
    tracing::info!(%user_id, "password reset completed");
    Ok(user_id)
}

// =============================================================================
// DELIVERY
// =============================================================================

/// Send the reset code email through Resend.
pub async fn send_reset_email(mailer: &MailerConfig, to_email: &str, code: &str) -> Result<(), PasswordResetError> {
    let resend = Resend::new(&mailer.resend_api_key);
    let to = [to_email];
    let subject = "Your AirChat password reset code";
    let html = render_reset_template(to_email, code);

    let email = CreateEmailBaseOptions::new(&mailer.from_address, to, subject).with_html(&html);
    resend
        .emails
        .send(email)
        .await
        .map_err(|e| PasswordResetError::EmailDelivery(e.to_string()))?;
    Ok(())
}

#[must_use]
pub fn render_reset_template(email: &str, code: &str) -> String {
    RESET_EMAIL_TEMPLATE
        .replace("{{EMAIL}}", email)
        .replace("{{CODE}}", code)
}

#[cfg(test)]
#[path = "password_reset_test.rs"]
mod tests;

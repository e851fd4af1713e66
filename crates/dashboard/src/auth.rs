//! Email/password accounts and bearer sessions.
//!
//! Users and sessions live in the same SQLite database as the node tree.
//! Passwords are stored as Argon2id PHC strings (salt and parameters
//! included); sessions are opaque UUID v4 tokens that expire after a TTL.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Shortest password the provider accepts.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Session lifetime unless configured otherwise.
pub const DEFAULT_SESSION_TTL: Duration = Duration::hours(24);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email not found. Please sign up first.")]
    EmailNotFound,

    #[error("Email already exists. Please login instead.")]
    EmailExists,

    #[error("Password should be at least 6 characters")]
    WeakPassword,

    #[error("{0}")]
    Unknown(String),
}

impl AuthError {
    /// Classify a raw provider error string by its well-known codes.
    pub fn from_provider_message(msg: &str) -> Self {
        if msg.contains("INVALID_PASSWORD") || msg.contains("INVALID_LOGIN_CREDENTIALS") {
            AuthError::InvalidCredentials
        } else if msg.contains("EMAIL_NOT_FOUND") {
            AuthError::EmailNotFound
        } else if msg.contains("EMAIL_EXISTS") {
            AuthError::EmailExists
        } else if msg.contains("WEAK_PASSWORD") {
            AuthError::WeakPassword
        } else {
            AuthError::Unknown(msg.to_string())
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        AuthError::from_provider_message(&format!("identity store error: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub token: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Identity {
    pool: Pool<Sqlite>,
    session_ttl: Duration,
}

impl Identity {
    pub fn new(pool: Pool<Sqlite>, session_ttl: Duration) -> Self {
        Self { pool, session_ttl }
    }

    /// Create an account and open a session for it.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let password = password.to_string();
        let hash = blocking(move || hash_password(&password)).await??;
        let now = OffsetDateTime::now_utc();

        sqlx::query("INSERT INTO users (email, password_hash, created_at) VALUES (?, ?, ?)")
            .bind(&email)
            .bind(&hash)
            .bind(now.unix_timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                let duplicate = e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if duplicate {
                    AuthError::EmailExists
                } else {
                    AuthError::from(e)
                }
            })?;

        tracing::info!(email = %email, "account created");
        self.open_session(email, now).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email)?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT password_hash FROM users WHERE email = ?")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;

        let Some((stored,)) = row else {
            return Err(AuthError::EmailNotFound);
        };
        let password = password.to_string();
        if !blocking(move || verify_password(&password, &stored)).await? {
            tracing::warn!(email = %email, "sign-in rejected");
            return Err(AuthError::InvalidCredentials);
        }

        self.open_session(email, OffsetDateTime::now_utc()).await
    }

    /// Revoke a session.  Unknown tokens are not an error.
    pub async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve a bearer token to its session.  Expired sessions are deleted
    /// and resolve to `None`.
    pub async fn session(&self, token: &str) -> Result<Option<Session>, AuthError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT email, created_at FROM sessions WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        let Some((email, created)) = row else {
            return Ok(None);
        };
        if OffsetDateTime::now_utc().unix_timestamp() - created >= self.session_ttl.whole_seconds() {
            tracing::debug!(email = %email, "session expired");
            self.sign_out(token).await?;
            return Ok(None);
        }

        Ok(Some(Session {
            token: token.to_string(),
            email,
            created_at: OffsetDateTime::from_unix_timestamp(created)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        }))
    }

    /// Delete every session older than the TTL.  Returns how many went.
    pub async fn prune_sessions(&self, now: OffsetDateTime) -> Result<u64, AuthError> {
        let cutoff = now.unix_timestamp() - self.session_ttl.whole_seconds();
        let done = sqlx::query("DELETE FROM sessions WHERE created_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn open_session(&self, email: String, now: OffsetDateTime) -> Result<Session, AuthError> {
        let pruned = self.prune_sessions(now).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "expired sessions removed");
        }

        let token = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO sessions (token, email, created_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(&email)
            .bind(now.unix_timestamp())
            .execute(&self.pool)
            .await?;

        Ok(Session {
            token,
            email,
            created_at: now.replace_nanosecond(0).unwrap_or(now),
        })
    }
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::Unknown(format!("invalid email address '{email}'")));
    }
    Ok(email)
}

/// Run a CPU-heavy hash off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Unknown(format!("password task failed: {e}")))
}

/// Argon2id PHC string for `password`.  The salt comes from a v4 UUID,
/// which is drawn from the OS random source.
fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| AuthError::Unknown(format!("salt encoding failed: {e}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Unknown(format!("password hashing failed: {e}")))
}

/// Constant-time check of `password` against a stored PHC string.  An
/// unparseable stored hash never verifies.
fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        tracing::warn!("stored password hash is malformed");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// ===========================================================================
// Tests
// ===========================================================================

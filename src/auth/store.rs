//! SQLite-backed account store.
//!
//! Owns the credential and profile columns of the `users` table. Quota
//! counters live in the same rows but are written by the usage ledger.

use crate::auth::password::{dummy_verify, hash_password, verify_password, MIN_PASSWORD_LEN};
use crate::config::QuotaConfig;
use crate::db::{from_epoch, Database};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest accepted email address.
const MAX_EMAIL_LEN: usize = 254;

/// Default page size for [`AccountStore::list_users`].
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Largest page size for [`AccountStore::list_users`].
pub const MAX_PAGE_LIMIT: u32 = 1000;

const USER_COLUMNS: &str = "id, email, hashed_password, is_active, is_admin, created_at, updated_at,
    monthly_llm_token_limit, monthly_embedding_token_limit,
    llm_tokens_used_this_month, embedding_tokens_used_this_month,
    last_token_reset_date, rag_settings";

/// Account store failures the HTTP layer reports to clients.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("Email already registered")]
    EmailTaken,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Password must be at least 8 characters")]
    WeakPassword,
    #[error("Token limits must be positive")]
    InvalidLimit,
    #[error("Incorrect email or password")]
    InvalidCredentials,
    #[error("Inactive user")]
    Inactive,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for AccountError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Per-user retrieval defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagSettings {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub top_k: u32,
    pub default_llm_model: String,
    pub default_embedding_model: String,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 3,
            default_llm_model: "gpt-3.5-turbo".into(),
            default_embedding_model: "text-embedding-ada-002".into(),
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub monthly_llm_token_limit: i64,
    pub monthly_embedding_token_limit: i64,
    pub llm_tokens_used_this_month: i64,
    pub embedding_tokens_used_this_month: i64,
    pub last_token_reset_date: DateTime<Utc>,
    pub rag_settings: RagSettings,
}

/// Input for [`AccountStore::create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub is_active: bool,
    pub is_admin: bool,
}

impl NewUser {
    /// Active, non-admin account.
    pub fn regular(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            is_active: true,
            is_admin: false,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
    pub monthly_llm_token_limit: Option<i64>,
    pub monthly_embedding_token_limit: Option<i64>,
}

impl UserUpdate {
    /// Whether the update touches fields only administrators may change.
    pub fn touches_privileged_fields(&self) -> bool {
        self.is_active.is_some()
            || self.is_admin.is_some()
            || self.monthly_llm_token_limit.is_some()
            || self.monthly_embedding_token_limit.is_some()
    }
}

/// Account CRUD over the shared database.
pub struct AccountStore {
    db: Arc<Database>,
    quota: QuotaConfig,
}

impl AccountStore {
    pub fn new(db: Arc<Database>, quota: QuotaConfig) -> Self {
        Self { db, quota }
    }

    // ── User Management ─────────────────────────────────────────────

    /// Create an account with the configured default limits.
    pub fn create_user(&self, new_user: NewUser) -> Result<User, AccountError> {
        let email = normalize_email(&new_user.email)?;
        if new_user.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::WeakPassword);
        }

        let hashed_password = hash_password(&new_user.password)?;
        let rag_settings = serde_json::to_string(&RagSettings::default())
            .map_err(|e| AccountError::Storage(e.into()))?;
        let now = Utc::now().timestamp();

        let conn = self.db.lock();
        let result = conn.execute(
            "INSERT INTO users (email, hashed_password, is_active, is_admin, created_at, updated_at,
                monthly_llm_token_limit, monthly_embedding_token_limit, last_token_reset_date,
                rag_settings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?5, ?8)",
            params![
                email,
                hashed_password,
                new_user.is_active,
                new_user.is_admin,
                now,
                self.quota.default_monthly_llm_token_limit,
                self.quota.default_monthly_embedding_token_limit,
                rag_settings,
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(AccountError::EmailTaken);
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        let user = query_user(&conn, "id = ?1", params![id])?
            .ok_or_else(|| AccountError::Storage(anyhow::anyhow!("user {id} vanished after insert")))?;
        tracing::info!(user_id = id, is_admin = user.is_admin, "Account created");
        Ok(user)
    }

    /// Verify credentials. Unknown email and wrong password are indistinguishable.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<User, AccountError> {
        let Some(user) = self.get_user_by_email(email)? else {
            dummy_verify(password);
            return Err(AccountError::InvalidCredentials);
        };
        if !verify_password(password, &user.hashed_password) {
            tracing::debug!(user_id = user.id, "Password mismatch");
            return Err(AccountError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AccountError::Inactive);
        }
        Ok(user)
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>, AccountError> {
        let conn = self.db.lock();
        query_user(&conn, "id = ?1", params![user_id])
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AccountError> {
        let conn = self.db.lock();
        query_user(&conn, "email = ?1 COLLATE NOCASE", params![email.trim()])
    }

    /// Page through accounts ordered by id.
    pub fn list_users(&self, skip: u32, limit: u32) -> Result<Vec<User>, AccountError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT ?1 OFFSET ?2"
        ))?;
        let users = stmt
            .query_map(params![limit, skip], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Apply a partial update. Returns `None` if the account does not exist.
    pub fn update_user(&self, user_id: i64, update: UserUpdate) -> Result<Option<User>, AccountError> {
        let email = update.email.as_deref().map(normalize_email).transpose()?;
        let hashed_password = match update.password.as_deref() {
            Some(p) if p.chars().count() < MIN_PASSWORD_LEN => return Err(AccountError::WeakPassword),
            Some(p) => Some(hash_password(p)?),
            None => None,
        };
        for limit in [update.monthly_llm_token_limit, update.monthly_embedding_token_limit]
            .into_iter()
            .flatten()
        {
            if limit <= 0 {
                return Err(AccountError::InvalidLimit);
            }
        }

        let conn = self.db.lock();
        let result = conn.execute(
            "UPDATE users SET
                email = COALESCE(?2, email),
                hashed_password = COALESCE(?3, hashed_password),
                is_active = COALESCE(?4, is_active),
                is_admin = COALESCE(?5, is_admin),
                monthly_llm_token_limit = COALESCE(?6, monthly_llm_token_limit),
                monthly_embedding_token_limit = COALESCE(?7, monthly_embedding_token_limit),
                updated_at = ?8
             WHERE id = ?1",
            params![
                user_id,
                email,
                hashed_password,
                update.is_active,
                update.is_admin,
                update.monthly_llm_token_limit,
                update.monthly_embedding_token_limit,
                Utc::now().timestamp(),
            ],
        );

        match result {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(AccountError::EmailTaken);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user_id, "Account updated");
        query_user(&conn, "id = ?1", params![user_id])
    }

    /// Delete an account. Its usage events are kept for audit.
    pub fn delete_user(&self, user_id: i64) -> Result<bool, AccountError> {
        let conn = self.db.lock();
        let deleted = conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        if deleted > 0 {
            tracing::info!(user_id, "Account deleted");
        }
        Ok(deleted > 0)
    }

    /// Count registered accounts.
    pub fn user_count(&self) -> Result<u64, AccountError> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn normalize_email(raw: &str) -> Result<String, AccountError> {
    let email = raw.trim();
    let valid = email.len() <= MAX_EMAIL_LEN
        && matches!(email.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(AccountError::InvalidEmail);
    }
    Ok(email.to_string())
}

fn query_user(
    conn: &rusqlite::Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<User>, AccountError> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate}"),
            params,
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let rag_settings: String = row.get(12)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        hashed_password: row.get(2)?,
        is_active: row.get(3)?,
        is_admin: row.get(4)?,
        created_at: from_epoch(row.get(5)?),
        updated_at: from_epoch(row.get(6)?),
        monthly_llm_token_limit: row.get(7)?,
        monthly_embedding_token_limit: row.get(8)?,
        llm_tokens_used_this_month: row.get(9)?,
        embedding_tokens_used_this_month: row.get(10)?,
        last_token_reset_date: from_epoch(row.get(11)?),
        rag_settings: serde_json::from_str(&rag_settings).unwrap_or_default(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────

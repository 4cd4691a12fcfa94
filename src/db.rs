//! Shared SQLite handle for the account store and the usage ledger.
//!
//! Tables:
//! - `users`: credentials, quota limits, running monthly counters
//! - `llm_usage_events`: one row per LLM call
//! - `embedding_usage_events`: one row per embedding call
//!
//! Both stores hold the same [`Database`] so that an event insert and the
//! matching counter update can share one transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        hashed_password TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_admin INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        monthly_llm_token_limit INTEGER NOT NULL,
        monthly_embedding_token_limit INTEGER NOT NULL,
        llm_tokens_used_this_month INTEGER NOT NULL DEFAULT 0
            CHECK (llm_tokens_used_this_month >= 0),
        embedding_tokens_used_this_month INTEGER NOT NULL DEFAULT 0
            CHECK (embedding_tokens_used_this_month >= 0),
        last_token_reset_date INTEGER NOT NULL,
        rag_settings TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS llm_usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        request_id TEXT NOT NULL,
        conversation_id INTEGER,
        message_id INTEGER,
        model TEXT NOT NULL,
        prompt_tokens INTEGER NOT NULL DEFAULT 0,
        completion_tokens INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0.0,
        request_metadata TEXT,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_llm_usage_user ON llm_usage_events(user_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_llm_usage_request ON llm_usage_events(request_id);

    CREATE TABLE IF NOT EXISTS embedding_usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        model TEXT NOT NULL,
        purpose TEXT NOT NULL,
        document_id INTEGER,
        chunk_id INTEGER,
        message_id INTEGER,
        token_count INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0.0,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_embedding_usage_user
        ON embedding_usage_events(user_id, created_at);";

/// SQLite connection guarded by a non-poisoning mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path and ensure the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database dir: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection for the duration of one store operation.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside an `IMMEDIATE` transaction; commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Convert a stored epoch-seconds column to a UTC timestamp.
pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

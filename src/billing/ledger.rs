//! Token usage ledger and monthly quota guard.
//!
//! Every billable LLM or embedding call is appended as an immutable event row,
//! and the owning account's monthly counter is updated in the same
//! transaction. Counters roll over lazily: the first write or quota check in a
//! new calendar month zeroes both categories before applying its own effect.

use crate::billing::rates::RateTable;
use crate::billing::rollover::needs_reset;
use crate::db::{from_epoch, Database};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum rows returned by the recent-events queries.
const MAX_RECENT_EVENTS: u32 = 500;

/// Which monthly counter a quota check or usage event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenCategory {
    Llm,
    Embedding,
}

impl TokenCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
        }
    }

    fn used_column(self) -> &'static str {
        match self {
            Self::Llm => "llm_tokens_used_this_month",
            Self::Embedding => "embedding_tokens_used_this_month",
        }
    }
}

/// Why an embedding was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingPurpose {
    DocumentIndexing,
    Query,
}

impl EmbeddingPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DocumentIndexing => "document_indexing",
            Self::Query => "query",
        }
    }

}

impl FromSql for EmbeddingPurpose {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "document_indexing" => Ok(Self::DocumentIndexing),
            "query" => Ok(Self::Query),
            other => Err(FromSqlError::Other(
                format!("unknown embedding purpose '{other}'").into(),
            )),
        }
    }
}

/// Input for [`UsageLedger::record_llm_usage`].
#[derive(Debug, Clone, Default)]
pub struct LlmUsageRecord {
    pub user_id: i64,
    pub request_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// Input for [`UsageLedger::record_embedding_usage`].
#[derive(Debug, Clone)]
pub struct EmbeddingUsageRecord {
    pub user_id: i64,
    pub model: String,
    pub token_count: u32,
    pub purpose: EmbeddingPurpose,
    pub document_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub message_id: Option<i64>,
}

/// A persisted LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUsageEvent {
    pub id: i64,
    pub user_id: i64,
    pub request_id: String,
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// Cost in USD.
    pub cost: f64,
    pub request_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A persisted embedding call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingUsageEvent {
    pub id: i64,
    pub user_id: i64,
    pub model: String,
    pub purpose: EmbeddingPurpose,
    pub document_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub message_id: Option<i64>,
    pub token_count: i64,
    /// Cost in USD.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Limit and usage for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryQuota {
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
}

impl CategoryQuota {
    fn new(limit: i64, used: i64) -> Self {
        Self {
            limit,
            used,
            remaining: (limit - used).max(0),
        }
    }
}

/// Current monthly quota state of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: i64,
    pub llm: CategoryQuota,
    pub embedding: CategoryQuota,
    pub last_token_reset_date: DateTime<Utc>,
}

/// Aggregated event totals since a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub llm_requests: i64,
    pub llm_prompt_tokens: i64,
    pub llm_completion_tokens: i64,
    pub llm_cost: f64,
    pub embedding_requests: i64,
    pub embedding_tokens: i64,
    pub embedding_cost: f64,
    pub total_cost: f64,
}

/// Quota columns of a `users` row.
struct AccountCounters {
    llm_limit: i64,
    embedding_limit: i64,
    llm_used: i64,
    embedding_used: i64,
    last_reset: DateTime<Utc>,
}

/// What happened to the account row while recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterUpdate {
    Incremented,
    RolledOver,
    Orphaned,
}

/// Usage ledger over the shared database.
pub struct UsageLedger {
    db: Arc<Database>,
    rates: Arc<RateTable>,
}

impl UsageLedger {
    pub fn new(db: Arc<Database>, rates: Arc<RateTable>) -> Self {
        Self { db, rates }
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    // ── Recording ───────────────────────────────────────────────

    /// Record one LLM call and charge it to the account's monthly counter.
    pub fn record_llm_usage(&self, usage: LlmUsageRecord) -> Result<LlmUsageEvent> {
        self.record_llm_usage_at(usage, Utc::now())
    }

    pub fn record_llm_usage_at(
        &self,
        usage: LlmUsageRecord,
        now: DateTime<Utc>,
    ) -> Result<LlmUsageEvent> {
        let cost = self
            .rates
            .llm_cost(&usage.model, usage.prompt_tokens, usage.completion_tokens);
        let total_tokens = i64::from(usage.prompt_tokens) + i64::from(usage.completion_tokens);
        let metadata_json = usage
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let (id, outcome) = self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO llm_usage_events (user_id, request_id, conversation_id, message_id, model,
                    prompt_tokens, completion_tokens, total_tokens, cost, request_metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    usage.user_id,
                    usage.request_id,
                    usage.conversation_id,
                    usage.message_id,
                    usage.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    total_tokens,
                    cost,
                    metadata_json,
                    now.timestamp(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            let outcome =
                charge_counter(tx, usage.user_id, TokenCategory::Llm, total_tokens, now)?;
            Ok((id, outcome))
        })?;

        log_outcome(usage.user_id, TokenCategory::Llm, total_tokens, outcome);

        Ok(LlmUsageEvent {
            id,
            user_id: usage.user_id,
            request_id: usage.request_id,
            conversation_id: usage.conversation_id,
            message_id: usage.message_id,
            model: usage.model,
            prompt_tokens: i64::from(usage.prompt_tokens),
            completion_tokens: i64::from(usage.completion_tokens),
            total_tokens,
            cost,
            request_metadata: usage.metadata,
            created_at: from_epoch(now.timestamp()),
        })
    }

    /// Record one embedding call and charge it to the account's monthly counter.
    pub fn record_embedding_usage(&self, usage: EmbeddingUsageRecord) -> Result<EmbeddingUsageEvent> {
        self.record_embedding_usage_at(usage, Utc::now())
    }

    pub fn record_embedding_usage_at(
        &self,
        usage: EmbeddingUsageRecord,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingUsageEvent> {
        let cost = self.rates.embedding_cost(&usage.model, usage.token_count);
        let tokens = i64::from(usage.token_count);

        let (id, outcome) = self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO embedding_usage_events (user_id, model, purpose, document_id, chunk_id,
                    message_id, token_count, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    usage.user_id,
                    usage.model,
                    usage.purpose.as_str(),
                    usage.document_id,
                    usage.chunk_id,
                    usage.message_id,
                    tokens,
                    cost,
                    now.timestamp(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            let outcome = charge_counter(tx, usage.user_id, TokenCategory::Embedding, tokens, now)?;
            Ok((id, outcome))
        })?;

        log_outcome(usage.user_id, TokenCategory::Embedding, tokens, outcome);

        Ok(EmbeddingUsageEvent {
            id,
            user_id: usage.user_id,
            model: usage.model,
            purpose: usage.purpose,
            document_id: usage.document_id,
            chunk_id: usage.chunk_id,
            message_id: usage.message_id,
            token_count: tokens,
            cost,
            created_at: from_epoch(now.timestamp()),
        })
    }

    // ── Quota guard ─────────────────────────────────────────────

    /// Whether the account can consume `requested` more tokens this month.
    ///
    /// Missing accounts have no capacity. A due rollover is persisted before
    /// the comparison. The check does not reserve anything: two callers can
    /// both pass and then jointly exceed the limit.
    pub fn has_capacity(&self, user_id: i64, category: TokenCategory, requested: u64) -> Result<bool> {
        self.has_capacity_at(user_id, category, requested, Utc::now())
    }

    pub fn has_capacity_at(
        &self,
        user_id: i64,
        category: TokenCategory,
        requested: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(counters) = self.db.transaction(|tx| load_and_roll(tx, user_id, now))? else {
            tracing::debug!(user_id, "Quota check for unknown account");
            return Ok(false);
        };

        let (used, limit) = match category {
            TokenCategory::Llm => (counters.llm_used, counters.llm_limit),
            TokenCategory::Embedding => (counters.embedding_used, counters.embedding_limit),
        };
        let used = u64::try_from(used).unwrap_or(0);
        let limit = u64::try_from(limit).unwrap_or(0);
        let allowed = used.saturating_add(requested) <= limit;

        if !allowed {
            tracing::info!(
                user_id,
                category = category.as_str(),
                used,
                requested,
                limit,
                "Token quota would be exceeded"
            );
        }
        Ok(allowed)
    }

    /// Current limits and usage for both categories, applying a due rollover.
    pub fn quota_status(&self, user_id: i64) -> Result<Option<QuotaStatus>> {
        self.quota_status_at(user_id, Utc::now())
    }

    pub fn quota_status_at(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<QuotaStatus>> {
        let counters = self.db.transaction(|tx| load_and_roll(tx, user_id, now))?;
        Ok(counters.map(|c| QuotaStatus {
            user_id,
            llm: CategoryQuota::new(c.llm_limit, c.llm_used),
            embedding: CategoryQuota::new(c.embedding_limit, c.embedding_used),
            last_token_reset_date: c.last_reset,
        }))
    }

    /// Zero both counters and restart the month at `now`. Returns `false` if
    /// the account does not exist.
    pub fn reset_usage(&self, user_id: i64) -> Result<bool> {
        let now = Utc::now();
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE users SET llm_tokens_used_this_month = 0,
                embedding_tokens_used_this_month = 0,
                last_token_reset_date = ?2
             WHERE id = ?1",
            params![user_id, now.timestamp()],
        )?;
        if updated > 0 {
            tracing::info!(user_id, "Monthly token counters reset by admin");
        }
        Ok(updated > 0)
    }

    // ── Reporting ───────────────────────────────────────────────

    /// Totals of all events recorded for the account at or after `since`.
    pub fn summary(&self, user_id: i64, since: DateTime<Utc>) -> Result<UsageSummary> {
        let conn = self.db.lock();

        let (llm_requests, llm_prompt_tokens, llm_completion_tokens, llm_cost): (i64, i64, i64, f64) =
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0), COALESCE(SUM(cost), 0.0)
                 FROM llm_usage_events WHERE user_id = ?1 AND created_at >= ?2",
                params![user_id, since.timestamp()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let (embedding_requests, embedding_tokens, embedding_cost): (i64, i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(token_count), 0), COALESCE(SUM(cost), 0.0)
                 FROM embedding_usage_events WHERE user_id = ?1 AND created_at >= ?2",
                params![user_id, since.timestamp()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        Ok(UsageSummary {
            llm_requests,
            llm_prompt_tokens,
            llm_completion_tokens,
            llm_cost,
            embedding_requests,
            embedding_tokens,
            embedding_cost,
            total_cost: llm_cost + embedding_cost,
        })
    }

    /// Newest LLM events for the account.
    pub fn recent_llm_events(&self, user_id: i64, limit: u32) -> Result<Vec<LlmUsageEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, request_id, conversation_id, message_id, model, prompt_tokens,
                    completion_tokens, total_tokens, cost, request_metadata, created_at
             FROM llm_usage_events WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![user_id, limit.min(MAX_RECENT_EVENTS)], |row| {
                let metadata: Option<String> = row.get(10)?;
                Ok(LlmUsageEvent {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    request_id: row.get(2)?,
                    conversation_id: row.get(3)?,
                    message_id: row.get(4)?,
                    model: row.get(5)?,
                    prompt_tokens: row.get(6)?,
                    completion_tokens: row.get(7)?,
                    total_tokens: row.get(8)?,
                    cost: row.get(9)?,
                    request_metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at: from_epoch(row.get(11)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Newest embedding events for the account.
    pub fn recent_embedding_events(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<EmbeddingUsageEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, model, purpose, document_id, chunk_id, message_id, token_count,
                    cost, created_at
             FROM embedding_usage_events WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![user_id, limit.min(MAX_RECENT_EVENTS)], |row| {
                Ok(EmbeddingUsageEvent {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    model: row.get(2)?,
                    purpose: row.get(3)?,
                    document_id: row.get(4)?,
                    chunk_id: row.get(5)?,
                    message_id: row.get(6)?,
                    token_count: row.get(7)?,
                    cost: row.get(8)?,
                    created_at: from_epoch(row.get(9)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

// ── Counter helpers ─────────────────────────────────────────────

fn load_counters(tx: &Transaction<'_>, user_id: i64) -> Result<Option<AccountCounters>> {
    let counters = tx
        .query_row(
            "SELECT monthly_llm_token_limit, monthly_embedding_token_limit,
                    llm_tokens_used_this_month, embedding_tokens_used_this_month,
                    last_token_reset_date
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(AccountCounters {
                    llm_limit: row.get(0)?,
                    embedding_limit: row.get(1)?,
                    llm_used: row.get(2)?,
                    embedding_used: row.get(3)?,
                    last_reset: from_epoch(row.get(4)?),
                })
            },
        )
        .optional()?;
    Ok(counters)
}

/// Load the account's counters, persisting a rollover first if one is due.
fn load_and_roll(
    tx: &Transaction<'_>,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<AccountCounters>> {
    let Some(mut counters) = load_counters(tx, user_id)? else {
        return Ok(None);
    };
    if needs_reset(counters.last_reset, now) {
        tx.execute(
            "UPDATE users SET llm_tokens_used_this_month = 0,
                embedding_tokens_used_this_month = 0,
                last_token_reset_date = ?2
             WHERE id = ?1",
            params![user_id, now.timestamp()],
        )?;
        tracing::info!(user_id, "Monthly token counters rolled over");
        counters.llm_used = 0;
        counters.embedding_used = 0;
        counters.last_reset = from_epoch(now.timestamp());
    }
    Ok(Some(counters))
}

/// Apply `tokens` to the account's `category` counter.
fn charge_counter(
    tx: &Transaction<'_>,
    user_id: i64,
    category: TokenCategory,
    tokens: i64,
    now: DateTime<Utc>,
) -> Result<CounterUpdate> {
    let last_reset: Option<i64> = tx
        .query_row(
            "SELECT last_token_reset_date FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(last_reset) = last_reset else {
        return Ok(CounterUpdate::Orphaned);
    };

    if needs_reset(from_epoch(last_reset), now) {
        let (llm, embedding) = match category {
            TokenCategory::Llm => (tokens, 0),
            TokenCategory::Embedding => (0, tokens),
        };
        tx.execute(
            "UPDATE users SET llm_tokens_used_this_month = ?2,
                embedding_tokens_used_this_month = ?3,
                last_token_reset_date = ?4
             WHERE id = ?1",
            params![user_id, llm, embedding, now.timestamp()],
        )?;
        return Ok(CounterUpdate::RolledOver);
    }

    let column = category.used_column();
    tx.execute(
        &format!("UPDATE users SET {column} = {column} + ?2 WHERE id = ?1"),
        params![user_id, tokens],
    )?;
    Ok(CounterUpdate::Incremented)
}

fn log_outcome(user_id: i64, category: TokenCategory, tokens: i64, outcome: CounterUpdate) {
    match outcome {
        CounterUpdate::Incremented => {
            tracing::debug!(user_id, category = category.as_str(), tokens, "Usage recorded");
        }
        CounterUpdate::RolledOver => {
            tracing::info!(
                user_id,
                category = category.as_str(),
                tokens,
                "Usage recorded after monthly rollover"
            );
        }
        CounterUpdate::Orphaned => {
            tracing::warn!(
                user_id,
                category = category.as_str(),
                tokens,
                orphaned_usage_event = true,
                "Usage recorded for an account that does not exist"
            );
        }
    }
}

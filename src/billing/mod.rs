//! Token usage accounting.
//!
//! Tracks LLM and embedding token consumption per account, prices each call
//! from a rate table, and enforces monthly token limits.
//!
//! ## Design
//! - SQLite-based usage event log, one row per billable call
//! - Running per-account monthly counters updated in the same transaction
//! - Lazy calendar-month rollover on first access in a new month
//! - Advisory capacity checks before billable calls

pub mod ledger;
pub mod rates;
pub mod rollover;

pub use ledger::{
    CategoryQuota, EmbeddingPurpose, EmbeddingUsageEvent, EmbeddingUsageRecord, LlmUsageEvent,
    LlmUsageRecord, QuotaStatus, TokenCategory, UsageLedger, UsageSummary,
};
pub use rates::{LlmRate, RateTable};
pub use rollover::needs_reset;

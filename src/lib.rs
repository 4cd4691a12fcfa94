//! Account authentication and monthly token-quota accounting.
//!
//! Accounts register and log in with email and password, receive short-lived
//! bearer tokens, and report LLM and embedding token usage. Every billable
//! call is priced from a per-model rate table, persisted as an event, and
//! charged against the account's monthly limit.

pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod gateway;

pub use config::Config;

//! Account authentication.
//!
//! Provides:
//! - Account registration and CRUD (email + password, bcrypt hashes)
//! - HS256 access tokens carrying the account email as `sub`
//! - SQLite-backed persistent storage shared with the usage ledger
//!
//! ## Design Decisions
//! - Tokens are stateless JWTs; the current account is re-read from the
//!   database on every request so deleted accounts lose access immediately.
//! - Unknown emails run a dummy bcrypt verification so login timing does
//!   not reveal which addresses are registered.

pub mod jwt;
pub mod password;
pub mod store;

pub use jwt::{Claims, JwtHandler};
pub use store::{AccountError, AccountStore, NewUser, RagSettings, User, UserUpdate};

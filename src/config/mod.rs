pub mod schema;

pub use schema::{AuthConfig, Config, DatabaseConfig, QuotaConfig, RatesConfig, ServerConfig};

use crate::billing::rates::LlmRate;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding `[auth] jwt_secret`.
pub const ENV_JWT_SECRET: &str = "QUOTAKEEPER_JWT_SECRET";
/// Environment variable overriding `[database] path`.
pub const ENV_DB_PATH: &str = "QUOTAKEEPER_DB_PATH";
/// Environment variable overriding `[server] host`.
pub const ENV_HOST: &str = "QUOTAKEEPER_HOST";
/// Environment variable overriding `[server] port`.
pub const ENV_PORT: &str = "QUOTAKEEPER_PORT";

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the config file was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Whether `config_path` existed at load time.
    #[serde(skip)]
    pub from_file: bool,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub rates: RatesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            from_file: false,
            log_level: "info".into(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            quota: QuotaConfig::default(),
            rates: RatesConfig::default(),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            request_timeout_secs: 30,
        }
    }
}

// ── Database ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path. Empty means `quotakeeper.db` in the data directory.
    pub path: String,
}

// ── Auth ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for HS256 access tokens. Required to serve.
    pub jwt_secret: String,
    /// Access token lifetime.
    pub access_token_expire_minutes: i64,
    /// Whether `POST /auth/register` is open.
    pub allow_registration: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_expire_minutes: 30,
            allow_registration: true,
        }
    }
}

// ── Quota ───────────────────────────────────────────────────────

/// Limits applied to newly created accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub default_monthly_llm_token_limit: i64,
    pub default_monthly_embedding_token_limit: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_monthly_llm_token_limit: 100_000,
            default_monthly_embedding_token_limit: 100_000,
        }
    }
}

// ── Rates ───────────────────────────────────────────────────────

/// Pricing overrides, merged over the built-in rate table.
///
/// ```toml
/// [rates]
/// default_embedding = 0.0001
///
/// [rates.default_llm]
/// prompt = 0.001
/// completion = 0.002
///
/// [rates.llm."gpt-4o"]
/// prompt = 0.005
/// completion = 0.015
///
/// [rates.embedding]
/// "text-embedding-3-small" = 0.00002
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RatesConfig {
    pub default_llm: Option<LlmRate>,
    pub default_embedding: Option<f64>,
    pub llm: BTreeMap<String, LlmRate>,
    pub embedding: BTreeMap<String, f64>,
}

impl Config {
    /// Load config from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let from_file = path.exists();
        let mut config = if from_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };
        config.config_path = path.to_path_buf();
        config.from_file = from_file;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location (`<config dir>/quotakeeper/config.toml`).
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "quotakeeper")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> PathBuf {
        let raw = self.database.path.trim();
        if !raw.is_empty() {
            let expanded = shellexpand::full(raw)
                .map(|p| p.into_owned())
                .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
            return PathBuf::from(expanded);
        }
        directories::ProjectDirs::from("", "", "quotakeeper")
            .map(|dirs| dirs.data_dir().join("quotakeeper.db"))
            .unwrap_or_else(|| PathBuf::from("quotakeeper.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(ENV_JWT_SECRET) {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(host) = std::env::var(ENV_HOST) {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Some(port) = std::env::var(ENV_PORT)
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.server.port = port;
        }
    }

    /// Reject values the rest of the service cannot work with.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = shellexpand::full(self.database.path.trim()) {
            bail!("[database] path cannot be expanded: {e}");
        }
        if self.auth.access_token_expire_minutes <= 0 {
            bail!("[auth] access_token_expire_minutes must be positive");
        }
        if self.quota.default_monthly_llm_token_limit <= 0
            || self.quota.default_monthly_embedding_token_limit <= 0
        {
            bail!("[quota] default monthly limits must be positive");
        }
        if self.server.request_timeout_secs == 0 {
            bail!("[server] request_timeout_secs must be positive");
        }

        let valid_rate = |r: f64| r.is_finite() && r >= 0.0;
        if let Some(rate) = &self.rates.default_llm {
            if !valid_rate(rate.prompt) || !valid_rate(rate.completion) {
                bail!("[rates] default_llm prices must be non-negative numbers");
            }
        }
        if let Some(rate) = self.rates.default_embedding {
            if !valid_rate(rate) {
                bail!("[rates] default_embedding must be a non-negative number");
            }
        }
        for (model, rate) in &self.rates.llm {
            if !valid_rate(rate.prompt) || !valid_rate(rate.completion) {
                bail!("[rates.llm] price for '{model}' must be non-negative");
            }
        }
        for (model, rate) in &self.rates.embedding {
            if !valid_rate(*rate) {
                bail!("[rates.embedding] price for '{model}' must be non-negative");
            }
        }
        Ok(())
    }

    /// Copy safe for display: the JWT secret is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.jwt_secret.is_empty() {
            copy.auth.jwt_secret = "***".into();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.auth.access_token_expire_minutes, 30);
        assert_eq!(config.quota.default_monthly_llm_token_limit, 100_000);
        assert!(config.auth.allow_registration);
    }

    #[test]
    fn parses_sections_and_rates() {
        let raw = r#"
            log_level = "debug"

            [server]
            port = 9100

            [quota]
            default_monthly_llm_token_limit = 5000

            [rates]
            default_embedding = 0.0002

            [rates.llm."gpt-4o"]
            prompt = 0.005
            completion = 0.015

            [rates.embedding]
            "text-embedding-3-small" = 0.00002
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.quota.default_monthly_llm_token_limit, 5000);
        assert_eq!(config.quota.default_monthly_embedding_token_limit, 100_000);
        assert_eq!(config.rates.default_embedding, Some(0.0002));
        let gpt4o = config.rates.llm.get("gpt-4o").unwrap();
        assert!((gpt4o.completion - 0.015).abs() < f64::EPSILON);
        assert_eq!(config.rates.embedding.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn negative_rate_is_rejected() {
        let mut config = Config::default();
        config.rates.embedding.insert("bad".into(), -1.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn non_positive_limits_are_rejected() {
        let mut config = Config::default();
        config.quota.default_monthly_embedding_token_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_masks_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = "hunter2-hunter2".into();
        assert_eq!(config.redacted().auth.jwt_secret, "***");
        assert_eq!(config.auth.jwt_secret, "hunter2-hunter2");
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut config = Config::default();
        config.database.path = "/tmp/quota-test.db".into();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/quota-test.db"));
    }

    #[test]
    fn database_path_expands_home() {
        let home = std::env::var("HOME").unwrap();
        let mut config = Config::default();

        config.database.path = "~".into();
        assert_eq!(config.database_path(), PathBuf::from(&home));

        for raw in ["~/q.db", "$HOME/q.db", "${HOME}/q.db"] {
            config.database.path = raw.into();
            assert_eq!(
                config.database_path(),
                PathBuf::from(format!("{home}/q.db")),
                "expanding {raw}"
            );
        }
    }

    #[test]
    fn undefined_variable_in_database_path_is_rejected() {
        let mut config = Config::default();
        config.database.path = "$QUOTAKEEPER_SURELY_UNSET_VAR/q.db".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[database]"));
    }

    #[test]
    fn load_records_whether_file_existed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let missing = Config::load(&path).unwrap();
        assert!(!missing.from_file);
        assert_eq!(missing.config_path, path);

        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();
        let loaded = Config::load(&path).unwrap();
        assert!(loaded.from_file);
        assert_eq!(loaded.log_level, "warn");
    }

    #[test]
    fn invalid_toml_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "server = [").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}

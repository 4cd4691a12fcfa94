use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quotakeeper::auth::{AccountStore, NewUser};
use quotakeeper::billing::{RateTable, UsageLedger};
use quotakeeper::db::Database;
use quotakeeper::{gateway, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Account and token-quota service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Bind address (overrides [server] host)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides [server] port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage accounts
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Inspect token usage
    Usage {
        #[command(subcommand)]
        command: UsageCommand,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create an account
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Grant administrator rights
        #[arg(long)]
        admin: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UsageCommand {
    /// Show the monthly quota state of an account
    Show {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration with secrets masked
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config.from_file {
        tracing::info!(path = %config_path.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            gateway::run_gateway(&host, port, config).await
        }
        Command::User {
            command: UserCommand::Create {
                email,
                password,
                admin,
            },
        } => {
            let accounts = AccountStore::new(open_db(&config)?, config.quota.clone());
            let mut new_user = NewUser::regular(email, password);
            new_user.is_admin = admin;
            let user = accounts.create_user(new_user)?;
            println!(
                "Created {} account #{} <{}>",
                if user.is_admin { "admin" } else { "user" },
                user.id,
                user.email
            );
            Ok(())
        }
        Command::Usage {
            command: UsageCommand::Show { email },
        } => {
            let db = open_db(&config)?;
            let accounts = AccountStore::new(db.clone(), config.quota.clone());
            let ledger = UsageLedger::new(db, Arc::new(RateTable::from_config(&config.rates)));

            let user = accounts
                .get_user_by_email(&email)?
                .with_context(|| format!("No account for {email}"))?;
            let quota = ledger
                .quota_status(user.id)?
                .with_context(|| format!("No account for {email}"))?;
            let summary = ledger.summary(user.id, quota.last_token_reset_date)?;

            println!("Account #{} <{}>", user.id, user.email);
            println!(
                "  since {}",
                quota.last_token_reset_date.format("%Y-%m-%d %H:%M UTC")
            );
            println!(
                "  llm:       {:>10} / {:<10} ({} left, {} calls, ${:.4})",
                quota.llm.used,
                quota.llm.limit,
                quota.llm.remaining,
                summary.llm_requests,
                summary.llm_cost
            );
            println!(
                "  embedding: {:>10} / {:<10} ({} left, {} calls, ${:.4})",
                quota.embedding.used,
                quota.embedding.limit,
                quota.embedding.remaining,
                summary.embedding_requests,
                summary.embedding_cost
            );
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            println!("# {}", config.config_path.display());
            println!("# database: {}", config.database_path().display());
            print!(
                "{}",
                toml::to_string_pretty(&config.redacted()).context("Failed to render config")?
            );
            Ok(())
        }
    }
}

fn open_db(config: &Config) -> Result<Arc<Database>> {
    Ok(Arc::new(Database::open(&config.database_path())?))
}

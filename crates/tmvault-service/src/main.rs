use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use tmvault_core::{AccountId, VaultConfig};
use tmvault_service::journal_store::JournalStorageConfig;
use tmvault_service::{build_router, ServiceConfig, ServiceState};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JournalStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "tmvaultd", version, about = "tmvault custody pool REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "TMVAULT_LISTEN")]
    listen: SocketAddr,
    /// Custody account holding the pool's local liquidity.
    #[arg(long, default_value = "tmvault", env = "TMVAULT_VAULT_ACCOUNT")]
    vault_account: String,
    /// Initial manager identity.
    #[arg(long, default_value = "vault-manager", env = "TMVAULT_MANAGER")]
    manager: String,
    #[arg(long, default_value_t = 86_400, env = "TMVAULT_WITHDRAWAL_COOLDOWN_SECS")]
    withdrawal_cooldown_secs: i64,
    /// Ceiling for a single queued withdrawal, in minor units.
    #[arg(long, default_value_t = 1_000_000_000, env = "TMVAULT_MAX_WITHDRAWAL_MINOR")]
    max_withdrawal_minor: u64,
    #[arg(long, default_value_t = 100, env = "TMVAULT_MAX_PENDING_WITHDRAWALS")]
    max_pending_withdrawals: usize,
    /// Journal mirror backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = JournalStorageMode::Auto, env = "TMVAULT_JOURNAL_STORAGE")]
    journal_storage: JournalStorageMode,
    /// PostgreSQL url for the journal mirror.
    #[arg(long, env = "TMVAULT_JOURNAL_DATABASE_URL")]
    journal_database_url: Option<String>,
    /// Max PostgreSQL pool connections for the journal mirror.
    #[arg(long, default_value_t = 5, env = "TMVAULT_JOURNAL_PG_MAX_CONNECTIONS")]
    journal_pg_max_connections: u32,
    /// Fund and deposit for a demo account at startup.
    #[arg(long, default_value_t = false, env = "TMVAULT_SEED_DEMO")]
    seed_demo: bool,
}

fn resolve_journal_storage(cli: &Cli) -> anyhow::Result<JournalStorageConfig> {
    let resolved_url = cli
        .journal_database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.journal_storage {
        JournalStorageMode::Memory => JournalStorageConfig::Memory,
        JournalStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!(
                    "journal_storage=postgres requires --journal-database-url or DATABASE_URL"
                )
            })?;
            JournalStorageConfig::postgres(database_url, cli.journal_pg_max_connections)
        }
        JournalStorageMode::Auto => match resolved_url {
            Some(database_url) => {
                JournalStorageConfig::postgres(database_url, cli.journal_pg_max_connections)
            }
            None => JournalStorageConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "tmvault_service=info,tmvault_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let journal_storage = resolve_journal_storage(&cli)?;
    let config = ServiceConfig {
        vault: VaultConfig {
            vault_account: AccountId::from(cli.vault_account),
            manager: AccountId::from(cli.manager),
            withdrawal_cooldown_secs: cli.withdrawal_cooldown_secs,
            max_withdrawal_minor: cli.max_withdrawal_minor,
            max_pending_withdrawals: cli.max_pending_withdrawals,
        },
        journal_storage,
        seed_demo: cli.seed_demo,
    };
    info!(journal_backend = config.journal_storage.label(), "bootstrapping vault");
    let state = ServiceState::bootstrap(config).await?;

    let mut events = state.vault.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(entry) => debug!(
                    index = entry.index,
                    event = entry.event.name(),
                    hash = %entry.entry_hash,
                    "journal entry committed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "journal subscriber lagged behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("tmvault-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

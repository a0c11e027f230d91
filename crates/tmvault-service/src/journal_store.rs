use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tmvault_core::{JournalEntry, PoolVault};
use tracing::{debug, info};
use uuid::Uuid;

const MIRROR_BATCH: usize = 500;

/// Journal mirror backend configuration.
#[derive(Debug, Clone, Default)]
pub enum JournalStorageConfig {
    /// Keep the journal in process memory only.
    #[default]
    Memory,
    /// Mirror every committed entry to PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl JournalStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("postgres {context} failed: {source}")]
    Postgres {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("journal index {0} exceeds postgres BIGINT range")]
    IndexRange(u64),
    #[error("journal event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

fn postgres(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Postgres { context, source }
}

#[derive(Debug, Clone)]
enum MirrorBackend {
    Memory,
    Postgres(PostgresJournalStore),
}

/// Copies committed journal entries out of the vault.
///
/// The in-process journal stays authoritative; PostgreSQL only receives a copy.
/// Each process run writes under its own run id, so restarts never collide
/// with earlier chains. The cursor only advances past entries that were
/// written, so a failed sync is retried from the same place next time.
#[derive(Debug)]
pub struct JournalMirror {
    backend: MirrorBackend,
    run_id: String,
    cursor: u64,
}

impl JournalMirror {
    pub async fn bootstrap(config: JournalStorageConfig) -> Result<Self, StoreError> {
        let run_id = Uuid::new_v4().to_string();
        let backend = match config {
            JournalStorageConfig::Memory => MirrorBackend::Memory,
            JournalStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresJournalStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                info!(run_id = %run_id, "journal mirror connected to postgres");
                MirrorBackend::Postgres(store)
            }
        };
        Ok(Self {
            backend,
            run_id,
            cursor: 0,
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            MirrorBackend::Memory => "memory",
            MirrorBackend::Postgres(_) => "postgres",
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Index of the next entry still to be mirrored.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Push every entry past the cursor. Returns how many were written.
    pub async fn sync(&mut self, vault: &PoolVault) -> Result<usize, StoreError> {
        let mut written = 0;
        loop {
            let batch = vault.journal_entries(self.cursor, MIRROR_BATCH).await;
            if batch.is_empty() {
                return Ok(written);
            }
            for entry in &batch {
                if let MirrorBackend::Postgres(store) = &self.backend {
                    store.insert_entry(&self.run_id, entry).await?;
                }
                self.cursor = entry.index + 1;
                written += 1;
            }
            debug!(cursor = self.cursor, written, "journal mirror advanced");
        }
    }
}

#[derive(Debug, Clone)]
struct PostgresJournalStore {
    pool: PgPool,
}

impl PostgresJournalStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(postgres("connect"))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tmvault_journal_entries (
                run_id TEXT NOT NULL,
                journal_index BIGINT NOT NULL,
                entry_id TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                event JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL,
                PRIMARY KEY (run_id, journal_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(postgres("schema create"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tmvault_journal_event_type ON tmvault_journal_entries (event_type)",
        )
        .execute(&self.pool)
        .await
        .map_err(postgres("index create"))?;

        Ok(())
    }

    async fn insert_entry(&self, run_id: &str, entry: &JournalEntry) -> Result<(), StoreError> {
        let index: i64 = entry
            .index
            .try_into()
            .map_err(|_| StoreError::IndexRange(entry.index))?;
        let event = serde_json::to_value(&entry.event)?;

        sqlx::query(
            r#"
            INSERT INTO tmvault_journal_entries (
                run_id,
                journal_index,
                entry_id,
                event_type,
                event,
                recorded_at,
                previous_hash,
                entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, journal_index) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(index)
        .bind(&entry.entry_id)
        .bind(entry.event.name())
        .bind(&event)
        .bind(entry.recorded_at)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(postgres("insert"))?;

        Ok(())
    }
}

//! Memory database module - SQLite-backed storage for sessions, messages, summaries and embeddings
pub mod advisory_lock;
pub mod embedding_store;
pub mod message_store;
pub mod metadata;
pub mod metadata_merge;
pub mod migration;
pub mod purge;
pub mod schema;
pub mod session_store;
pub mod summary_store;

pub use advisory_lock::{LockPolicy, NamedMutex, ShardedMutex, SqliteAdvisoryLock};
pub use embedding_store::{EmbeddingStats, EmbeddingStore, SearchHit, SearchOptions, SearchScope};
pub use message_store::MessageStore;
pub use metadata::{MetadataDocument, MetadataPatch};
pub use metadata_merge::{EntityKind, MergeOutcome, MetadataMergeEngine};
pub use migration::MigrationManager;
pub use purge::PurgeEngine;
pub use schema::*;
pub use session_store::SessionStore;
pub use summary_store::SummaryStore;

use crate::error::{MemoryError, Result, StorageContext};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA busy_timeout = 5000;";

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub embedding_dimensions: usize,
    pub lock_policy: LockPolicy,
    /// Advisory lock rows older than this are reclaimed
    pub stale_lock_after: Duration,
    pub pool_size: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            embedding_dimensions: 384,
            lock_policy: LockPolicy::default(),
            stale_lock_after: Duration::from_secs(300),
            pool_size: 10,
        }
    }
}

/// One schema (database file) worth of stores sharing a pool and a merge engine
pub struct MemoryDatabase {
    pub sessions: SessionStore,
    pub messages: MessageStore,
    pub summaries: SummaryStore,
    pub embeddings: EmbeddingStore,
    pub purge: PurgeEngine,
    merger: Arc<MetadataMergeEngine>,
    schema: String,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) the database for `schema` at `db_path` and migrate it
    pub fn new(db_path: &Path, schema: &str, options: DatabaseOptions) -> Result<Self> {
        info!("Opening memory database '{}' at: {}", schema, db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::storage("create database directory", e))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)
            .storage_context("create connection pool")?;

        Self::from_pool(pool, schema, options)
    }

    /// Private in-memory database. The pool holds a single connection since
    /// every in-memory connection is its own database.
    pub fn new_in_memory(schema: &str, options: DatabaseOptions) -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .storage_context("create connection pool")?;
        Self::from_pool(pool, schema, options)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>, schema: &str, options: DatabaseOptions) -> Result<Self> {
        {
            let mut conn = pool.get().storage_context("migration connection")?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database().storage_context("migrate database")?;
        }
        let pool = Arc::new(pool);

        let mutex: Arc<dyn NamedMutex> =
            Arc::new(SqliteAdvisoryLock::new(Arc::clone(&pool), options.stale_lock_after));
        let merger = Arc::new(MetadataMergeEngine::new(
            Arc::clone(&pool),
            mutex,
            options.lock_policy.clone(),
        ));

        info!("Memory database initialized successfully");
        Ok(Self {
            sessions: SessionStore::new(Arc::clone(&pool), Arc::clone(&merger)),
            messages: MessageStore::new(Arc::clone(&pool), Arc::clone(&merger)),
            summaries: SummaryStore::new(Arc::clone(&pool), Arc::clone(&merger)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool), options.embedding_dimensions),
            purge: PurgeEngine::new(Arc::clone(&pool)),
            merger,
            schema: schema.to_string(),
            pool,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Tenant scope for a project in this database's schema
    pub fn scope(&self, project_uuid: Uuid) -> TenantScope {
        TenantScope::new(self.schema.clone(), project_uuid)
    }

    pub fn merger(&self) -> &Arc<MetadataMergeEngine> {
        &self.merger
    }

    /// Every project that has rows in this database
    pub fn projects(&self) -> Result<Vec<Uuid>> {
        let conn = self.pool.get().storage_context("list projects connection")?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT project_uuid FROM sessions")
            .storage_context("prepare list projects")?;
        let mut rows = stmt.query([]).storage_context("list projects")?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next().storage_context("list projects")? {
            let raw: String = row.get(0)?;
            projects.push(parse_uuid(&raw)?);
        }
        Ok(projects)
    }

    /// Purge every project of rows soft-deleted more than `retention` ago
    pub fn purge_all(&self, retention: Duration) -> Result<PurgeStats> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| MemoryError::Config(format!("invalid retention: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let mut total = PurgeStats::default();
        for project in self.projects()? {
            let stats = self.purge.purge_deleted(&self.scope(project), cutoff)?;
            total.sessions += stats.sessions;
            total.messages += stats.messages;
        }
        Ok(total)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get().storage_context("stats connection")?;
        migration::get_database_stats(&conn).storage_context("database stats")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::time::Duration;

    /// Fast-failing lock policy so contention tests do not sleep for long
    pub fn test_options() -> DatabaseOptions {
        DatabaseOptions {
            embedding_dimensions: 3,
            lock_policy: LockPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
                max_attempts: 50,
            },
            ..Default::default()
        }
    }

    pub fn test_db() -> (MemoryDatabase, TenantScope) {
        let db = MemoryDatabase::new_in_memory("test", test_options()).unwrap();
        let scope = db.scope(Uuid::new_v4());
        (db, scope)
    }
}

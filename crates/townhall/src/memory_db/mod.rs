//! Memory database module - SQLite-based source of truth for chronicle summaries.

pub mod schema;
pub mod summary_store;

pub use schema::{NewSummary, SummaryRecord, SCHEMA_SQL};
pub use summary_store::SummaryStore;

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::Result;

/// Owns the pooled SQLite connection behind the summary store.
///
/// The pool holds exactly one connection: every store operation checks it
/// out and concurrent callers block on that checkout, so reads and writes
/// against the shared connection are serialized rather than interleaved.
pub struct MemoryDatabase {
    pub summaries: SummaryStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> Result<Self> {
        info!("Opening townhall memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        info!("Townhall memory database initialized successfully");
        Ok(Self {
            summaries: SummaryStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        Ok(Self {
            summaries: SummaryStore::new(Arc::clone(&pool)),
            pool,
        })
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

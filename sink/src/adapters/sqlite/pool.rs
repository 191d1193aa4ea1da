use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

use crate::types::error::SinkError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Bound on how long a statement waits for a competing writer
const BUSY_TIMEOUT_MS: u32 = 5_000;

fn init_connection(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = {};",
        BUSY_TIMEOUT_MS
    ))
}

pub fn create_pool(db_path: &Path) -> Result<DbPool, SinkError> {
    let manager = SqliteConnectionManager::file(db_path).with_init(init_connection);

    let pool = Pool::builder()
        .max_size(8)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)?;

    Ok(pool)
}

/// Single-connection pool over a private in-memory database (for testing)
pub fn create_memory_pool() -> Result<DbPool, SinkError> {
    let manager = SqliteConnectionManager::memory().with_init(init_connection);

    // One connection only: every in-memory connection is its own database.
    let pool = Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .build(manager)?;

    Ok(pool)
}

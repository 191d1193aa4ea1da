use rusqlite::Connection;

use crate::types::error::SinkError;

pub fn initialize_schema(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch("
        -- One row per live message document. Collections share the table.
        -- sequence_number is not UNIQUE: renumbering shifts rows one at a time.
        CREATE TABLE IF NOT EXISTS documents (
            id              TEXT PRIMARY KEY,   -- UUID
            collection      TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            document        TEXT NOT NULL,      -- JSON object, sequenceNumber excluded
            created_at      INTEGER NOT NULL    -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_documents_sequence ON documents(collection, sequence_number);
    ")?;

    Ok(())
}

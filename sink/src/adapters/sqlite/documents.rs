//! SQLite-backed document collection
//!
//! Documents are stored as JSON next to an indexed `sequence_number` column.
//! The column is authoritative: it is stripped from the JSON on write and
//! merged back on read.

use rusqlite::{params, params_from_iter, types::Value as SqlValue, OptionalExtension};
use serde_json::{Map, Value};
use std::net::IpAddr;
use tracing::{debug, info};
use uuid::Uuid;

use super::pool::{create_memory_pool, create_pool, DbPool};
use super::schema::initialize_schema;
use crate::adapters::store::{DocumentStore, Filter, SortOrder};
use crate::config::StoreConfig;
use crate::types::document::FIELD_SEQUENCE_NUMBER;
use crate::types::{MessageDocument, Result, SinkError};

pub struct SqliteStore {
    pool: DbPool,
    collection: String,
}

impl SqliteStore {
    /// Open (creating if needed) `<data_dir>/<database>.sqlite`.
    ///
    /// Any failure here is reported as `StoreUnavailable`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if !is_loopback(&config.host) {
            return Err(SinkError::StoreUnavailable(format!(
                "embedded store only serves loopback hosts, got {:?}",
                config.host
            )));
        }

        let dir = config.resolved_data_dir();
        std::fs::create_dir_all(&dir).map_err(|e| {
            SinkError::StoreUnavailable(format!("cannot create {:?}: {}", dir, e))
        })?;
        let path = dir.join(format!("{}.sqlite", config.database));

        let pool = create_pool(&path).map_err(unavailable)?;
        let store = Self::with_pool(pool, &config.collection).map_err(unavailable)?;

        info!("Opened document store {} at {:?}", config.descriptor(), path);
        Ok(store)
    }

    /// Private in-memory store (for testing)
    pub fn in_memory(collection: &str) -> Result<Self> {
        Self::with_pool(create_memory_pool()?, collection)
    }

    fn with_pool(pool: DbPool, collection: &str) -> Result<Self> {
        let conn = pool.get()?;
        initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    /// WHERE clause and its parameters; the collection is always `?1`.
    fn where_clause(&self, filter: Filter) -> (&'static str, Vec<SqlValue>) {
        let mut values = vec![SqlValue::Text(self.collection.clone())];
        let clause = match filter {
            Filter::All => "collection = ?1",
            Filter::SequenceGreaterThan(n) => {
                values.push(SqlValue::Integer(n));
                "collection = ?1 AND sequence_number > ?2"
            }
            Filter::SequenceLessThan(n) => {
                values.push(SqlValue::Integer(n));
                "collection = ?1 AND sequence_number < ?2"
            }
        };
        (clause, values)
    }

    fn query(&self, filter: Filter, sort: SortOrder, limit: Option<u32>) -> Result<Vec<MessageDocument>> {
        let (clause, values) = self.where_clause(filter);
        let direction = match sort {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let limit = limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
        let sql = format!(
            "SELECT sequence_number, document FROM documents WHERE {}
             ORDER BY sequence_number {dir}, rowid {dir}{}",
            clause,
            limit,
            dir = direction
        );

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (sequence_number, json) = row?;
            documents.push(decode_row(sequence_number, &json)?);
        }
        Ok(documents)
    }
}

impl DocumentStore for SqliteStore {
    fn insert_one(&self, document: &MessageDocument) -> Result<()> {
        let mut json = document.to_json();
        json.remove(FIELD_SEQUENCE_NUMBER);
        let encoded = serde_json::to_string(&Value::Object(json))?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO documents (id, collection, sequence_number, document, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                self.collection,
                document.sequence_number,
                encoded,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        debug!(
            "Stored document #{} in {}",
            document.sequence_number, self.collection
        );
        Ok(())
    }

    fn delete_many(&self, filter: Filter) -> Result<u64> {
        let (clause, values) = self.where_clause(filter);
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            &format!("DELETE FROM documents WHERE {}", clause),
            params_from_iter(values.iter()),
        )?;
        Ok(deleted as u64)
    }

    fn count(&self, filter: Filter) -> Result<u64> {
        let (clause, values) = self.where_clause(filter);
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM documents WHERE {}", clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn find_first(&self, filter: Filter, sort: SortOrder) -> Result<Option<MessageDocument>> {
        Ok(self.query(filter, sort, Some(1))?.into_iter().next())
    }

    fn find(&self, filter: Filter, sort: SortOrder) -> Result<Vec<MessageDocument>> {
        self.query(filter, sort, None)
    }

    fn sequence_at(&self, position: u64) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        let sequence_number = conn
            .query_row(
                "SELECT sequence_number FROM documents WHERE collection = ?1
                 ORDER BY sequence_number ASC, rowid ASC LIMIT 1 OFFSET ?2",
                params![self.collection, position as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(sequence_number)
    }

    fn trim_front(&self, keep_from: i64) -> Result<u64> {
        let (clause, values) = self.where_clause(Filter::SequenceLessThan(keep_from));
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        let deleted = tx.execute(
            &format!("DELETE FROM documents WHERE {}", clause),
            params_from_iter(values.iter()),
        )?;

        let mut select = tx.prepare(
            "SELECT id, sequence_number FROM documents WHERE collection = ?1
             ORDER BY sequence_number ASC, rowid ASC",
        )?;
        let survivors = select
            .query_map(params![self.collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        drop(select);

        let mut renumbered = 0;
        {
            let mut update =
                tx.prepare("UPDATE documents SET sequence_number = ?1 WHERE id = ?2")?;
            for (position, (id, current)) in survivors.iter().enumerate() {
                let position = position as i64;
                if *current != position {
                    update.execute(params![position, id])?;
                    renumbered += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            "Trimmed {} below #{} ({} deleted, {} renumbered)",
            self.collection, keep_from, deleted, renumbered
        );
        Ok(deleted as u64)
    }
}

fn decode_row(sequence_number: i64, json: &str) -> Result<MessageDocument> {
    let mut map: Map<String, Value> = serde_json::from_str(json)?;
    map.insert(FIELD_SEQUENCE_NUMBER.into(), Value::from(sequence_number));
    MessageDocument::from_json(map)
}

fn unavailable(err: SinkError) -> SinkError {
    match err {
        SinkError::StoreUnavailable(_) => err,
        other => SinkError::StoreUnavailable(other.to_string()),
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

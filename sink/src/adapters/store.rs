//! Persistent-store boundary
//!
//! The ledger only talks to a collection through this trait. Every call is a
//! single blocking round trip to the backend; failures are returned as-is and
//! never retried here.

use crate::types::{MessageDocument, Result};

/// Document selection on `sequenceNumber`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    All,
    SequenceGreaterThan(i64),
    SequenceLessThan(i64),
}

/// Ordering on `sequenceNumber`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

pub trait DocumentStore: Send + Sync {
    fn insert_one(&self, document: &MessageDocument) -> Result<()>;

    /// Returns the number of deleted documents.
    fn delete_many(&self, filter: Filter) -> Result<u64>;

    fn count(&self, filter: Filter) -> Result<u64>;

    fn find_first(&self, filter: Filter, sort: SortOrder) -> Result<Option<MessageDocument>>;

    fn find(&self, filter: Filter, sort: SortOrder) -> Result<Vec<MessageDocument>>;

    /// Sequence number of the document at zero-based `position` in
    /// ascending order, or `None` past the end.
    fn sequence_at(&self, position: u64) -> Result<Option<i64>>;

    /// Deletes every document numbered below `keep_from` and renumbers the
    /// survivors 0, 1, 2, ... in their existing order. Both steps commit
    /// together or not at all. Returns the number of deleted documents.
    fn trim_front(&self, keep_from: i64) -> Result<u64>;
}

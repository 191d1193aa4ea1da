//! Ordered Message Ledger
//!
//! Keeps the persistent collection and the optional in-memory mirror in step
//! and assigns sequence numbers. Every operation runs under one lock that
//! guards the counter and the mirror; the store is only touched while that
//! lock is held, so the two mirrors never diverge between operations.
//!
//! Store calls happen before the mirror is changed. A failing store call
//! leaves the mirror and the counter untouched and is returned to the caller.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::adapters::{DocumentStore, Filter, SortOrder, SqliteStore};
use crate::config::SinkConfig;
use crate::services::mapper::{map_message, MappingOutcome};
use crate::types::{MessageDocument, ReceivedMail, Result, SinkError};

struct LedgerState {
    next_sequence_number: i64,
    /// `None` when mirroring is disabled
    mirror: Option<Vec<Arc<ReceivedMail>>>,
}

pub struct Ledger {
    state: Mutex<LedgerState>,
    store: Arc<dyn DocumentStore>,
    mirroring_enabled: bool,
}

impl Ledger {
    /// Open the configured store and build a ledger over it.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.store)?;
        Self::new(Arc::new(store), config.mirroring_enabled)
    }

    /// Build a ledger over an existing store.
    ///
    /// Documents already in the collection are kept: the counter continues
    /// after the highest live sequence number and, when mirroring, the mirror
    /// is rebuilt from the stored raw bytes.
    pub fn new(store: Arc<dyn DocumentStore>, mirroring_enabled: bool) -> Result<Self> {
        let next_sequence_number = store
            .find_first(Filter::All, SortOrder::Descending)?
            .map(|doc| doc.sequence_number + 1)
            .unwrap_or(0);

        let live = store.count(Filter::All)?;
        if live as i64 != next_sequence_number {
            warn!(
                "Stored sequence numbers have gaps ({} documents, highest #{}); trims follow position",
                live,
                next_sequence_number - 1
            );
        }

        let mirror = if mirroring_enabled {
            let mut mirror = Vec::new();
            for doc in store.find(Filter::All, SortOrder::Ascending)? {
                mirror.push(Arc::new(doc.to_received_mail()?));
            }
            Some(mirror)
        } else {
            None
        };

        info!(
            "Ledger ready (mirroring: {}, live documents: {}, next sequence: {})",
            mirroring_enabled,
            mirror.as_ref().map(Vec::len).unwrap_or(0),
            next_sequence_number
        );

        Ok(Self {
            state: Mutex::new(LedgerState {
                next_sequence_number,
                mirror,
            }),
            store,
            mirroring_enabled,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|e| SinkError::Lock(e.to_string()))
    }

    pub fn mirroring_enabled(&self) -> bool {
        self.mirroring_enabled
    }

    /// Record one received mail. Returns whether it was recorded.
    pub fn insert(&self, mail: ReceivedMail) -> Result<bool> {
        let mut state = self.lock()?;

        let mut document = match map_message(&mail) {
            MappingOutcome::Mapped(document) => document,
            MappingOutcome::Partial { document, reason } => {
                warn!(
                    "Recording mail for {} with partial fields: {}",
                    mail.envelope_receiver(),
                    reason
                );
                document
            }
        };
        document.sequence_number = state.next_sequence_number;

        if let Err(e) = self.store.insert_one(&document) {
            error!(
                "Failed to store mail for {}: {}",
                mail.envelope_receiver(),
                e
            );
            return Err(e);
        }
        state.next_sequence_number += 1;

        if let Some(mirror) = state.mirror.as_mut() {
            mirror.push(Arc::new(mail));
        }

        debug!("Recorded message #{}", document.sequence_number);
        Ok(true)
    }

    /// Number of live messages.
    pub fn size(&self) -> Result<usize> {
        let state = self.lock()?;
        self.size_locked(&state)
    }

    fn size_locked(&self, state: &LedgerState) -> Result<usize> {
        match &state.mirror {
            Some(mirror) => Ok(mirror.len()),
            None => Ok(self.store.count(Filter::All)? as usize),
        }
    }

    /// Sequence number of the live message at `position`, oldest first.
    fn sequence_at(&self, position: usize) -> Result<i64> {
        self.store.sequence_at(position as u64)?.ok_or_else(|| {
            SinkError::Database(format!("no stored document at position {}", position))
        })
    }

    /// Snapshot of the mirror, oldest first. Always empty without mirroring.
    pub fn list(&self) -> Result<Vec<Arc<ReceivedMail>>> {
        let state = self.lock()?;
        Ok(state.mirror.clone().unwrap_or_default())
    }

    /// Live persisted documents in sequence order.
    pub fn documents(&self) -> Result<Vec<MessageDocument>> {
        let _state = self.lock()?;
        self.store.find(Filter::All, SortOrder::Ascending)
    }

    /// Drop every message and restart numbering at 0.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;

        let deleted = self.store.delete_many(Filter::All)?;
        state.next_sequence_number = 0;
        if let Some(mirror) = state.mirror.as_mut() {
            mirror.clear();
        }

        info!("Cleared ledger ({} documents deleted)", deleted);
        Ok(())
    }

    /// Keep the oldest `retain` messages and drop the rest.
    pub fn truncate(&self, retain: usize) -> Result<()> {
        let mut state = self.lock()?;

        let size = self.size_locked(&state)?;
        if retain >= size {
            return Ok(());
        }

        // First dropped message; everything numbered at or above it goes.
        let boundary = self.sequence_at(retain)?;
        let deleted = self
            .store
            .delete_many(Filter::SequenceGreaterThan(boundary - 1))?;
        if let Some(mirror) = state.mirror.as_mut() {
            mirror.truncate(retain);
        }
        // Survivors are all numbered below `boundary`.
        state.next_sequence_number = boundary;

        info!(
            "Truncated ledger to the oldest {} messages ({} documents deleted)",
            retain, deleted
        );
        Ok(())
    }

    /// Keep the newest `retain` messages, renumbering them from 0.
    pub fn tail(&self, retain: usize) -> Result<()> {
        let mut state = self.lock()?;

        let size = self.size_locked(&state)?;
        if retain >= size {
            return Ok(());
        }

        let cut = size - retain;
        let boundary = self.sequence_at(cut)?;
        let deleted = self.store.trim_front(boundary)?;
        if let Some(mirror) = state.mirror.as_mut() {
            mirror.drain(..cut);
        }
        state.next_sequence_number = retain as i64;

        info!(
            "Tailed ledger to the newest {} messages ({} documents deleted)",
            retain, deleted
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn message(i: usize) -> ReceivedMail {
        ReceivedMail::new(
            "someone@somewhereelse.com",
            "anyone@anywhere.com",
            format!(
                "From: someone@somewhereelse.com\r\n\
                 To: anyone@anywhere.com\r\n\
                 Subject: barf{i}\r\n\
                 Content-Type: text/plain\r\n\
                 \r\n\
                 text{i}\r\n"
            ),
        )
    }

    fn ledger(mirroring: bool) -> (Ledger, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory("messages").expect("Failed to create store"));
        let ledger = Ledger::new(store.clone(), mirroring).expect("Failed to create ledger");
        (ledger, store)
    }

    fn send_sequence(ledger: &Ledger, n: usize) {
        for i in 0..n {
            assert!(ledger.insert(message(i)).unwrap());
        }
    }

    fn sequence_numbers(store: &SqliteStore) -> Vec<i64> {
        store
            .find(Filter::All, SortOrder::Ascending)
            .unwrap()
            .iter()
            .map(|d| d.sequence_number)
            .collect()
    }

    fn subjects(ledger: &Ledger) -> Vec<String> {
        ledger
            .list()
            .unwrap()
            .iter()
            .map(|m| m.subject().unwrap_or_default())
            .collect()
    }

    fn assert_mirrors_agree(ledger: &Ledger, store: &SqliteStore) {
        let stored: Vec<String> = store
            .find(Filter::All, SortOrder::Ascending)
            .unwrap()
            .iter()
            .map(|d| d.field("subject").unwrap_or_default().to_string())
            .collect();
        assert_eq!(subjects(ledger), stored);
        assert_eq!(ledger.size().unwrap() as u64, store.count(Filter::All).unwrap());
    }

    #[test]
    fn test_insert_assigns_increasing_sequence_numbers() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 4);
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3]);
        assert_eq!(ledger.size().unwrap(), 4);
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_one_document_per_recipient() {
        let (ledger, store) = ledger(true);
        let data = "Subject: barf\r\n\r\nbody\r\n";
        ledger
            .insert(ReceivedMail::new("a@x.com", "anyone@anywhere.com", data))
            .unwrap();
        ledger
            .insert(ReceivedMail::new("a@x.com", "anyone2@anywhere.com", data))
            .unwrap();
        let receivers: Vec<String> = store
            .find(Filter::All, SortOrder::Ascending)
            .unwrap()
            .into_iter()
            .map(|d| d.envelope_receiver)
            .collect();
        assert_eq!(receivers, vec!["anyone@anywhere.com", "anyone2@anywhere.com"]);
        assert_eq!(ledger.list().unwrap().len(), 2);
    }

    #[test]
    fn test_clear_resets_everything() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 10);
        assert_eq!(store.count(Filter::All).unwrap(), 10);

        ledger.clear().unwrap();
        assert_eq!(ledger.size().unwrap(), 0);
        assert!(ledger.list().unwrap().is_empty());
        assert_eq!(store.count(Filter::All).unwrap(), 0);

        ledger.insert(message(0)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0]);
    }

    #[test]
    fn test_truncate_keeps_oldest() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 10);

        ledger.truncate(5).unwrap();
        assert_eq!(ledger.size().unwrap(), 5);
        assert_eq!(subjects(&ledger).last().map(String::as_str), Some("barf4"));
        assert_eq!(store.count(Filter::All).unwrap(), 5);

        let last = store
            .find_first(Filter::All, SortOrder::Descending)
            .unwrap()
            .unwrap();
        assert_eq!(last.sequence_number, 4);
        assert_eq!(last.field("subject"), Some("barf4"));
        assert_eq!(last.body.as_deref().map(str::trim_end), Some("text4"));
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_insert_after_truncate_does_not_reuse_sequence_number() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 10);
        ledger.truncate(5).unwrap();

        ledger.insert(message(10)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3, 4, 5]);
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_tail_keeps_newest_and_renumbers() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 10);

        ledger.tail(5).unwrap();
        assert_eq!(ledger.size().unwrap(), 5);
        assert_eq!(
            subjects(&ledger),
            vec!["barf5", "barf6", "barf7", "barf8", "barf9"]
        );
        assert_eq!(store.count(Filter::All).unwrap(), 5);

        let last = store
            .find_first(Filter::All, SortOrder::Descending)
            .unwrap()
            .unwrap();
        assert_eq!(last.field("subject"), Some("barf9"));
        assert_eq!(last.sequence_number, 4);
        let first = store
            .find_first(Filter::All, SortOrder::Ascending)
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence_number, 0);
        assert_eq!(first.field("subject"), Some("barf5"));
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_insert_after_tail_does_not_reuse_sequence_number() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 10);
        ledger.tail(3).unwrap();

        ledger.insert(message(10)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3]);
        let last = store
            .find_first(Filter::All, SortOrder::Descending)
            .unwrap()
            .unwrap();
        assert_eq!(last.field("subject"), Some("barf10"));
    }

    #[test]
    fn test_trims_at_or_above_size_are_noops() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 5);
        let before = store.find(Filter::All, SortOrder::Ascending).unwrap();

        ledger.truncate(5).unwrap();
        ledger.tail(5).unwrap();
        ledger.truncate(50).unwrap();
        ledger.tail(50).unwrap();

        assert_eq!(store.find(Filter::All, SortOrder::Ascending).unwrap(), before);
        assert_eq!(ledger.size().unwrap(), 5);

        ledger.insert(message(5)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_trim_to_zero_empties_both_mirrors() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 3);
        ledger.tail(0).unwrap();
        assert_eq!(ledger.size().unwrap(), 0);
        assert_eq!(store.count(Filter::All).unwrap(), 0);

        send_sequence(&ledger, 2);
        ledger.truncate(0).unwrap();
        assert_mirrors_agree(&ledger, &store);
        ledger.insert(message(0)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0]);
    }

    #[test]
    fn test_store_only_mode() {
        let (ledger, store) = ledger(false);
        assert!(!ledger.mirroring_enabled());
        send_sequence(&ledger, 10);

        assert!(ledger.list().unwrap().is_empty());
        assert_eq!(ledger.size().unwrap(), 10);

        ledger.tail(5).unwrap();
        assert_eq!(ledger.size().unwrap(), 5);
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3, 4]);

        ledger.truncate(2).unwrap();
        let docs = ledger.documents().unwrap();
        let stored: Vec<&str> = docs.iter().filter_map(|d| d.field("subject")).collect();
        assert_eq!(stored, vec!["barf5", "barf6"]);

        ledger.clear().unwrap();
        assert_eq!(ledger.size().unwrap(), 0);
    }

    #[test]
    fn test_mixed_operations_keep_mirrors_consistent() {
        let (ledger, store) = ledger(true);
        send_sequence(&ledger, 7);
        ledger.tail(4).unwrap();
        assert_mirrors_agree(&ledger, &store);
        send_sequence(&ledger, 3);
        ledger.truncate(5).unwrap();
        assert_mirrors_agree(&ledger, &store);
        ledger.tail(2).unwrap();
        assert_mirrors_agree(&ledger, &store);
        assert_eq!(sequence_numbers(&store), vec![0, 1]);
        ledger.clear().unwrap();
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_reopen_continues_numbering_and_rebuilds_mirror() {
        let store = Arc::new(SqliteStore::in_memory("messages").unwrap());
        {
            let ledger = Ledger::new(store.clone(), true).unwrap();
            send_sequence(&ledger, 3);
        }
        let ledger = Ledger::new(store.clone(), true).unwrap();
        assert_eq!(subjects(&ledger), vec!["barf0", "barf1", "barf2"]);

        ledger.insert(message(3)).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3]);
        assert_mirrors_agree(&ledger, &store);
    }

    #[test]
    fn test_partial_mapping_is_still_recorded() {
        let (ledger, store) = ledger(true);
        let data = "Subject: broken\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            !!!not base64!!!\r\n";
        assert!(ledger
            .insert(ReceivedMail::new("a@x.com", "b@y.com", data))
            .unwrap());
        let doc = store.find_first(Filter::All, SortOrder::Ascending).unwrap().unwrap();
        assert_eq!(doc.field("subject"), Some("broken"));
        assert!(doc.body.is_none());
    }

    #[test]
    fn test_concurrent_inserts_get_unique_numbers() {
        let (ledger, store) = ledger(true);
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        ledger.insert(message(t * 10 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sequence_numbers(&store), (0..20).collect::<Vec<i64>>());
        assert_mirrors_agree(&ledger, &store);
    }

    /// Delegates to an in-memory store until told to fail writes.
    struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(SinkError::Database("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    impl DocumentStore for FlakyStore {
        fn insert_one(&self, document: &MessageDocument) -> Result<()> {
            self.check()?;
            self.inner.insert_one(document)
        }

        fn delete_many(&self, filter: Filter) -> Result<u64> {
            self.check()?;
            self.inner.delete_many(filter)
        }

        fn count(&self, filter: Filter) -> Result<u64> {
            self.inner.count(filter)
        }

        fn find_first(&self, filter: Filter, sort: SortOrder) -> Result<Option<MessageDocument>> {
            self.inner.find_first(filter, sort)
        }

        fn find(&self, filter: Filter, sort: SortOrder) -> Result<Vec<MessageDocument>> {
            self.inner.find(filter, sort)
        }

        fn sequence_at(&self, position: u64) -> Result<Option<i64>> {
            self.inner.sequence_at(position)
        }

        fn trim_front(&self, keep_from: i64) -> Result<u64> {
            self.check()?;
            self.inner.trim_front(keep_from)
        }
    }

    #[test]
    fn test_store_failure_is_propagated_and_leaves_state_untouched() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory("messages").unwrap(),
            failing: AtomicBool::new(false),
        });
        let ledger = Ledger::new(store.clone(), true).unwrap();
        send_sequence(&ledger, 3);

        store.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            ledger.insert(message(3)),
            Err(SinkError::Database(_))
        ));
        assert!(ledger.truncate(1).is_err());
        assert!(ledger.tail(1).is_err());
        assert!(ledger.clear().is_err());
        assert_eq!(ledger.size().unwrap(), 3);

        store.failing.store(false, Ordering::SeqCst);
        ledger.insert(message(3)).unwrap();
        let numbers: Vec<i64> = store
            .find(Filter::All, SortOrder::Ascending)
            .unwrap()
            .iter()
            .map(|d| d.sequence_number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(ledger.list().unwrap().len(), 4);
    }

    #[test]
    fn test_tail_is_all_or_nothing_when_renumbering_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..StoreConfig::default()
        };
        let store = Arc::new(SqliteStore::open(&config).unwrap());
        let ledger = Ledger::new(store.clone(), true).unwrap();
        send_sequence(&ledger, 10);

        let raw = rusqlite::Connection::open(dir.path().join("mailsink.sqlite")).unwrap();
        raw.execute_batch(
            "CREATE TRIGGER refuse_renumber BEFORE UPDATE OF sequence_number ON documents
             BEGIN SELECT RAISE(ABORT, 'renumber refused'); END;",
        )
        .unwrap();

        assert!(matches!(ledger.tail(5), Err(SinkError::Database(_))));
        assert_eq!(ledger.size().unwrap(), 10);
        assert_eq!(sequence_numbers(&store), (0..10).collect::<Vec<i64>>());
        assert_mirrors_agree(&ledger, &store);

        raw.execute_batch("DROP TRIGGER refuse_renumber;").unwrap();
        ledger.tail(5).unwrap();
        assert_eq!(sequence_numbers(&store), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            subjects(&ledger),
            vec!["barf5", "barf6", "barf7", "barf8", "barf9"]
        );
        assert_mirrors_agree(&ledger, &store);
    }

    /// Store whose documents were numbered with gaps by an earlier writer.
    fn gapped_store(numbers: &[i64]) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory("messages").unwrap());
        for (i, n) in numbers.iter().enumerate() {
            let mut document = map_message(&message(i)).into_document();
            document.sequence_number = *n;
            store.insert_one(&document).unwrap();
        }
        store
    }

    #[test]
    fn test_truncate_on_gapped_numbers_keeps_oldest_by_position() {
        for mirroring in [true, false] {
            let store = gapped_store(&[0, 2, 5, 7, 9]);
            let ledger = Ledger::new(store.clone(), mirroring).unwrap();

            ledger.truncate(3).unwrap();
            assert_eq!(ledger.size().unwrap(), 3);
            assert_eq!(sequence_numbers(&store), vec![0, 2, 5]);
            let stored: Vec<String> = ledger
                .documents()
                .unwrap()
                .iter()
                .filter_map(|d| d.field("subject").map(str::to_string))
                .collect();
            assert_eq!(stored, vec!["barf0", "barf1", "barf2"]);
            if mirroring {
                assert_mirrors_agree(&ledger, &store);
            }

            // Numbering resumes at the first dropped number.
            ledger.insert(message(3)).unwrap();
            assert_eq!(sequence_numbers(&store), vec![0, 2, 5, 7]);
        }
    }

    #[test]
    fn test_tail_on_gapped_numbers_keeps_newest_by_position() {
        for mirroring in [true, false] {
            let store = gapped_store(&[0, 2, 5, 7, 9]);
            let ledger = Ledger::new(store.clone(), mirroring).unwrap();

            ledger.tail(2).unwrap();
            assert_eq!(ledger.size().unwrap(), 2);
            assert_eq!(sequence_numbers(&store), vec![0, 1]);
            let stored: Vec<String> = ledger
                .documents()
                .unwrap()
                .iter()
                .filter_map(|d| d.field("subject").map(str::to_string))
                .collect();
            assert_eq!(stored, vec!["barf3", "barf4"]);
            if mirroring {
                assert_mirrors_agree(&ledger, &store);
            }

            ledger.insert(message(5)).unwrap();
            assert_eq!(sequence_numbers(&store), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_mirroring_flag_is_fixed_at_construction() {
        let (mirrored, _) = ledger(true);
        let (store_only, _) = ledger(false);
        assert!(mirrored.mirroring_enabled());
        assert!(!store_only.mirroring_enabled());
    }
}

use std::sync::Arc;

use indexmap::IndexSet;

use crate::error::{SourceKind, SyncError, SyncResult};
use crate::model::{Entry, EntryId};
use crate::sources::{BatchSource, KeyValueStore};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_KEY_PREFIX: &str = "randomBatch_";
const DELETED_MEMORY: usize = 512;

/// Identifies one requested refill. A completion is only accepted while no
/// other refill has replaced the buffer since the ticket was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillTicket {
    generation: u64,
}

/// Pick-without-replacement buffer over a sampled batch, persisted per user.
pub struct RandomItemCache {
    batch_size: usize,
    key: String,
    batches: Arc<dyn BatchSource>,
    store: Arc<dyn KeyValueStore>,
    buffer: Vec<Entry>,
    generation: u64,
    refill: Option<RefillTicket>,
    deleted: IndexSet<EntryId>,
}

impl RandomItemCache {
    pub fn new(
        batch_size: usize,
        key_prefix: &str,
        user_id: &str,
        batches: Arc<dyn BatchSource>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let key = format!("{key_prefix}{user_id}");
        let buffer = load_buffer(store.as_ref(), &key);
        Self {
            batch_size: batch_size.max(1),
            key,
            batches,
            store,
            buffer,
            generation: 0,
            refill: None,
            deleted: IndexSet::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered(&self) -> &[Entry] {
        &self.buffer
    }

    pub fn refill_pending(&self) -> bool {
        self.refill.is_some()
    }

    /// Pops the last buffered entry, refilling an empty buffer first.
    pub fn get_next(&mut self) -> SyncResult<Option<Entry>> {
        if self.buffer.is_empty() {
            self.refill_now()?;
        }
        let next = self.buffer.pop();
        if self.buffer.is_empty() {
            self.schedule_refill();
        }
        self.persist();
        Ok(next)
    }

    pub fn on_entry_updated(&mut self, entry: &Entry) {
        let Some(slot) = self.buffer.iter_mut().find(|cached| cached.id == entry.id) else {
            return;
        };
        *slot = entry.clone();
        self.persist();
    }

    pub fn on_entry_deleted(&mut self, id: &EntryId) {
        if self.deleted.insert(id.clone()) && self.deleted.len() > DELETED_MEMORY {
            self.deleted.shift_remove_index(0);
        }
        let Some(position) = self.buffer.iter().position(|cached| &cached.id == id) else {
            return;
        };
        self.buffer.remove(position);
        if self.buffer.is_empty() {
            self.schedule_refill();
        }
        self.persist();
    }

    pub fn take_refill_request(&mut self) -> Option<RefillTicket> {
        self.refill.take()
    }

    /// Installs the batch fetched for `ticket`. Returns `Ok(false)` when a later
    /// call already refilled the buffer and the result was discarded.
    pub fn complete_refill(
        &mut self,
        ticket: RefillTicket,
        result: SyncResult<Vec<Entry>>,
    ) -> SyncResult<bool> {
        if ticket.generation != self.generation {
            tracing::debug!(key = %self.key, "discarding stale random batch");
            return Ok(false);
        }
        match result {
            Ok(batch) => {
                self.install(batch);
                Ok(true)
            }
            Err(err) => {
                self.refill = Some(ticket);
                Err(err)
            }
        }
    }

    /// Runs a scheduled refill, if any. Returns whether a new batch was installed.
    pub fn run_refill(&mut self) -> SyncResult<bool> {
        let Some(ticket) = self.take_refill_request() else {
            return Ok(false);
        };
        let result = self.sample();
        self.complete_refill(ticket, result)
    }

    fn refill_now(&mut self) -> SyncResult<()> {
        let batch = self.sample()?;
        self.install(batch);
        Ok(())
    }

    fn sample(&self) -> SyncResult<Vec<Entry>> {
        self.batches
            .sample(self.batch_size)
            .map_err(|err| match err {
                SyncError::SourceFailure { .. } => err,
                other => SyncError::source_failure(SourceKind::Batch, other),
            })
    }

    fn install(&mut self, batch: Vec<Entry>) {
        self.generation += 1;
        self.refill = None;
        if let Err(err) = self.store.remove(&self.key) {
            tracing::warn!(%err, key = %self.key, "failed to invalidate cached random batch");
        }
        let mut batch: Vec<Entry> = batch
            .into_iter()
            .filter(|entry| !self.deleted.contains(&entry.id))
            .collect();
        batch.truncate(self.batch_size);
        if batch.len() < self.batch_size {
            tracing::debug!(
                requested = self.batch_size,
                received = batch.len(),
                "random batch smaller than requested"
            );
        }
        self.buffer = batch;
        self.persist();
    }

    fn schedule_refill(&mut self) {
        if self.refill.is_none() {
            self.refill = Some(RefillTicket {
                generation: self.generation,
            });
        }
    }

    fn persist(&self) {
        let result = if self.buffer.is_empty() {
            self.store.remove(&self.key)
        } else {
            encode_batch(&self.buffer).and_then(|raw| self.store.set(&self.key, &raw))
        };
        if let Err(err) = result {
            tracing::warn!(%err, key = %self.key, "failed to persist random batch");
        }
    }
}

pub fn encode_batch(entries: &[Entry]) -> SyncResult<String> {
    Ok(serde_json::to_string(entries)?)
}

pub fn decode_batch(raw: &str) -> SyncResult<Vec<Entry>> {
    Ok(serde_json::from_str(raw)?)
}

/// A malformed or unreadable payload is a cache miss.
fn load_buffer(store: &dyn KeyValueStore, key: &str) -> Vec<Entry> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            tracing::warn!(%err, key, "failed to read cached random batch");
            return Vec::new();
        }
    };
    match decode_batch(&raw) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(%err, key, "discarding malformed random batch");
            if let Err(err) = store.remove(key) {
                tracing::warn!(%err, key, "failed to remove malformed random batch");
            }
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use time::macros::datetime;

    use super::*;
    use crate::sources::MemoryKeyValueStore;
    use crate::testing::FakeBatchSource;

    fn entry(id: &str) -> Entry {
        let at = datetime!(2018-03-31 13:58 UTC);
        let mut entry = Entry::new(format!("word-{id}"), format!("t-{id}"), at);
        entry.id = EntryId::from(id);
        entry
    }

    fn ids(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    fn seeded(
        batch: &[&str],
        refills: Vec<Vec<Entry>>,
    ) -> (RandomItemCache, Arc<FakeBatchSource>, Arc<MemoryKeyValueStore>) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let entries: Vec<Entry> = batch.iter().map(|id| entry(id)).collect();
        store
            .set("randomBatch_u1", &encode_batch(&entries).unwrap())
            .unwrap();
        let source = Arc::new(FakeBatchSource::new(refills));
        let cache = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source.clone(),
            store.clone(),
        );
        (cache, source, store)
    }

    #[test]
    fn pops_from_the_end_and_refills_on_the_following_call() {
        let (mut cache, source, _) = seeded(&["A", "B", "C"], vec![vec![entry("D"), entry("E")]]);
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "C");

        cache.on_entry_deleted(&EntryId::from("A"));
        assert_eq!(ids(cache.buffered()), vec!["B"]);

        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "B");
        assert!(cache.refill_pending());
        assert_eq!(source.calls(), 0);

        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "E");
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn buffer_survives_reload() {
        let (mut cache, source, store) = seeded(&["A", "B", "C"], vec![]);
        cache.get_next().unwrap();
        let reloaded = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source,
            store,
        );
        assert_eq!(ids(reloaded.buffered()), vec!["A", "B"]);
    }

    #[test]
    fn encode_then_decode_keeps_ids() {
        let entries = vec![entry("A"), entry("B")];
        let decoded = decode_batch(&encode_batch(&entries).unwrap()).unwrap();
        assert_eq!(ids(&decoded), ids(&entries));
        assert_eq!(decoded[0].translation, "t-A");
    }

    #[test]
    fn malformed_payload_is_a_cache_miss() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set("randomBatch_u1", "{not json").unwrap();
        let source = Arc::new(FakeBatchSource::new(vec![vec![entry("X")]]));
        let mut cache = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source.clone(),
            store.clone(),
        );
        assert!(cache.is_empty());
        assert_eq!(store.get("randomBatch_u1").unwrap(), None);
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "X");
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn small_collections_yield_small_batches() {
        let source = Arc::new(FakeBatchSource::new(vec![
            vec![entry("only")],
            vec![entry("again")],
        ]));
        let mut cache = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source.clone(),
            Arc::new(MemoryKeyValueStore::new()),
        );
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "only");
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "again");
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn empty_collection_yields_nothing() {
        let source = Arc::new(FakeBatchSource::new(vec![]));
        let mut cache = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source,
            Arc::new(MemoryKeyValueStore::new()),
        );
        assert_eq!(cache.get_next().unwrap(), None);
    }

    #[test]
    fn update_replaces_buffered_entry_in_place() {
        let (mut cache, _, store) = seeded(&["A", "B"], vec![]);
        let mut edited = entry("A");
        edited.translation = "edited".into();
        cache.on_entry_updated(&edited);
        cache.on_entry_updated(&entry("zzz"));
        assert_eq!(ids(cache.buffered()), vec!["A", "B"]);
        assert_eq!(cache.buffered()[0].translation, "edited");
        let persisted = decode_batch(&store.get("randomBatch_u1").unwrap().unwrap()).unwrap();
        assert_eq!(persisted[0].translation, "edited");
    }

    #[test]
    fn deleting_last_item_schedules_refill_and_clears_key() {
        let (mut cache, _, store) = seeded(&["A"], vec![]);
        cache.on_entry_deleted(&EntryId::from("A"));
        assert!(cache.is_empty());
        assert!(cache.refill_pending());
        assert_eq!(store.get("randomBatch_u1").unwrap(), None);
    }

    #[test]
    fn refill_skips_entries_deleted_this_session() {
        let (mut cache, _, _) = seeded(&[], vec![vec![entry("gone"), entry("kept")]]);
        cache.on_entry_deleted(&EntryId::from("gone"));
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "kept");
    }

    #[test]
    fn stale_refill_completion_is_discarded() {
        let (mut cache, _, _) = seeded(&["A"], vec![vec![entry("sync")]]);
        cache.get_next().unwrap();
        let ticket = cache.take_refill_request().expect("refill scheduled");

        // A later call refills synchronously before the async result lands.
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "sync");
        let accepted = cache
            .complete_refill(ticket, Ok(vec![entry("late")]))
            .unwrap();
        assert!(!accepted);
        assert!(cache.buffered().iter().all(|e| e.id.as_str() != "late"));
    }

    #[test]
    fn current_refill_completion_is_installed() {
        let (mut cache, source, _) = seeded(&["A"], vec![]);
        cache.get_next().unwrap();
        let ticket = cache.take_refill_request().expect("refill scheduled");
        assert!(cache
            .complete_refill(ticket, Ok(vec![entry("B"), entry("C")]))
            .unwrap());
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "C");
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn run_refill_installs_a_scheduled_batch_once() {
        let (mut cache, source, _) = seeded(&["A"], vec![vec![entry("B")]]);
        assert!(!cache.run_refill().unwrap());
        cache.get_next().unwrap();

        assert!(cache.run_refill().unwrap());
        assert_eq!(source.calls(), 1);
        assert!(!cache.refill_pending());
        assert!(!cache.run_refill().unwrap());
        assert_eq!(cache.get_next().unwrap().unwrap().id.as_str(), "B");
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn deleted_ids_are_remembered_up_to_a_bound() {
        let (mut cache, _, _) = seeded(&[], vec![]);
        for n in 0..DELETED_MEMORY + 8 {
            cache.on_entry_deleted(&EntryId::from(format!("d{n}")));
        }
        assert_eq!(cache.deleted.len(), DELETED_MEMORY);
        assert!(!cache.deleted.contains(&EntryId::from("d0")));
        assert!(cache.deleted.contains(&EntryId::from(format!("d{}", DELETED_MEMORY + 7))));
    }

    #[test]
    fn failed_refill_reports_source_failure() {
        let source = Arc::new(FakeBatchSource::failing());
        let mut cache = RandomItemCache::new(
            DEFAULT_BATCH_SIZE,
            DEFAULT_KEY_PREFIX,
            "u1",
            source,
            Arc::new(MemoryKeyValueStore::new()),
        );
        assert_matches!(
            cache.get_next(),
            Err(SyncError::SourceFailure {
                kind: SourceKind::Batch,
                ..
            })
        );
        assert!(cache.is_empty());
    }
}

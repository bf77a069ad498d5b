use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};
use crate::error::{SourceKind, SyncError, SyncResult};
use crate::model::{Entry, EntryId, EntryRecord};
use crate::sources::{
    channel, AuthSource, BatchSource, EntriesResult, KeyValueStore, Mutation, PageRequest,
    PageSource, PageToken, Publisher, StatsSnapshot, StatsSource, Subscription,
};

mod schema;

const ENTRY_COLUMNS: &str = "id, original_text, translation, added_on, updated_on, archived";

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

/// Keyset position of the last row of a page: newest first, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    added_on: i64,
    id: String,
}

impl PageCursor {
    pub fn token(&self) -> PageToken {
        PageToken(format!("{}:{}", self.added_on, self.id))
    }

    pub fn parse(token: &PageToken) -> Option<Self> {
        let (added_on, id) = token.0.split_once(':')?;
        Some(Self {
            added_on: added_on.parse().ok()?,
            id: id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntryPage {
    pub records: Vec<EntryRecord>,
    pub next: Option<PageCursor>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    /// One page of entries after `cursor`, plus the cursor of the following page if any.
    pub fn fetch_page(&self, cursor: Option<&PageCursor>, limit: usize) -> Result<EntryPage> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM entries
                 WHERE ?1 IS NULL
                    OR added_on < ?1
                    OR (added_on = ?1 AND id > ?2)
                 ORDER BY added_on DESC, id ASC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut records = stmt
                .query_map(
                    params![
                        cursor.map(|c| c.added_on),
                        cursor.map(|c| c.id.as_str()),
                        (limit + 1) as i64
                    ],
                    record_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()
                .context("loading entries page")?;
            let next = if records.len() > limit {
                records.truncate(limit);
                records.last().and_then(|last| {
                    Some(PageCursor {
                        added_on: to_millis(last.added_on?),
                        id: last.id.clone(),
                    })
                })
            } else {
                None
            };
            Ok(EntryPage { records, next })
        })
    }

    pub fn fetch_entry(&self, id: &EntryId) -> Result<Option<EntryRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
            let record = conn
                .query_row(&sql, [id.as_str()], record_from_row)
                .optional()
                .with_context(|| format!("loading entry {id}"))?;
            Ok(record)
        })
    }

    pub fn insert_entry(&self, entry: &Entry) -> Result<()> {
        if entry.original_text.trim().is_empty() {
            bail!("entry text cannot be empty");
        }
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO entries (id, original_text, translation, added_on, updated_on, archived)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    entry.id.as_str(),
                    entry.original_text,
                    entry.translation,
                    to_millis(entry.added_on),
                    to_millis(entry.updated_on)
                ],
            )
            .with_context(|| format!("inserting entry {}", entry.id))?;
            Ok(())
        })
    }

    pub fn update_entry(&self, entry: &Entry) -> Result<bool> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE entries
                     SET original_text = ?1, translation = ?2, added_on = ?3, updated_on = ?4
                     WHERE id = ?5",
                    params![
                        entry.original_text,
                        entry.translation,
                        to_millis(entry.added_on),
                        to_millis(entry.updated_on),
                        entry.id.as_str()
                    ],
                )
                .with_context(|| format!("updating entry {}", entry.id))?;
            Ok(updated > 0)
        })
    }

    pub fn delete_entry(&self, id: &EntryId) -> Result<bool> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute("DELETE FROM entries WHERE id = ?1", [id.as_str()])
                .with_context(|| format!("deleting entry {id}"))?;
            Ok(deleted > 0)
        })
    }

    pub fn set_entry_archived(&self, id: &EntryId, archived: bool) -> Result<bool> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE entries SET archived = ?1 WHERE id = ?2",
                    params![if archived { 1 } else { 0 }, id.as_str()],
                )
                .context("updating entry archived state")?;
            Ok(updated > 0)
        })
    }

    pub fn fetch_stats(&self) -> Result<StatsSnapshot> {
        self.with_connection(|conn| {
            let snapshot = conn
                .query_row(
                    "SELECT total_entry_count, learned_entry_count FROM entry_stats WHERE id = 1",
                    [],
                    |row| {
                        Ok(StatsSnapshot {
                            total_entry_count: row.get(0)?,
                            learned_entry_count: row.get(1)?,
                            from_cache: false,
                        })
                    },
                )
                .context("loading entry stats")?;
            Ok(snapshot)
        })
    }

    /// Up to `limit` entries not yet learned, in random order.
    pub fn sample_entries(&self, limit: usize) -> Result<Vec<Entry>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE archived = 0 ORDER BY RANDOM() LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let now = OffsetDateTime::now_utc();
            let entries = stmt
                .query_map([limit as i64], record_from_row)?
                .map(|row| row.map(|record| record.normalize(now).0))
                .collect::<Result<Vec<_>, _>>()
                .context("sampling entries")?;
            Ok(entries)
        })
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()
                .with_context(|| format!("reading key {key}"))?;
            Ok(value)
        })
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("writing key {key}"))?;
            Ok(())
        })
    }

    pub fn kv_remove(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])
                .with_context(|| format!("removing key {key}"))?;
            Ok(())
        })
    }
}

struct LiveWindow {
    request: PageRequest,
    publisher: Publisher<EntriesResult>,
}

/// Every acknowledged mutation re-publishes all live subscriptions.
pub struct LocalCollection {
    storage: StorageHandle,
    windows: Mutex<Vec<LiveWindow>>,
    stats: Mutex<Vec<Publisher<StatsSnapshot>>>,
}

impl LocalCollection {
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage,
            windows: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    fn load_page(&self, request: &PageRequest) -> SyncResult<EntriesResult> {
        let cursor = match &request.token {
            Some(token) => Some(PageCursor::parse(token).ok_or_else(|| {
                SyncError::source_failure(SourceKind::Page, format!("invalid page token {}", token.0))
            })?),
            None => None,
        };
        let page = self
            .storage
            .fetch_page(cursor.as_ref(), request.page_size)
            .map_err(|err| page_failure(&err))?;
        Ok(EntriesResult {
            entries: page.records,
            has_more: page.next.is_some(),
            next_page_token: page.next.map(|cursor| cursor.token()),
            from_cache: false,
        })
    }

    fn publish_page(&self, window: &LiveWindow) -> bool {
        match self.load_page(&window.request) {
            Ok(result) => window.publisher.push(result),
            Err(err) => {
                tracing::warn!(%err, "failed to refresh page subscription");
                window.publisher.error(err)
            }
        }
    }

    fn publish_stats(&self, publisher: &Publisher<StatsSnapshot>) -> bool {
        match self.storage.fetch_stats() {
            Ok(snapshot) => publisher.push(snapshot),
            Err(err) => publisher.error(SyncError::source_failure(
                SourceKind::Stats,
                format!("{err:#}"),
            )),
        }
    }

    fn republish(&self) {
        let mut windows = self.windows.lock();
        windows.retain(|window| self.publish_page(window));
        drop(windows);
        let mut stats = self.stats.lock();
        stats.retain(|publisher| self.publish_stats(publisher));
        tracing::debug!(live_stats = stats.len(), "re-published live subscriptions");
    }

    fn apply(&self, mutation: &Mutation) -> Result<bool> {
        match mutation {
            Mutation::Add(entry) => self.storage.insert_entry(entry).map(|()| true),
            Mutation::Update(entry) => self.storage.update_entry(entry),
            Mutation::Delete(id) => self.storage.delete_entry(id),
            Mutation::Archive(id) => self.storage.set_entry_archived(id, true),
            Mutation::Unarchive(id) => self.storage.set_entry_archived(id, false),
        }
    }
}

impl PageSource for LocalCollection {
    fn subscribe(&self, request: PageRequest) -> Subscription<EntriesResult> {
        let (publisher, subscription) = channel();
        let window = LiveWindow { request, publisher };
        if self.publish_page(&window) {
            self.windows.lock().push(window);
        }
        subscription
    }

    fn mutate(&self, mutation: Mutation) -> SyncResult<()> {
        let found = self.apply(&mutation).map_err(|err| page_failure(&err))?;
        if !found {
            let id = match mutation {
                Mutation::Add(entry) | Mutation::Update(entry) => entry.id,
                Mutation::Delete(id) | Mutation::Archive(id) | Mutation::Unarchive(id) => id,
            };
            return Err(SyncError::NotFound(id));
        }
        tracing::debug!(mutation = mutation.label(), "applied mutation");
        self.republish();
        Ok(())
    }
}

impl StatsSource for LocalCollection {
    fn subscribe(&self) -> Subscription<StatsSnapshot> {
        let (publisher, subscription) = channel();
        if self.publish_stats(&publisher) {
            self.stats.lock().push(publisher);
        }
        subscription
    }
}

impl BatchSource for LocalCollection {
    fn sample(&self, n: usize) -> SyncResult<Vec<Entry>> {
        self.storage
            .sample_entries(n)
            .map_err(|err| SyncError::source_failure(SourceKind::Batch, format!("{err:#}")))
    }
}

/// Client-side key-value persistence in the `kv` table.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    storage: StorageHandle,
}

impl SqliteKeyValueStore {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.storage.kv_get(key).map_err(|err| kv_failure(&err))
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.storage.kv_set(key, value).map_err(|err| kv_failure(&err))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.storage.kv_remove(key).map_err(|err| kv_failure(&err))
    }
}

/// Session for a single configured user.
#[derive(Default)]
pub struct LocalSession {
    user_id: Mutex<Option<String>>,
    publishers: Mutex<Vec<Publisher<bool>>>,
}

impl LocalSession {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: Mutex::new(user_id),
            publishers: Mutex::new(Vec::new()),
        }
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user_id.lock() = Some(user_id.to_string());
        self.broadcast(true);
    }

    pub fn sign_out(&self) {
        *self.user_id.lock() = None;
        self.broadcast(false);
    }

    fn broadcast(&self, logged_in: bool) {
        self.publishers
            .lock()
            .retain(|publisher| publisher.push(logged_in));
    }
}

impl AuthSource for LocalSession {
    fn login_state(&self) -> Subscription<bool> {
        let (publisher, subscription) = channel();
        if publisher.push(self.user_id.lock().is_some()) {
            self.publishers.lock().push(publisher);
        }
        subscription
    }

    fn current_user_id(&self) -> SyncResult<String> {
        self.user_id.lock().clone().ok_or(SyncError::NotLoggedIn)
    }
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        &paths.database_path
    } else {
        &storage.database_path
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "storage ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EntryRecord> {
    Ok(EntryRecord {
        id: row.get(0)?,
        original_text: row.get(1)?,
        translation: row.get(2)?,
        added_on: Some(from_millis(3, row.get(3)?)?),
        updated_on: Some(from_millis(4, row.get(4)?)?),
        archived: row.get::<_, i64>(5)? != 0,
    })
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(column: usize, millis: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(err)))
}

fn page_failure(err: &anyhow::Error) -> SyncError {
    SyncError::source_failure(SourceKind::Page, format!("{err:#}"))
}

fn kv_failure(err: &anyhow::Error) -> SyncError {
    SyncError::source_failure(SourceKind::KeyValue, format!("{err:#}"))
}

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::SyncResult;
use crate::model::{Entry, EntryId, EntryRecord};

pub mod subscription;

pub use subscription::{channel, Publisher, Subscription};

/// Opaque continuation token handed out by a page source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(pub String);

/// Identifies one page window; the first page has no token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PageKey(pub Option<PageToken>);

impl PageKey {
    pub fn first() -> Self {
        Self(None)
    }

    pub fn token(&self) -> Option<&PageToken> {
        self.0.as_ref()
    }
}

impl From<Option<PageToken>> for PageKey {
    fn from(token: Option<PageToken>) -> Self {
        Self(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Cache,
    Server,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub token: Option<PageToken>,
    pub page_size: usize,
}

impl PageRequest {
    pub fn key(&self) -> PageKey {
        PageKey(self.token.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntriesResult {
    pub entries: Vec<EntryRecord>,
    pub has_more: bool,
    pub next_page_token: Option<PageToken>,
    pub from_cache: bool,
}

impl EntriesResult {
    pub fn provenance(&self) -> Provenance {
        if self.from_cache {
            Provenance::Cache
        } else {
            Provenance::Server
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Add(Entry),
    Update(Entry),
    Delete(EntryId),
    Archive(EntryId),
    Unarchive(EntryId),
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::Add(_) => "add",
            Mutation::Update(_) => "update",
            Mutation::Delete(_) => "delete",
            Mutation::Archive(_) => "archive",
            Mutation::Unarchive(_) => "unarchive",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_entry_count: i64,
    pub learned_entry_count: i64,
    pub from_cache: bool,
}

pub trait PageSource: Send + Sync {
    fn subscribe(&self, request: PageRequest) -> Subscription<EntriesResult>;
    fn mutate(&self, mutation: Mutation) -> SyncResult<()>;
}

pub trait StatsSource: Send + Sync {
    fn subscribe(&self) -> Subscription<StatsSnapshot>;
}

pub trait AuthSource: Send + Sync {
    fn login_state(&self) -> Subscription<bool>;
    fn current_user_id(&self) -> SyncResult<String>;
}

pub trait BatchSource: Send + Sync {
    /// Up to `n` entries, no ordering guarantee.
    fn sample(&self, n: usize) -> SyncResult<Vec<Entry>>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;
    fn remove(&self, key: &str) -> SyncResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

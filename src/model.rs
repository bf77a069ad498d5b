use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A vocabulary item. Two entries are equal iff their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    pub original_text: String,
    pub translation: String,
    #[serde(with = "time::serde::rfc3339")]
    pub added_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_on: OffsetDateTime,
}

impl Entry {
    pub fn new(
        original_text: impl Into<String>,
        translation: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        let original_text = original_text.into();
        let translation = default_translation(translation.into(), &original_text);
        Self {
            id: EntryId::mint(),
            original_text,
            translation,
            added_on: now,
            updated_on: now,
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryUiState {
    pub is_new: bool,
    pub is_learned: bool,
}

/// An entry as delivered by a page snapshot, before defaults are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryRecord {
    pub id: String,
    pub original_text: String,
    pub translation: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub added_on: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_on: Option<OffsetDateTime>,
    pub archived: bool,
}

impl EntryRecord {
    /// Fills missing fields: translation falls back to the original text,
    /// timestamps fall back to `now`.
    pub fn normalize(self, now: OffsetDateTime) -> (Entry, bool) {
        let translation =
            default_translation(self.translation.unwrap_or_default(), &self.original_text);
        let entry = Entry {
            id: EntryId(self.id),
            original_text: self.original_text,
            translation,
            added_on: self.added_on.unwrap_or(now),
            updated_on: self.updated_on.unwrap_or(now),
        };
        (entry, self.archived)
    }
}

fn default_translation(translation: String, original_text: &str) -> String {
    if translation.trim().is_empty() {
        original_text.to_string()
    } else {
        translation
    }
}

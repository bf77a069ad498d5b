use std::fmt;

use strum::Display;
use thiserror::Error;

use crate::model::EntryId;

/// Which collaborator a [`SyncError::SourceFailure`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SourceKind {
    Page,
    Stats,
    Batch,
    Auth,
    KeyValue,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("entry {0} not found")]
    NotFound(EntryId),
    #[error("{kind} source failed: {message}")]
    SourceFailure { kind: SourceKind, message: String },
    #[error("no user is logged in")]
    NotLoggedIn,
    #[error("malformed cached payload: {0}")]
    Serialization(String),
}

impl SyncError {
    pub fn source_failure(kind: SourceKind, err: impl fmt::Display) -> Self {
        SyncError::SourceFailure {
            kind,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_failures_name_their_collaborator() {
        let err = SyncError::source_failure(SourceKind::KeyValue, "disk full");
        assert_eq!(err.to_string(), "key-value source failed: disk full");
        assert_eq!(SourceKind::Page.to_string(), "page");
        assert_eq!(SourceKind::Stats.to_string(), "stats");
    }
}

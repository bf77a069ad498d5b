pub mod bucketing;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod random;
pub mod sources;
pub mod stats;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use error::{SyncError, SyncResult};
pub use model::{Entry, EntryId};
pub use sync::SyncEngine;

pub mod local;
pub mod merge;
pub mod remote;
pub mod repo;
pub mod schema;

pub use local::{LocalStore, SqliteLocalStore, INSTALL_ID_KEY, LAST_SYNC_TIME_KEY};
pub use merge::{MergeDecision, MergeReport};
pub use remote::{FileSystemRemoteStore, MemoryRemoteStore, RemoteSession, RemoteStore};
pub use repo::{init_clock, MutationObserver, Repository};

/// Map a SQLite failure into the crate error type.
pub(crate) fn sql_err(e: rusqlite::Error) -> lectern_core::Error {
    lectern_core::Error::Storage(e.to_string())
}

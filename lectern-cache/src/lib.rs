//! Media cache for Lectern.
//!
//! Video bytes requested by the playback engine go through [`MediaCache`],
//! which serves ranges from local span files when it can and otherwise
//! fetches them from an [`Upstream`], writing them through to disk. Total
//! bytes on disk are bounded; the least recently accessed span is evicted
//! first.

pub mod cache;
pub mod index;
pub mod key;
pub mod upstream;

pub use cache::{CacheStats, MediaCache, INDEX_FILE};
pub use index::{CacheIndex, SpanEntry};
pub use key::{ByteRange, CacheKey};
#[cfg(feature = "http")]
pub use upstream::HttpUpstream;
pub use upstream::{FileUpstream, LocalFolderProvider, MemoryUpstream, SchemeUpstream, Upstream};

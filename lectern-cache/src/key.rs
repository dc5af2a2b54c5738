//! Cache identity: which media item, fetched from where, which bytes.

use lectern_core::provider::CloudFileProvider;
use lectern_core::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached media stream.
///
/// The upstream URL is part of the key, so the same media item served from
/// a new address starts with an empty cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub media_id: String,
    pub upstream_url: String,
}

impl CacheKey {
    pub fn new(media_id: impl Into<String>, upstream_url: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            upstream_url: upstream_url.into(),
        }
    }

    /// Key for a file in the user's cloud storage, addressed by its stream URL.
    pub async fn for_cloud_file(provider: &dyn CloudFileProvider, file_id: &str) -> Result<Self> {
        let url = provider.stream_url(file_id).await?;
        Ok(Self::new(file_id, url))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.media_id, self.upstream_url)
    }
}

/// Half-open byte interval `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// HTTP `Range` header value (inclusive end).
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end().saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let span = ByteRange::new(100, 50);
        assert!(span.contains(&ByteRange::new(100, 50)));
        assert!(span.contains(&ByteRange::new(120, 10)));
        assert!(!span.contains(&ByteRange::new(90, 20)));
        assert!(!span.contains(&ByteRange::new(140, 20)));
    }

    #[test]
    fn test_header() {
        assert_eq!(ByteRange::new(0, 1024).to_header(), "bytes=0-1023");
        assert_eq!(ByteRange::new(10, 1).to_header(), "bytes=10-10");
    }

    #[test]
    fn test_url_is_part_of_identity() {
        let a = CacheKey::new("video-1", "https://cdn.example/a");
        let b = CacheKey::new("video-1", "https://cdn.example/b");
        assert_ne!(a, b);
    }
}

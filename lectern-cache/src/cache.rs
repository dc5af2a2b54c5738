//! Bounded on-disk LRU cache of media byte ranges.
//!
//! Each fetched span is written to its own file under the cache directory
//! and tracked in a [`CacheIndex`]. A read is served from any cached span
//! of the same key that covers the requested range; otherwise the range is
//! fetched from the upstream and written through. Before a span is
//! inserted, least recently used spans are evicted until it fits, so the
//! bytes on disk never exceed `max_bytes`.

use bytes::Bytes;
use lectern_core::{CacheSettings, Error, Result};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::index::{CacheIndex, SpanEntry};
use crate::key::{ByteRange, CacheKey};
use crate::upstream::Upstream;

pub const INDEX_FILE: &str = "cache_index.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Bytes on disk: indexed spans plus evicted spans whose files could not
    /// be deleted yet.
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Reads larger than the whole budget, served without caching.
    pub uncached: u64,
}

struct State {
    index: CacheIndex,
    /// Spans dropped from the index whose files are still on disk.
    stranded: Vec<SpanEntry>,
    dirty: bool,
}

impl State {
    fn disk_bytes(&self) -> u64 {
        self.index.total_bytes() + self.stranded.iter().map(SpanEntry::size).sum::<u64>()
    }
}

pub struct MediaCache {
    dir: PathBuf,
    max_bytes: u64,
    upstream: Arc<dyn Upstream>,
    state: Mutex<State>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    uncached: AtomicU64,
}

impl MediaCache {
    /// Open (or create) a cache directory, reconciling the persisted index
    /// with the span files actually on disk.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        if max_bytes == 0 {
            return Err(Error::InvalidConfig(
                "cache max_bytes must be greater than 0".into(),
            ));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let index = load_index(&dir).await?;
        let cache = Self {
            dir,
            max_bytes,
            upstream,
            state: Mutex::new(State {
                index,
                stranded: Vec::new(),
                dirty: false,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            uncached: AtomicU64::new(0),
        };

        {
            let mut state = cache.state.lock().await;
            cache.reconcile(&mut state).await?;
            let _ = cache.make_room(&mut state, 0).await;
            cache.persist(&mut state).await?;
            info!(
                dir = %cache.dir.display(),
                entries = state.index.len(),
                bytes = state.index.total_bytes(),
                max_bytes,
                "media cache opened"
            );
        }
        Ok(cache)
    }

    pub async fn from_settings(settings: &CacheSettings, upstream: Arc<dyn Upstream>) -> Result<Self> {
        Self::open(settings.directory.clone(), settings.max_bytes, upstream).await
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Read `range` of the stream behind `key`, through the cache.
    ///
    /// The result is shorter than requested only when the upstream stream
    /// ends inside the range.
    pub async fn read(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state
                .index
                .find_covering(key, &range)
                .and_then(|id| state.index.get(id).cloned())
            {
                match self.read_span(&entry, range).await {
                    Ok(bytes) => {
                        state.index.touch(entry.id);
                        state.dirty = true;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, range = %range, span = entry.id, "cache hit");
                        return Ok(bytes);
                    }
                    Err(e) => {
                        warn!(span = entry.id, error = %e, "dropping unreadable span");
                        state.index.remove(entry.id);
                        self.discard(&mut state, entry).await;
                        state.dirty = true;
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.upstream.fetch(key, range).await?;
        if data.is_empty() {
            return Ok(data);
        }

        let fetched = ByteRange::new(range.start, data.len() as u64);
        if fetched.len > self.max_bytes {
            self.uncached.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, range = %fetched, "span exceeds cache budget, not cached");
            return Ok(data);
        }

        let mut state = self.state.lock().await;
        // A concurrent read may have filled the same range meanwhile.
        if state.index.find_covering(key, &fetched).is_none() {
            if !self.make_room(&mut state, fetched.len).await {
                self.uncached.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, range = %fetched, "no room after failed deletes, serving uncached");
                return Ok(data);
            }
            let entry = state.index.insert(key.clone(), fetched);
            match write_atomic(&self.span_path(&entry), &data).await {
                Ok(()) => {
                    debug!(key = %key, range = %fetched, span = entry.id, "cached span");
                    state.dirty = true;
                    if let Err(e) = self.persist(&mut state).await {
                        warn!(error = %e, "failed to persist cache index");
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to write span, serving uncached");
                    state.index.remove(entry.id);
                    self.discard(&mut state, entry).await;
                }
            }
        }
        Ok(data)
    }

    /// Whether `range` of `key` would be served without touching upstream.
    pub async fn contains(&self, key: &CacheKey, range: ByteRange) -> bool {
        range.is_empty() || self.state.lock().await.index.find_covering(key, &range).is_some()
    }

    /// Drop every span of `key`, returning how many were removed.
    pub async fn remove_key(&self, key: &CacheKey) -> Result<usize> {
        let mut state = self.state.lock().await;
        let ids = state.index.ids_for_key(key);
        for id in &ids {
            if let Some(entry) = state.index.remove(*id) {
                self.discard(&mut state, entry).await;
            }
        }
        if !ids.is_empty() {
            state.dirty = true;
            self.persist(&mut state).await?;
        }
        Ok(ids.len())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in state.index.ids() {
            if let Some(entry) = state.index.remove(id) {
                self.discard(&mut state, entry).await;
            }
        }
        self.retry_stranded(&mut state).await;
        state.dirty = true;
        self.persist(&mut state).await?;
        info!(dir = %self.dir.display(), "media cache cleared");
        Ok(())
    }

    /// Write recency changes from cache hits to the index file.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persist(&mut state).await
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.index.len(),
            total_bytes: state.disk_bytes(),
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            uncached: self.uncached.load(Ordering::Relaxed),
        }
    }

    fn span_path(&self, entry: &SpanEntry) -> PathBuf {
        self.dir.join(entry.file_name())
    }

    async fn read_span(&self, entry: &SpanEntry, range: ByteRange) -> Result<Bytes> {
        let mut file = fs::File::open(self.span_path(entry)).await?;
        file.seek(SeekFrom::Start(range.start - entry.range.start)).await?;
        let mut buf = Vec::with_capacity(usize::try_from(range.len).unwrap_or(0));
        file.take(range.len).read_to_end(&mut buf).await?;
        if buf.len() as u64 != range.len {
            return Err(Error::Cache(format!(
                "span {} truncated: wanted {} bytes, read {}",
                entry.id,
                range.len,
                buf.len()
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Delete a span file. Returns false if the file is still on disk.
    async fn delete_span_file(&self, entry: &SpanEntry) -> bool {
        match fs::remove_file(self.span_path(entry)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(span = entry.id, error = %e, "failed to delete span file");
                false
            }
        }
    }

    /// Delete the file of a span already removed from the index; keep its
    /// bytes accounted for if the delete fails.
    async fn discard(&self, state: &mut State, entry: SpanEntry) {
        if !self.delete_span_file(&entry).await {
            state.stranded.push(entry);
        }
    }

    async fn retry_stranded(&self, state: &mut State) {
        let mut still = Vec::new();
        for entry in std::mem::take(&mut state.stranded) {
            if !self.delete_span_file(&entry).await {
                still.push(entry);
            }
        }
        state.stranded = still;
    }

    /// Evict least recently used spans until `incoming` more bytes fit on
    /// disk. Returns false if they cannot fit.
    async fn make_room(&self, state: &mut State, incoming: u64) -> bool {
        if !state.stranded.is_empty() {
            self.retry_stranded(state).await;
        }
        while state.disk_bytes() + incoming > self.max_bytes {
            let Some(victim) = state.index.lru_victim() else {
                return false;
            };
            if let Some(entry) = state.index.remove(victim) {
                debug!(key = %entry.key, range = %entry.range, span = entry.id, "evicting span");
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.discard(state, entry).await;
            }
        }
        true
    }

    /// Drop index entries whose files are missing or the wrong size, and
    /// delete span files the index does not know about.
    async fn reconcile(&self, state: &mut State) -> Result<()> {
        for id in state.index.ids() {
            let Some(entry) = state.index.get(id).cloned() else {
                continue;
            };
            let intact = match fs::metadata(self.span_path(&entry)).await {
                Ok(meta) => meta.len() == entry.size(),
                Err(_) => false,
            };
            if !intact {
                warn!(span = id, key = %entry.key, "span file missing or damaged, dropping entry");
                state.index.remove(id);
                self.discard(state, entry).await;
            }
        }
        let index = &state.index;

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(file) = dir.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            let known = span_id(&name).is_some_and(|id| index.get(id).is_some());
            if name.starts_with("span-") && !known {
                debug!(file = %name, "removing orphaned span file");
                let _ = fs::remove_file(file.path()).await;
            }
        }
        Ok(())
    }

    async fn persist(&self, state: &mut State) -> Result<()> {
        let data = state.index.to_json()?;
        write_atomic(&self.dir.join(INDEX_FILE), &data).await?;
        state.dirty = false;
        Ok(())
    }
}

fn span_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("span-")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

async fn load_index(dir: &Path) -> Result<CacheIndex> {
    match fs::read(dir.join(INDEX_FILE)).await {
        Ok(data) => match CacheIndex::from_json(&data) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(error = %e, "cache index unreadable, starting empty");
                Ok(CacheIndex::new())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheIndex::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

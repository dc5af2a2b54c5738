//! In-memory index of cached spans with recency ordering.
//!
//! Every access bumps a monotonic tick; `lru` maps tick to span id so the
//! least recently used span is always the first entry. The index is
//! persisted as JSON next to the span files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::key::{ByteRange, CacheKey};

const INDEX_VERSION: u32 = 1;

/// One cached span of a media stream, stored in its own file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEntry {
    pub id: u64,
    pub key: CacheKey,
    pub range: ByteRange,
    pub last_access: u64,
}

impl SpanEntry {
    pub fn file_name(&self) -> String {
        format!("span-{}.bin", self.id)
    }

    pub fn size(&self) -> u64 {
        self.range.len
    }
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    next_id: u64,
    tick: u64,
    entries: Vec<SpanEntry>,
}

#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<u64, SpanEntry>,
    lru: BTreeMap<u64, u64>,
    total_bytes: u64,
    next_id: u64,
    tick: u64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn get(&self, id: u64) -> Option<&SpanEntry> {
        self.entries.get(&id)
    }

    /// Entries in recency order, least recently used first.
    pub fn iter_lru(&self) -> impl Iterator<Item = &SpanEntry> {
        self.lru.values().filter_map(|id| self.entries.get(id))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Register a new span as the most recently used entry.
    pub fn insert(&mut self, key: CacheKey, range: ByteRange) -> SpanEntry {
        let id = self.next_id;
        self.next_id += 1;
        let tick = self.next_tick();
        let entry = SpanEntry {
            id,
            key,
            range,
            last_access: tick,
        };
        self.total_bytes += entry.size();
        self.lru.insert(tick, id);
        self.entries.insert(id, entry.clone());
        entry
    }

    /// Mark a span as just used.
    pub fn touch(&mut self, id: u64) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&id) {
            self.lru.remove(&entry.last_access);
            entry.last_access = tick;
            self.lru.insert(tick, id);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<SpanEntry> {
        let entry = self.entries.remove(&id)?;
        self.lru.remove(&entry.last_access);
        self.total_bytes -= entry.size();
        Some(entry)
    }

    /// Least recently used span, the next eviction victim.
    pub fn lru_victim(&self) -> Option<u64> {
        self.lru.values().next().copied()
    }

    /// A span of `key` that fully contains `range`. Prefers the smallest one.
    pub fn find_covering(&self, key: &CacheKey, range: &ByteRange) -> Option<u64> {
        self.entries
            .values()
            .filter(|e| &e.key == key && e.range.contains(range))
            .min_by_key(|e| (e.range.len, e.id))
            .map(|e| e.id)
    }

    pub fn ids_for_key(&self, key: &CacheKey) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entries
            .values()
            .filter(|e| &e.key == key)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn ids(&self) -> Vec<u64> {
        self.lru.values().copied().collect()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let file = IndexFile {
            version: INDEX_VERSION,
            next_id: self.next_id,
            tick: self.tick,
            entries: self.iter_lru().cloned().collect(),
        };
        serde_json::to_vec_pretty(&file)
    }

    /// Rebuild from persisted JSON. An unknown version yields an empty index.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        let file: IndexFile = serde_json::from_slice(data)?;
        let mut index = Self::new();
        if file.version != INDEX_VERSION {
            return Ok(index);
        }
        for entry in file.entries {
            index.next_id = index.next_id.max(entry.id + 1);
            index.tick = index.tick.max(entry.last_access);
            index.total_bytes += entry.size();
            index.lru.insert(entry.last_access, entry.id);
            index.entries.insert(entry.id, entry);
        }
        index.next_id = index.next_id.max(file.next_id);
        index.tick = index.tick.max(file.tick);
        Ok(index)
    }
}

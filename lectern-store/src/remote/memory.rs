//! In-process remote store
//!
//! Keeps every user's collections in memory. Used by tests and by embedders
//! that sync two local stores inside one process.

use async_trait::async_trait;
use lectern_core::hlc::{SystemTimeSource, TimeSource};
use lectern_core::{EntityKind, Error, RemoteDocument, Result, MAX_BATCH_SIZE};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::{check_batch, check_session, decode_changed_since, is_deleted, merge_fields};
use super::{stamp_written, updated_at};
use super::{RemoteSession, RemoteStore};

type Collection = BTreeMap<String, Value>;

pub struct MemoryRemoteStore {
    collections: RwLock<HashMap<(String, EntityKind), Collection>>,
    revoked_tokens: RwLock<HashSet<String>>,
    batch_log: RwLock<Vec<usize>>,
    max_batch_size: usize,
    time: Arc<dyn TimeSource>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            revoked_tokens: RwLock::new(HashSet::new()),
            batch_log: RwLock::new(Vec::new()),
            max_batch_size,
            time: Arc::new(SystemTimeSource),
        }
    }

    /// Stamp writes with `time` instead of the system clock.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Make every later request with `token` fail as unauthorized.
    pub fn revoke_token(&self, token: &str) {
        self.revoked_tokens.write().insert(token.to_string());
    }

    /// Sizes of every accepted `upsert_merge` batch, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_log.read().clone()
    }

    /// Raw stored document, including fields other clients may have added.
    pub fn raw_document(&self, user: &str, kind: EntityKind, id: &str) -> Option<Value> {
        self.collections
            .read()
            .get(&(user.to_string(), kind))
            .and_then(|c| c.get(id).cloned())
    }

    /// Overwrite a stored document verbatim, bypassing the merge.
    pub fn put_raw(&self, user: &str, kind: EntityKind, id: &str, doc: Value) {
        self.collections
            .write()
            .entry((user.to_string(), kind))
            .or_default()
            .insert(id.to_string(), doc);
    }

    pub fn document_count(&self, user: &str, kind: EntityKind) -> usize {
        self.collections
            .read()
            .get(&(user.to_string(), kind))
            .map_or(0, BTreeMap::len)
    }

    fn authorize(&self, session: &RemoteSession) -> Result<()> {
        check_session(session)?;
        if self.revoked_tokens.read().contains(&session.token) {
            return Err(Error::Unauthorized("token revoked".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert_merge(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        docs: Vec<RemoteDocument>,
    ) -> Result<()> {
        self.authorize(session)?;
        check_batch(docs.len(), self.max_batch_size)?;

        let count = docs.len();
        let now = self.time.now_ms() as i64;
        let mut collections = self.collections.write();
        let collection = collections
            .entry((session.user_id.as_str().to_string(), kind))
            .or_default();
        for doc in docs {
            let incoming = serde_json::to_value(&doc)?;
            let stored = collection.entry(doc.id).or_insert(Value::Null);
            merge_fields(stored, incoming);
            stamp_written(stored, now);
        }
        drop(collections);

        self.batch_log.write().push(count);
        Ok(())
    }

    async fn fetch_updated_since(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        since_ms: i64,
    ) -> Result<Vec<RemoteDocument>> {
        self.authorize(session)?;

        let collections = self.collections.read();
        let Some(collection) = collections.get(&(session.user_id.as_str().to_string(), kind)) else {
            return Ok(Vec::new());
        };
        Ok(decode_changed_since(collection.values().cloned(), since_ms))
    }

    async fn purge_tombstones(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        older_than_ms: i64,
    ) -> Result<usize> {
        self.authorize(session)?;

        let mut collections = self.collections.write();
        let Some(collection) = collections.get_mut(&(session.user_id.as_str().to_string(), kind))
        else {
            return Ok(0);
        };
        let before = collection.len();
        collection.retain(|_, doc| !(is_deleted(doc) && updated_at(doc) < older_than_ms));
        Ok(before - collection.len())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

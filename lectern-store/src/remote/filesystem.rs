//! Filesystem-backed remote store
//!
//! One JSON document per file under `<root>/users/<uid>/<collection>/<id>.json`.
//! Lets several local databases sync through a shared directory.

use async_trait::async_trait;
use lectern_core::hlc::{SystemTimeSource, TimeSource};
use lectern_core::{EntityKind, Error, RemoteDocument, Result, MAX_BATCH_SIZE};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use super::{check_batch, check_session, decode_changed_since, is_deleted, merge_fields};
use super::{stamp_written, updated_at};
use super::{RemoteSession, RemoteStore};

pub struct FileSystemRemoteStore {
    root: PathBuf,
    max_batch_size: usize,
    time: Arc<dyn TimeSource>,
}

impl FileSystemRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_batch_size: MAX_BATCH_SIZE,
            time: Arc::new(SystemTimeSource),
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, session: &RemoteSession, kind: EntityKind) -> Result<PathBuf> {
        let user = session.user_id.as_str();
        validate_segment(user)?;
        Ok(self.root.join("users").join(user).join(kind.table()))
    }
}

/// Reject path segments that could escape the collection directory.
fn validate_segment(segment: &str) -> Result<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::RemoteRejected(format!("invalid path segment: {segment:?}")));
    }
    Ok(())
}

async fn read_document(path: &Path) -> Result<Option<Value>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file and rename so readers never see a partial document.
async fn write_document(path: &Path, value: &Value) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Every parseable document in a collection directory.
async fn scan_collection(dir: &Path) -> Result<Vec<(PathBuf, Value)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut docs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_document(&path).await {
            Ok(Some(value)) => docs.push((path, value)),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
        }
    }
    Ok(docs)
}

#[async_trait]
impl RemoteStore for FileSystemRemoteStore {
    async fn upsert_merge(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        docs: Vec<RemoteDocument>,
    ) -> Result<()> {
        check_session(session)?;
        check_batch(docs.len(), self.max_batch_size)?;

        let dir = self.collection_dir(session, kind)?;
        fs::create_dir_all(&dir).await?;

        for doc in &docs {
            validate_segment(&doc.id)?;
        }

        let count = docs.len();
        let now = self.time.now_ms() as i64;
        for doc in docs {
            let path = dir.join(format!("{}.json", doc.id));
            let incoming = serde_json::to_value(&doc)?;
            let mut merged = match read_document(&path).await? {
                Some(mut stored) => {
                    merge_fields(&mut stored, incoming);
                    stored
                }
                None => incoming,
            };
            stamp_written(&mut merged, now);
            write_document(&path, &merged).await?;
        }

        debug!(kind = %kind, count, dir = %dir.display(), "documents written");
        Ok(())
    }

    async fn fetch_updated_since(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        since_ms: i64,
    ) -> Result<Vec<RemoteDocument>> {
        check_session(session)?;
        let dir = self.collection_dir(session, kind)?;

        let values = scan_collection(&dir).await?.into_iter().map(|(_, value)| value);
        let mut docs = decode_changed_since(values, since_ms);
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn purge_tombstones(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        older_than_ms: i64,
    ) -> Result<usize> {
        check_session(session)?;
        let dir = self.collection_dir(session, kind)?;

        let mut purged = 0;
        for (path, value) in scan_collection(&dir).await? {
            if is_deleted(&value) && updated_at(&value) < older_than_ms {
                fs::remove_file(&path).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

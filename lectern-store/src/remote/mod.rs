//! Per-user remote document store.
//!
//! Documents live in one collection per entity kind, scoped by the signed-in
//! user. Writes are merge-upserts: fields present in the incoming document
//! are set and every other stored field is kept. Every accepted write is
//! stamped with the store's own clock in `written_at`, and incremental pulls
//! filter on that stamp rather than on the client's `updated_at`, so edits a
//! device made offline still reach peers whose watermark has moved past them.

use async_trait::async_trait;
use lectern_core::{EntityKind, Error, RemoteDocument, Result, UserId, MAX_BATCH_SIZE};
use serde_json::Value;
use tracing::warn;

pub mod filesystem;
pub mod memory;

pub use filesystem::FileSystemRemoteStore;
pub use memory::MemoryRemoteStore;

/// Credentials for one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub user_id: UserId,
    pub token: String,
}

impl RemoteSession {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Merge-upsert one batch of documents into the user's collection.
    async fn upsert_merge(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        docs: Vec<RemoteDocument>,
    ) -> Result<()>;

    /// Documents written to the store at or after `since_ms`, by the store's
    /// clock. Documents that do not decode are skipped.
    async fn fetch_updated_since(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        since_ms: i64,
    ) -> Result<Vec<RemoteDocument>>;

    /// Remove tombstones last touched before `older_than_ms`.
    async fn purge_tombstones(
        &self,
        _session: &RemoteSession,
        _kind: EntityKind,
        _older_than_ms: i64,
    ) -> Result<usize> {
        Ok(0)
    }

    /// Largest batch `upsert_merge` accepts.
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }
}

/// Deep-merge `incoming` into `stored`: objects merge key by key, any other
/// value replaces what was there.
pub fn merge_fields(stored: &mut Value, incoming: Value) {
    match (stored, incoming) {
        (Value::Object(stored), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match stored.get_mut(&key) {
                    Some(existing) => merge_fields(existing, value),
                    None => {
                        stored.insert(key, value);
                    }
                }
            }
        }
        (stored, incoming) => *stored = incoming,
    }
}

pub(crate) fn check_batch(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::RemoteRejected(format!(
            "batch of {len} documents exceeds limit of {max}"
        )));
    }
    Ok(())
}

pub(crate) fn check_session(session: &RemoteSession) -> Result<()> {
    if session.token.is_empty() {
        return Err(Error::Unauthorized("missing token".to_string()));
    }
    if session.user_id.as_str().is_empty() {
        return Err(Error::Unauthorized("missing user".to_string()));
    }
    Ok(())
}

/// Decode a stored document, tolerating extra fields written by other clients.
pub(crate) fn decode(value: Value) -> Result<RemoteDocument> {
    Ok(serde_json::from_value(value)?)
}

/// Decode the stored documents written at or after `since_ms`.
///
/// The bound is inclusive: a write stamped in the same millisecond as a
/// watermark is seen again rather than lost, and merging it twice is a no-op.
/// A document that does not decode is logged and skipped so one bad record
/// cannot block the rest of its collection.
pub(crate) fn decode_changed_since(
    values: impl IntoIterator<Item = Value>,
    since_ms: i64,
) -> Vec<RemoteDocument> {
    values
        .into_iter()
        .filter(|value| written_at(value) >= since_ms)
        .filter_map(|value| {
            let id = value.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
            match decode(value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping undecodable remote document");
                    None
                }
            }
        })
        .collect()
}

/// Field the store stamps with its own clock on every accepted write.
pub const WRITTEN_AT_FIELD: &str = "written_at";

/// Store write time; documents without a stamp fall back to `updated_at`.
pub(crate) fn written_at(value: &Value) -> i64 {
    value
        .get(WRITTEN_AT_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| updated_at(value))
}

pub(crate) fn stamp_written(value: &mut Value, now_ms: i64) {
    if let Value::Object(map) = value {
        map.insert(WRITTEN_AT_FIELD.to_string(), Value::from(now_ms));
    }
}

pub(crate) fn updated_at(value: &Value) -> i64 {
    value.get("updated_at").and_then(Value::as_i64).unwrap_or(0)
}

pub(crate) fn is_deleted(value: &Value) -> bool {
    value.get("is_deleted").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_written_at_falls_back_to_updated_at() {
        let mut doc = json!({ "id": "n1", "updated_at": 7 });
        assert_eq!(written_at(&doc), 7);
        stamp_written(&mut doc, 42);
        assert_eq!(written_at(&doc), 42);
        assert_eq!(updated_at(&doc), 7);
    }

    #[test]
    fn test_decode_changed_since_is_inclusive_and_skips_bad_documents() {
        let good = |id: &str, written: i64| {
            json!({
                "id": id,
                "body": { "content": id },
                "hlc": "1:0:A",
                "is_deleted": false,
                "updated_at": 1,
                "written_at": written,
            })
        };
        let broken = json!({ "id": "broken", "body": {}, "updated_at": 1, "written_at": 50 });

        let docs = decode_changed_since(
            vec![good("old", 10), good("edge", 50), broken, good("new", 60)],
            50,
        );
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["edge", "new"]);
    }

    #[test]
    fn test_merge_fields_keeps_unmentioned_fields() {
        let mut stored = json!({
            "id": "n1",
            "body": { "content": "old", "server_flag": true },
            "hlc": "1:0:A",
        });
        merge_fields(
            &mut stored,
            json!({ "body": { "content": "new" }, "hlc": "2:0:B" }),
        );

        assert_eq!(stored["body"]["content"], json!("new"));
        assert_eq!(stored["body"]["server_flag"], json!(true));
        assert_eq!(stored["hlc"], json!("2:0:B"));
        assert_eq!(stored["id"], json!("n1"));
    }

    #[test]
    fn test_merge_fields_replaces_non_objects() {
        let mut stored = json!({ "tags": ["a", "b"] });
        merge_fields(&mut stored, json!({ "tags": ["c"] }));
        assert_eq!(stored["tags"], json!(["c"]));
    }

    #[test]
    fn test_session_checks() {
        let ok = RemoteSession::new(UserId::new("u"), "t");
        assert!(check_session(&ok).is_ok());

        let no_token = RemoteSession::new(UserId::new("u"), "");
        assert!(matches!(check_session(&no_token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_batch_limit() {
        assert!(check_batch(500, 500).is_ok());
        assert!(matches!(check_batch(501, 500), Err(Error::RemoteRejected(_))));
    }
}

//! Last-writer-wins merge of pulled documents into local rows.
//!
//! Pure functions; the local store applies the outcome inside a transaction.

use lectern_core::hlc;
use lectern_core::EntityRow;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What to do with one incoming remote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local row with this id exists.
    Insert,
    /// Remote HLC is strictly newer; replace, carrying local-only fields.
    Overwrite,
    /// Local is newer or equal; no write.
    KeepLocal,
}

pub fn resolve(local: Option<&EntityRow>, remote: &EntityRow) -> MergeDecision {
    match local {
        None => MergeDecision::Insert,
        Some(local) => match hlc::compare(&remote.hlc, &local.hlc) {
            Ordering::Greater => MergeDecision::Overwrite,
            Ordering::Equal | Ordering::Less => MergeDecision::KeepLocal,
        },
    }
}

/// Resolve and build the row to persist, if any.
pub fn merge_row(local: Option<&EntityRow>, mut remote: EntityRow) -> (MergeDecision, Option<EntityRow>) {
    let decision = resolve(local, &remote);
    match (decision, local) {
        (MergeDecision::Insert, _) => (decision, Some(remote)),
        (MergeDecision::Overwrite, Some(local)) => {
            remote.local = local.local.clone();
            (decision, Some(remote))
        }
        _ => (MergeDecision::KeepLocal, None),
    }
}

/// Counts of merge outcomes for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub overwritten: usize,
    pub kept_local: usize,
}

impl MergeReport {
    pub fn record(&mut self, decision: MergeDecision) {
        match decision {
            MergeDecision::Insert => self.inserted += 1,
            MergeDecision::Overwrite => self.overwritten += 1,
            MergeDecision::KeepLocal => self.kept_local += 1,
        }
    }

    /// Rows written to the local store.
    pub fn applied(&self) -> usize {
        self.inserted + self.overwritten
    }

    pub fn total(&self) -> usize {
        self.applied() + self.kept_local
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.inserted += other.inserted;
        self.overwritten += other.overwritten;
        self.kept_local += other.kept_local;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::EntityKind;
    use serde_json::json;

    fn row(hlc: &str, content: &str, local: serde_json::Value) -> EntityRow {
        EntityRow {
            kind: EntityKind::Lecture,
            id: "lec".into(),
            body: json!({ "name": content, "created_at": 1 }),
            local,
            hlc: hlc.into(),
            is_deleted: false,
            updated_at: 1,
        }
    }

    #[test]
    fn test_missing_local_inserts() {
        let remote = row("5:0:B", "remote", json!({}));
        let (decision, write) = merge_row(None, remote.clone());
        assert_eq!(decision, MergeDecision::Insert);
        assert_eq!(write, Some(remote));
    }

    #[test]
    fn test_newer_remote_overwrites_and_keeps_local_fields() {
        let local = row("999:0:B", "offline edit", json!({ "video_path": "/v.mp4" }));
        let remote = row("1000:0:A", "server edit", json!({}));

        let (decision, write) = merge_row(Some(&local), remote);
        let write = write.unwrap();

        assert_eq!(decision, MergeDecision::Overwrite);
        assert_eq!(write.body["name"], json!("server edit"));
        assert_eq!(write.local["video_path"], json!("/v.mp4"));
        assert_eq!(write.hlc, "1000:0:A");
    }

    #[test]
    fn test_older_or_equal_remote_keeps_local() {
        let local = row("1000:0:A", "local", json!({}));

        let (decision, write) = merge_row(Some(&local), row("999:0:B", "old", json!({})));
        assert_eq!(decision, MergeDecision::KeepLocal);
        assert!(write.is_none());

        let (decision, _) = merge_row(Some(&local), row("1000:0:A", "same", json!({})));
        assert_eq!(decision, MergeDecision::KeepLocal);
    }

    #[test]
    fn test_never_written_local_loses_to_any_remote() {
        let local = row("", "legacy", json!({}));
        assert_eq!(resolve(Some(&local), &row("0:0:A", "r", json!({}))), MergeDecision::Overwrite);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let local = row("10:0:A", "local", json!({ "remote_only": false }));
        let remote = row("20:0:B", "remote", json!({}));

        let (_, first) = merge_row(Some(&local), remote.clone());
        let first = first.unwrap();
        let (decision, second) = merge_row(Some(&first), remote);

        assert_eq!(decision, MergeDecision::KeepLocal);
        assert!(second.is_none());
    }

    #[test]
    fn test_report_counts() {
        let mut report = MergeReport::default();
        report.record(MergeDecision::Insert);
        report.record(MergeDecision::Overwrite);
        report.record(MergeDecision::KeepLocal);
        report.record(MergeDecision::KeepLocal);

        assert_eq!(report.applied(), 2);
        assert_eq!(report.total(), 4);

        let mut sum = MergeReport::default();
        sum.absorb(report);
        sum.absorb(report);
        assert_eq!(sum.kept_local, 4);
    }
}

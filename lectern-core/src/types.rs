//! Syncable data model shared by the local store, the remote store and the
//! sync engine.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Fresh globally unique record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The syncable tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lecture,
    Note,
    Annotation,
}

impl EntityKind {
    /// Every kind, in sync order.
    pub const ALL: [EntityKind; 3] = [EntityKind::Lecture, EntityKind::Note, EntityKind::Annotation];

    /// Local table name; also used as the remote collection name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Lecture => "lectures",
            EntityKind::Note => "notes",
            EntityKind::Annotation => "visual_annotations",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lecture => "lecture",
            EntityKind::Note => "note",
            EntityKind::Annotation => "annotation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lecture" | "lectures" => Ok(EntityKind::Lecture),
            "note" | "notes" => Ok(EntityKind::Note),
            "annotation" | "annotations" | "visual_annotations" => Ok(EntityKind::Annotation),
            other => Err(Error::InvalidArgument(format!("unknown entity kind: {other}"))),
        }
    }
}

/// Identifier of the signed-in account that owns the remote documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote-visible attributes of a syncable record.
///
/// `Local` holds the fields that only exist on this device and are carried
/// forward untouched when a remote version overwrites the row.
pub trait EntityBody:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    type Local: Serialize + DeserializeOwned + Clone + fmt::Debug + Default + Send + Sync + 'static;

    const KIND: EntityKind;
}

/// Placeholder local state for bodies that have no device-only fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoLocalState {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    NotDownloaded,
    Downloading,
    Downloaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureBody {
    pub name: String,
    #[serde(default)]
    pub video_file_id: Option<String>,
    #[serde(default)]
    pub pdf_file_id: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
    pub created_at: i64,
}

/// Device-only lecture state: resolved file paths and download progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LectureLocal {
    pub video_path: Option<String>,
    pub pdf_path: Option<String>,
    pub download_status: DownloadStatus,
    /// Lecture only known from a cloud folder listing; never pushed.
    pub remote_only: bool,
}

impl EntityBody for LectureBody {
    type Local = LectureLocal;
    const KIND: EntityKind = EntityKind::Lecture;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteBody {
    pub lecture_id: String,
    pub content: String,
    pub video_position_ms: i64,
    #[serde(default)]
    pub pdf_page: Option<u32>,
    pub created_at: i64,
}

impl EntityBody for NoteBody {
    type Local = NoLocalState;
    const KIND: EntityKind = EntityKind::Note;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationBody {
    pub lecture_id: String,
    pub pdf_page: u32,
    /// Serialized stroke list, opaque to the sync layer.
    pub geometry: String,
    pub color: u32,
    pub stroke_width: f32,
    pub created_at: i64,
}

impl EntityBody for AnnotationBody {
    type Local = NoLocalState;
    const KIND: EntityKind = EntityKind::Annotation;
}

/// A typed syncable record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<B: EntityBody> {
    pub id: String,
    pub body: B,
    pub local: B::Local,
    /// HLC of the last mutation, in wire form
    pub hlc: String,
    pub is_deleted: bool,
    /// Wall-clock ms of the last mutation; never used for conflict resolution
    pub updated_at: i64,
}

impl<B: EntityBody> Entity<B> {
    pub fn to_row(&self) -> Result<EntityRow> {
        Ok(EntityRow {
            kind: B::KIND,
            id: self.id.clone(),
            body: serde_json::to_value(&self.body)?,
            local: serde_json::to_value(&self.local)?,
            hlc: self.hlc.clone(),
            is_deleted: self.is_deleted,
            updated_at: self.updated_at,
        })
    }

    pub fn from_row(row: EntityRow) -> Result<Self> {
        if row.kind != B::KIND {
            return Err(Error::InvalidArgument(format!(
                "expected {} row, got {}",
                B::KIND,
                row.kind
            )));
        }

        let local = if row.local.is_null() {
            B::Local::default()
        } else {
            serde_json::from_value(row.local)?
        };

        Ok(Self {
            id: row.id,
            body: serde_json::from_value(row.body)?,
            local,
            hlc: row.hlc,
            is_deleted: row.is_deleted,
            updated_at: row.updated_at,
        })
    }
}

/// Untyped storage form of an entity, as persisted by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub kind: EntityKind,
    pub id: String,
    pub body: Value,
    pub local: Value,
    pub hlc: String,
    pub is_deleted: bool,
    pub updated_at: i64,
}

impl EntityRow {
    /// Build a row from a pulled document. Local fields start empty.
    pub fn from_remote(kind: EntityKind, doc: RemoteDocument) -> Self {
        Self {
            kind,
            id: doc.id,
            body: doc.body,
            local: Value::Object(Default::default()),
            hlc: doc.hlc,
            is_deleted: doc.is_deleted,
            updated_at: doc.updated_at,
        }
    }

    /// Strip local-only fields for upload.
    pub fn to_remote(&self) -> RemoteDocument {
        RemoteDocument {
            id: self.id.clone(),
            body: self.body.clone(),
            hlc: self.hlc.clone(),
            is_deleted: self.is_deleted,
            updated_at: self.updated_at,
        }
    }

    /// Remote-only lectures mirror a cloud listing and are never uploaded.
    pub fn is_pushable(&self) -> bool {
        match self.kind {
            EntityKind::Lecture => !self
                .local
                .get("remote_only")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            EntityKind::Note | EntityKind::Annotation => true,
        }
    }
}

/// Remote form of an entity. Carries no local-only fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub body: Value,
    pub hlc: String,
    pub is_deleted: bool,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lecture() -> Entity<LectureBody> {
        Entity {
            id: "lec-1".into(),
            body: LectureBody {
                name: "Week 1".into(),
                video_file_id: Some("vid".into()),
                pdf_file_id: None,
                folder_name: None,
                created_at: 10,
            },
            local: LectureLocal {
                video_path: Some("/videos/w1.mp4".into()),
                download_status: DownloadStatus::Downloaded,
                ..Default::default()
            },
            hlc: "10:0:A".into(),
            is_deleted: false,
            updated_at: 10,
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntityKind::Annotation.table(), "visual_annotations");
        assert_eq!("notes".parse::<EntityKind>().unwrap(), EntityKind::Note);
        assert!("folders".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_row_conversion() {
        let entity = lecture();
        let row = entity.to_row().unwrap();
        assert_eq!(row.kind, EntityKind::Lecture);
        assert_eq!(row.body["name"], json!("Week 1"));
        assert_eq!(row.local["download_status"], json!("downloaded"));

        let back = Entity::<LectureBody>::from_row(row).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_from_row_rejects_wrong_kind() {
        let mut row = lecture().to_row().unwrap();
        row.kind = EntityKind::Note;
        assert!(Entity::<LectureBody>::from_row(row).is_err());
    }

    #[test]
    fn test_remote_document_drops_local_fields() {
        let row = lecture().to_row().unwrap();
        let doc = row.to_remote();
        let encoded = serde_json::to_value(&doc).unwrap();
        assert!(encoded.get("local").is_none());
        assert!(!encoded.to_string().contains("/videos/w1.mp4"));

        let pulled = EntityRow::from_remote(EntityKind::Lecture, doc);
        let typed = Entity::<LectureBody>::from_row(pulled).unwrap();
        assert_eq!(typed.local, LectureLocal::default());
    }

    #[test]
    fn test_remote_only_lecture_not_pushable() {
        let mut entity = lecture();
        assert!(entity.to_row().unwrap().is_pushable());
        entity.local.remote_only = true;
        assert!(!entity.to_row().unwrap().is_pushable());
    }
}

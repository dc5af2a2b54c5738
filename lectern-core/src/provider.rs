//! Contract for the cloud storage account lectures are imported from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// A file or folder in the user's cloud storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFile {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub is_folder: bool,
}

impl CloudFile {
    pub fn is_video(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("video/"))
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type.as_deref() == Some("application/pdf")
    }
}

#[async_trait]
pub trait CloudFileProvider: Send + Sync {
    /// List the direct children of a folder; `None` is the root.
    async fn list_folder(&self, folder_id: Option<&str>) -> Result<Vec<CloudFile>>;

    /// Download a whole file to `destination`, returning the bytes written.
    async fn download_file(&self, file_id: &str, destination: &Path) -> Result<u64>;

    /// URL the media cache can issue range requests against.
    async fn stream_url(&self, file_id: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_classification() {
        let mut file = CloudFile {
            id: "1".into(),
            name: "lecture.mp4".into(),
            mime_type: Some("video/mp4".into()),
            size: Some(10),
            is_folder: false,
        };
        assert!(file.is_video());
        assert!(!file.is_pdf());

        file.mime_type = Some("application/pdf".into());
        assert!(file.is_pdf());

        file.mime_type = None;
        assert!(!file.is_video());
    }
}

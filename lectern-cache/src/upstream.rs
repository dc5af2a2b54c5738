//! Sources the media cache fills from.

use async_trait::async_trait;
use bytes::Bytes;
use lectern_core::provider::{CloudFile, CloudFileProvider};
use lectern_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::key::{ByteRange, CacheKey};

/// Where uncached bytes come from.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch `range` of the stream behind `key`. Fewer bytes than requested
    /// come back when the range runs past the end of the stream.
    async fn fetch(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes>;
}

fn file_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Reads `file://` URLs and plain paths from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileUpstream;

#[async_trait]
impl Upstream for FileUpstream {
    async fn fetch(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        let path = file_path(&key.upstream_url);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;

        let mut buf = Vec::with_capacity(usize::try_from(range.len).unwrap_or(0).min(1 << 20));
        file.take(range.len).read_to_end(&mut buf).await?;
        debug!(path = %path.display(), range = %range, read = buf.len(), "read upstream file");
        Ok(Bytes::from(buf))
    }
}

/// Issues HTTP range requests, retrying transient network failures.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpUpstream {
    client: reqwest::Client,
    retry: lectern_core::RetryPolicy,
}

#[cfg(feature = "http")]
impl HttpUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: lectern_core::RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_once(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        use reqwest::{header, StatusCode};

        let response = self
            .client
            .get(&key.upstream_url)
            .header(header::RANGE, range.to_header())
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => response
                .bytes()
                .await
                .map_err(|e| Error::Network(e.to_string())),
            // Server ignored the Range header and sent the whole body.
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Network(e.to_string()))?;
                let len = body.len();
                let start = usize::try_from(range.start).unwrap_or(usize::MAX).min(len);
                let end = usize::try_from(range.end()).unwrap_or(usize::MAX).min(len);
                Ok(body.slice(start..end))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::Unauthorized(format!("{} for {}", status, key.media_id)))
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(key.to_string())),
            _ => Err(Error::Upstream(format!("{} for {}", status, key))),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        lectern_core::retry::retry_async(&self.retry, || self.fetch_once(key, range)).await
    }
}

/// Picks an upstream by URL scheme: local files, or HTTP when built with the
/// `http` feature.
#[derive(Debug, Clone, Default)]
pub struct SchemeUpstream {
    file: FileUpstream,
    #[cfg(feature = "http")]
    http: HttpUpstream,
}

impl SchemeUpstream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Upstream for SchemeUpstream {
    async fn fetch(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        let url = key.upstream_url.as_str();
        if url.starts_with("http://") || url.starts_with("https://") {
            #[cfg(feature = "http")]
            return self.http.fetch(key, range).await;
            #[cfg(not(feature = "http"))]
            return Err(Error::Upstream(format!(
                "http upstream not enabled for {url}"
            )));
        }
        self.file.fetch(key, range).await
    }
}

/// Streams held in memory, keyed by upstream URL. Counts fetches.
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    streams: RwLock<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.streams.write().insert(url.into(), data.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn fetch(&self, key: &CacheKey, range: ByteRange) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .streams
            .read()
            .get(&key.upstream_url)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let len = data.len();
        let start = usize::try_from(range.start).unwrap_or(usize::MAX).min(len);
        let end = usize::try_from(range.end()).unwrap_or(usize::MAX).min(len);
        Ok(data.slice(start..end))
    }
}

/// Cloud file provider backed by a local directory. File ids are paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct LocalFolderProvider {
    root: PathBuf,
}

impl LocalFolderProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(Error::InvalidArgument(format!("invalid file id: {id}")));
        }
        Ok(self.root.join(relative))
    }
}

fn mime_for(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime.to_string())
}

#[async_trait]
impl CloudFileProvider for LocalFolderProvider {
    async fn list_folder(&self, folder_id: Option<&str>) -> Result<Vec<CloudFile>> {
        let dir = match folder_id {
            Some(id) => self.resolve(id)?,
            None => self.root.clone(),
        };
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            let id = path
                .strip_prefix(&self.root)
                .map_err(|e| Error::Internal(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            files.push(CloudFile {
                id,
                name: entry.file_name().to_string_lossy().into_owned(),
                mime_type: if metadata.is_dir() { None } else { mime_for(&path) },
                size: (!metadata.is_dir()).then(|| metadata.len()),
                is_folder: metadata.is_dir(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, file_id: &str, destination: &Path) -> Result<u64> {
        let source = self.resolve(file_id)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::copy(&source, destination).await?)
    }

    async fn stream_url(&self, file_id: &str) -> Result<String> {
        let path = self.resolve(file_id)?;
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| Error::NotFound(file_id.to_string()))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

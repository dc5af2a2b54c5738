use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Largest batch the remote document store accepts in one write.
pub const MAX_BATCH_SIZE: usize = 500;

/// Top-level configuration, loaded by the composition root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LecternConfig {
    /// Path of the local SQLite database
    pub database_path: PathBuf,

    /// Shared directory backing the filesystem remote store (None = no remote)
    pub remote_directory: Option<PathBuf>,

    /// Signed-in account; sync is skipped when unset
    pub user_id: Option<String>,

    pub sync: SyncSettings,

    pub cache: CacheSettings,
}

impl Default for LecternConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("lectern.db"),
            remote_directory: None,
            user_id: None,
            sync: SyncSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl LecternConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config
            .validate()
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_remote_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.remote_directory = Some(dir.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.database_path.as_os_str().is_empty() {
            return Err("database_path must not be empty".to_string());
        }
        if let Some(user) = &self.user_id {
            if user.trim().is_empty() {
                return Err("user_id must not be blank when set".to_string());
            }
        }
        self.sync.validate()?;
        self.cache.validate()
    }
}

/// Sync scheduling, batching and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Interval of the periodic background job in milliseconds
    pub periodic_interval_ms: u64,

    /// Delay before an immediate sync runs after a local mutation
    pub debounce_ms: u64,

    /// Documents per remote write (1..=500)
    pub batch_size: usize,

    pub retry: RetryPolicy,

    /// Age after which pushed tombstones are purged (None = keep forever)
    pub tombstone_retention_days: Option<u32>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            periodic_interval_ms: 15 * 60 * 1000,
            debounce_ms: 2_000,
            batch_size: MAX_BATCH_SIZE,
            retry: RetryPolicy::standard(),
            tombstone_retention_days: Some(30),
        }
    }
}

impl SyncSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tombstone_retention(&self) -> Option<Duration> {
        self.tombstone_retention_days
            .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Set the push batch size, clamped to the remote limit.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tombstone_retention_days(mut self, days: Option<u32>) -> Self {
        self.tombstone_retention_days = days;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.periodic_interval_ms == 0 {
            return Err("periodic_interval_ms must be greater than 0".to_string());
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"));
        }
        self.retry.validate()
    }
}

/// Media cache location and byte budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("media-cache"),
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

impl CacheSettings {
    pub fn new(directory: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            directory: directory.into(),
            max_bytes,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_bytes == 0 {
            return Err("cache max_bytes must be greater than 0".to_string());
        }
        Ok(())
    }
}

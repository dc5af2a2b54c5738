//! Composition root: wires config, stores, clock, engine and cache.

use anyhow::{Context, Result};
use lectern_cache::{MediaCache, SchemeUpstream};
use lectern_core::{HybridClock, LecternConfig, LectureBody, NoteBody, UserId};
use lectern_store::{init_clock, FileSystemRemoteStore, LocalStore, Repository, SqliteLocalStore};
use lectern_sync::{AuthProvider, StaticAuthProvider, SyncEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "lectern.json";

/// Token handed to the filesystem remote, which only checks it is present.
const LOCAL_TOKEN: &str = "local";

#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub remote: Option<PathBuf>,
    pub user: Option<String>,
}

pub fn load_config(overrides: &Overrides) -> Result<LecternConfig> {
    let mut config = match &overrides.config {
        Some(path) => LecternConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => LecternConfig::load(DEFAULT_CONFIG_FILE)
            .with_context(|| format!("Failed to load {DEFAULT_CONFIG_FILE}"))?,
        None => LecternConfig::default(),
    };

    if let Some(db) = &overrides.database {
        config = config.with_database_path(db);
    }
    if let Some(remote) = &overrides.remote {
        config = config.with_remote_directory(remote);
    }
    if let Some(user) = &overrides.user {
        config = config.with_user_id(user);
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

pub struct App {
    pub config: LecternConfig,
    pub local: Arc<dyn LocalStore>,
    pub clock: Arc<HybridClock>,
}

impl App {
    pub async fn open(config: LecternConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let store = SqliteLocalStore::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?;
        let local: Arc<dyn LocalStore> = Arc::new(store);
        let clock = init_clock(local.as_ref())
            .await
            .context("Failed to initialize clock")?;
        debug!(node = clock.node_id(), "opened local store");

        Ok(Self {
            config,
            local,
            clock,
        })
    }

    pub fn lectures(&self) -> Repository<LectureBody> {
        Repository::new(self.local.clone(), self.clock.clone())
    }

    pub fn notes(&self) -> Repository<NoteBody> {
        Repository::new(self.local.clone(), self.clock.clone())
    }

    fn auth(&self) -> Arc<dyn AuthProvider> {
        match &self.config.user_id {
            Some(user) => Arc::new(StaticAuthProvider::new(UserId::new(user), LOCAL_TOKEN)),
            None => Arc::new(StaticAuthProvider::signed_out()),
        }
    }

    pub fn engine(&self) -> Result<SyncEngine> {
        let remote_dir = self.config.remote_directory.clone().context(
            "No remote directory configured; pass --remote or set remote_directory in the config",
        )?;
        SyncEngine::builder()
            .local(self.local.clone())
            .remote(Arc::new(FileSystemRemoteStore::new(remote_dir)))
            .auth(self.auth())
            .settings(self.config.sync.clone())
            .build()
            .context("Failed to build sync engine")
    }
}

pub async fn open_cache(config: &LecternConfig) -> Result<MediaCache> {
    MediaCache::from_settings(&config.cache, Arc::new(SchemeUpstream::new()))
        .await
        .with_context(|| format!("Failed to open media cache {}", config.cache.directory.display()))
}

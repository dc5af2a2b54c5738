//! Test utilities and helpers for Lectern testing
//!
//! Simulated devices sharing a remote store, body fixtures, and a remote
//! wrapper that injects failures.

use async_trait::async_trait;
use lectern_core::hlc::ManualTimeSource;
use lectern_core::{
    AnnotationBody, EntityKind, Error, HybridClock, LectureBody, NoteBody, RemoteDocument, Result,
    SyncSettings, UserId,
};
use lectern_store::local::load_or_create_install_id;
use lectern_store::{LocalStore, RemoteSession, RemoteStore, Repository, SqliteLocalStore};
use lectern_sync::{CycleReport, StaticAuthProvider, SyncEngine};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// User all simulated devices sign in as
pub const USER: &str = "alice";

/// One simulated app install: its own local store and clock, sharing a
/// remote store and a manual time source with the other devices of a test.
pub struct Device {
    pub local: Arc<dyn LocalStore>,
    pub clock: Arc<HybridClock>,
    pub time: Arc<ManualTimeSource>,
    pub auth: Arc<StaticAuthProvider>,
    pub engine: Arc<SyncEngine>,
}

impl Device {
    /// Device backed by an in-memory database, with a fixed node id
    pub fn in_memory(
        node: &str,
        remote: Arc<dyn RemoteStore>,
        time: Arc<ManualTimeSource>,
        settings: SyncSettings,
    ) -> Self {
        let local: Arc<dyn LocalStore> =
            Arc::new(SqliteLocalStore::open_in_memory().expect("Failed to open database"));
        let clock = Arc::new(
            HybridClock::with_time_source(node, time.clone()).expect("Failed to create clock"),
        );
        Self::assemble(local, clock, remote, time, settings)
    }

    /// Device backed by a database file; the node id comes from the
    /// persisted install id and the clock resumes from the stored rows,
    /// like a real app start.
    pub async fn open(
        path: &Path,
        remote: Arc<dyn RemoteStore>,
        time: Arc<ManualTimeSource>,
        settings: SyncSettings,
    ) -> Self {
        let local: Arc<dyn LocalStore> =
            Arc::new(SqliteLocalStore::open(path).expect("Failed to open database"));
        let node = load_or_create_install_id(local.as_ref())
            .await
            .expect("Failed to load install id");
        let clock = HybridClock::with_time_source(node, time.clone()).expect("Failed to create clock");
        if let Some(last) = local
            .max_hlc_for_node(clock.node_id())
            .await
            .expect("Failed to read max hlc")
        {
            clock.restore(&last);
        }
        Self::assemble(local, Arc::new(clock), remote, time, settings)
    }

    fn assemble(
        local: Arc<dyn LocalStore>,
        clock: Arc<HybridClock>,
        remote: Arc<dyn RemoteStore>,
        time: Arc<ManualTimeSource>,
        settings: SyncSettings,
    ) -> Self {
        let auth = Arc::new(StaticAuthProvider::new(UserId::new(USER), "token"));
        let engine = SyncEngine::builder()
            .local(local.clone())
            .remote(remote)
            .auth(auth.clone())
            .settings(settings)
            .time_source(time.clone())
            .build()
            .expect("Failed to build engine");
        Self {
            local,
            clock,
            time,
            auth,
            engine: Arc::new(engine),
        }
    }

    pub fn lectures(&self) -> Repository<LectureBody> {
        Repository::new(self.local.clone(), self.clock.clone())
    }

    pub fn notes(&self) -> Repository<NoteBody> {
        Repository::new(self.local.clone(), self.clock.clone())
    }

    pub fn annotations(&self) -> Repository<AnnotationBody> {
        Repository::new(self.local.clone(), self.clock.clone())
    }

    pub async fn sync(&self) -> CycleReport {
        self.engine.run_cycle().await
    }

    pub async fn watermark(&self) -> i64 {
        self.engine
            .last_sync_time()
            .await
            .expect("Failed to read watermark")
    }
}

/// Manual time source starting at `start_ms`
pub fn manual_time(start_ms: u64) -> Arc<ManualTimeSource> {
    Arc::new(ManualTimeSource::new(start_ms))
}

pub fn lecture(name: &str) -> LectureBody {
    LectureBody {
        name: name.to_string(),
        video_file_id: Some(format!("{name}.mp4")),
        pdf_file_id: Some(format!("{name}.pdf")),
        folder_name: Some("course".to_string()),
        created_at: 1,
    }
}

pub fn note(lecture_id: &str, content: &str, position_ms: i64) -> NoteBody {
    NoteBody {
        lecture_id: lecture_id.to_string(),
        content: content.to_string(),
        video_position_ms: position_ms,
        pdf_page: None,
        created_at: 1,
    }
}

pub fn annotation(lecture_id: &str, page: u32) -> AnnotationBody {
    AnnotationBody {
        lecture_id: lecture_id.to_string(),
        pdf_page: page,
        geometry: r#"[{"points":[[0,0],[10,10]]}]"#.to_string(),
        color: 0xff0000,
        stroke_width: 2.0,
        created_at: 1,
    }
}

/// Failure a [`FlakyRemote`] injects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Unauthorized,
    Rejected,
}

impl Fault {
    fn error(self) -> Error {
        match self {
            Fault::Unavailable => Error::RemoteUnavailable("injected outage".into()),
            Fault::Unauthorized => Error::Unauthorized("injected token rejection".into()),
            Fault::Rejected => Error::RemoteRejected("injected rejection".into()),
        }
    }
}

/// Remote store wrapper that fails queued calls before delegating. A
/// `None` slot in a queue lets one call through.
pub struct FlakyRemote {
    inner: Arc<dyn RemoteStore>,
    upsert_faults: Mutex<VecDeque<Option<Fault>>>,
    fetch_faults: Mutex<VecDeque<Option<Fault>>>,
    upserts: AtomicUsize,
    fetches: AtomicUsize,
}

impl FlakyRemote {
    pub fn new(inner: Arc<dyn RemoteStore>) -> Self {
        Self {
            inner,
            upsert_faults: Mutex::new(VecDeque::new()),
            fetch_faults: Mutex::new(VecDeque::new()),
            upserts: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` upsert calls
    pub fn fail_upserts(&self, n: usize, fault: Fault) {
        self.fail_upsert_after(0, n, fault);
    }

    /// Let `passes` upsert calls through, then fail the following `n`
    pub fn fail_upsert_after(&self, passes: usize, n: usize, fault: Fault) {
        let mut queue = self.upsert_faults.lock();
        queue.extend(std::iter::repeat(None).take(passes));
        queue.extend(std::iter::repeat(Some(fault)).take(n));
    }

    /// Fail the next `n` fetch calls
    pub fn fail_fetches(&self, n: usize, fault: Fault) {
        self.fetch_faults.lock().extend(std::iter::repeat(Some(fault)).take(n));
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn upsert_merge(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        docs: Vec<RemoteDocument>,
    ) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let fault = self.upsert_faults.lock().pop_front().flatten();
        if let Some(fault) = fault {
            return Err(fault.error());
        }
        self.inner.upsert_merge(session, kind, docs).await
    }

    async fn fetch_updated_since(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        since_ms: i64,
    ) -> Result<Vec<RemoteDocument>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let fault = self.fetch_faults.lock().pop_front().flatten();
        if let Some(fault) = fault {
            return Err(fault.error());
        }
        self.inner.fetch_updated_since(session, kind, since_ms).await
    }

    async fn purge_tombstones(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        older_than_ms: i64,
    ) -> Result<usize> {
        self.inner.purge_tombstones(session, kind, older_than_ms).await
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}

//! Sync engine with state machine for push / pull / merge cycles.
//!
//! One cycle pushes local rows changed since the watermark, pulls remote
//! documents changed since the watermark, and merges them under the HLC
//! last-writer-wins rule. Local rows that beat the pulled remote copy are
//! pushed again at the end of the merge, which repairs a remote value an
//! older push overwrote. The watermark only advances when every phase of
//! every entity kind succeeded, so a failed cycle is fully retried.

use lectern_core::hlc::{self, SystemTimeSource, TimeSource};
use lectern_core::{EntityKind, EntityRow, Error, RemoteDocument, Result, SyncSettings};
use lectern_store::{LocalStore, MergeReport, RemoteSession, RemoteStore, LAST_SYNC_TIME_KEY};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthProvider};
use crate::gc::{GcReport, TombstoneCollector};

/// Intent reported when the user has to sign in again.
pub const SIGN_IN_INTENT: &str = "sign_in";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Pushing,
    Pulling,
    Merging,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    StateChanged {
        old_state: SyncState,
        new_state: SyncState,
    },
    CycleCompleted {
        report: CycleReport,
    },
    ConsentRequired {
        intent: String,
    },
    CycleFailed {
        error: String,
    },
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Every phase succeeded and the watermark advanced.
    Completed,
    /// Nobody is signed in.
    Skipped,
    /// The user has to act before sync can continue.
    NeedsUserConsent { intent: String },
    /// Transient or auth-related failure; worth retrying.
    Retry(String),
    /// Permanent failure.
    Failed(String),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Completed | CycleOutcome::Skipped)
    }
}

/// Per-kind results of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub pushed: usize,
    pub pulled: usize,
    pub merge: MergeReport,
    /// Local rows pushed again because the pulled remote copy was older.
    pub repushed: usize,
    pub errors: Vec<String>,
}

impl KindReport {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            pushed: 0,
            pulled: 0,
            merge: MergeReport::default(),
            repushed: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub started_at: i64,
    pub watermark_before: i64,
    /// New watermark, set only when the cycle completed
    pub watermark_after: Option<i64>,
    pub kinds: Vec<KindReport>,
    pub gc: Option<GcReport>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn early(outcome: CycleOutcome, started_at: i64, started: Instant) -> Self {
        Self {
            outcome,
            started_at,
            watermark_before: 0,
            watermark_after: None,
            kinds: Vec::new(),
            gc: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn pushed(&self) -> usize {
        self.kinds.iter().map(|k| k.pushed).sum()
    }

    pub fn pulled(&self) -> usize {
        self.kinds.iter().map(|k| k.pulled).sum()
    }

    pub fn merged(&self) -> MergeReport {
        let mut total = MergeReport::default();
        for kind in &self.kinds {
            total.absorb(kind.merge);
        }
        total
    }
}

/// Cumulative counters across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub skipped_cycles: u64,
    pub items_pushed: u64,
    pub items_pulled: u64,
    pub items_applied: u64,
    pub items_kept_local: u64,
    pub last_sync_time: Option<i64>,
    pub last_cycle_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("a sync cycle is already running")]
pub struct AlreadyRunning;

pub struct SyncEngine {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    settings: SyncSettings,
    time: Arc<dyn TimeSource>,
    gc: Option<TombstoneCollector>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cycle_lock: tokio::sync::Mutex<()>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Receive engine events from now on. A new subscriber replaces the
    /// previous one; events are dropped while nobody is subscribed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock() = Some(tx);
        rx
    }

    /// Current watermark (wall-clock ms of the last completed cycle).
    pub async fn last_sync_time(&self) -> Result<i64> {
        match self.local.get_setting(LAST_SYNC_TIME_KEY).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| Error::Storage(format!("corrupt {LAST_SYNC_TIME_KEY} {raw:?}: {e}"))),
        }
    }

    /// Run one cycle, waiting for an in-flight cycle to finish first.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        self.execute().await
    }

    /// Run one cycle unless another is in flight.
    pub async fn try_run_cycle(&self) -> std::result::Result<CycleReport, AlreadyRunning> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| AlreadyRunning)?;
        Ok(self.execute().await)
    }

    fn set_state(&self, new_state: SyncState) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };
        if old_state != new_state {
            self.emit_event(SyncEvent::StateChanged {
                old_state,
                new_state,
            });
        }
    }

    fn emit_event(&self, event: SyncEvent) {
        let mut tx = self.event_tx.lock();
        if let Some(sender) = tx.as_ref() {
            if sender.send(event).is_err() {
                *tx = None;
            }
        }
    }

    fn now_ms(&self) -> i64 {
        self.time.now_ms() as i64
    }

    async fn execute(&self) -> CycleReport {
        let started = Instant::now();
        let started_at = self.now_ms();

        let Some(user) = self.auth.current_user().await else {
            info!("no signed-in user; skipping sync");
            let report = CycleReport::early(CycleOutcome::Skipped, started_at, started);
            self.record(&report);
            return report;
        };

        let token = match self.auth.get_token().await {
            Ok(token) => token,
            Err(e) => {
                let outcome = match e {
                    AuthError::AuthRequired => CycleOutcome::NeedsUserConsent {
                        intent: SIGN_IN_INTENT.to_string(),
                    },
                    AuthError::PermissionRequired { intent } => {
                        CycleOutcome::NeedsUserConsent { intent }
                    }
                    AuthError::Fatal(reason) => CycleOutcome::Failed(format!("auth: {reason}")),
                };
                let report = CycleReport::early(outcome, started_at, started);
                self.finish(&report);
                return report;
            }
        };

        let watermark = match self.last_sync_time().await {
            Ok(w) => w,
            Err(e) => {
                let report = CycleReport::early(
                    classify(&[e.with_context("read watermark")]),
                    started_at,
                    started,
                );
                self.finish(&report);
                return report;
            }
        };

        info!(user = %user, watermark, "sync cycle started");
        let session = RemoteSession::new(user, token.as_str());
        let mut kinds: Vec<KindReport> = EntityKind::ALL.iter().map(|k| KindReport::new(*k)).collect();
        let mut errors: Vec<Error> = Vec::new();

        self.set_state(SyncState::Pushing);
        for report in kinds.iter_mut() {
            match self.push_kind(&session, report.kind, watermark).await {
                Ok(pushed) => report.pushed = pushed,
                Err((pushed, e)) => {
                    report.pushed = pushed;
                    warn!(kind = %report.kind, error = %e, "push aborted");
                    report.errors.push(format!("push: {e}"));
                    errors.push(e);
                }
            }
        }

        self.set_state(SyncState::Pulling);
        let mut pulled: Vec<(usize, Vec<RemoteDocument>)> = Vec::new();
        for (idx, report) in kinds.iter_mut().enumerate() {
            match self
                .remote
                .fetch_updated_since(&session, report.kind, watermark)
                .await
            {
                Ok(docs) => {
                    report.pulled = docs.len();
                    debug!(kind = %report.kind, pulled = docs.len(), "pulled");
                    pulled.push((idx, docs));
                }
                Err(e) => {
                    warn!(kind = %report.kind, error = %e, "pull aborted");
                    report.errors.push(format!("pull: {e}"));
                    errors.push(e);
                }
            }
        }

        self.set_state(SyncState::Merging);
        let mut kept: Vec<(usize, Vec<(String, String)>)> = Vec::new();
        for (idx, docs) in pulled {
            let report = &mut kinds[idx];
            let seen: Vec<(String, String)> =
                docs.iter().map(|d| (d.id.clone(), d.hlc.clone())).collect();
            let rows: Vec<EntityRow> = docs
                .into_iter()
                .map(|doc| EntityRow::from_remote(report.kind, doc))
                .collect();
            match self.local.merge_remote(report.kind, rows).await {
                Ok(merge) => {
                    report.merge = merge;
                    if merge.kept_local > 0 {
                        kept.push((idx, seen));
                    }
                }
                Err(e) => {
                    error!(kind = %report.kind, error = %e, "merge failed");
                    report.errors.push(format!("merge: {e}"));
                    errors.push(e);
                }
            }
        }

        for (idx, seen) in kept {
            let report = &mut kinds[idx];
            match self.repush_newer_local(&session, report.kind, seen).await {
                Ok(repushed) => report.repushed = repushed,
                Err(e) => {
                    warn!(kind = %report.kind, error = %e, "repush aborted");
                    report.errors.push(format!("repush: {e}"));
                    errors.push(e);
                }
            }
        }

        if errors.iter().any(|e| matches!(e, Error::Unauthorized(_))) {
            self.auth.clear_token(&token).await;
        }

        let mut report = CycleReport {
            outcome: CycleOutcome::Completed,
            started_at,
            watermark_before: watermark,
            watermark_after: None,
            kinds,
            gc: None,
            duration_ms: 0,
        };

        if errors.is_empty() {
            match self
                .local
                .put_setting(LAST_SYNC_TIME_KEY, &started_at.to_string())
                .await
            {
                Ok(()) => {
                    report.watermark_after = Some(started_at);
                    report.gc = self.collect_garbage(&session, started_at).await;
                }
                Err(e) => errors.push(e.with_context("advance watermark")),
            }
        }

        if !errors.is_empty() {
            report.outcome = classify(&errors);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.finish(&report);
        report
    }

    /// Push one kind. On failure returns how many documents made it.
    async fn push_kind(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        watermark: i64,
    ) -> std::result::Result<usize, (usize, Error)> {
        let rows = self.local.modified_since(kind, watermark).await.map_err(|e| (0, e))?;
        let docs: Vec<RemoteDocument> = rows
            .iter()
            .filter(|row| row.is_pushable())
            .map(EntityRow::to_remote)
            .collect();

        let mut pushed = 0;
        for chunk in docs.chunks(self.chunk_size()) {
            self.remote
                .upsert_merge(session, kind, chunk.to_vec())
                .await
                .map_err(|e| (pushed, e))?;
            pushed += chunk.len();
        }

        debug!(kind = %kind, pushed, skipped = rows.len() - docs.len(), "pushed");
        Ok(pushed)
    }

    /// Push local rows whose HLC is strictly newer than the version just
    /// pulled. `seen` pairs each pulled id with its remote HLC.
    async fn repush_newer_local(
        &self,
        session: &RemoteSession,
        kind: EntityKind,
        seen: Vec<(String, String)>,
    ) -> Result<usize> {
        let mut docs = Vec::new();
        for (id, remote_hlc) in seen {
            if let Some(row) = self.local.get(kind, &id).await? {
                if row.is_pushable() && hlc::compare(&row.hlc, &remote_hlc) == Ordering::Greater {
                    docs.push(row.to_remote());
                }
            }
        }
        for chunk in docs.chunks(self.chunk_size()) {
            self.remote.upsert_merge(session, kind, chunk.to_vec()).await?;
        }
        if !docs.is_empty() {
            info!(kind = %kind, count = docs.len(), "re-pushed local rows newer than remote");
        }
        Ok(docs.len())
    }

    fn chunk_size(&self) -> usize {
        self.settings
            .batch_size
            .min(self.remote.max_batch_size())
            .max(1)
    }

    async fn collect_garbage(&self, session: &RemoteSession, watermark: i64) -> Option<GcReport> {
        let gc = self.gc?;
        match gc
            .collect(self.local.as_ref(), self.remote.as_ref(), session, self.now_ms(), watermark)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "tombstone collection failed");
                None
            }
        }
    }

    fn finish(&self, report: &CycleReport) {
        self.record(report);
        match &report.outcome {
            CycleOutcome::Completed => {
                info!(
                    pushed = report.pushed(),
                    pulled = report.pulled(),
                    applied = report.merged().applied(),
                    duration_ms = report.duration_ms,
                    "sync cycle completed"
                );
                self.set_state(SyncState::Idle);
                self.emit_event(SyncEvent::CycleCompleted {
                    report: report.clone(),
                });
            }
            CycleOutcome::Skipped => {}
            CycleOutcome::NeedsUserConsent { intent } => {
                warn!(intent = %intent, "sync needs user consent");
                self.emit_event(SyncEvent::ConsentRequired {
                    intent: intent.clone(),
                });
            }
            CycleOutcome::Retry(reason) | CycleOutcome::Failed(reason) => {
                error!(reason = %reason, "sync cycle failed");
                self.set_state(SyncState::Failed(reason.clone()));
                self.emit_event(SyncEvent::CycleFailed {
                    error: reason.clone(),
                });
            }
        }
    }

    fn record(&self, report: &CycleReport) {
        let merged = report.merged();
        let mut stats = self.stats.write();
        stats.total_cycles += 1;
        match report.outcome {
            CycleOutcome::Completed => {
                stats.successful_cycles += 1;
                stats.last_sync_time = report.watermark_after;
            }
            CycleOutcome::Skipped => stats.skipped_cycles += 1,
            _ => stats.failed_cycles += 1,
        }
        stats.items_pushed += report.pushed() as u64;
        stats.items_pulled += report.pulled() as u64;
        stats.items_applied += merged.applied() as u64;
        stats.items_kept_local += merged.kept_local as u64;
        stats.last_cycle_duration_ms = report.duration_ms;
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &*self.state.read())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Retry when any failure is transient or auth-related, fail otherwise.
fn classify(errors: &[Error]) -> CycleOutcome {
    let summary = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if errors.iter().any(|e| e.is_retryable() || e.is_auth()) {
        CycleOutcome::Retry(summary)
    } else {
        CycleOutcome::Failed(summary)
    }
}

/// Builder for a [`SyncEngine`].
#[derive(Default)]
pub struct SyncEngineBuilder {
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    auth: Option<Arc<dyn AuthProvider>>,
    settings: SyncSettings,
    time: Option<Arc<dyn TimeSource>>,
}

impl SyncEngineBuilder {
    pub fn local(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wall clock used for the watermark and tombstone cutoff.
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.settings.validate().map_err(Error::InvalidConfig)?;
        let local = self
            .local
            .ok_or_else(|| Error::InvalidConfig("sync engine needs a local store".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| Error::InvalidConfig("sync engine needs a remote store".into()))?;
        let auth = self
            .auth
            .ok_or_else(|| Error::InvalidConfig("sync engine needs an auth provider".into()))?;

        let gc = self.settings.tombstone_retention().map(TombstoneCollector::new);

        Ok(SyncEngine {
            local,
            remote,
            auth,
            settings: self.settings,
            time: self.time.unwrap_or_else(|| Arc::new(SystemTimeSource)),
            gc,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            event_tx: Mutex::new(None),
        })
    }
}

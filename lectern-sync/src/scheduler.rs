//! Background job runner for sync cycles.
//!
//! A single worker task owns the pending-job table, so at most one job per
//! name is queued and cycles never overlap. Jobs run inline in the worker
//! loop; a request that arrives while a cycle runs is queued behind it.

use lectern_core::{EntityKind, RetryPolicy};
use lectern_store::MutationObserver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, CycleReport, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    Periodic,
    Immediate,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::Periodic => "periodic",
            JobName::Immediate => "immediate",
        }
    }

    pub fn collision_policy(&self) -> CollisionPolicy {
        match self {
            JobName::Periodic => CollisionPolicy::KeepExisting,
            JobName::Immediate => CollisionPolicy::ReplaceExisting,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a job is enqueued while one with the same name waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Ignore the new request.
    KeepExisting,
    /// Drop the waiting job and queue the new one with a fresh delay.
    ReplaceExisting,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { job: JobName, attempt: u32 },
    Finished { job: JobName, report: CycleReport },
    RetryScheduled { job: JobName, attempt: u32, delay: Duration },
    ConsentRequired { job: JobName, intent: String },
    GaveUp { job: JobName, attempts: u32, error: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub periodic_interval: Duration,
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &lectern_core::SyncSettings) -> Self {
        Self {
            periodic_interval: settings.periodic_interval(),
            debounce: settings.debounce(),
            retry: settings.retry.clone(),
        }
    }
}

enum Command {
    Enqueue { job: JobName, delay: Duration },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for requesting syncs.
#[derive(Clone)]
pub struct SyncTrigger {
    tx: mpsc::UnboundedSender<Command>,
    debounce: Duration,
}

impl SyncTrigger {
    /// Queue a debounced immediate sync, replacing any that has not started.
    pub fn sync_soon(&self) {
        self.enqueue(JobName::Immediate, self.debounce);
    }

    pub fn enqueue(&self, job: JobName, delay: Duration) {
        if self.tx.send(Command::Enqueue { job, delay }).is_err() {
            debug!(job = %job, "scheduler stopped; dropping request");
        }
    }
}

impl MutationObserver for SyncTrigger {
    fn on_local_mutation(&self, kind: EntityKind) {
        debug!(kind = %kind, "local mutation; scheduling sync");
        self.sync_soon();
    }
}

pub struct SyncScheduler {
    trigger: SyncTrigger,
    task: JoinHandle<()>,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
}

impl SyncScheduler {
    /// Spawn the worker on the current runtime.
    pub fn start(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let trigger = SyncTrigger {
            tx,
            debounce: config.debounce,
        };

        let worker = Worker {
            engine,
            retry: config.retry,
            pending: HashMap::new(),
            events: event_tx,
        };
        let task = tokio::spawn(worker.run(rx, config.periodic_interval));
        info!(
            periodic_ms = config.periodic_interval.as_millis() as u64,
            debounce_ms = config.debounce.as_millis() as u64,
            "sync scheduler started"
        );

        Self {
            trigger,
            task,
            events: Some(event_rx),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    /// Take the job event receiver. Only the first caller gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events.take()
    }

    /// Stop after the running cycle, if any, finishes. Pending jobs are dropped.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.trigger.tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    due: Instant,
    attempt: u32,
}

struct Worker {
    engine: Arc<SyncEngine>,
    retry: RetryPolicy,
    pending: HashMap<JobName, Pending>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, period: Duration) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let next = self.next_due();
            let sleep_until = next.map(|(_, p)| p.due).unwrap_or_else(|| Instant::now() + period);

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Enqueue { job, delay }) => self.enqueue(job, delay),
                    Some(Command::Shutdown(ack)) => {
                        info!(dropped = self.pending.len(), "sync scheduler shutting down");
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },
                _ = time::sleep_until(sleep_until), if next.is_some() => {
                    if let Some((job, pending)) = next {
                        self.pending.remove(&job);
                        self.run_job(job, pending.attempt).await;
                    }
                }
                _ = ticker.tick() => self.enqueue(JobName::Periodic, Duration::ZERO),
            }
        }
    }

    fn next_due(&self) -> Option<(JobName, Pending)> {
        self.pending
            .iter()
            .min_by_key(|(_, p)| p.due)
            .map(|(job, p)| (*job, *p))
    }

    fn enqueue(&mut self, job: JobName, delay: Duration) {
        let entry = Pending {
            due: Instant::now() + delay,
            attempt: 0,
        };
        match (job.collision_policy(), self.pending.contains_key(&job)) {
            (CollisionPolicy::KeepExisting, true) => {
                debug!(job = %job, "already queued; keeping existing");
            }
            _ => {
                self.pending.insert(job, entry);
            }
        }
    }

    async fn run_job(&mut self, job: JobName, attempt: u32) {
        self.emit(JobEvent::Started { job, attempt });
        let report = self.engine.run_cycle().await;
        let outcome = report.outcome.clone();
        self.emit(JobEvent::Finished { job, report });

        let error = match outcome {
            CycleOutcome::Completed | CycleOutcome::Skipped => return,
            CycleOutcome::Failed(error) => {
                self.give_up(job, attempt + 1, error);
                return;
            }
            CycleOutcome::NeedsUserConsent { intent } => {
                self.emit(JobEvent::ConsentRequired {
                    job,
                    intent: intent.clone(),
                });
                format!("user consent required: {intent}")
            }
            CycleOutcome::Retry(error) => error,
        };

        if attempt + 1 >= self.retry.max_attempts {
            self.give_up(job, attempt + 1, error);
            return;
        }

        // A newer request for the same job supersedes the retry.
        if self.pending.contains_key(&job) {
            return;
        }

        let delay = self.retry.backoff_duration(attempt);
        self.pending.insert(
            job,
            Pending {
                due: Instant::now() + delay,
                attempt: attempt + 1,
            },
        );
        debug!(job = %job, attempt = attempt + 1, ?delay, "retry scheduled");
        self.emit(JobEvent::RetryScheduled {
            job,
            attempt: attempt + 1,
            delay,
        });
    }

    fn give_up(&self, job: JobName, attempts: u32, error: String) {
        warn!(job = %job, attempts, error = %error, "sync job gave up");
        self.emit(JobEvent::GaveUp {
            job,
            attempts,
            error,
        });
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, StaticAuthProvider};
    use lectern_core::{HybridClock, NoteBody, SyncSettings, UserId};
    use lectern_store::{LocalStore, MemoryRemoteStore, Repository, SqliteLocalStore};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        scheduler: SyncScheduler,
        events: mpsc::UnboundedReceiver<JobEvent>,
        auth: Arc<StaticAuthProvider>,
        notes: Repository<NoteBody>,
        remote: Arc<MemoryRemoteStore>,
    }

    fn harness(periodic: Duration, debounce: Duration) -> Harness {
        let local: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = Arc::new(StaticAuthProvider::new(UserId::new("alice"), "token"));
        let engine = Arc::new(
            SyncEngine::builder()
                .local(local.clone())
                .remote(remote.clone())
                .auth(auth.clone())
                .settings(SyncSettings::default())
                .build()
                .unwrap(),
        );
        let mut scheduler = SyncScheduler::start(
            engine,
            SchedulerConfig {
                periodic_interval: periodic,
                debounce,
                retry: RetryPolicy::new(3, 10, 50, 2.0),
            },
        );
        let events = scheduler.take_events().unwrap();
        let clock = Arc::new(HybridClock::new("dev").unwrap());
        let notes = Repository::new(local, clock).with_observer(Arc::new(scheduler.trigger()));
        Harness {
            scheduler,
            events,
            auth,
            notes,
            remote,
        }
    }

    async fn next_finished(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> (JobName, CycleReport) {
        loop {
            match time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                JobEvent::Finished { job, report } => return (job, report),
                _ => continue,
            }
        }
    }

    fn note() -> NoteBody {
        NoteBody {
            lecture_id: "lec".into(),
            content: "hello".into(),
            video_position_ms: 0,
            pdf_page: None,
            created_at: 1,
        }
    }

    #[test]
    fn test_collision_policies() {
        assert_eq!(JobName::Periodic.collision_policy(), CollisionPolicy::KeepExisting);
        assert_eq!(JobName::Immediate.collision_policy(), CollisionPolicy::ReplaceExisting);
        assert_eq!(JobName::Immediate.to_string(), "immediate");
    }

    #[tokio::test]
    async fn test_mutation_triggers_debounced_sync() {
        let mut h = harness(Duration::from_secs(3600), Duration::from_millis(20));

        h.notes.create(note()).await.unwrap();
        let (job, report) = next_finished(&mut h.events).await;

        assert_eq!(job, JobName::Immediate);
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(h.remote.document_count("alice", EntityKind::Note), 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_burst_of_mutations_collapses_into_one_job() {
        let mut h = harness(Duration::from_secs(3600), Duration::from_millis(300));

        for _ in 0..5 {
            h.notes.create(note()).await.unwrap();
        }
        let (_, report) = next_finished(&mut h.events).await;
        assert_eq!(report.pushed(), 5);

        // No second cycle follows the burst.
        let extra = time::timeout(Duration::from_millis(500), h.events.recv()).await;
        assert!(extra.is_err());
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_job_runs() {
        let mut h = harness(Duration::from_millis(30), Duration::from_millis(10));
        let (job, _) = next_finished(&mut h.events).await;
        assert_eq!(job, JobName::Periodic);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_consent_is_retried_then_gives_up() {
        let mut h = harness(Duration::from_secs(3600), Duration::from_millis(5));
        h.auth.set_token_error(Some(AuthError::PermissionRequired {
            intent: "drive.file".into(),
        }));

        h.scheduler.trigger().sync_soon();

        let mut consent = 0;
        let mut retries = 0;
        let mut started = 0;
        loop {
            match time::timeout(WAIT, h.events.recv()).await.unwrap().unwrap() {
                JobEvent::Started { .. } => started += 1,
                JobEvent::ConsentRequired { intent, .. } => {
                    assert_eq!(intent, "drive.file");
                    consent += 1;
                }
                JobEvent::RetryScheduled { .. } => retries += 1,
                JobEvent::GaveUp { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }
        // max_attempts of 3 means three runs in total.
        assert_eq!(started, 3);
        assert_eq!(consent, 3);
        assert_eq!(retries, 2);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_graceful() {
        let h = harness(Duration::from_secs(3600), Duration::from_secs(3600));
        let trigger = h.scheduler.trigger();
        trigger.sync_soon();
        time::timeout(WAIT, h.scheduler.shutdown()).await.unwrap();

        // Requests after shutdown are dropped quietly.
        trigger.sync_soon();
    }
}

//! Offline-first sync for Lectern: HLC last-writer-wins reconciliation of the
//! local store against the per-user remote store.

pub mod auth;
pub mod engine;
pub mod gc;
pub mod scheduler;

pub use auth::{AuthError, AuthProvider, AuthToken, StaticAuthProvider};
pub use engine::{
    AlreadyRunning, CycleOutcome, CycleReport, KindReport, SyncEngine, SyncEngineBuilder,
    SyncEvent, SyncState, SyncStats,
};
pub use gc::{GcReport, TombstoneCollector};
pub use scheduler::{
    CollisionPolicy, JobEvent, JobName, SchedulerConfig, SyncScheduler, SyncTrigger,
};

//! Typed repositories: the local-first write path used by the UI.
//!
//! Every mutation is stamped with a fresh HLC and wall-clock time before it
//! hits the local store, then reported to the mutation observer so a sync
//! can be scheduled.

use lectern_core::{
    Entity, EntityBody, EntityKind, Error, HybridClock, NoteBody, AnnotationBody, Result,
};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

use crate::local::{load_or_create_install_id, LocalStore};

/// Receives a signal after every local mutation.
pub trait MutationObserver: Send + Sync {
    fn on_local_mutation(&self, kind: EntityKind);
}

/// Build the device clock: node id from the persisted install id, state
/// restored from the highest timestamp this node already wrote.
pub async fn init_clock(store: &dyn LocalStore) -> Result<Arc<HybridClock>> {
    let node_id = load_or_create_install_id(store).await?;
    let clock = HybridClock::new(node_id)?;
    if let Some(last) = store.max_hlc_for_node(clock.node_id()).await? {
        info!(last = %last, "restoring clock");
        clock.restore(&last);
    }
    Ok(Arc::new(clock))
}

pub struct Repository<B: EntityBody> {
    store: Arc<dyn LocalStore>,
    clock: Arc<HybridClock>,
    observer: Option<Arc<dyn MutationObserver>>,
    _body: PhantomData<fn() -> B>,
}

impl<B: EntityBody> Clone for Repository<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            observer: self.observer.clone(),
            _body: PhantomData,
        }
    }
}

impl<B: EntityBody> Repository<B> {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<HybridClock>) -> Self {
        Self {
            store,
            clock,
            observer: None,
            _body: PhantomData,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MutationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer.on_local_mutation(B::KIND);
        }
    }

    pub async fn create(&self, body: B) -> Result<Entity<B>> {
        self.create_with_local(body, B::Local::default()).await
    }

    pub async fn create_with_local(&self, body: B, local: B::Local) -> Result<Entity<B>> {
        let entity = Entity {
            id: lectern_core::new_id(),
            body,
            local,
            hlc: self.clock.generate().to_string(),
            is_deleted: false,
            updated_at: self.clock.wall_ms(),
        };
        self.store.upsert(entity.to_row()?).await?;
        debug!(kind = %B::KIND, id = %entity.id, hlc = %entity.hlc, "created");
        self.notify();
        Ok(entity)
    }

    /// Replace the remote-visible body of a live record.
    pub async fn update(&self, id: &str, body: B) -> Result<Entity<B>> {
        let mut entity = self.get(id).await?.ok_or_else(|| not_found::<B>(id))?;
        entity.body = body;
        entity.hlc = self.clock.generate().to_string();
        entity.updated_at = self.clock.wall_ms();
        self.store.upsert(entity.to_row()?).await?;
        debug!(kind = %B::KIND, id, hlc = %entity.hlc, "updated");
        self.notify();
        Ok(entity)
    }

    /// Change device-only fields. Not a syncable mutation, so the HLC and
    /// `updated_at` are left alone.
    pub async fn update_local(&self, id: &str, local: B::Local) -> Result<Entity<B>> {
        let mut entity = self.get(id).await?.ok_or_else(|| not_found::<B>(id))?;
        entity.local = local;
        self.store.upsert(entity.to_row()?).await?;
        Ok(entity)
    }

    /// Tombstone a record. Returns false if it does not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let hlc = self.clock.generate().to_string();
        let deleted = self.store.soft_delete(B::KIND, id, &hlc, self.clock.wall_ms()).await?;
        if deleted {
            debug!(kind = %B::KIND, id, hlc = %hlc, "deleted");
            self.notify();
        }
        Ok(deleted)
    }

    /// Live record by id; tombstones read as absent.
    pub async fn get(&self, id: &str) -> Result<Option<Entity<B>>> {
        match self.store.get(B::KIND, id).await? {
            Some(row) if !row.is_deleted => Ok(Some(Entity::from_row(row)?)),
            _ => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Entity<B>>> {
        self.store
            .list(B::KIND, false)
            .await?
            .into_iter()
            .map(Entity::from_row)
            .collect()
    }
}

impl Repository<NoteBody> {
    /// Live notes of one lecture, ordered by video position.
    pub async fn list_for_lecture(&self, lecture_id: &str) -> Result<Vec<Entity<NoteBody>>> {
        let mut notes: Vec<_> = self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.body.lecture_id == lecture_id)
            .collect();
        notes.sort_by_key(|n| n.body.video_position_ms);
        Ok(notes)
    }
}

impl Repository<AnnotationBody> {
    /// Live annotations drawn on one PDF page.
    pub async fn list_for_page(&self, lecture_id: &str, pdf_page: u32) -> Result<Vec<Entity<AnnotationBody>>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.body.lecture_id == lecture_id && a.body.pdf_page == pdf_page)
            .collect())
    }
}

fn not_found<B: EntityBody>(id: &str) -> Error {
    Error::NotFound(format!("{} {}", B::KIND, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteLocalStore;
    use lectern_core::hlc::{self, ManualTimeSource};
    use lectern_core::{DownloadStatus, LectureBody, LectureLocal};
    use parking_lot::Mutex;
    use std::cmp::Ordering;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EntityKind>>);

    impl MutationObserver for Recorder {
        fn on_local_mutation(&self, kind: EntityKind) {
            self.0.lock().push(kind);
        }
    }

    fn setup() -> (Arc<dyn LocalStore>, Arc<HybridClock>) {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let clock = Arc::new(
            HybridClock::with_time_source("dev", Arc::new(ManualTimeSource::new(1_000))).unwrap(),
        );
        (store, clock)
    }

    fn note(lecture: &str, pos: i64, content: &str) -> NoteBody {
        NoteBody {
            lecture_id: lecture.into(),
            content: content.into(),
            video_position_ms: pos,
            pdf_page: None,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_create_update_delete_stamp_increasing_hlc() {
        let (store, clock) = setup();
        let recorder = Arc::new(Recorder::default());
        let notes = Repository::<NoteBody>::new(store.clone(), clock).with_observer(recorder.clone());

        let created = notes.create(note("l", 0, "a")).await.unwrap();
        let updated = notes.update(&created.id, note("l", 0, "b")).await.unwrap();
        assert_eq!(hlc::compare(&created.hlc, &updated.hlc), Ordering::Less);

        assert!(notes.delete(&created.id).await.unwrap());
        assert!(notes.get(&created.id).await.unwrap().is_none());

        let tomb = store.get(EntityKind::Note, &created.id).await.unwrap().unwrap();
        assert!(tomb.is_deleted);
        assert_eq!(hlc::compare(&updated.hlc, &tomb.hlc), Ordering::Less);

        assert_eq!(recorder.0.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (store, clock) = setup();
        let notes = Repository::<NoteBody>::new(store, clock);
        let err = notes.update("nope", note("l", 0, "x")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(!notes.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_local_does_not_restamp() {
        let (store, clock) = setup();
        let recorder = Arc::new(Recorder::default());
        let lectures =
            Repository::<LectureBody>::new(store, clock).with_observer(recorder.clone());

        let lecture = lectures
            .create(LectureBody {
                name: "Intro".into(),
                video_file_id: None,
                pdf_file_id: None,
                folder_name: None,
                created_at: 1,
            })
            .await
            .unwrap();

        let local = LectureLocal {
            video_path: Some("/v.mp4".into()),
            download_status: DownloadStatus::Downloaded,
            ..Default::default()
        };
        let changed = lectures.update_local(&lecture.id, local.clone()).await.unwrap();

        assert_eq!(changed.hlc, lecture.hlc);
        assert_eq!(changed.updated_at, lecture.updated_at);
        assert_eq!(lectures.get(&lecture.id).await.unwrap().unwrap().local, local);
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_list_for_lecture_orders_by_position() {
        let (store, clock) = setup();
        let notes = Repository::<NoteBody>::new(store, clock);
        notes.create(note("l1", 500, "late")).await.unwrap();
        notes.create(note("l1", 100, "early")).await.unwrap();
        notes.create(note("l2", 0, "other")).await.unwrap();

        let listed = notes.list_for_lecture("l1").await.unwrap();
        let contents: Vec<_> = listed.iter().map(|n| n.body.content.as_str()).collect();
        assert_eq!(contents, ["early", "late"]);
    }

    #[tokio::test]
    async fn test_init_clock_resumes_after_restart() {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let clock = init_clock(store.as_ref()).await.unwrap();
        let node = clock.node_id().to_string();

        // A previous run wrote far in the future relative to this clock.
        let notes = Repository::<NoteBody>::new(store.clone(), clock);
        let created = notes.create(note("l", 0, "x")).await.unwrap();
        let mut row = store.get(EntityKind::Note, &created.id).await.unwrap().unwrap();
        row.hlc = format!("{}:9:{}", i64::MAX / 2, node);
        store.upsert(row.clone()).await.unwrap();

        let restarted = init_clock(store.as_ref()).await.unwrap();
        assert_eq!(restarted.node_id(), node);
        let next = restarted.generate().to_string();
        assert_eq!(hlc::compare(&row.hlc, &next), Ordering::Less);
    }
}

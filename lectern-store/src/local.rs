//! Embedded relational store for syncable rows and device settings.

use async_trait::async_trait;
use lectern_core::{EntityKind, EntityRow, Error, HlcTimestamp, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::merge::{merge_row, MergeReport};
use crate::{schema, sql_err};

/// Settings key of the sync watermark (wall-clock ms of the last full cycle).
pub const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

/// Settings key of the device install id the HLC node id derives from.
pub const INSTALL_ID_KEY: &str = "install_id";

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRow>>;

    async fn list(&self, kind: EntityKind, include_deleted: bool) -> Result<Vec<EntityRow>>;

    /// Local write path: insert or replace the whole row.
    async fn upsert(&self, row: EntityRow) -> Result<()>;

    /// Rows with `updated_at >= watermark_ms`, tombstones included. The bound
    /// is inclusive so an edit made in the watermark millisecond is pushed.
    async fn modified_since(&self, kind: EntityKind, watermark_ms: i64) -> Result<Vec<EntityRow>>;

    /// Tombstone a row. Returns false if no row has this id.
    async fn soft_delete(&self, kind: EntityKind, id: &str, hlc: &str, updated_at: i64) -> Result<bool>;

    /// Apply pulled rows under the last-writer-wins rule in one transaction.
    async fn merge_remote(&self, kind: EntityKind, rows: Vec<EntityRow>) -> Result<MergeReport>;

    /// Physically remove tombstones last touched before `older_than_ms`.
    async fn purge_tombstones(&self, kind: EntityKind, older_than_ms: i64) -> Result<usize>;

    /// Highest timestamp any table holds for `node_id`.
    async fn max_hlc_for_node(&self, node_id: &str) -> Result<Option<HlcTimestamp>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Read the device install id, generating and persisting one on first use.
pub async fn load_or_create_install_id(store: &dyn LocalStore) -> Result<String> {
    if let Some(id) = store.get_setting(INSTALL_ID_KEY).await? {
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = lectern_core::new_id();
    store.put_setting(INSTALL_ID_KEY, &id).await?;
    info!(install_id = %id, "generated install id");
    Ok(id)
}

/// `LocalStore` over a single SQLite connection.
///
/// Statements run on the blocking pool so async callers suspend instead of
/// stalling the runtime.
#[derive(Clone)]
pub struct SqliteLocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let started_at = Instant::now();
        let conn = Connection::open(path).map_err(sql_err)?;
        let store = Self::bootstrap(conn)?;
        info!(
            path = %path.display(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "local store opened"
        );
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        schema::apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("local store task failed: {e}")))?
    }
}

const COLUMNS: &str = "id, body, local_state, hlc, is_deleted, updated_at";

fn map_row(kind: EntityKind) -> impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    move |row| {
        Ok(RawRow {
            kind,
            id: row.get(0)?,
            body: row.get(1)?,
            local: row.get(2)?,
            hlc: row.get(3)?,
            is_deleted: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// Row as stored, before JSON decoding.
struct RawRow {
    kind: EntityKind,
    id: String,
    body: String,
    local: String,
    hlc: String,
    is_deleted: bool,
    updated_at: i64,
}

impl RawRow {
    fn decode(self) -> Result<EntityRow> {
        Ok(EntityRow {
            kind: self.kind,
            id: self.id,
            body: serde_json::from_str(&self.body)?,
            local: serde_json::from_str(&self.local)?,
            hlc: self.hlc,
            is_deleted: self.is_deleted,
            updated_at: self.updated_at,
        })
    }
}

fn query_rows(
    conn: &Connection,
    kind: EntityKind,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<EntityRow>> {
    let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
    let raw = stmt
        .query_map(params, map_row(kind))
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;
    raw.into_iter().map(RawRow::decode).collect()
}

fn select_one(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<EntityRow>> {
    let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", kind.table());
    let raw = conn
        .query_row(&sql, [id], map_row(kind))
        .optional()
        .map_err(sql_err)?;
    raw.map(RawRow::decode).transpose()
}

fn write_row(conn: &Connection, row: &EntityRow) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            body = excluded.body,
            local_state = excluded.local_state,
            hlc = excluded.hlc,
            is_deleted = excluded.is_deleted,
            updated_at = excluded.updated_at",
        row.kind.table()
    );
    conn.execute(
        &sql,
        params![
            row.id,
            serde_json::to_string(&row.body)?,
            serde_json::to_string(&row.local)?,
            row.hlc,
            row.is_deleted,
            row.updated_at,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn merge_in_tx(tx: &Transaction<'_>, kind: EntityKind, rows: Vec<EntityRow>) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    for mut remote in rows {
        remote.kind = kind;
        let local = select_one(tx, kind, &remote.id)?;
        let (decision, write) = merge_row(local.as_ref(), remote);
        if let Some(row) = write {
            write_row(tx, &row)?;
        }
        report.record(decision);
    }
    Ok(report)
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRow>> {
        let id = id.to_string();
        self.with_conn(move |conn| select_one(conn, kind, &id)).await
    }

    async fn list(&self, kind: EntityKind, include_deleted: bool) -> Result<Vec<EntityRow>> {
        self.with_conn(move |conn| {
            let filter = if include_deleted { "" } else { "WHERE is_deleted = 0" };
            let sql = format!(
                "SELECT {COLUMNS} FROM {} {filter} ORDER BY updated_at DESC, id",
                kind.table()
            );
            query_rows(conn, kind, &sql, [])
        })
        .await
    }

    async fn upsert(&self, row: EntityRow) -> Result<()> {
        self.with_conn(move |conn| write_row(conn, &row)).await
    }

    async fn modified_since(&self, kind: EntityKind, watermark_ms: i64) -> Result<Vec<EntityRow>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM {} WHERE updated_at >= ?1 ORDER BY updated_at, id",
                kind.table()
            );
            query_rows(conn, kind, &sql, [watermark_ms])
        })
        .await
    }

    async fn soft_delete(&self, kind: EntityKind, id: &str, hlc: &str, updated_at: i64) -> Result<bool> {
        let id = id.to_string();
        let hlc = hlc.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE {} SET is_deleted = 1, hlc = ?2, updated_at = ?3 WHERE id = ?1",
                kind.table()
            );
            let changed = conn.execute(&sql, params![id, hlc, updated_at]).map_err(sql_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn merge_remote(&self, kind: EntityKind, rows: Vec<EntityRow>) -> Result<MergeReport> {
        if rows.is_empty() {
            return Ok(MergeReport::default());
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let report = merge_in_tx(&tx, kind, rows)?;
            tx.commit().map_err(sql_err)?;
            debug!(
                kind = %kind,
                inserted = report.inserted,
                overwritten = report.overwritten,
                kept_local = report.kept_local,
                "merged remote rows"
            );
            Ok(report)
        })
        .await
    }

    async fn purge_tombstones(&self, kind: EntityKind, older_than_ms: i64) -> Result<usize> {
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM {} WHERE is_deleted = 1 AND updated_at < ?1",
                kind.table()
            );
            conn.execute(&sql, [older_than_ms]).map_err(sql_err)
        })
        .await
    }

    async fn max_hlc_for_node(&self, node_id: &str) -> Result<Option<HlcTimestamp>> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let mut max: Option<HlcTimestamp> = None;
            for table in schema::entity_tables() {
                let mut stmt = conn
                    .prepare_cached(&format!("SELECT hlc FROM {table} WHERE hlc != ''"))
                    .map_err(sql_err)?;
                let stamps = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?;
                for stamp in stamps {
                    let stamp = stamp.map_err(sql_err)?;
                    let Ok(ts) = HlcTimestamp::parse(&stamp) else {
                        continue;
                    };
                    if ts.node_id == node_id && max.as_ref().map_or(true, |m| ts > *m) {
                        max = Some(ts);
                    }
                }
            }
            Ok(max)
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()
                .map_err(sql_err)
        })
        .await
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }
}

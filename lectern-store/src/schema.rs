//! SQLite schema and migrations.
//!
//! The applied version is mirrored to `PRAGMA user_version`. Migrations are
//! additive and applied in order inside one transaction. A database written
//! by a newer binary has no downgrade path and is recreated from scratch;
//! its data is recovered by the next sync.

use lectern_core::{EntityKind, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::sql_err;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE lectures (
                id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                local_state TEXT NOT NULL DEFAULT '{}',
                hlc TEXT NOT NULL DEFAULT '',
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE notes (
                id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                local_state TEXT NOT NULL DEFAULT '{}',
                hlc TEXT NOT NULL DEFAULT '',
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE visual_annotations (
                id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                local_state TEXT NOT NULL DEFAULT '{}',
                hlc TEXT NOT NULL DEFAULT '',
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE settings (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        sql: "
            CREATE INDEX idx_lectures_updated_at ON lectures(updated_at);
            CREATE INDEX idx_notes_updated_at ON notes(updated_at);
            CREATE INDEX idx_visual_annotations_updated_at ON visual_annotations(updated_at);
            CREATE INDEX idx_lectures_tombstones ON lectures(is_deleted, updated_at);
            CREATE INDEX idx_notes_tombstones ON notes(is_deleted, updated_at);
            CREATE INDEX idx_visual_annotations_tombstones ON visual_annotations(is_deleted, updated_at);
        ",
    },
];

/// Tables holding syncable rows, one per entity kind.
pub fn entity_tables() -> impl Iterator<Item = &'static str> {
    EntityKind::ALL.iter().map(|kind| kind.table())
}

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))
        .map_err(sql_err)
}

/// Applies all pending migrations, resetting databases from the future.
pub fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let mut current = current_version(conn)?;
    let latest = latest_version();

    if current > latest {
        warn!(
            db_version = current,
            latest_supported = latest,
            "database schema is newer than this build; dropping all tables"
        );
        reset(conn)?;
        current = 0;
    }

    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction().map_err(sql_err)?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql).map_err(sql_err)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))
            .map_err(sql_err)?;
    }
    tx.commit().map_err(sql_err)?;

    info!(from = current, to = latest, "schema migrated");
    Ok(())
}

fn reset(conn: &mut Connection) -> Result<()> {
    let tables: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
            .map_err(sql_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        names
    };

    let tx = conn.transaction().map_err(sql_err)?;
    for table in &tables {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", table.replace('"', "\"\"")))
            .map_err(sql_err)?;
    }
    tx.execute_batch("PRAGMA user_version = 0;").map_err(sql_err)?;
    tx.commit().map_err(sql_err)
}

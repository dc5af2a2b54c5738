//! Table formatting for CLI output using comfy-table

use chrono::{TimeZone, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use lectern_cache::CacheStats;
use lectern_core::{Entity, LectureBody, NoteBody};
use lectern_sync::CycleReport;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Render epoch milliseconds as a UTC timestamp; 0 means never.
pub fn format_time(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_string();
    }
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ms.to_string(),
    }
}

/// Video position as m:ss.
fn format_position(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

pub fn format_lectures(lectures: &[Entity<LectureBody>]) -> String {
    if lectures.is_empty() {
        return "No lectures found".to_string();
    }
    let mut table = new_table();
    table.set_header(vec!["id", "name", "folder", "video", "pdf", "download", "updated"]);
    for lecture in lectures {
        table.add_row(vec![
            Cell::new(&lecture.id),
            Cell::new(&lecture.body.name),
            Cell::new(opt(&lecture.body.folder_name)),
            Cell::new(opt(&lecture.body.video_file_id)),
            Cell::new(opt(&lecture.body.pdf_file_id)),
            Cell::new(format!("{:?}", lecture.local.download_status)),
            Cell::new(format_time(lecture.updated_at)),
        ]);
    }
    table.to_string()
}

pub fn format_notes(notes: &[Entity<NoteBody>]) -> String {
    if notes.is_empty() {
        return "No notes found".to_string();
    }
    let mut table = new_table();
    table.set_header(vec!["id", "at", "page", "content", "hlc"]);
    for note in notes {
        table.add_row(vec![
            Cell::new(&note.id),
            Cell::new(format_position(note.body.video_position_ms)),
            Cell::new(
                note.body
                    .pdf_page
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(&note.body.content),
            Cell::new(&note.hlc),
        ]);
    }
    table.to_string()
}

pub fn format_cycle(report: &CycleReport) -> String {
    let mut table = new_table();
    table.set_header(vec!["kind", "pushed", "pulled", "inserted", "overwritten", "kept local", "repushed", "errors"]);
    for kind in &report.kinds {
        table.add_row(vec![
            Cell::new(kind.kind),
            Cell::new(kind.pushed),
            Cell::new(kind.pulled),
            Cell::new(kind.merge.inserted),
            Cell::new(kind.merge.overwritten),
            Cell::new(kind.merge.kept_local),
            Cell::new(kind.repushed),
            Cell::new(if kind.errors.is_empty() {
                "-".to_string()
            } else {
                kind.errors.join("; ")
            }),
        ]);
    }
    table.to_string()
}

pub fn format_cache_stats(stats: &CacheStats) -> String {
    let mut table = new_table();
    table.set_header(vec!["metric", "value"]);
    let rows: [(&str, String); 7] = [
        ("entries", stats.entries.to_string()),
        ("bytes", stats.total_bytes.to_string()),
        ("budget", stats.max_bytes.to_string()),
        ("hits", stats.hits.to_string()),
        ("misses", stats.misses.to_string()),
        ("evictions", stats.evictions.to_string()),
        ("uncached", stats.uncached.to_string()),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    table.to_string()
}

//! Noteworthy-event log maintenance and placeholder findings.
//!
//! Current events live in the database and mirror into
//! `Logs/noteworthy.json`; once the current set grows past the configured
//! size limit, the whole set archives to a dated
//! `Logs/noteworthy-archived-YYYY-MM-DD.json` file and the current log
//! starts fresh. Events themselves are append-only and never mutated beyond
//! the archival stamp.

use chrono::Utc;
use serde_json::json;

use pm_core::{
    config::ProjectConfig,
    error::Result,
    models::EntityKind,
};
use store::{ChangeSet, ChangeType, JsonStyle, Store};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMaintenance {
    /// Events moved to the dated archive file, if the limit was crossed
    pub archived: u32,
    /// Path of the archive file written, when archival happened
    pub archive_file: Option<std::path::PathBuf>,
}

/// Mirror the current events into `Logs/noteworthy.json` and archive the
/// whole set once it exceeds `noteworthySizeLimit`. Called on every
/// comprehensive boot and after reconciliation passes.
pub async fn maintain_noteworthy(
    store: &Store,
    config: &ProjectConfig,
) -> Result<EventMaintenance> {
    let limit = config.events.noteworthy_size_limit;
    let count = store.current_event_count().await?;
    let layout = store.layout();

    let current = store.recent_events(limit.max(count)).await?;
    let current_value = serde_json::to_value(&current).unwrap_or_default();

    if count <= limit {
        // keep the mirror fresh; nothing to archive
        let change = ChangeSet::new("refresh noteworthy log").write_json(
            layout.noteworthy_file(),
            current_value,
            JsonStyle::Machine,
        );
        store.apply(change).await?;
        return Ok(EventMaintenance::default());
    }

    let now = Utc::now();
    let archive_file = layout.noteworthy_archive_file(now);
    tracing::info!(
        count,
        limit,
        archive = %archive_file.display(),
        "Archiving noteworthy events"
    );

    let change = ChangeSet::new("archive noteworthy events")
        .statement(
            "UPDATE noteworthy_events SET archived_at = ? WHERE archived_at IS NULL",
            vec![now.into()],
        )
        .write_json(archive_file.clone(), current_value, JsonStyle::Machine)
        .write_json(layout.noteworthy_file(), json!([]), JsonStyle::Machine)
        .notify(EntityKind::NoteworthyEvent, "archive", ChangeType::Archived);
    store.apply(change).await?;

    Ok(EventMaintenance {
        archived: count,
        archive_file: Some(archive_file),
    })
}

/// Placeholder markers rejected by `project.avoidPlaceholders`.
const PLACEHOLDER_MARKERS: [&str; 4] = ["TODO", "FIXME", "XXX", "unimplemented!"];

/// A placeholder found in generated content.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlaceholderFinding {
    pub file: String,
    pub line: usize,
    pub marker: String,
}

/// Scan generated content for placeholder markers.
pub fn scan_placeholders(file: &str, content: &str) -> Vec<PlaceholderFinding> {
    let mut findings = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for marker in PLACEHOLDER_MARKERS {
            if line.contains(marker) {
                findings.push(PlaceholderFinding {
                    file: file.to_string(),
                    line: idx + 1,
                    marker: marker.to_string(),
                });
                break;
            }
        }
    }
    findings
}

/// Append placeholder findings to `Placeholders/todos.jsonl` as one paired
/// write. No-op when `avoidPlaceholders` is off or nothing was found.
pub async fn record_placeholders(
    store: &Store,
    config: &ProjectConfig,
    findings: &[PlaceholderFinding],
) -> Result<()> {
    if !config.project.avoid_placeholders || findings.is_empty() {
        return Ok(());
    }

    let path = store.layout().todos_file();
    let mut body = std::fs::read_to_string(&path).unwrap_or_default();
    let now = Utc::now();
    for finding in findings {
        let line = json!({
            "file": finding.file,
            "line": finding.line,
            "marker": finding.marker,
            "recorded_at": now,
        });
        body.push_str(&line.to_string());
        body.push('\n');
    }

    let change = ChangeSet::new("record placeholder findings").write_text(path, body);
    store.apply(change).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_placeholders() {
        let content = "fn a() {}\n// TODO: finish\nlet x = 1; // FIXME later\nclean line\n";
        let findings = scan_placeholders("src/a.rs", content);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].line, 2);
        assert_eq!(findings[0].marker, "TODO");
        assert_eq!(findings[1].marker, "FIXME");
    }

    #[test]
    fn test_scan_clean_content() {
        assert!(scan_placeholders("src/a.rs", "fn done() -> u8 { 1 }\n").is_empty());
    }
}

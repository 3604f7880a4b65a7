//! File half of the paired-write protocol.
//!
//! Before a transaction touches the database, a journal sidecar
//! (`database/.txn-<txid>.json`) records every file operation with
//! deterministic temp and backup paths. New contents are staged at
//! `<target>.tmp-<txid>`, pre-images preserved at `<target>.bak-<txid>`.
//! Temps are fsynced and renamed over targets before the SQL commit; the
//! final statement of every transaction inserts the txid into `store_txns`.
//!
//! Recovery on boot is driven by the journal: a txid absent from
//! `store_txns` never committed, so pre-images are restored and the caller
//! observes the pre-change state; a present txid committed, so only backups
//! and the journal remain to be swept.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pm_core::error::{PmError, Result};

use crate::changeset::{FileContents, FileOp};
use crate::json;

/// Operation kinds as recorded in the journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalOpKind {
    Write,
    Rename,
    Delete,
}

/// One journaled file operation with every path recovery needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalOp {
    pub kind: JournalOpKind,
    pub target: PathBuf,
    /// Pre-image backup, present when the target existed at staging time
    pub backup: Option<PathBuf>,
    /// Staged temp file for writes
    pub temp: Option<PathBuf>,
    /// Source path for renames
    pub rename_from: Option<PathBuf>,
}

/// The journal sidecar for one transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxnJournal {
    pub txn_id: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ops: Vec<JournalOp>,
}

impl TxnJournal {
    pub fn path_in(database_dir: &Path, txn_id: &str) -> PathBuf {
        database_dir.join(format!(".txn-{txn_id}.json"))
    }
}

fn temp_path(target: &Path, txn_id: &str) -> PathBuf {
    sibling_with_suffix(target, &format!(".tmp-{txn_id}"))
}

fn backup_path(target: &Path, txn_id: &str) -> PathBuf {
    sibling_with_suffix(target, &format!(".bak-{txn_id}"))
}

fn sibling_with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    target.with_file_name(name)
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> PmError {
    PmError::Database(format!("{context} {}: {err}", path.display()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error("create dir for", parent, e))?;
    }
    let mut file = fs::File::create(path).map_err(|e| io_error("create", path, e))?;
    file.write_all(bytes).map_err(|e| io_error("write", path, e))?;
    file.sync_all().map_err(|e| io_error("sync", path, e))?;
    Ok(())
}

/// Build the journal for a change set's file operations. Temps and backups
/// get deterministic names so recovery can find them from the journal alone.
pub fn plan_journal(
    txn_id: &str,
    description: &str,
    started_at: DateTime<Utc>,
    file_ops: &[FileOp],
) -> TxnJournal {
    let ops = file_ops
        .iter()
        .map(|op| match op {
            FileOp::Write { path, .. } => JournalOp {
                kind: JournalOpKind::Write,
                target: path.clone(),
                backup: path.exists().then(|| backup_path(path, txn_id)),
                temp: Some(temp_path(path, txn_id)),
                rename_from: None,
            },
            FileOp::Rename { from, to } => JournalOp {
                kind: JournalOpKind::Rename,
                target: to.clone(),
                backup: to.exists().then(|| backup_path(to, txn_id)),
                temp: None,
                rename_from: Some(from.clone()),
            },
            FileOp::Delete { path } => JournalOp {
                kind: JournalOpKind::Delete,
                target: path.clone(),
                backup: path.exists().then(|| backup_path(path, txn_id)),
                temp: None,
                rename_from: None,
            },
        })
        .collect();

    TxnJournal {
        txn_id: txn_id.to_string(),
        description: description.to_string(),
        started_at,
        ops,
    }
}

/// Persist the journal sidecar (fsynced) before any target is touched.
pub fn write_journal(database_dir: &Path, journal: &TxnJournal) -> Result<PathBuf> {
    let path = TxnJournal::path_in(database_dir, &journal.txn_id);
    let body = serde_json::to_vec_pretty(journal)
        .map_err(|e| PmError::Internal(format!("Journal serialization failed: {e}")))?;
    write_synced(&path, &body)?;
    Ok(path)
}

/// Stage new contents and preserve pre-images. Targets are not modified.
pub fn stage(journal: &TxnJournal, file_ops: &[FileOp], minify_machine_json: bool) -> Result<()> {
    for (journal_op, op) in journal.ops.iter().zip(file_ops) {
        if let Some(backup) = &journal_op.backup {
            fs::copy(&journal_op.target, backup)
                .map_err(|e| io_error("back up", &journal_op.target, e))?;
        }
        if let FileOp::Write { path, contents } = op {
            let temp = journal_op
                .temp
                .as_ref()
                .ok_or_else(|| PmError::Internal("Write op without temp path".to_string()))?;
            let bytes = match contents {
                FileContents::Json { value, style } => {
                    json::render(value, *style, minify_machine_json).into_bytes()
                }
                FileContents::Text(text) => text.clone().into_bytes(),
            };
            // create the target's parent even if the target is new
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error("create dir for", parent, e))?;
            }
            write_synced(temp, &bytes)?;
        }
    }
    Ok(())
}

/// Make every staged operation visible: rename temps over targets, apply
/// renames, remove deleted targets. Runs after SQL execution, before commit.
pub fn promote(journal: &TxnJournal) -> Result<()> {
    for op in &journal.ops {
        match op.kind {
            JournalOpKind::Write => {
                let temp = op
                    .temp
                    .as_ref()
                    .ok_or_else(|| PmError::Internal("Write op without temp path".to_string()))?;
                fs::rename(temp, &op.target).map_err(|e| io_error("rename over", &op.target, e))?;
            }
            JournalOpKind::Rename => {
                let from = op.rename_from.as_ref().ok_or_else(|| {
                    PmError::Internal("Rename op without source path".to_string())
                })?;
                if let Some(parent) = op.target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| io_error("create dir for", parent, e))?;
                }
                fs::rename(from, &op.target).map_err(|e| io_error("rename to", &op.target, e))?;
            }
            JournalOpKind::Delete => {
                if op.target.exists() {
                    fs::remove_file(&op.target)
                        .map_err(|e| io_error("delete", &op.target, e))?;
                }
            }
        }
    }
    Ok(())
}

/// Undo whatever the transaction did to the file tree. Safe to call at any
/// point between staging and commit, and idempotent for recovery replays.
pub fn rollback(journal: &TxnJournal) -> Result<()> {
    for op in &journal.ops {
        if let Some(temp) = &op.temp {
            if temp.exists() {
                fs::remove_file(temp).map_err(|e| io_error("remove temp", temp, e))?;
            }
        }
        match op.kind {
            JournalOpKind::Write | JournalOpKind::Delete => match &op.backup {
                Some(backup) if backup.exists() => {
                    fs::rename(backup, &op.target)
                        .map_err(|e| io_error("restore", &op.target, e))?;
                }
                Some(_) => {}
                // a brand-new file that may have been promoted
                None => {
                    if op.kind == JournalOpKind::Write && op.target.exists() {
                        fs::remove_file(&op.target)
                            .map_err(|e| io_error("remove promoted", &op.target, e))?;
                    }
                }
            },
            JournalOpKind::Rename => {
                let from = op.rename_from.as_ref().ok_or_else(|| {
                    PmError::Internal("Rename op without source path".to_string())
                })?;
                if !from.exists() && op.target.exists() {
                    fs::rename(&op.target, from)
                        .map_err(|e| io_error("restore rename", from, e))?;
                } else if from.exists() && op.target.exists() && op.backup.is_none() {
                    // the source was restored by an earlier op in this
                    // journal; the promoted copy at the target is stale
                    fs::remove_file(&op.target)
                        .map_err(|e| io_error("remove promoted", &op.target, e))?;
                }
                if let Some(backup) = &op.backup {
                    if backup.exists() {
                        fs::rename(backup, &op.target)
                            .map_err(|e| io_error("restore", &op.target, e))?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Sweep backups and the journal after a successful commit.
pub fn cleanup(database_dir: &Path, journal: &TxnJournal) -> Result<()> {
    for op in &journal.ops {
        if let Some(backup) = &op.backup {
            if backup.exists() {
                fs::remove_file(backup).map_err(|e| io_error("remove backup", backup, e))?;
            }
        }
        if let Some(temp) = &op.temp {
            if temp.exists() {
                fs::remove_file(temp).map_err(|e| io_error("remove temp", temp, e))?;
            }
        }
    }
    let path = TxnJournal::path_in(database_dir, &journal.txn_id);
    if path.exists() {
        fs::remove_file(&path).map_err(|e| io_error("remove journal", &path, e))?;
    }
    Ok(())
}

/// Find journal sidecars left behind by an unclean shutdown.
pub fn find_orphan_journals(database_dir: &Path) -> Result<Vec<TxnJournal>> {
    let mut journals = Vec::new();
    if !database_dir.exists() {
        return Ok(journals);
    }
    let entries =
        fs::read_dir(database_dir).map_err(|e| io_error("read", database_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error("read entry in", database_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(".txn-") && name.ends_with(".json") {
            let body = fs::read_to_string(entry.path())
                .map_err(|e| io_error("read journal", &entry.path(), e))?;
            let journal: TxnJournal = serde_json::from_str(&body)
                .map_err(|e| PmError::Database(format!("Corrupt journal {name}: {e}")))?;
            journals.push(journal);
        }
    }
    journals.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    Ok(journals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::JsonStyle;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let db_dir = dir.path().join("database");
        fs::create_dir_all(&db_dir).unwrap();
        (dir, db_dir)
    }

    fn write_op(path: &Path, body: &str) -> FileOp {
        FileOp::Write {
            path: path.to_path_buf(),
            contents: FileContents::Json {
                value: json!({ "body": body }),
                style: JsonStyle::Machine,
            },
        }
    }

    #[test]
    fn test_stage_promote_cleanup_happy_path() {
        let (dir, db_dir) = setup();
        let target = dir.path().join("Tasks/active/TASK-1.json");
        let ops = vec![write_op(&target, "v1")];

        let journal = plan_journal("tx1", "create task", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();
        assert!(!target.exists(), "target untouched until promote");

        promote(&journal).unwrap();
        assert!(target.exists());

        cleanup(&db_dir, &journal).unwrap();
        assert!(find_orphan_journals(&db_dir).unwrap().is_empty());
    }

    #[test]
    fn test_rollback_restores_pre_image() {
        let (dir, db_dir) = setup();
        let target = dir.path().join("Tasks/active/TASK-1.json");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "{\"body\":\"old\"}\n").unwrap();

        let ops = vec![write_op(&target, "new")];
        let journal = plan_journal("tx2", "update task", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();
        promote(&journal).unwrap();
        assert!(fs::read_to_string(&target).unwrap().contains("new"));

        // simulate crash between rename and SQL commit
        rollback(&journal).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"body\":\"old\"}\n");
    }

    #[test]
    fn test_rollback_removes_new_file() {
        let (dir, db_dir) = setup();
        let target = dir.path().join("Tasks/active/TASK-9.json");
        let ops = vec![write_op(&target, "fresh")];

        let journal = plan_journal("tx3", "create", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();
        promote(&journal).unwrap();
        assert!(target.exists());

        rollback(&journal).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_delete_rollback_restores() {
        let (dir, db_dir) = setup();
        let target = dir.path().join("Tasks/sidequests/SQ-1.json");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "keep me").unwrap();

        let ops = vec![FileOp::Delete {
            path: target.clone(),
        }];
        let journal = plan_journal("tx4", "archive", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();
        promote(&journal).unwrap();
        assert!(!target.exists());

        rollback(&journal).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "keep me");
    }

    #[test]
    fn test_rename_promote_and_rollback() {
        let (dir, db_dir) = setup();
        let from = dir.path().join("Tasks/active/TASK-1.json");
        let to = dir.path().join("Tasks/archive/TASK-1.json");
        fs::create_dir_all(from.parent().unwrap()).unwrap();
        fs::write(&from, "archived body").unwrap();

        let ops = vec![FileOp::Rename {
            from: from.clone(),
            to: to.clone(),
        }];
        let journal = plan_journal("tx5", "archive task", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();
        promote(&journal).unwrap();
        assert!(!from.exists());
        assert!(to.exists());

        rollback(&journal).unwrap();
        assert!(from.exists());
        assert!(!to.exists());
    }

    #[test]
    fn test_orphan_journal_discovery_ordering() {
        let (_dir, db_dir) = setup();
        let older = TxnJournal {
            txn_id: "b".to_string(),
            description: String::new(),
            started_at: Utc::now() - chrono::Duration::seconds(10),
            ops: vec![],
        };
        let newer = TxnJournal {
            txn_id: "a".to_string(),
            description: String::new(),
            started_at: Utc::now(),
            ops: vec![],
        };
        write_journal(&db_dir, &newer).unwrap();
        write_journal(&db_dir, &older).unwrap();

        let found = find_orphan_journals(&db_dir).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].txn_id, "b");
        assert_eq!(found[1].txn_id, "a");
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let (dir, db_dir) = setup();
        let target = dir.path().join("x.json");
        fs::write(&target, "old").unwrap();

        let ops = vec![write_op(&target, "new")];
        let journal = plan_journal("tx6", "update", Utc::now(), &ops);
        write_journal(&db_dir, &journal).unwrap();
        stage(&journal, &ops, true).unwrap();

        rollback(&journal).unwrap();
        rollback(&journal).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "old");
    }
}

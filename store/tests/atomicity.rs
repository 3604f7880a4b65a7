//! Crash-recovery and atomicity contract tests.
//!
//! These exercise the paired-write protocol end to end: a change set either
//! lands in full (SQL and files) or not at all, and a process killed between
//! the file rename and the SQL commit is healed on the next open with the
//! database as the authority.

use chrono::Utc;
use pm_core::layout::ProjectLayout;
use serde_json::json;
use store::paired;
use store::{ChangeSet, FileContents, FileOp, JsonStyle, Store, StoreOptions};
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> Store {
    let layout = ProjectLayout::new(dir.path());
    Store::open(layout, StoreOptions::default()).await.unwrap()
}

fn task_change(dir: &TempDir, task_id: &str, title: &str) -> ChangeSet {
    let file = dir
        .path()
        .join(format!("projectManagement/Tasks/active/{task_id}.json"));
    ChangeSet::new("create task")
        .statement(
            "INSERT INTO task_status (task_id, title, status, priority, milestone_id, primary_theme, created_at, last_updated) \
             VALUES (?, ?, 'pending', 'medium', 'M-01', 'payment', ?, ?)",
            vec![
                task_id.into(),
                title.into(),
                Utc::now().into(),
                Utc::now().into(),
            ],
        )
        .write_json(
            file,
            json!({ "id": task_id, "title": title }),
            JsonStyle::Machine,
        )
}

#[tokio::test]
async fn change_set_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .apply(task_change(&dir, "TASK-20250712090000", "Ship checkout"))
        .await
        .unwrap();

    // both halves observable
    let task = store.get_task("TASK-20250712090000").await.unwrap().unwrap();
    assert_eq!(task.title, "Ship checkout");
    let file = dir
        .path()
        .join("projectManagement/Tasks/active/TASK-20250712090000.json");
    assert!(file.exists());

    // a failing SQL half drags the file half down with it
    let bad = ChangeSet::new("bad change")
        .statement("INSERT INTO nonexistent (x) VALUES (1)", vec![])
        .write_json(
            dir.path().join("projectManagement/Tasks/active/TASK-X.json"),
            json!({"id": "TASK-X"}),
            JsonStyle::Machine,
        );
    assert!(store.apply(bad).await.is_err());
    assert!(!dir
        .path()
        .join("projectManagement/Tasks/active/TASK-X.json")
        .exists());
}

#[tokio::test]
async fn crash_between_rename_and_commit_restores_pre_change_state() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .apply(task_change(&dir, "TASK-20250712090000", "Original title"))
        .await
        .unwrap();
    let file = dir
        .path()
        .join("projectManagement/Tasks/active/TASK-20250712090000.json");
    let original = std::fs::read_to_string(&file).unwrap();

    // Hand-drive the file half of an update past the rename, then "crash"
    // before any SQL commit: no store_txns marker is written.
    let ops = vec![FileOp::Write {
        path: file.clone(),
        contents: FileContents::Json {
            value: json!({ "id": "TASK-20250712090000", "title": "Half-written update" }),
            style: JsonStyle::Machine,
        },
    }];
    let journal = paired::plan_journal("crashed-tx", "update task", Utc::now(), &ops);
    paired::write_journal(&store.layout().database_dir(), &journal).unwrap();
    paired::stage(&journal, &ops, true).unwrap();
    paired::promote(&journal).unwrap();
    assert!(std::fs::read_to_string(&file)
        .unwrap()
        .contains("Half-written update"));

    drop(store);

    // Next boot: recovery finds the orphan journal, sees no commit marker,
    // and rewrites the file back to the committed state.
    let store = open_store(&dir).await;
    assert_eq!(std::fs::read_to_string(&file).unwrap(), original);
    let task = store.get_task("TASK-20250712090000").await.unwrap().unwrap();
    assert_eq!(task.title, "Original title");

    // journal is gone; recovery is idempotent
    let report = store.recover().await.unwrap();
    assert!(report.rolled_back.is_empty());
    assert!(report.completed.is_empty());
}

#[tokio::test]
async fn committed_journal_is_swept_not_rolled_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .apply(task_change(&dir, "TASK-20250712090000", "Original title"))
        .await
        .unwrap();
    let file = dir
        .path()
        .join("projectManagement/Tasks/active/TASK-20250712090000.json");

    // Drive an update fully through rename and SQL commit, then "crash"
    // before the post-commit sweep: journal and backup are left behind.
    let ops = vec![FileOp::Write {
        path: file.clone(),
        contents: FileContents::Json {
            value: json!({ "id": "TASK-20250712090000", "title": "Committed update" }),
            style: JsonStyle::Machine,
        },
    }];
    let journal = paired::plan_journal("committed-tx", "update task", Utc::now(), &ops);
    paired::write_journal(&store.layout().database_dir(), &journal).unwrap();
    paired::stage(&journal, &ops, true).unwrap();
    paired::promote(&journal).unwrap();
    sqlx::query("INSERT INTO store_txns (txn_id, committed_at) VALUES ('committed-tx', ?)")
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

    drop(store);

    let store = open_store(&dir).await;
    // the committed content survives recovery
    assert!(std::fs::read_to_string(&file)
        .unwrap()
        .contains("Committed update"));

    // backups and journal are gone
    let database_dir = store.layout().database_dir();
    let leftovers: Vec<_> = std::fs::read_dir(&database_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".txn-") || n.contains(".bak-"))
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}

#[tokio::test]
async fn concurrent_ordinal_allocation_never_collides() {
    use std::sync::Arc;
    use store::OrdinalScope;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir).await);
    store
        .apply(task_change(&dir, "TASK-20250712090000", "Parent"))
        .await
        .unwrap();

    // ten racing creations must serialize through the allocating
    // transaction and come out with consecutive ordinals
    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let change = ChangeSet::new("racing sidequest")
                .with_ordinal(OrdinalScope::Sidequest {
                    parent_task_id: "TASK-20250712090000".to_string(),
                })
                .statement(
                    "INSERT INTO sidequest_status (sidequest_id, parent_task_id, ordinal, title, primary_theme, created_at, last_updated) \
                     VALUES (?, 'TASK-20250712090000', ?, 't', 'payment', ?, ?)",
                    vec![
                        "SQ-20250712090000-{{ordinal3}}".into(),
                        "{{ordinal}}".into(),
                        Utc::now().into(),
                        Utc::now().into(),
                    ],
                );
            store.apply(change).await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let mut ordinals: Vec<u32> = results.iter().filter_map(|a| a.ordinal).collect();
    ordinals.sort_unstable();
    assert_eq!(ordinals, (1..=10).collect::<Vec<u32>>());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sidequest_status")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 10);
}

#[tokio::test]
async fn json_round_trip_with_indented_writer() {
    let dir = TempDir::new().unwrap();
    let layout = ProjectLayout::new(dir.path());
    let store = Store::open(
        layout,
        StoreOptions {
            minify_machine_json: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let value = json!({
        "zeta": {"deep": [1, 2, 3]},
        "alpha": "text with \"quotes\" and \u{00e9}",
        "count": 42,
        "flag": true,
        "nothing": null
    });
    let file = dir.path().join("projectManagement/Themes/sample.json");
    store
        .apply(
            ChangeSet::new("write artifact").write_json(&file, value.clone(), JsonStyle::Machine),
        )
        .await
        .unwrap();

    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(parsed, value);
}

#[tokio::test]
async fn archival_rename_is_atomic_with_status_change() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .apply(task_change(&dir, "TASK-20250712090000", "Archive me"))
        .await
        .unwrap();

    let active = dir
        .path()
        .join("projectManagement/Tasks/active/TASK-20250712090000.json");
    let archived = dir
        .path()
        .join("projectManagement/Tasks/archive/TASK-20250712090000.json");

    let change = ChangeSet::new("archive task")
        .statement(
            "UPDATE task_status SET status = 'cancelled' WHERE task_id = 'TASK-20250712090000'",
            vec![],
        )
        .rename(&active, &archived);
    store.apply(change).await.unwrap();

    assert!(!active.exists());
    assert!(archived.exists());
    let task = store.get_task("TASK-20250712090000").await.unwrap().unwrap();
    assert_eq!(task.status, pm_core::models::WorkStatus::Cancelled);
}

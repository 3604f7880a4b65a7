//! Session boot and termination behavior: idempotent back-to-back boots,
//! fast-path selection, auto-resume, and clean termination.

use engine::{BootOptions, BootPath, Server, SessionBoot, TaskSpec};
use pm_core::{
    config::ProjectConfig,
    models::{Priority, SessionStatus, WorkStatus},
};
use serde_json::json;
use tempfile::TempDir;

async fn project(config: ProjectConfig) -> (TempDir, Server) {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("projectManagement");
    std::fs::create_dir_all(base.join("Tasks")).unwrap();
    std::fs::create_dir_all(base.join("Themes")).unwrap();
    std::fs::create_dir_all(base.join("ProjectBlueprint")).unwrap();

    std::fs::write(
        base.join("Tasks/completion-path.json"),
        serde_json::to_string_pretty(&json!({
            "milestones": [{
                "id": "M-01",
                "description": "Foundation",
                "status": "in-progress",
                "dependencies": [],
                "required_flows": {},
                "related_tasks": [],
                "implementation_plans": []
            }]
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(base.join("Themes/themes.json"), r#"["payment"]"#).unwrap();
    std::fs::write(
        base.join("Themes/payment.json"),
        serde_json::to_string_pretty(&json!({
            "name": "payment",
            "category": "functional",
            "description": "",
            "paths": ["src/payment"],
            "linked_themes": [],
            "shared_files": {},
            "keywords": []
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        base.join("ProjectBlueprint/blueprint.md"),
        "# Project\n\nA sample project under orchestration.\n",
    )
    .unwrap();

    let server = Server::initialize(dir.path(), config).await.unwrap();
    (dir, server)
}

#[tokio::test]
async fn boot_twice_is_idempotent_and_second_run_is_fast() {
    let (_dir, server) = project(ProjectConfig::default()).await;

    let first = SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    assert_eq!(first.path, BootPath::Comprehensive);
    assert!(first.resumed_task.is_none());
    assert!(first.blueprint_summary.contains("A sample project"));

    let second = SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    assert_eq!(second.path, BootPath::Fast);
    assert_ne!(first.session_id, second.session_id);

    // same reconstructed context, modulo timestamps
    assert_eq!(first.context_mode, second.context_mode);
    assert_eq!(first.loaded_themes, second.loaded_themes);
    assert_eq!(first.open_tasks, second.open_tasks);

    // exactly one session is active
    let first_session = server.store().get_session(&first.session_id).await.unwrap().unwrap();
    assert_eq!(first_session.status, SessionStatus::Terminated);
    let second_session = server.store().get_session(&second.session_id).await.unwrap().unwrap();
    assert_eq!(second_session.status, SessionStatus::Active);
}

#[tokio::test]
async fn force_comprehensive_overrides_fast_path() {
    let (_dir, server) = project(ProjectConfig::default()).await;

    SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    let forced = SessionBoot::boot(
        &server,
        BootOptions {
            force_comprehensive: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(forced.path, BootPath::Comprehensive);
}

#[tokio::test]
async fn resume_tasks_on_start_adopts_in_progress_task() {
    let mut config = ProjectConfig::default();
    config.tasks.resume_tasks_on_start = true;
    let (_dir, server) = project(config).await;

    let report = SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    let task = server
        .scheduler()
        .create_task(TaskSpec {
            title: "Resume me".to_string(),
            priority: Priority::Medium,
            milestone_id: "M-01".to_string(),
            primary_theme: "payment".to_string(),
            related_themes: vec![],
            acceptance_criteria: vec![],
            dependencies: vec![],
        })
        .await
        .unwrap();
    server
        .scheduler()
        .start_task(&task.id, &report.session_id)
        .await
        .unwrap();

    // the next session picks the task up automatically
    let next = SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    assert_eq!(next.resumed_task.as_deref(), Some(task.id.as_str()));

    let adopted = server.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(adopted.status, WorkStatus::InProgress);
    let owned = server
        .store()
        .in_progress_task(&next.session_id)
        .await
        .unwrap();
    assert_eq!(owned.map(|t| t.id), Some(task.id));
}

#[tokio::test]
async fn noteworthy_archival_at_size_boundary() {
    use chrono::Utc;
    use store::ChangeSet;

    let mut config = ProjectConfig::default();
    config.events.noteworthy_size_limit = 3;
    let (dir, server) = project(config).await;
    let store = server.store();

    let insert_event = |n: u32| {
        ChangeSet::new("seed event").statement(
            "INSERT INTO noteworthy_events (event_id, event_type, title, impact, created_at) \
             VALUES (?, 'decision', ?, 'low', ?)",
            vec![
                format!("event-{n}").into(),
                format!("event number {n}").into(),
                Utc::now().into(),
            ],
        )
    };

    // at exactly the limit: nothing archives
    for n in 1..=3 {
        store.apply(insert_event(n)).await.unwrap();
    }
    let outcome = engine::events::maintain_noteworthy(store, server.config().as_ref())
        .await
        .unwrap();
    assert_eq!(outcome.archived, 0);
    assert_eq!(store.current_event_count().await.unwrap(), 3);

    // the mirror file tracks the current set
    let noteworthy = dir.path().join("projectManagement/Logs/noteworthy.json");
    let mirrored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&noteworthy).unwrap()).unwrap();
    assert_eq!(mirrored.as_array().unwrap().len(), 3);

    // one past the limit: the whole current set archives to a dated file
    store.apply(insert_event(4)).await.unwrap();
    let outcome = engine::events::maintain_noteworthy(store, server.config().as_ref())
        .await
        .unwrap();
    assert_eq!(outcome.archived, 4);
    let archive = outcome.archive_file.unwrap();
    assert!(archive.exists());
    let archived: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&archive).unwrap()).unwrap();
    assert_eq!(archived.as_array().unwrap().len(), 4);

    assert_eq!(store.current_event_count().await.unwrap(), 0);
    let mirrored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&noteworthy).unwrap()).unwrap();
    assert!(mirrored.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn placeholder_findings_append_to_todos() {
    let (dir, server) = project(ProjectConfig::default()).await;

    let findings = engine::events::scan_placeholders(
        "src/payment/refunds.js",
        "function refund() {\n  // TODO: call the gateway\n}\n",
    );
    assert_eq!(findings.len(), 1);

    engine::events::record_placeholders(server.store(), server.config().as_ref(), &findings)
        .await
        .unwrap();
    engine::events::record_placeholders(server.store(), server.config().as_ref(), &findings)
        .await
        .unwrap();

    let todos =
        std::fs::read_to_string(dir.path().join("projectManagement/Placeholders/todos.jsonl"))
            .unwrap();
    // appends, never rewrites
    assert_eq!(todos.lines().count(), 2);
    assert!(todos.contains("src/payment/refunds.js"));
}

#[tokio::test]
async fn terminate_writes_final_snapshot() {
    let (_dir, server) = project(ProjectConfig::default()).await;

    let report = SessionBoot::boot(&server, BootOptions::default()).await.unwrap();
    SessionBoot::terminate(&server).await.unwrap();

    let session = server
        .store()
        .get_session(&report.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(server.current_session().await.is_none());

    // terminating again is refused
    let err = SessionBoot::terminate(&server).await.unwrap_err();
    assert!(matches!(err, pm_core::error::PmError::SessionExpired(_)));
}

//! End-to-end scheduler scenarios: sidequest pause/resume, the sidequest
//! limit boundary, milestone gates, and the cancellation cascade.

use chrono::Utc;
use engine::{Server, SessionBoot, SidequestSpec, SubtaskSpec, TaskSpec, WorkItemRef};
use pm_core::{
    config::ProjectConfig,
    error::PmError,
    models::{FlowState, ParentKind, Priority, WorkStatus},
};
use serde_json::json;
use store::ChangeSet;
use tempfile::TempDir;

async fn project() -> (TempDir, Server) {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir);
    let server = Server::initialize(dir.path(), ProjectConfig::default())
        .await
        .unwrap();
    seed_session(&server).await;
    (dir, server)
}

fn write_fixture(dir: &TempDir) {
    let base = dir.path().join("projectManagement");
    for sub in ["Tasks", "Themes", "ProjectFlow", "UserSettings"] {
        std::fs::create_dir_all(base.join(sub)).unwrap();
    }

    std::fs::write(
        base.join("Tasks/completion-path.json"),
        serde_json::to_string_pretty(&json!({
            "milestones": [
                {
                    "id": "M-01",
                    "description": "Foundation",
                    "status": "in-progress",
                    "dependencies": [],
                    "required_flows": {},
                    "related_tasks": [],
                    "implementation_plans": []
                },
                {
                    "id": "M-02",
                    "description": "Payments",
                    "status": "in-progress",
                    "dependencies": [],
                    "required_flows": { "payment-processing-flow": "complete" },
                    "related_tasks": [],
                    "implementation_plans": []
                }
            ]
        }))
        .unwrap(),
    )
    .unwrap();

    std::fs::write(
        base.join("Themes/themes.json"),
        r#"["payment", "checkout", "security"]"#,
    )
    .unwrap();
    for (name, paths) in [
        ("payment", json!(["src/payment"])),
        ("checkout", json!(["src/checkout"])),
        ("security", json!(["src/security"])),
    ] {
        std::fs::write(
            base.join(format!("Themes/{name}.json")),
            serde_json::to_string_pretty(&json!({
                "name": name,
                "category": "functional",
                "description": format!("{name} slice"),
                "paths": paths,
                "linked_themes": [],
                "shared_files": {},
                "keywords": []
            }))
            .unwrap(),
        )
        .unwrap();
    }

    std::fs::write(
        base.join("ProjectFlow/flow-index.json"),
        serde_json::to_string_pretty(&json!({
            "flowFiles": [
                { "file": "payment-flow.json", "flows": ["payment-processing-flow"], "primaryThemes": ["payment"] }
            ]
        }))
        .unwrap(),
    )
    .unwrap();
    write_payment_flow(dir, FlowState::InProgress);
}

fn write_payment_flow(dir: &TempDir, second_step: FlowState) {
    let base = dir.path().join("projectManagement");
    std::fs::write(
        base.join("ProjectFlow/payment-flow.json"),
        serde_json::to_string_pretty(&json!({
            "flows": [{
                "flow_id": "payment-processing-flow",
                "flow_file": "payment-flow.json",
                "name": "Payment processing",
                "steps": [
                    { "step_id": "PP-01", "description": "collect card", "dependencies": [], "status": "complete" },
                    { "step_id": "PP-02", "description": "settle", "dependencies": [], "status": second_step }
                ],
                "primary_themes": ["payment"],
                "completion_percentage": 50
            }]
        }))
        .unwrap(),
    )
    .unwrap();
}

async fn seed_session(server: &Server) {
    server
        .store()
        .apply(
            ChangeSet::new("seed session")
                .statement(
                    "INSERT INTO sessions (id, start_time, last_activity) VALUES ('S1', ?, ?)",
                    vec![Utc::now().into(), Utc::now().into()],
                )
                .statement(
                    "INSERT INTO session_context (session_id, context_mode, loaded_themes, loaded_flows, loaded_files, last_activity, created_at) \
                     VALUES ('S1', 'focused', ?, '[]', '[]', ?, ?)",
                    vec![
                        r#"["payment","checkout"]"#.into(),
                        Utc::now().into(),
                        Utc::now().into(),
                    ],
                ),
        )
        .await
        .unwrap();
}

fn task_spec(title: &str) -> TaskSpec {
    TaskSpec {
        title: title.to_string(),
        priority: Priority::High,
        milestone_id: "M-01".to_string(),
        primary_theme: "payment".to_string(),
        related_themes: vec!["checkout".to_string()],
        acceptance_criteria: vec![],
        dependencies: vec![],
    }
}

fn sidequest_spec(title: &str) -> SidequestSpec {
    SidequestSpec {
        title: title.to_string(),
        scope_description: "tangent".to_string(),
        reason: "discovered mid-task".to_string(),
        urgency: Priority::Medium,
        impact: pm_core::models::ImpactLevel::Minimal,
        primary_theme: "security".to_string(),
    }
}

#[tokio::test]
async fn sidequest_pause_and_resume_round_trip() {
    let (dir, server) = project().await;
    let scheduler = server.scheduler();

    let task = scheduler.create_task(task_spec("Wire payments")).await.unwrap();
    scheduler.start_task(&task.id, "S1").await.unwrap();

    // two subtasks; the second is mid-flight at 75%
    scheduler
        .create_subtask(ParentKind::Task, &task.id, SubtaskSpec {
            description: "schema".to_string(),
            flow_references: vec![],
            files: vec![],
            context_mode: None,
        })
        .await
        .unwrap();
    let st2 = scheduler
        .create_subtask(ParentKind::Task, &task.id, SubtaskSpec {
            description: "webhooks".to_string(),
            flow_references: vec![],
            files: vec![],
            context_mode: None,
        })
        .await
        .unwrap();
    assert_eq!(st2.id, "ST-02");
    scheduler
        .transition_subtask(&task.id, "ST-01", WorkStatus::InProgress)
        .await
        .unwrap();
    scheduler
        .transition_subtask(&task.id, "ST-01", WorkStatus::Completed)
        .await
        .unwrap();
    scheduler
        .transition_subtask(&task.id, "ST-02", WorkStatus::InProgress)
        .await
        .unwrap();
    scheduler
        .update_progress(
            WorkItemRef::Subtask {
                parent_id: task.id.clone(),
                id: "ST-02".to_string(),
            },
            75,
            None,
        )
        .await
        .unwrap();

    // creating the sidequest pauses the parent with a snapshot
    let sidequest = scheduler
        .create_sidequest(&task.id, sidequest_spec("Rate limiting"))
        .await
        .unwrap();
    assert!(sidequest.id.ends_with("-001"), "got {}", sidequest.id);

    let parent = server.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(parent.status, WorkStatus::Blocked);
    assert_eq!(
        parent.blocked_reason.as_deref(),
        Some(format!("sidequest:{}", sidequest.id).as_str())
    );

    let raw = server.store().queued_context(&task.id).await.unwrap().unwrap();
    let snapshot = store::common::parse_context_snapshot(Some(raw)).unwrap().unwrap();
    assert_eq!(snapshot.paused_subtask_id.as_deref(), Some("ST-02"));
    assert_eq!(snapshot.paused_progress, 75);
    assert_eq!(snapshot.loaded_themes, vec!["payment", "checkout"]);

    // sidequest file landed; parent file reflects the pause
    assert!(dir
        .path()
        .join(format!("projectManagement/Tasks/sidequests/{}.json", sidequest.id))
        .exists());

    // completing restores the snapshot and resumes the parent
    scheduler.start_sidequest(&sidequest.id).await.unwrap();
    let completion = scheduler.complete_sidequest(&sidequest.id).await.unwrap();
    assert!(completion.parent_resumed);
    let restored = completion.restored_context.unwrap();
    assert_eq!(restored.paused_subtask_id.as_deref(), Some("ST-02"));
    assert_eq!(restored.paused_progress, 75);
    assert_eq!(restored.loaded_themes, vec!["payment", "checkout"]);

    let parent = server.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(parent.status, WorkStatus::InProgress);
    assert!(parent.blocked_reason.is_none());

    let st2 = server
        .store()
        .get_subtask(&task.id, "ST-02")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(st2.progress, 75);

    // file archived, queue entry cleared
    assert!(dir
        .path()
        .join(format!(
            "projectManagement/Tasks/sidequests/archive/{}.json",
            sidequest.id
        ))
        .exists());
    assert!(server.store().queued_context(&task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn sidequest_limit_boundary() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let task = scheduler.create_task(task_spec("Busy task")).await.unwrap();
    scheduler.start_task(&task.id, "S1").await.unwrap();

    // one below the limit succeeds; three sidequests fill it
    for n in 1..=3 {
        let sq = scheduler
            .create_sidequest(&task.id, sidequest_spec(&format!("tangent {n}")))
            .await
            .unwrap();
        assert!(sq.id.ends_with(&format!("-{n:03}")));
    }

    // at the limit: LimitExceeded with the four resolutions, and no mutation
    let before = server.store().active_sidequests_by_task(&task.id).await.unwrap();
    let err = scheduler
        .create_sidequest(&task.id, sidequest_spec("one too many"))
        .await
        .unwrap_err();
    match &err {
        PmError::LimitExceeded { active, limit, .. } => {
            assert_eq!(*active, 3);
            assert_eq!(*limit, 3);
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
    let resolutions: Vec<String> =
        serde_json::from_value(err.details()["resolutions"].clone()).unwrap();
    assert_eq!(resolutions, vec!["wait", "modify_existing", "replace", "raise_limit"]);

    let after = server.store().active_sidequests_by_task(&task.id).await.unwrap();
    assert_eq!(before, after, "a refused creation must not mutate state");

    // the raise_limit resolution unblocks a fourth
    scheduler
        .raise_sidequest_limit(&task.id, 4, "S1")
        .await
        .unwrap();
    let sq4 = scheduler
        .create_sidequest(&task.id, sidequest_spec("approved extra"))
        .await
        .unwrap();
    assert!(sq4.id.ends_with("-004"));
}

#[tokio::test]
async fn milestone_gate_on_required_flow() {
    let (dir, server) = project().await;
    let scheduler = server.scheduler();

    // flow still in progress: the gate holds
    let err = scheduler.complete_milestone("M-02").await.unwrap_err();
    assert!(
        matches!(err, PmError::StateTransitionForbidden { .. }),
        "got {err:?}"
    );

    // completing the flow and reloading the index opens the gate
    write_payment_flow(&dir, FlowState::Complete);
    server.reload_index().await.unwrap();
    let milestone = scheduler.complete_milestone("M-02").await.unwrap();
    assert_eq!(milestone.status, pm_core::models::MilestoneStatus::Completed);

    // completion-path.json was rewritten through the paired write
    let doc: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("projectManagement/Tasks/completion-path.json"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(doc["milestones"][1]["status"], "completed");

    // and the decision left an event
    let events = server.store().recent_events(10).await.unwrap();
    assert!(events.iter().any(|e| e.title.contains("M-02")));
}

#[tokio::test]
async fn cancelling_parent_cancels_sidequests_and_discards_snapshot() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let task = scheduler.create_task(task_spec("Doomed")).await.unwrap();
    scheduler.start_task(&task.id, "S1").await.unwrap();
    let sidequest = scheduler
        .create_sidequest(&task.id, sidequest_spec("tangent"))
        .await
        .unwrap();

    scheduler
        .transition_task(&task.id, WorkStatus::Cancelled)
        .await
        .unwrap();

    let sq = server
        .store()
        .get_sidequest(&sidequest.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sq.status, WorkStatus::Cancelled);
    assert!(server.store().queued_context(&task.id).await.unwrap().is_none());

    // the creating-then-cancelling round trip leaves the counter at zero
    let limit_row = server
        .store()
        .sidequest_limit_status(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(limit_row.active_sidequests_count, 0);
}

#[tokio::test]
async fn completion_gates_on_task() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let mut spec = task_spec("Gated");
    spec.acceptance_criteria = vec!["works end to end".to_string()];
    let task = scheduler.create_task(spec).await.unwrap();
    scheduler.start_task(&task.id, "S1").await.unwrap();
    scheduler
        .create_subtask(ParentKind::Task, &task.id, SubtaskSpec {
            description: "only step".to_string(),
            flow_references: vec![],
            files: vec![],
            context_mode: None,
        })
        .await
        .unwrap();

    // incomplete subtask blocks completion
    let err = scheduler
        .transition_task(&task.id, WorkStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, PmError::StateTransitionForbidden { .. }));

    scheduler
        .transition_subtask(&task.id, "ST-01", WorkStatus::InProgress)
        .await
        .unwrap();
    scheduler
        .transition_subtask(&task.id, "ST-01", WorkStatus::Completed)
        .await
        .unwrap();

    // unsatisfied acceptance still blocks
    let err = scheduler
        .transition_task(&task.id, WorkStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, PmError::StateTransitionForbidden { .. }));

    server
        .store()
        .apply(ChangeSet::new("satisfy acceptance").statement(
            "UPDATE task_status SET acceptance_criteria = ? WHERE task_id = ?",
            vec![
                r#"[{"description":"works end to end","satisfied":true}]"#.into(),
                task.id.clone().into(),
            ],
        ))
        .await
        .unwrap();

    let done = scheduler
        .transition_task(&task.id, WorkStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, WorkStatus::Completed);
}

#[tokio::test]
async fn concurrent_task_guard() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let first = scheduler.create_task(task_spec("First")).await.unwrap();
    let second = scheduler.create_task(task_spec("Second")).await.unwrap();

    scheduler.start_task(&first.id, "S1").await.unwrap();
    let err = scheduler.start_task(&second.id, "S1").await.unwrap_err();
    assert_eq!(err, PmError::ConcurrentTask(first.id.clone()));

    // starting the same task again is a no-op, not an error
    let again = scheduler.start_task(&first.id, "S1").await.unwrap();
    assert_eq!(again.status, WorkStatus::InProgress);
}

#[tokio::test]
async fn unknown_milestone_and_theme_are_rejected() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let mut spec = task_spec("Bad milestone");
    spec.milestone_id = "M-99".to_string();
    let err = scheduler.create_task(spec).await.unwrap_err();
    assert_eq!(err, PmError::MissingMilestone("M-99".to_string()));

    let mut spec = task_spec("Bad theme");
    spec.primary_theme = "nonexistent".to_string();
    let err = scheduler.create_task(spec).await.unwrap_err();
    assert_eq!(err, PmError::UnknownTheme("nonexistent".to_string()));
}

#[tokio::test]
async fn scope_change_requires_parent_file_update() {
    let (_dir, server) = project().await;
    let scheduler = server.scheduler();

    let task = scheduler.create_task(task_spec("Scoped")).await.unwrap();
    scheduler.start_task(&task.id, "S1").await.unwrap();
    let sidequest = scheduler
        .create_sidequest(&task.id, sidequest_spec("scope changer"))
        .await
        .unwrap();
    scheduler.start_sidequest(&sidequest.id).await.unwrap();
    scheduler.mark_scope_change(&sidequest.id).await.unwrap();

    let err = scheduler.complete_sidequest(&sidequest.id).await.unwrap_err();
    assert!(matches!(err, PmError::Validation(_)), "got {err:?}");

    // an update to the parent's definition satisfies the gate
    scheduler
        .update_progress(WorkItemRef::Task { id: task.id.clone() }, 10, Some("scope widened".to_string()))
        .await
        .unwrap();
    let completion = scheduler.complete_sidequest(&sidequest.id).await.unwrap();
    assert!(completion.parent_resumed);
}

#[tokio::test]
async fn touch_updates_session_activity() {
    let (_dir, server) = project().await;
    // no active engine session yet: touch is a no-op
    SessionBoot::touch(&server).await.unwrap();
}

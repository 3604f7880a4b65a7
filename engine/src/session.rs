//! Session boot and termination.
//!
//! Every session start reconstructs the complete working state: recover the
//! store, open a session row, restore the latest context snapshot, surface
//! external Git changes, and optionally auto-resume the in-progress task.
//! The fast path (fresh cache, unchanged Git hash) skips reconciliation
//! entirely; the whole sequence degrades to a read-only session when it
//! cannot finish inside the configured deadline.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use pm_core::{
    error::{PmError, Result},
    models::{ContextMode, EntityKind, SessionStatus, Task, WorkStatus},
};
use store::{common, ChangeSet, ChangeType, SqlValue};

use crate::fsutil;
use crate::git_bridge::ReconciliationPlan;
use crate::server::Server;

/// Session context snapshots older than this force the comprehensive path.
const CACHE_FRESHNESS_HOURS: i64 = 24;

/// Which boot path was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootPath {
    /// Cache fresh and Git hash unchanged (~100 ms target)
    Fast,
    /// Full restoration (~2-5 s target)
    Comprehensive,
    /// Deadline exceeded; read-only session with minimal state
    Degraded,
}

/// Everything a caller needs to know after boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootReport {
    pub session_id: String,
    pub path: BootPath,
    /// Task auto-resumed per `resumeTasksOnStart`
    pub resumed_task: Option<String>,
    /// Open tasks presented for direction when nothing auto-resumed
    pub open_tasks: Vec<String>,
    /// Reconciliation that must be addressed before work continues
    pub pending_reconciliation: Option<ReconciliationPlan>,
    pub context_mode: ContextMode,
    pub loaded_themes: Vec<String>,
    pub blueprint_summary: String,
    pub recent_logic: String,
    pub warnings: Vec<String>,
}

/// Options governing the boot sequence.
#[derive(Debug, Clone)]
pub struct BootOptions {
    pub force_comprehensive: bool,
    /// Total deadline before degrading to a read-only session
    pub deadline: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            force_comprehensive: false,
            deadline: Duration::from_secs(10),
        }
    }
}

/// Boots and terminates sessions against a [`Server`].
pub struct SessionBoot;

impl SessionBoot {
    /// Run the boot sequence under the deadline. On timeout the session
    /// degrades instead of failing: whatever committed stays committed, and
    /// the report marks the session read-only.
    pub async fn boot(server: &Server, options: BootOptions) -> Result<BootReport> {
        let deadline = options.deadline;
        match tokio::time::timeout(deadline, Self::boot_inner(server, options)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?deadline, "Boot deadline exceeded; degrading to read-only session");
                let session_id = server
                    .current_session()
                    .await
                    .unwrap_or_else(|| format!("session-{}", Utc::now().timestamp_millis()));
                Ok(BootReport {
                    session_id,
                    path: BootPath::Degraded,
                    resumed_task: None,
                    open_tasks: vec![],
                    pending_reconciliation: None,
                    context_mode: ContextMode::Focused,
                    loaded_themes: vec![],
                    blueprint_summary: String::new(),
                    recent_logic: String::new(),
                    warnings: vec!["boot deadline exceeded; session is read-only".to_string()],
                })
            }
        }
    }

    async fn boot_inner(server: &Server, options: BootOptions) -> Result<BootReport> {
        let store = server.store();
        let now = Utc::now();

        // 1. Store recovery ran at open; claim the session slot. Any
        //    session left active by an unclean shutdown is terminated:
        //    exactly one session is active per process.
        let session_id = format!("session-{}", now.timestamp_millis());
        let open_session = ChangeSet::new("open session")
            .statement(
                "UPDATE sessions SET status = 'terminated' WHERE status = 'active'",
                vec![],
            )
            .statement(
                "INSERT INTO sessions (id, start_time, last_activity, context_mode, status) \
                 VALUES (?, ?, ?, 'focused', 'active')",
                vec![session_id.clone().into(), now.into(), now.into()],
            )
            .notify(EntityKind::Session, &session_id, ChangeType::Created);
        store.apply(open_session).await?;
        server.set_current_session(&session_id).await;

        // 2. Decide the path from the latest snapshot and the Git hash.
        let snapshot = store.latest_session_context().await?;
        let current_hash = server.git_bridge().current_head_hash();
        let cache_fresh = snapshot
            .as_ref()
            .map(|s| now - s.last_activity < chrono::Duration::hours(CACHE_FRESHNESS_HOURS))
            .unwrap_or(false);
        let hash_unchanged = match (&snapshot, &current_hash) {
            (Some(s), current) => s.git_hash == *current,
            (None, _) => false,
        };
        let fast = cache_fresh && hash_unchanged && !options.force_comprehensive;
        let path = if fast {
            BootPath::Fast
        } else {
            BootPath::Comprehensive
        };

        // 3. Core artifacts. The blueprint summary and recent logic are
        //    small reads either way.
        let layout = store.layout().clone();
        let blueprint_summary = fsutil::head_lines(&layout.blueprint_file(), 40);
        let recent_logic = fsutil::tail_lines(&layout.projectlogic(), 10);

        let mut warnings = Vec::new();

        // 4/6. Reconciliation and log maintenance run on the comprehensive
        // path only.
        let mut pending_reconciliation = None;
        if !fast {
            server.reload_index().await?;
            let index = server.index();
            let guard = index.read().await;

            // files spread over too many themes get flagged for review
            let threshold = server.config().themes.shared_file_threshold as usize;
            for shared in guard.shared_file_warnings(threshold) {
                warnings.push(format!(
                    "{} is shared by {} themes (threshold {threshold}); consider reorganizing",
                    shared.file,
                    shared.themes.len()
                ));
            }

            let plan = server.git_bridge().detect_changes(&guard).await?;
            if plan.requires_user() {
                warnings.push(format!(
                    "{} file change(s) need review before work resumes",
                    plan.proposals.len()
                ));
                pending_reconciliation = Some(plan);
            }
            drop(guard);

            let maintenance =
                crate::events::maintain_noteworthy(store, server.config().as_ref()).await?;
            if maintenance.archived > 0 {
                warnings.push(format!(
                    "{} noteworthy events archived to a dated file",
                    maintenance.archived
                ));
            }
        }

        // 4. Active work. Auto-resume only when configured AND the Git
        //    hash did not move; a changed hash must reconcile first.
        let open_tasks: Vec<Task> = store.open_tasks().await?;
        let in_progress: Option<&Task> = open_tasks
            .iter()
            .find(|t| t.status == WorkStatus::InProgress);

        let mut resumed_task = None;
        if let Some(task) = in_progress {
            let resume_allowed = server.config().tasks.resume_tasks_on_start
                && hash_unchanged
                && pending_reconciliation.is_none();
            if resume_allowed {
                let adopt = ChangeSet::new("adopt in-progress task")
                    .statement(
                        "UPDATE task_status SET session_id = ? WHERE task_id = ?",
                        vec![session_id.clone().into(), task.id.clone().into()],
                    )
                    .notify(EntityKind::Task, &task.id, ChangeType::Updated);
                store.apply(adopt).await?;
                resumed_task = Some(task.id.clone());
                tracing::info!(task_id = %task.id, "Auto-resumed in-progress task");
            } else if server.config().tasks.resume_tasks_on_start {
                warnings.push(format!(
                    "task {} not auto-resumed: source tree changed since last session",
                    task.id
                ));
            }
        }

        // 5. Restore context from the snapshot, falling back to computing
        //    it from the active work item.
        let (context_mode, loaded_themes, loaded_flows, loaded_files) = match &snapshot {
            Some(s) if fast || !s.loaded_themes.is_empty() => (
                s.context_mode,
                s.loaded_themes.clone(),
                s.loaded_flows.clone(),
                s.loaded_files.clone(),
            ),
            _ => match in_progress {
                Some(task) => {
                    let plan = server.context_loader().load_for_task(task, None).await?;
                    (
                        plan.mode,
                        plan.themes,
                        plan.flows,
                        plan.files
                            .iter()
                            .map(|p| p.to_string_lossy().into_owned())
                            .collect(),
                    )
                }
                None => (ContextMode::Focused, vec![], vec![], vec![]),
            },
        };

        // 7. Stamp activity and persist a fresh snapshot.
        let close_boot = ChangeSet::new("persist boot context")
            .statement(
                "UPDATE sessions SET last_activity = ?, context_mode = ?, active_themes = ?, active_tasks = ? WHERE id = ?",
                vec![
                    Utc::now().into(),
                    common::context_mode_to_string(context_mode).into(),
                    common::string_list(&loaded_themes).into(),
                    SqlValue::Text(
                        serde_json::to_string(
                            &open_tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
                        )
                        .unwrap_or_default(),
                    ),
                    session_id.clone().into(),
                ],
            )
            .statement(
                "INSERT INTO session_context (session_id, git_hash, context_mode, loaded_themes, loaded_flows, loaded_files, last_activity, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    session_id.clone().into(),
                    current_hash.clone().into(),
                    common::context_mode_to_string(context_mode).into(),
                    common::string_list(&loaded_themes).into(),
                    common::string_list(&loaded_flows).into(),
                    common::string_list(&loaded_files).into(),
                    Utc::now().into(),
                    Utc::now().into(),
                ],
            )
            .notify(EntityKind::Session, &session_id, ChangeType::Updated);
        store.apply(close_boot).await?;

        tracing::info!(
            session_id = %session_id,
            ?path,
            resumed = resumed_task.is_some(),
            "Session boot finished"
        );

        Ok(BootReport {
            session_id,
            path,
            resumed_task,
            open_tasks: open_tasks.iter().map(|t| t.id.clone()).collect(),
            pending_reconciliation,
            context_mode,
            loaded_themes,
            blueprint_summary,
            recent_logic,
            warnings,
        })
    }

    /// Clean shutdown: write the final context snapshot and mark the
    /// session completed. Unclean shutdown needs nothing more than the
    /// store's recovery pass, because every work-unit completion was
    /// already one atomic paired write.
    pub async fn terminate(server: &Server) -> Result<()> {
        let Some(session_id) = server.current_session().await else {
            return Err(PmError::SessionExpired("no active session".to_string()));
        };
        let store = server.store();

        let session = store
            .get_session(&session_id)
            .await?
            .ok_or_else(|| PmError::not_found("session", &session_id))?;
        if session.status.is_terminal() {
            return Err(PmError::SessionExpired(session_id));
        }

        let now = Utc::now();
        let current_hash = server.git_bridge().current_head_hash();
        let change = ChangeSet::new("terminate session")
            .statement(
                "UPDATE sessions SET status = ?, last_activity = ? WHERE id = ?",
                vec![
                    common::session_status_to_string(SessionStatus::Completed).into(),
                    now.into(),
                    session_id.clone().into(),
                ],
            )
            .statement(
                "INSERT INTO session_context (session_id, git_hash, context_mode, loaded_themes, loaded_flows, loaded_files, last_activity, created_at) \
                 SELECT id, ?, context_mode, active_themes, '[]', '[]', ?, ? FROM sessions WHERE id = ?",
                vec![
                    current_hash.into(),
                    now.into(),
                    now.into(),
                    session_id.clone().into(),
                ],
            )
            .notify(EntityKind::Session, &session_id, ChangeType::Updated);
        store.apply(change).await?;
        server.clear_current_session().await;

        tracing::info!(session_id = %session_id, "Session terminated cleanly");
        Ok(())
    }

    /// Touch `last_activity` for the current session; called by the tool
    /// dispatch layer around every operation.
    pub async fn touch(server: &Server) -> Result<()> {
        let Some(session_id) = server.current_session().await else {
            return Ok(());
        };
        let change = ChangeSet::new("touch session").statement(
            "UPDATE sessions SET last_activity = ? WHERE id = ? AND status = 'active'",
            vec![Utc::now().into(), session_id.into()],
        );
        server.store().apply(change).await?;
        Ok(())
    }
}

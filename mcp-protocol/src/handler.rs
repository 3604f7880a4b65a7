//! Orchestrator handler: the bridge between the tool registry and the
//! engine. Thin by design; every rule lives in the engine and the store,
//! the handler only threads sessions, the pending reconciliation plan, and
//! the read-only flag through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use engine::{
    BootOptions, BootPath, BootReport, BranchStatusReport, ContextPlan, Escalation, MergeReport,
    OrgMainOutcome, ReconciliationPlan, Server, SessionBoot, SidequestCompletion, SidequestSpec,
    SubtaskSpec, TaskSpec, WorkItemRef,
};
use pm_core::{
    error::{PmError, Result},
    models::{
        Branch, ContextMode, Milestone, ParentKind, ReconciliationStatus, Session, Sidequest,
        Subtask, Task, WorkStatus,
    },
};
use serde::{Deserialize, Serialize};
use store::ActiveSidequestRow;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub database: bool,
    pub session_active: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Handler owning the protocol-visible state around an engine [`Server`].
pub struct McpOrchestratorHandler {
    server: Arc<Server>,
    pending_plan: RwLock<Option<ReconciliationPlan>>,
    read_only: AtomicBool,
}

impl McpOrchestratorHandler {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            pending_plan: RwLock::new(None),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// A degraded boot leaves the session read-only; mutating tools are
    /// refused until a successful boot clears the flag.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    async fn require_session(&self) -> Result<String> {
        self.server
            .current_session()
            .await
            .ok_or_else(|| PmError::SessionExpired("no active session; boot first".to_string()))
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub async fn boot_session(&self, force_comprehensive: bool) -> Result<BootReport> {
        let report = SessionBoot::boot(
            &self.server,
            BootOptions {
                force_comprehensive,
                ..Default::default()
            },
        )
        .await?;

        self.read_only
            .store(report.path == BootPath::Degraded, Ordering::SeqCst);
        *self.pending_plan.write().await = report.pending_reconciliation.clone();
        Ok(report)
    }

    pub async fn session_status(&self) -> Result<Option<Session>> {
        match self.server.current_session().await {
            Some(id) => self.server.store().get_session(&id).await,
            None => Ok(None),
        }
    }

    pub async fn terminate_session(&self) -> Result<()> {
        SessionBoot::terminate(&self.server).await
    }

    /// Stamp session activity; dispatched around every mutating tool call.
    pub async fn touch_session(&self) -> Result<()> {
        SessionBoot::touch(&self.server).await
    }

    // ------------------------------------------------------------------
    // Tasks and subtasks
    // ------------------------------------------------------------------

    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        self.server.scheduler().create_task(spec).await
    }

    pub async fn start_task(&self, task_id: &str) -> Result<Task> {
        let session = self.require_session().await?;
        self.server.scheduler().start_task(task_id, &session).await
    }

    pub async fn transition_task(&self, task_id: &str, status: WorkStatus) -> Result<Task> {
        self.server.scheduler().transition_task(task_id, status).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.server
            .store()
            .get_task(task_id)
            .await?
            .ok_or_else(|| PmError::not_found("task", task_id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.server.store().open_tasks().await
    }

    pub async fn create_subtask(
        &self,
        parent_kind: ParentKind,
        parent_id: &str,
        spec: SubtaskSpec,
    ) -> Result<Subtask> {
        self.server
            .scheduler()
            .create_subtask(parent_kind, parent_id, spec)
            .await
    }

    pub async fn transition_subtask(
        &self,
        parent_id: &str,
        subtask_id: &str,
        status: WorkStatus,
    ) -> Result<Subtask> {
        self.server
            .scheduler()
            .transition_subtask(parent_id, subtask_id, status)
            .await
    }

    pub async fn update_progress(
        &self,
        item: WorkItemRef,
        progress: u8,
        notes: Option<String>,
    ) -> Result<()> {
        self.server
            .scheduler()
            .update_progress(item, progress, notes)
            .await
    }

    // ------------------------------------------------------------------
    // Sidequests
    // ------------------------------------------------------------------

    pub async fn create_sidequest(
        &self,
        parent_task_id: &str,
        spec: SidequestSpec,
    ) -> Result<Sidequest> {
        self.server
            .scheduler()
            .create_sidequest(parent_task_id, spec)
            .await
    }

    pub async fn start_sidequest(&self, sidequest_id: &str) -> Result<Sidequest> {
        self.server.scheduler().start_sidequest(sidequest_id).await
    }

    pub async fn complete_sidequest(&self, sidequest_id: &str) -> Result<SidequestCompletion> {
        self.server.scheduler().complete_sidequest(sidequest_id).await
    }

    pub async fn list_active_sidequests(&self, task_id: &str) -> Result<Vec<ActiveSidequestRow>> {
        self.server.store().active_sidequests_by_task(task_id).await
    }

    pub async fn raise_sidequest_limit(&self, task_id: &str, new_limit: u32) -> Result<()> {
        let session = self.require_session().await?;
        self.server
            .scheduler()
            .raise_sidequest_limit(task_id, new_limit, &session)
            .await
    }

    // ------------------------------------------------------------------
    // Milestones and context
    // ------------------------------------------------------------------

    pub async fn complete_milestone(&self, milestone_id: &str) -> Result<Milestone> {
        self.server.scheduler().complete_milestone(milestone_id).await
    }

    pub async fn load_context(
        &self,
        task_id: &str,
        mode: Option<ContextMode>,
    ) -> Result<ContextPlan> {
        let task = self.get_task(task_id).await?;
        self.server.context_loader().load_for_task(&task, mode).await
    }

    pub async fn escalate_context(
        &self,
        task_id: &str,
        current: ContextMode,
        reason: &str,
        approved: bool,
    ) -> Result<ContextPlan> {
        let task = self.get_task(task_id).await?;
        let escalation = self
            .server
            .context_loader()
            .escalate(&task, current, reason, approved)
            .await?;
        Ok(match escalation {
            Escalation::Widened(plan) | Escalation::Approved(plan) => plan,
        })
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    pub async fn ensure_org_main(&self) -> Result<OrgMainOutcome> {
        self.server.branch_manager().ensure_org_main()
    }

    pub async fn create_branch(&self, purpose: &str) -> Result<Branch> {
        self.server.branch_manager().create_work_branch(purpose).await
    }

    pub async fn merge_branch(&self, branch_name: &str, delete_after: bool) -> Result<MergeReport> {
        self.server
            .branch_manager()
            .merge_work_branch(branch_name, delete_after)
            .await
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        self.server.branch_manager().list_branches().await
    }

    pub async fn branch_status(&self, branch_name: &str) -> Result<BranchStatusReport> {
        self.server.branch_manager().branch_status(branch_name).await
    }

    pub async fn delete_branch(&self, branch_name: &str, force: bool) -> Result<()> {
        self.server.branch_manager().delete_branch(branch_name, force).await
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    pub async fn detect_changes(&self) -> Result<ReconciliationPlan> {
        self.server.reload_index().await?;
        let index = self.server.index();
        let guard = index.read().await;
        let plan = self.server.git_bridge().detect_changes(&guard).await?;
        drop(guard);
        if plan.requires_user() {
            *self.pending_plan.write().await = Some(plan.clone());
        }
        Ok(plan)
    }

    pub async fn approve_reconciliation(&self, files: &[String]) -> Result<ReconciliationStatus> {
        let plan = {
            let guard = self.pending_plan.read().await;
            guard.clone().ok_or_else(|| {
                PmError::Validation("No reconciliation plan is pending approval".to_string())
            })?
        };
        let status = self.server.git_bridge().approve(&plan, files).await?;
        if status == ReconciliationStatus::Reconciled {
            *self.pending_plan.write().await = None;
            // approved changes may have touched theme files
            self.server.reload_index().await?;
        }
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn health_check(&self) -> Result<HealthStatus> {
        let database = sqlx_ping(self.server.store().pool()).await;
        Ok(HealthStatus {
            status: if database { "healthy" } else { "degraded" }.to_string(),
            database,
            session_active: self.server.current_session().await.is_some(),
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

async fn sqlx_ping(pool: &sqlx::SqlitePool) -> bool {
    sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()
}

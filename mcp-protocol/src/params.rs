//! Typed parameters for every tool operation.
//!
//! Creation specs are reused from the engine; everything else is a thin
//! serde struct so the registry can deserialize straight from JSON-RPC
//! params into concrete inputs.

use serde::{Deserialize, Serialize};

use engine::{SidequestSpec, SubtaskSpec, TaskSpec, WorkItemRef};
use pm_core::models::{ContextMode, ParentKind, WorkStatus};

/// `task.create`
pub type CreateTaskParams = TaskSpec;

/// `sidequest.create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSidequestParams {
    pub parent_task_id: String,
    #[serde(flatten)]
    pub spec: SidequestSpec,
}

/// `subtask.create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubtaskParams {
    pub parent_kind: ParentKind,
    pub parent_id: String,
    #[serde(flatten)]
    pub spec: SubtaskSpec,
}

/// `task.start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskParams {
    pub task_id: String,
}

/// `task.transition`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionTaskParams {
    pub task_id: String,
    pub status: WorkStatus,
}

/// `subtask.transition`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSubtaskParams {
    pub parent_id: String,
    pub subtask_id: String,
    pub status: WorkStatus,
}

/// `task.get`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskParams {
    pub task_id: String,
}

/// `work.update_progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProgressParams {
    #[serde(flatten)]
    pub item: WorkItemRef,
    pub progress: u8,
    pub notes: Option<String>,
}

/// `sidequest.start` / `sidequest.complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidequestIdParams {
    pub sidequest_id: String,
}

/// `sidequest.list_active`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListActiveSidequestsParams {
    pub task_id: String,
}

/// `sidequest.raise_limit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseLimitParams {
    pub task_id: String,
    pub new_limit: u32,
}

/// `milestone.complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteMilestoneParams {
    pub milestone_id: String,
}

/// `context.load`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadContextParams {
    pub task_id: String,
    pub mode: Option<ContextMode>,
}

/// `context.escalate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalateContextParams {
    pub task_id: String,
    pub current_mode: ContextMode,
    pub reason: String,
    #[serde(default)]
    pub approved: bool,
}

/// `branch.create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBranchParams {
    pub purpose: String,
}

/// `branch.merge`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeBranchParams {
    pub branch_name: String,
    #[serde(default)]
    pub delete_after: bool,
}

/// `branch.status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchNameParams {
    pub branch_name: String,
}

/// `branch.delete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBranchParams {
    pub branch_name: String,
    #[serde(default)]
    pub force: bool,
}

/// `session.boot`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootSessionParams {
    #[serde(default)]
    pub force_comprehensive: bool,
}

/// `reconcile.approve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveReconciliationParams {
    pub files: Vec<String>,
}

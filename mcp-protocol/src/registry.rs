//! Tagged tool registry.
//!
//! Tool dispatch is keyed by stable string ids; each id maps to exactly one
//! typed operation. Unknown ids yield a structured not-found error instead
//! of falling through dynamic dispatch.

use serde::{Deserialize, Serialize};

/// Every tool the orchestrator exposes, keyed by its wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolId {
    TaskCreate,
    TaskStart,
    TaskTransition,
    TaskGet,
    TaskList,
    SubtaskCreate,
    SubtaskTransition,
    WorkUpdateProgress,
    SidequestCreate,
    SidequestStart,
    SidequestComplete,
    SidequestListActive,
    SidequestRaiseLimit,
    MilestoneComplete,
    ContextLoad,
    ContextEscalate,
    BranchEnsureOrgMain,
    BranchCreate,
    BranchMerge,
    BranchList,
    BranchStatus,
    BranchDelete,
    SessionBoot,
    SessionStatus,
    SessionTerminate,
    ReconcileDetect,
    ReconcileApprove,
    HealthCheck,
}

impl ToolId {
    /// The stable wire id.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolId::TaskCreate => "task.create",
            ToolId::TaskStart => "task.start",
            ToolId::TaskTransition => "task.transition",
            ToolId::TaskGet => "task.get",
            ToolId::TaskList => "task.list",
            ToolId::SubtaskCreate => "subtask.create",
            ToolId::SubtaskTransition => "subtask.transition",
            ToolId::WorkUpdateProgress => "work.update_progress",
            ToolId::SidequestCreate => "sidequest.create",
            ToolId::SidequestStart => "sidequest.start",
            ToolId::SidequestComplete => "sidequest.complete",
            ToolId::SidequestListActive => "sidequest.list_active",
            ToolId::SidequestRaiseLimit => "sidequest.raise_limit",
            ToolId::MilestoneComplete => "milestone.complete",
            ToolId::ContextLoad => "context.load",
            ToolId::ContextEscalate => "context.escalate",
            ToolId::BranchEnsureOrgMain => "branch.ensure_org_main",
            ToolId::BranchCreate => "branch.create",
            ToolId::BranchMerge => "branch.merge",
            ToolId::BranchList => "branch.list",
            ToolId::BranchStatus => "branch.status",
            ToolId::BranchDelete => "branch.delete",
            ToolId::SessionBoot => "session.boot",
            ToolId::SessionStatus => "session.status",
            ToolId::SessionTerminate => "session.terminate",
            ToolId::ReconcileDetect => "reconcile.detect",
            ToolId::ReconcileApprove => "reconcile.approve",
            ToolId::HealthCheck => "health.check",
        }
    }

    /// Resolve a wire id; `None` is the structured-not-found path.
    pub fn parse(id: &str) -> Option<ToolId> {
        ALL_TOOLS.iter().copied().find(|tool| tool.as_str() == id)
    }

    /// Whether the tool mutates state. Degraded (read-only) sessions only
    /// admit non-mutating tools.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            ToolId::TaskGet
                | ToolId::TaskList
                | ToolId::SidequestListActive
                | ToolId::ContextLoad
                | ToolId::BranchList
                | ToolId::BranchStatus
                | ToolId::SessionStatus
                | ToolId::HealthCheck
        )
    }
}

/// Every registered tool, in display order.
pub const ALL_TOOLS: [ToolId; 28] = [
    ToolId::TaskCreate,
    ToolId::TaskStart,
    ToolId::TaskTransition,
    ToolId::TaskGet,
    ToolId::TaskList,
    ToolId::SubtaskCreate,
    ToolId::SubtaskTransition,
    ToolId::WorkUpdateProgress,
    ToolId::SidequestCreate,
    ToolId::SidequestStart,
    ToolId::SidequestComplete,
    ToolId::SidequestListActive,
    ToolId::SidequestRaiseLimit,
    ToolId::MilestoneComplete,
    ToolId::ContextLoad,
    ToolId::ContextEscalate,
    ToolId::BranchEnsureOrgMain,
    ToolId::BranchCreate,
    ToolId::BranchMerge,
    ToolId::BranchList,
    ToolId::BranchStatus,
    ToolId::BranchDelete,
    ToolId::SessionBoot,
    ToolId::SessionStatus,
    ToolId::SessionTerminate,
    ToolId::ReconcileDetect,
    ToolId::ReconcileApprove,
    ToolId::HealthCheck,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for tool in ALL_TOOLS {
            assert_eq!(ToolId::parse(tool.as_str()), Some(tool));
        }
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(ToolId::parse("task.destroy"), None);
        assert_eq!(ToolId::parse(""), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for tool in ALL_TOOLS {
            assert!(seen.insert(tool.as_str()), "duplicate id {}", tool.as_str());
        }
    }

    #[test]
    fn test_read_only_classification() {
        assert!(!ToolId::TaskGet.is_mutating());
        assert!(!ToolId::HealthCheck.is_mutating());
        assert!(ToolId::TaskCreate.is_mutating());
        assert!(ToolId::SessionBoot.is_mutating());
    }
}

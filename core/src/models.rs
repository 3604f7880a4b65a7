use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Breadth of themes/flows exposed to the agent for a work item.
///
/// `Focused` loads the primary theme only (typically 5-15 files),
/// `Expanded` adds linked themes (15-25 files), `Wide` loads every theme
/// (25+ files). Escalation between modes is governed by the context loader:
/// focused -> expanded may happen without approval, expanded -> wide needs
/// an explicit user decision recorded as an event.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Focused,
    Expanded,
    Wide,
}

impl Default for ContextMode {
    fn default() -> Self {
        ContextMode::Focused
    }
}

impl ContextMode {
    /// The next broader mode, if any.
    pub fn escalated(self) -> Option<ContextMode> {
        match self {
            ContextMode::Focused => Some(ContextMode::Expanded),
            ContextMode::Expanded => Some(ContextMode::Wide),
            ContextMode::Wide => None,
        }
    }
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextMode::Focused => write!(f, "focused"),
            ContextMode::Expanded => write!(f, "expanded"),
            ContextMode::Wide => write!(f, "wide"),
        }
    }
}

/// Lifecycle states shared by tasks and sidequests.
///
/// The progression is: pending -> in-progress -> completed, with `blocked`
/// as a temporary detour from in-progress (a task is blocked while one of
/// its sidequests runs). Cancellation is reachable from every non-terminal
/// state: cancelling a task whose sidequest is active finds the task in
/// `blocked`, so `blocked -> cancelled` must be legal.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl WorkStatus {
    /// Check whether a task or sidequest may move to `new_status`.
    pub fn can_transition_to(self, new_status: WorkStatus) -> bool {
        use WorkStatus::*;

        match (self, new_status) {
            (current, new) if current == new => false,

            (Pending, InProgress | Cancelled) => true,
            (InProgress, Blocked | Completed | Cancelled) => true,
            (Blocked, InProgress | Cancelled) => true,

            // Completed and Cancelled are terminal
            _ => false,
        }
    }

    /// Subtasks share the task graph minus cancellation.
    pub fn can_transition_to_as_subtask(self, new_status: WorkStatus) -> bool {
        new_status != WorkStatus::Cancelled && self.can_transition_to(new_status)
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Cancelled)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending => write!(f, "pending"),
            WorkStatus::InProgress => write!(f, "in-progress"),
            WorkStatus::Blocked => write!(f, "blocked"),
            WorkStatus::Completed => write!(f, "completed"),
            WorkStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Session lifecycle. Exactly one session is `Active` per process; the
/// terminal states (`Completed`, `Terminated`) are immutable.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Terminated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// An MCP session over one project. Reconstructed on every boot; the latest
/// `session_context` snapshot (ordered by `last_activity`) wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub context_mode: ContextMode,
    pub active_themes: Vec<String>,
    pub active_tasks: Vec<String>,
    pub active_sidequests: Vec<String>,
    pub status: SessionStatus,
}

/// Task priority, ordered low to high.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// A single acceptance criterion on a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptanceCriterion {
    pub description: String,
    pub satisfied: bool,
}

/// A unit of work created from an implementation-plan phase.
///
/// Identity is `TASK-<timestamp>`. At most one task is in-progress per
/// session; completing a task requires every subtask completed, no
/// non-terminal sidequests, and all acceptance criteria satisfied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// `TASK-<yyyymmddHHMMSS>` identifier
    pub id: String,
    pub title: String,
    pub status: WorkStatus,
    pub priority: Priority,
    /// Milestone this task serves (`M-<n>`); required at creation
    pub milestone_id: String,
    /// Primary theme driving focused context loading
    pub primary_theme: String,
    pub related_themes: Vec<String>,
    /// Completion percentage 0-100
    pub progress: u8,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Ids of tasks this one depends on
    pub dependencies: Vec<String>,
    /// Reason string when blocked (e.g. `sidequest:SQ-...`)
    pub blocked_reason: Option<String>,
    /// Context escalations consumed by this task (at most one permitted)
    pub escalation_count: u8,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Task {
    /// Whether every acceptance criterion is marked satisfied.
    pub fn acceptance_satisfied(&self) -> bool {
        self.acceptance_criteria.iter().all(|c| c.satisfied)
    }
}

/// What kind of entity owns a subtask.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParentKind {
    Task,
    Sidequest,
}

impl std::fmt::Display for ParentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentKind::Task => write!(f, "task"),
            ParentKind::Sidequest => write!(f, "sidequest"),
        }
    }
}

/// Reference from a subtask into the flow index: a flow, the file it lives
/// in, and the concrete steps the subtask implements. Step ids must resolve
/// against the index (enforced per the configured validation mode).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowReference {
    pub flow_id: String,
    pub flow_file: String,
    pub step_ids: Vec<String>,
}

/// A concrete step of work under a task or sidequest (`ST-<n>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subtask {
    /// `ST-<n>` within the parent
    pub id: String,
    pub parent_id: String,
    pub parent_kind: ParentKind,
    pub description: String,
    pub status: WorkStatus,
    pub flow_references: Vec<FlowReference>,
    /// Files this subtask touches
    pub files: Vec<String>,
    pub context_mode: ContextMode,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// How much a sidequest is expected to disturb its parent task.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Minimal,
    Moderate,
    Significant,
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpactLevel::Minimal => write!(f, "minimal"),
            ImpactLevel::Moderate => write!(f, "moderate"),
            ImpactLevel::Significant => write!(f, "significant"),
        }
    }
}

/// A tangential unit of work spawned mid-task (`SQ-<timestamp>-<n>`).
///
/// Creating a sidequest pauses its parent: the parent task moves to
/// `blocked` with a context snapshot of the active subtask; completing the
/// sidequest restores that snapshot and resumes the parent. A task may hold
/// at most `maxActiveSidequests` sidequests in non-terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sidequest {
    /// `SQ-<yyyymmddHHMMSS>-<NNN>` identifier
    pub id: String,
    pub parent_task_id: String,
    pub title: String,
    pub scope_description: String,
    pub reason: String,
    pub urgency: Priority,
    pub impact: ImpactLevel,
    pub status: WorkStatus,
    /// Primary theme for the sidequest's own context
    pub primary_theme: String,
    /// Themes inherited from the parent task
    pub inherited_themes: Vec<String>,
    /// Whether this sidequest changed the parent task's scope; if so the
    /// parent task file must be rewritten before the sidequest archives
    pub changed_parent_scope: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// The context captured when a task is paused for a sidequest and restored
/// on resume. Written to `task_queue.context_snapshot` as one atomic paired
/// write with the pause itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    pub paused_subtask_id: Option<String>,
    pub paused_progress: u8,
    pub loaded_themes: Vec<String>,
    pub loaded_flows: Vec<String>,
    pub loaded_files: Vec<String>,
    pub paused_at: DateTime<Utc>,
}

/// Ordered flow completion states. A milestone gate of the form
/// `flow_status(f) >= required` uses this ordering.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum FlowState {
    NotStarted,
    InProgress,
    NeedsReview,
    Complete,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::NotStarted => write!(f, "not-started"),
            FlowState::InProgress => write!(f, "in-progress"),
            FlowState::NeedsReview => write!(f, "needs-review"),
            FlowState::Complete => write!(f, "complete"),
        }
    }
}

/// Milestone lifecycle.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MilestoneStatus::Pending => write!(f, "pending"),
            MilestoneStatus::InProgress => write!(f, "in-progress"),
            MilestoneStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A completion gate on the project's path (`M-<n>`).
///
/// A milestone cannot complete while any required flow sits below its
/// required state or any of its implementation plans is still active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    /// `M-<n>` identifier
    pub id: String,
    pub description: String,
    pub status: MilestoneStatus,
    /// Ids of milestones this one depends on
    pub dependencies: Vec<String>,
    /// flow-id -> minimum state required for completion
    pub required_flows: BTreeMap<String, FlowState>,
    pub related_tasks: Vec<String>,
    pub implementation_plans: Vec<String>,
}

/// A named bucket of source files representing a functional slice of the
/// project. Themes are the primary key for context loading; they are
/// referenced by work items but never owned by them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Theme {
    pub name: String,
    pub category: String,
    pub description: String,
    /// Paths (files and directories) belonging to this theme
    pub paths: Vec<String>,
    pub linked_themes: Vec<String>,
    /// file path -> entry describing the other themes sharing it
    pub shared_files: BTreeMap<String, SharedFileEntry>,
    pub keywords: Vec<String>,
}

/// Record of a file shared between themes. Sharing beyond
/// `sharedFileThreshold` themes flags the file for reorganization review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedFileEntry {
    pub themes: Vec<String>,
    pub description: String,
}

/// One user-experience step within a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowStep {
    pub step_id: String,
    pub description: String,
    /// Step ids (possibly `flow-id:step-id` cross-flow) this step depends on
    pub dependencies: Vec<String>,
    pub status: FlowState,
}

/// An ordered set of user-experience steps, grouped into a domain flow file
/// and indexed centrally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub flow_id: String,
    /// File under `ProjectFlow/` holding this flow
    pub flow_file: String,
    pub name: String,
    pub steps: Vec<FlowStep>,
    pub primary_themes: Vec<String>,
    pub completion_percentage: u8,
}

impl Flow {
    /// Overall state derived from step states.
    pub fn state(&self) -> FlowState {
        if self.steps.is_empty() {
            return FlowState::NotStarted;
        }
        if self.steps.iter().all(|s| s.status == FlowState::Complete) {
            return FlowState::Complete;
        }
        if self.steps.iter().all(|s| s.status == FlowState::NotStarted) {
            return FlowState::NotStarted;
        }
        if self.steps.iter().any(|s| s.status == FlowState::NeedsReview) {
            return FlowState::NeedsReview;
        }
        FlowState::InProgress
    }
}

/// Implementation plan lifecycle. Versions are append-only; the highest
/// `Active` version per milestone is current.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Completed,
    Superseded,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Active => write!(f, "active"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// One phase of an implementation plan; phases feed task generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanPhase {
    pub name: String,
    pub description: String,
    pub completed: bool,
}

/// A versioned decomposition of a milestone (`M<n>-v<k>-<slug>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImplementationPlan {
    /// `M<n>-v<k>-<slug>` identifier
    pub id: String,
    pub milestone_id: String,
    pub status: PlanStatus,
    pub version: u32,
    pub phases: Vec<PlanPhase>,
    pub success_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Severity attached to noteworthy events and git change impacts.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// An append-only record of a notable project decision or incident
/// (`event-<epoch-ms>`). Never mutated; archived to dated files once the
/// current table exceeds its size limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteworthyEvent {
    pub id: String,
    /// Event class, e.g. `decision`, `escalation`, `reconciliation`
    pub event_type: String,
    pub title: String,
    pub primary_theme: Option<String>,
    pub related_task: Option<String>,
    pub related_session: Option<String>,
    pub impact: Severity,
    pub reasoning: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Branch registry lifecycle.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Merged,
    Deleted,
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStatus::Active => write!(f, "active"),
            BranchStatus::Merged => write!(f, "merged"),
            BranchStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Where the branch author identity came from.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorSource {
    GitConfig,
    Environment,
    System,
    Default,
}

impl std::fmt::Display for AuthorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorSource::GitConfig => write!(f, "git_config"),
            AuthorSource::Environment => write!(f, "environment"),
            AuthorSource::System => write!(f, "system"),
            AuthorSource::Default => write!(f, "default"),
        }
    }
}

/// Resolved branch author with the detection source recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchAuthor {
    pub name: String,
    pub email: String,
    pub source: AuthorSource,
}

/// A registered parallel work branch (`ai-pm-org-branch-NNN`).
///
/// Branch numbers are strictly monotonic and allocated inside the same
/// transaction that registers the branch, so concurrent creations never
/// collide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    /// `ai-pm-org-branch-<NNN>` name, number zero-padded to 3+ digits
    pub name: String,
    pub number: u32,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub created_by: BranchAuthor,
    /// Hash of the org-main commit the branch was cut from
    pub git_base_hash: String,
    pub status: BranchStatus,
}

/// Metadata file written to `.ai-pm-meta.json` on every work branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchMeta {
    pub branch_number: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: BranchAuthor,
    pub git_base_hash: String,
}

/// Outcome class of a reconciliation pass.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Clean,
    PendingApproval,
    ManualRequired,
    Reconciled,
}

impl std::fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationStatus::Clean => write!(f, "clean"),
            ReconciliationStatus::PendingApproval => write!(f, "pending_approval"),
            ReconciliationStatus::ManualRequired => write!(f, "manual_required"),
            ReconciliationStatus::Reconciled => write!(f, "reconciled"),
        }
    }
}

/// Tracked Git state for a project root: one current row per path, with
/// history retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitProjectState {
    pub project_path: String,
    pub current_git_hash: String,
    pub last_known_hash: Option<String>,
    pub last_sync: DateTime<Utc>,
    pub change_summary: String,
    pub affected_themes: Vec<String>,
    pub reconciliation_status: ReconciliationStatus,
}

/// Entity kinds the store persists and publishes notifications for.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Task,
    Subtask,
    Sidequest,
    Milestone,
    Theme,
    Flow,
    ImplementationPlan,
    NoteworthyEvent,
    Branch,
    GitProjectState,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Session => "session",
            EntityKind::Task => "task",
            EntityKind::Subtask => "subtask",
            EntityKind::Sidequest => "sidequest",
            EntityKind::Milestone => "milestone",
            EntityKind::Theme => "theme",
            EntityKind::Flow => "flow",
            EntityKind::ImplementationPlan => "implementation_plan",
            EntityKind::NoteworthyEvent => "noteworthy_event",
            EntityKind::Branch => "branch",
            EntityKind::GitProjectState => "git_project_state",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_status_transitions() {
        use WorkStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Blocked));

        assert!(InProgress.can_transition_to(Blocked));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Pending));

        assert!(Blocked.can_transition_to(InProgress));
        assert!(Blocked.can_transition_to(Cancelled));
        assert!(!Blocked.can_transition_to(Completed));
        assert!(!Blocked.can_transition_to(Pending));

        for target in [Pending, InProgress, Blocked, Completed, Cancelled] {
            assert!(!Completed.can_transition_to(target));
            assert!(!Cancelled.can_transition_to(target));
        }
    }

    #[test]
    fn test_no_same_state_transition() {
        assert!(!WorkStatus::InProgress.can_transition_to(WorkStatus::InProgress));
        assert!(!WorkStatus::Pending.can_transition_to(WorkStatus::Pending));
    }

    #[test]
    fn test_subtask_cannot_cancel() {
        assert!(!WorkStatus::Pending.can_transition_to_as_subtask(WorkStatus::Cancelled));
        assert!(!WorkStatus::Blocked.can_transition_to_as_subtask(WorkStatus::Cancelled));
        assert!(WorkStatus::Pending.can_transition_to_as_subtask(WorkStatus::InProgress));
        assert!(WorkStatus::InProgress.can_transition_to_as_subtask(WorkStatus::Completed));
    }

    #[test]
    fn test_context_mode_escalation_chain() {
        assert_eq!(ContextMode::Focused.escalated(), Some(ContextMode::Expanded));
        assert_eq!(ContextMode::Expanded.escalated(), Some(ContextMode::Wide));
        assert_eq!(ContextMode::Wide.escalated(), None);
    }

    #[test]
    fn test_flow_state_ordering_for_milestone_gates() {
        assert!(FlowState::Complete >= FlowState::InProgress);
        assert!(FlowState::InProgress < FlowState::Complete);
        assert!(FlowState::NotStarted < FlowState::InProgress);
        assert!(FlowState::NeedsReview < FlowState::Complete);
    }

    #[test]
    fn test_flow_derived_state() {
        let step = |id: &str, status: FlowState| FlowStep {
            step_id: id.to_string(),
            description: String::new(),
            dependencies: vec![],
            status,
        };

        let mut flow = Flow {
            flow_id: "registration-flow".to_string(),
            flow_file: "authentication-flow.json".to_string(),
            name: "Registration".to_string(),
            steps: vec![
                step("RF-01", FlowState::Complete),
                step("RF-02", FlowState::Complete),
            ],
            primary_themes: vec!["authentication".to_string()],
            completion_percentage: 100,
        };
        assert_eq!(flow.state(), FlowState::Complete);

        flow.steps[1].status = FlowState::InProgress;
        assert_eq!(flow.state(), FlowState::InProgress);

        flow.steps[1].status = FlowState::NeedsReview;
        assert_eq!(flow.state(), FlowState::NeedsReview);

        flow.steps = vec![];
        assert_eq!(flow.state(), FlowState::NotStarted);
    }

    #[test]
    fn test_acceptance_satisfied() {
        let mut task = Task {
            id: "TASK-20250712090000".to_string(),
            title: "Wire payment webhooks".to_string(),
            status: WorkStatus::InProgress,
            priority: Priority::High,
            milestone_id: "M-02".to_string(),
            primary_theme: "payment".to_string(),
            related_themes: vec!["api".to_string()],
            progress: 40,
            acceptance_criteria: vec![AcceptanceCriterion {
                description: "webhook retries are idempotent".to_string(),
                satisfied: false,
            }],
            dependencies: vec![],
            blocked_reason: None,
            escalation_count: 0,
            created_at: Utc::now(),
            last_updated: Utc::now(),
        };
        assert!(!task.acceptance_satisfied());
        task.acceptance_criteria[0].satisfied = true;
        assert!(task.acceptance_satisfied());
    }

    #[test]
    fn test_status_serde_round_trip() {
        let json = serde_json::to_string(&WorkStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let back: WorkStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WorkStatus::InProgress);

        let json = serde_json::to_string(&ContextMode::Focused).unwrap();
        assert_eq!(json, "\"focused\"");
    }
}

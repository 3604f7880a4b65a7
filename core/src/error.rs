use serde_json::json;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, PmError>;

/// Error kinds raised by the work and context orchestrator.
///
/// Every surfaced error carries a stable kind string (for protocol clients),
/// a short human-readable message, and a structured details payload.
/// Recoverable errors additionally suggest next steps: `LimitExceeded` lists
/// its four resolutions, `Busy` asks the caller to retry.
///
/// `Conflict` and `Busy` are retried internally by the store with bounded
/// backoff and only surface once retries are exhausted; every other kind
/// propagates to the caller unaltered; the core never masks a failed write
/// with a success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PmError {
    /// Entity not found by the given identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input failed schema or format validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A reference would dangle after the change set applied
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Concurrent write collided; retried internally up to the bound
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Too many tool calls queued on the store
    #[error("Store is busy: {0}")]
    Busy(String),

    /// Sidequest limit reached for the parent task
    #[error("Sidequest limit reached for task {task_id}: {active} active of {limit} allowed")]
    LimitExceeded {
        task_id: String,
        active: u32,
        limit: u32,
    },

    /// Task creation without a resolvable milestone
    #[error("Unknown milestone: {0}")]
    MissingMilestone(String),

    /// Referenced theme does not exist in the index
    #[error("Unknown theme: {0}")]
    UnknownTheme(String),

    /// Flow reference failed to resolve in the flow index
    #[error("Unknown flow reference: {0}")]
    UnknownFlowReference(String),

    /// Requested status change is not in the state graph, or a completion
    /// gate has not been satisfied
    #[error("Transition forbidden for {entity}: {from} -> {to}")]
    StateTransitionForbidden {
        entity: String,
        from: String,
        to: String,
    },

    /// Another task is already in-progress for this session
    #[error("Task {0} is already in progress this session")]
    ConcurrentTask(String),

    /// Git working tree must be clean for this operation
    #[error("Git working tree is dirty: {0}")]
    GitDirty(String),

    /// Merge produced conflicts; resolution is left to standard Git tools
    #[error("Merge of {branch} produced {} conflicted file(s)", conflicts.len())]
    MergeConflict {
        branch: String,
        conflicts: Vec<String>,
    },

    /// External source changes must be reconciled before proceeding
    #[error("Reconciliation required: {0}")]
    ReconciliationRequired(String),

    /// Session is no longer active
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Database operation error
    #[error("Database error: {0}")]
    Database(String),

    /// Git plumbing error
    #[error("Git error: {0}")]
    Git(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The four advisory resolutions returned with `LimitExceeded`.
pub const LIMIT_RESOLUTIONS: [&str; 4] = ["wait", "modify_existing", "replace", "raise_limit"];

impl PmError {
    /// Create a not found error for an entity kind and id
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound(format!("{kind} '{id}' not found"))
    }

    /// Create a transition error for any status-bearing entity
    pub fn forbidden_transition(
        entity: &str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::StateTransitionForbidden {
            entity: entity.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a validation error for an empty field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Stable machine-readable kind string
    pub fn kind(&self) -> &'static str {
        match self {
            PmError::NotFound(_) => "not_found",
            PmError::Validation(_) => "validation",
            PmError::Integrity(_) => "integrity",
            PmError::Conflict(_) => "conflict",
            PmError::Busy(_) => "busy",
            PmError::LimitExceeded { .. } => "limit_exceeded",
            PmError::MissingMilestone(_) => "missing_milestone",
            PmError::UnknownTheme(_) => "unknown_theme",
            PmError::UnknownFlowReference(_) => "unknown_flow_reference",
            PmError::StateTransitionForbidden { .. } => "state_transition_forbidden",
            PmError::ConcurrentTask(_) => "concurrent_task",
            PmError::GitDirty(_) => "git_dirty",
            PmError::MergeConflict { .. } => "merge_conflict",
            PmError::ReconciliationRequired(_) => "reconciliation_required",
            PmError::SessionExpired(_) => "session_expired",
            PmError::Database(_) => "database",
            PmError::Git(_) => "git",
            PmError::Configuration(_) => "configuration",
            PmError::Internal(_) => "internal",
        }
    }

    /// Structured details payload for protocol clients. Recoverable errors
    /// include a `resolutions` array the client can present.
    pub fn details(&self) -> serde_json::Value {
        match self {
            PmError::LimitExceeded {
                task_id,
                active,
                limit,
            } => json!({
                "task_id": task_id,
                "active_sidequests": active,
                "limit": limit,
                "resolutions": LIMIT_RESOLUTIONS,
            }),
            PmError::StateTransitionForbidden { entity, from, to } => json!({
                "entity": entity,
                "from": from,
                "to": to,
            }),
            PmError::MergeConflict { branch, conflicts } => json!({
                "branch": branch,
                "conflicts": conflicts,
                "resolutions": ["resolve with standard git tools, then retry"],
            }),
            PmError::Busy(_) => json!({ "resolutions": ["retry"] }),
            _ => json!({}),
        }
    }

    /// Whether the store may transparently retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, PmError::Conflict(_))
    }

    /// Check if this error indicates a not found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, PmError::NotFound(_))
    }

    /// Check if this error indicates a validation problem
    pub fn is_validation(&self) -> bool {
        matches!(self, PmError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkStatus;

    #[test]
    fn test_error_creation_and_kinds() {
        let error = PmError::not_found("task", "TASK-20250712090000");
        assert!(error.is_not_found());
        assert_eq!(error.kind(), "not_found");

        let error = PmError::empty_field("primary_theme");
        assert!(error.is_validation());
        assert_eq!(error.kind(), "validation");

        let error =
            PmError::forbidden_transition("M-02", WorkStatus::InProgress, WorkStatus::Completed);
        assert_eq!(error.kind(), "state_transition_forbidden");
    }

    #[test]
    fn test_limit_exceeded_resolutions() {
        let error = PmError::LimitExceeded {
            task_id: "TASK-20250712090000".to_string(),
            active: 3,
            limit: 3,
        };
        let details = error.details();
        let resolutions: Vec<String> =
            serde_json::from_value(details["resolutions"].clone()).unwrap();
        assert_eq!(
            resolutions,
            vec!["wait", "modify_existing", "replace", "raise_limit"]
        );
        assert_eq!(details["limit"], 3);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PmError::Conflict("row version moved".to_string()).is_retryable());
        assert!(!PmError::Busy("queue full".to_string()).is_retryable());
        assert!(!PmError::Database("disk".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = PmError::MergeConflict {
            branch: "ai-pm-org-branch-002".to_string(),
            conflicts: vec!["src/auth/mod.rs".to_string()],
        };
        assert_eq!(
            format!("{error}"),
            "Merge of ai-pm-org-branch-002 produced 1 conflicted file(s)"
        );

        let error = PmError::forbidden_transition("TASK-1", WorkStatus::Pending, WorkStatus::Blocked);
        assert_eq!(
            format!("{error}"),
            "Transition forbidden for TASK-1: pending -> blocked"
        );
    }
}

use chrono::{DateTime, Utc};
use pm_core::{
    error::{PmError, Result},
    models::{
        AuthorSource, Branch, BranchAuthor, BranchStatus, ContextMode, ContextSnapshot, FlowState,
        GitProjectState, ImpactLevel, NoteworthyEvent, ParentKind, Priority, ReconciliationStatus,
        Session, SessionStatus, Severity, Sidequest, Subtask, Task, WorkStatus,
    },
};
use sqlx::{sqlite::SqliteRow, Row};

/// Convert WorkStatus to its database string form
pub fn status_to_string(status: WorkStatus) -> &'static str {
    match status {
        WorkStatus::Pending => "pending",
        WorkStatus::InProgress => "in-progress",
        WorkStatus::Blocked => "blocked",
        WorkStatus::Completed => "completed",
        WorkStatus::Cancelled => "cancelled",
    }
}

/// Convert a database string back to WorkStatus
pub fn string_to_status(s: &str) -> Result<WorkStatus> {
    match s {
        "pending" => Ok(WorkStatus::Pending),
        "in-progress" => Ok(WorkStatus::InProgress),
        "blocked" => Ok(WorkStatus::Blocked),
        "completed" => Ok(WorkStatus::Completed),
        "cancelled" => Ok(WorkStatus::Cancelled),
        _ => Err(PmError::Database(format!(
            "Invalid work status in database: {s}"
        ))),
    }
}

pub fn context_mode_to_string(mode: ContextMode) -> &'static str {
    match mode {
        ContextMode::Focused => "focused",
        ContextMode::Expanded => "expanded",
        ContextMode::Wide => "wide",
    }
}

pub fn string_to_context_mode(s: &str) -> Result<ContextMode> {
    match s {
        "focused" => Ok(ContextMode::Focused),
        "expanded" => Ok(ContextMode::Expanded),
        "wide" => Ok(ContextMode::Wide),
        _ => Err(PmError::Database(format!(
            "Invalid context mode in database: {s}"
        ))),
    }
}

pub fn session_status_to_string(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
        SessionStatus::Terminated => "terminated",
    }
}

pub fn string_to_session_status(s: &str) -> Result<SessionStatus> {
    match s {
        "active" => Ok(SessionStatus::Active),
        "paused" => Ok(SessionStatus::Paused),
        "completed" => Ok(SessionStatus::Completed),
        "terminated" => Ok(SessionStatus::Terminated),
        _ => Err(PmError::Database(format!(
            "Invalid session status in database: {s}"
        ))),
    }
}

pub fn priority_to_string(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
    }
}

pub fn string_to_priority(s: &str) -> Result<Priority> {
    match s {
        "low" => Ok(Priority::Low),
        "medium" => Ok(Priority::Medium),
        "high" => Ok(Priority::High),
        _ => Err(PmError::Database(format!(
            "Invalid priority in database: {s}"
        ))),
    }
}

pub fn impact_to_string(impact: ImpactLevel) -> &'static str {
    match impact {
        ImpactLevel::Minimal => "minimal",
        ImpactLevel::Moderate => "moderate",
        ImpactLevel::Significant => "significant",
    }
}

pub fn string_to_impact(s: &str) -> Result<ImpactLevel> {
    match s {
        "minimal" => Ok(ImpactLevel::Minimal),
        "moderate" => Ok(ImpactLevel::Moderate),
        "significant" => Ok(ImpactLevel::Significant),
        _ => Err(PmError::Database(format!("Invalid impact in database: {s}"))),
    }
}

pub fn severity_to_string(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

pub fn string_to_severity(s: &str) -> Result<Severity> {
    match s {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        _ => Err(PmError::Database(format!(
            "Invalid severity in database: {s}"
        ))),
    }
}

pub fn flow_state_to_string(state: FlowState) -> &'static str {
    match state {
        FlowState::NotStarted => "not-started",
        FlowState::InProgress => "in-progress",
        FlowState::NeedsReview => "needs-review",
        FlowState::Complete => "complete",
    }
}

pub fn string_to_flow_state(s: &str) -> Result<FlowState> {
    match s {
        "not-started" => Ok(FlowState::NotStarted),
        "in-progress" => Ok(FlowState::InProgress),
        "needs-review" => Ok(FlowState::NeedsReview),
        "complete" => Ok(FlowState::Complete),
        _ => Err(PmError::Database(format!(
            "Invalid flow state in database: {s}"
        ))),
    }
}

pub fn branch_status_to_string(status: BranchStatus) -> &'static str {
    match status {
        BranchStatus::Active => "active",
        BranchStatus::Merged => "merged",
        BranchStatus::Deleted => "deleted",
    }
}

pub fn string_to_branch_status(s: &str) -> Result<BranchStatus> {
    match s {
        "active" => Ok(BranchStatus::Active),
        "merged" => Ok(BranchStatus::Merged),
        "deleted" => Ok(BranchStatus::Deleted),
        _ => Err(PmError::Database(format!(
            "Invalid branch status in database: {s}"
        ))),
    }
}

pub fn author_source_to_string(source: AuthorSource) -> &'static str {
    match source {
        AuthorSource::GitConfig => "git_config",
        AuthorSource::Environment => "environment",
        AuthorSource::System => "system",
        AuthorSource::Default => "default",
    }
}

pub fn string_to_author_source(s: &str) -> Result<AuthorSource> {
    match s {
        "git_config" => Ok(AuthorSource::GitConfig),
        "environment" => Ok(AuthorSource::Environment),
        "system" => Ok(AuthorSource::System),
        "default" => Ok(AuthorSource::Default),
        _ => Err(PmError::Database(format!(
            "Invalid author source in database: {s}"
        ))),
    }
}

pub fn reconciliation_status_to_string(status: ReconciliationStatus) -> &'static str {
    match status {
        ReconciliationStatus::Clean => "clean",
        ReconciliationStatus::PendingApproval => "pending_approval",
        ReconciliationStatus::ManualRequired => "manual_required",
        ReconciliationStatus::Reconciled => "reconciled",
    }
}

pub fn string_to_reconciliation_status(s: &str) -> Result<ReconciliationStatus> {
    match s {
        "clean" => Ok(ReconciliationStatus::Clean),
        "pending_approval" => Ok(ReconciliationStatus::PendingApproval),
        "manual_required" => Ok(ReconciliationStatus::ManualRequired),
        "reconciled" => Ok(ReconciliationStatus::Reconciled),
        _ => Err(PmError::Database(format!(
            "Invalid reconciliation status in database: {s}"
        ))),
    }
}

/// Parse a JSON list column; an empty or missing column is an empty list.
pub fn parse_string_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Serialize a string list for a JSON list column.
pub fn string_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Convert a SQLite row from `task_status` to a Task model
pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status_str: String = row.get("status");
    let priority_str: String = row.get("priority");

    Ok(Task {
        id: row.get("task_id"),
        title: row.get("title"),
        status: string_to_status(&status_str)?,
        priority: string_to_priority(&priority_str)?,
        milestone_id: row.get("milestone_id"),
        primary_theme: row.get("primary_theme"),
        related_themes: parse_string_list(row.try_get("related_themes").ok()),
        progress: row.get::<i64, _>("progress") as u8,
        acceptance_criteria: row
            .try_get::<String, _>("acceptance_criteria")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        dependencies: parse_string_list(row.try_get("dependencies").ok()),
        blocked_reason: row.try_get("blocked_reason").ok().flatten(),
        escalation_count: row.try_get::<i64, _>("escalation_count").unwrap_or(0) as u8,
        created_at: row.get("created_at"),
        last_updated: row.get("last_updated"),
    })
}

/// Convert a SQLite row from `sidequest_status` to a Sidequest model
pub fn row_to_sidequest(row: &SqliteRow) -> Result<Sidequest> {
    let status_str: String = row.get("status");
    let urgency_str: String = row.get("urgency");
    let impact_str: String = row.get("impact");

    Ok(Sidequest {
        id: row.get("sidequest_id"),
        parent_task_id: row.get("parent_task_id"),
        title: row.get("title"),
        scope_description: row.get("scope_description"),
        reason: row.get("reason"),
        urgency: string_to_priority(&urgency_str)?,
        impact: string_to_impact(&impact_str)?,
        status: string_to_status(&status_str)?,
        primary_theme: row.get("primary_theme"),
        inherited_themes: parse_string_list(row.try_get("inherited_themes").ok()),
        changed_parent_scope: row.get::<i64, _>("changed_parent_scope") != 0,
        created_at: row.get("created_at"),
        last_updated: row.get("last_updated"),
    })
}

/// Convert a SQLite row from `subtask_status` to a Subtask model
pub fn row_to_subtask(row: &SqliteRow) -> Result<Subtask> {
    let status_str: String = row.get("status");
    let mode_str: String = row.get("context_mode");
    let kind_str: String = row.get("parent_kind");

    let parent_kind = match kind_str.as_str() {
        "task" => ParentKind::Task,
        "sidequest" => ParentKind::Sidequest,
        other => {
            return Err(PmError::Database(format!(
                "Invalid parent kind in database: {other}"
            )))
        }
    };

    Ok(Subtask {
        id: row.get("subtask_id"),
        parent_id: row.get("parent_id"),
        parent_kind,
        description: row.get("description"),
        status: string_to_status(&status_str)?,
        flow_references: row
            .try_get::<String, _>("flow_references")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        files: parse_string_list(row.try_get("files").ok()),
        context_mode: string_to_context_mode(&mode_str)?,
        progress: row.get::<i64, _>("progress") as u8,
        created_at: row.get("created_at"),
        last_updated: row.get("last_updated"),
    })
}

/// Convert a SQLite row from `sessions` to a Session model
pub fn row_to_session(row: &SqliteRow) -> Result<Session> {
    let status_str: String = row.get("status");
    let mode_str: String = row.get("context_mode");

    Ok(Session {
        id: row.get("id"),
        start_time: row.get("start_time"),
        last_activity: row.get("last_activity"),
        context_mode: string_to_context_mode(&mode_str)?,
        active_themes: parse_string_list(row.try_get("active_themes").ok()),
        active_tasks: parse_string_list(row.try_get("active_tasks").ok()),
        active_sidequests: parse_string_list(row.try_get("active_sidequests").ok()),
        status: string_to_session_status(&status_str)?,
    })
}

/// Convert a SQLite row from `noteworthy_events` to a NoteworthyEvent model
pub fn row_to_event(row: &SqliteRow) -> Result<NoteworthyEvent> {
    let impact_str: String = row.get("impact");

    Ok(NoteworthyEvent {
        id: row.get("event_id"),
        event_type: row.get("event_type"),
        title: row.get("title"),
        primary_theme: row.try_get("primary_theme").ok().flatten(),
        related_task: row.try_get("related_task").ok().flatten(),
        related_session: row.try_get("related_session").ok().flatten(),
        impact: string_to_severity(&impact_str)?,
        reasoning: row.get("reasoning"),
        outcome: row.get("outcome"),
        created_at: row.get("created_at"),
        archived_at: row.try_get("archived_at").ok().flatten(),
    })
}

/// Convert a SQLite row from `ai_instance_branches` to a Branch model
pub fn row_to_branch(row: &SqliteRow) -> Result<Branch> {
    let status_str: String = row.get("status");
    let source_str: String = row.get("created_by_source");

    Ok(Branch {
        name: row.get("branch_name"),
        number: row.get::<i64, _>("branch_number") as u32,
        purpose: row.get("purpose"),
        created_at: row.get("created_at"),
        created_by: BranchAuthor {
            name: row.get("created_by_name"),
            email: row.get("created_by_email"),
            source: string_to_author_source(&source_str)?,
        },
        git_base_hash: row.get("git_base_hash"),
        status: string_to_branch_status(&status_str)?,
    })
}

/// Convert a SQLite row from `git_project_state` to a GitProjectState model
pub fn row_to_git_state(row: &SqliteRow) -> Result<GitProjectState> {
    let status_str: String = row.get("reconciliation_status");

    Ok(GitProjectState {
        project_path: row.get("project_path"),
        current_git_hash: row.get("current_git_hash"),
        last_known_hash: row.try_get("last_known_hash").ok().flatten(),
        last_sync: row.get("last_sync"),
        change_summary: row.get("change_summary"),
        affected_themes: parse_string_list(row.try_get("affected_themes").ok()),
        reconciliation_status: string_to_reconciliation_status(&status_str)?,
    })
}

/// Parse a `task_queue.context_snapshot` column.
pub fn parse_context_snapshot(raw: Option<String>) -> Result<Option<ContextSnapshot>> {
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| PmError::Database(format!("Corrupt context snapshot: {e}"))),
    }
}

/// Convert a sqlx error to the orchestrator's error kinds.
///
/// Unique-constraint collisions become `Conflict` (the store retries them),
/// foreign-key failures become `Integrity`, busy/locked become `Busy`.
pub fn sqlx_error_to_pm_error(err: sqlx::Error) -> PmError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            let message = db_err.message();

            if code == "2067" || message.contains("UNIQUE constraint failed") {
                PmError::Conflict(format!("Unique constraint violated: {message}"))
            } else if code == "787" || message.contains("FOREIGN KEY constraint failed") {
                PmError::Integrity(format!("Foreign key violated: {message}"))
            } else if code == "5" || message.contains("database is locked") {
                PmError::Busy("database is locked".to_string())
            } else {
                PmError::Database(format!("Database constraint error: {message}"))
            }
        }
        sqlx::Error::RowNotFound => {
            // Handled at the application level when expected
            PmError::Database("Unexpected RowNotFound error".to_string())
        }
        sqlx::Error::PoolTimedOut => PmError::Busy("Connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => PmError::Database(format!("Database I/O error: {io_err}")),
        _ => PmError::Database(format!("Database operation failed: {err}")),
    }
}

/// Format a timestamp the way trigger-generated stamps are formatted, for
/// comparisons in tests and queries.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

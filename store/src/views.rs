//! Typed queries over the prebuilt SQL views and the read surface the
//! engine components use. Mutations never happen here.

use chrono::{DateTime, Utc};
use sqlx::Row;

use pm_core::{
    error::Result,
    models::{
        Branch, ContextMode, FlowState, ImpactLevel, NoteworthyEvent, Severity, Sidequest,
        Subtask, Task, WorkStatus,
    },
};

use crate::common::{
    parse_string_list, row_to_branch, row_to_event, row_to_sidequest, row_to_subtask, row_to_task,
    sqlx_error_to_pm_error, status_to_string, string_to_context_mode, string_to_flow_state,
    string_to_impact, string_to_severity, string_to_status,
};
use crate::sqlite::Store;

/// Row of `active_sidequests_by_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSidequestRow {
    pub sidequest_id: String,
    pub parent_task_id: String,
    pub ordinal: u32,
    pub title: String,
    pub status: WorkStatus,
    pub impact: ImpactLevel,
    pub primary_theme: String,
    pub created_at: DateTime<Utc>,
}

/// Row of `sidequest_limit_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidequestLimitRow {
    pub task_id: String,
    pub active_sidequests_count: u32,
    pub session_limit_override: Option<u32>,
}

/// Row of `theme_flow_summary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeFlowSummaryRow {
    pub theme_name: String,
    pub flow_count: u32,
    pub flow_ids: Vec<String>,
}

/// Row of `flow_theme_summary`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowThemeSummaryRow {
    pub flow_id: String,
    pub flow_file: String,
    pub status: FlowState,
    pub completion_percentage: u8,
    pub theme_names: Vec<String>,
}

/// Row of `subtask_sidequest_summary`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskSidequestRow {
    pub parent_task_id: String,
    pub subtask_id: String,
    pub sidequest_id: String,
    pub sidequest_status: WorkStatus,
    pub sidequest_title: String,
    pub created_at: DateTime<Utc>,
}

/// Row of `event_impact_summary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventImpactRow {
    pub impact: Severity,
    pub event_count: u32,
}

/// Row of `theme_event_activity`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeEventActivityRow {
    pub theme_name: String,
    pub event_count: u32,
    pub latest_event_at: DateTime<Utc>,
}

/// The latest persisted session context snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContextRow {
    pub session_id: String,
    pub git_hash: Option<String>,
    pub context_mode: ContextMode,
    pub loaded_themes: Vec<String>,
    pub loaded_flows: Vec<String>,
    pub loaded_files: Vec<String>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

fn split_concat(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl Store {
    /// Non-terminal sidequests of one task, ordered by ordinal.
    pub async fn active_sidequests_by_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<ActiveSidequestRow>> {
        let rows = sqlx::query(
            "SELECT * FROM active_sidequests_by_task WHERE parent_task_id = ? ORDER BY ordinal",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let impact: String = row.get("impact");
                Ok(ActiveSidequestRow {
                    sidequest_id: row.get("sidequest_id"),
                    parent_task_id: row.get("parent_task_id"),
                    ordinal: row.get::<i64, _>("ordinal") as u32,
                    title: row.get("title"),
                    status: string_to_status(&status)?,
                    impact: string_to_impact(&impact)?,
                    primary_theme: row.get("primary_theme"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    /// Limit bookkeeping for one task (zero row means no sidequests yet).
    pub async fn sidequest_limit_status(&self, task_id: &str) -> Result<Option<SidequestLimitRow>> {
        let row = sqlx::query("SELECT * FROM sidequest_limit_status WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;

        Ok(row.map(|row| SidequestLimitRow {
            task_id: row.get("task_id"),
            active_sidequests_count: row.get::<i64, _>("active_sidequests_count") as u32,
            session_limit_override: row
                .try_get::<Option<i64>, _>("session_limit_override")
                .ok()
                .flatten()
                .map(|v| v as u32),
        }))
    }

    pub async fn theme_flow_summary(&self) -> Result<Vec<ThemeFlowSummaryRow>> {
        let rows = sqlx::query("SELECT * FROM theme_flow_summary ORDER BY theme_name")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;

        Ok(rows
            .iter()
            .map(|row| ThemeFlowSummaryRow {
                theme_name: row.get("theme_name"),
                flow_count: row.get::<i64, _>("flow_count") as u32,
                flow_ids: split_concat(row.try_get("flow_ids").ok().flatten()),
            })
            .collect())
    }

    pub async fn flow_theme_summary(&self) -> Result<Vec<FlowThemeSummaryRow>> {
        let rows = sqlx::query("SELECT * FROM flow_theme_summary ORDER BY flow_id")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(FlowThemeSummaryRow {
                    flow_id: row.get("flow_id"),
                    flow_file: row.get("flow_file"),
                    status: string_to_flow_state(&status)?,
                    completion_percentage: row.get::<i64, _>("completion_percentage") as u8,
                    theme_names: split_concat(row.try_get("theme_names").ok().flatten()),
                })
            })
            .collect()
    }

    pub async fn subtask_sidequest_summary(
        &self,
        task_id: &str,
    ) -> Result<Vec<SubtaskSidequestRow>> {
        let rows = sqlx::query(
            "SELECT * FROM subtask_sidequest_summary WHERE parent_task_id = ? ORDER BY created_at",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("sidequest_status");
                Ok(SubtaskSidequestRow {
                    parent_task_id: row.get("parent_task_id"),
                    subtask_id: row.get("subtask_id"),
                    sidequest_id: row.get("sidequest_id"),
                    sidequest_status: string_to_status(&status)?,
                    sidequest_title: row.get("sidequest_title"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    /// Most recent unarchived events, newest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<NoteworthyEvent>> {
        let rows = sqlx::query("SELECT * FROM recent_events LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_event).collect()
    }

    /// Count of unarchived events, used for the archival boundary.
    pub async fn current_event_count(&self) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM noteworthy_events WHERE archived_at IS NULL",
        )
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        Ok(count as u32)
    }

    pub async fn event_impact_summary(&self) -> Result<Vec<EventImpactRow>> {
        let rows = sqlx::query("SELECT * FROM event_impact_summary")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;

        rows.iter()
            .map(|row| {
                let impact: String = row.get("impact");
                Ok(EventImpactRow {
                    impact: string_to_severity(&impact)?,
                    event_count: row.get::<i64, _>("event_count") as u32,
                })
            })
            .collect()
    }

    pub async fn theme_event_activity(&self) -> Result<Vec<ThemeEventActivityRow>> {
        let rows = sqlx::query("SELECT * FROM theme_event_activity ORDER BY event_count DESC")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;

        Ok(rows
            .iter()
            .map(|row| ThemeEventActivityRow {
                theme_name: row.get("theme_name"),
                event_count: row.get::<i64, _>("event_count") as u32,
                latest_event_at: row.get("latest_event_at"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Read surface beyond the views
    // ------------------------------------------------------------------

    /// Tasks in the given status, oldest first.
    pub async fn tasks_with_status(&self, status: WorkStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM task_status WHERE status = ? ORDER BY created_at")
            .bind(status_to_string(status))
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_task).collect()
    }

    /// Every task that is not yet terminal.
    pub async fn open_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM task_status WHERE status IN ('pending', 'in-progress', 'blocked') ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_task).collect()
    }

    /// The session's in-progress task, if any.
    pub async fn in_progress_task(&self, session_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT * FROM task_status WHERE session_id = ? AND status = 'in-progress'",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// Subtasks of a task or sidequest, in id order.
    pub async fn subtasks_of(&self, parent_id: &str) -> Result<Vec<Subtask>> {
        let rows =
            sqlx::query("SELECT * FROM subtask_status WHERE parent_id = ? ORDER BY subtask_id")
                .bind(parent_id)
                .fetch_all(self.pool())
                .await
                .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_subtask).collect()
    }

    /// Every sidequest of a task regardless of status.
    pub async fn sidequests_of(&self, task_id: &str) -> Result<Vec<Sidequest>> {
        let rows = sqlx::query(
            "SELECT * FROM sidequest_status WHERE parent_task_id = ? ORDER BY ordinal",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_sidequest).collect()
    }

    /// All registered branches, newest number first.
    pub async fn branches(&self) -> Result<Vec<Branch>> {
        let rows = sqlx::query("SELECT * FROM ai_instance_branches ORDER BY branch_number DESC")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)?;
        rows.iter().map(row_to_branch).collect()
    }

    /// Count of branches still in `active` status.
    pub async fn active_branch_count(&self) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ai_instance_branches WHERE status = 'active'",
        )
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        Ok(count as u32)
    }

    /// The newest session context snapshot; ordering is by `last_activity`,
    /// so the latest wins.
    pub async fn latest_session_context(&self) -> Result<Option<SessionContextRow>> {
        let row = sqlx::query(
            "SELECT * FROM session_context ORDER BY last_activity DESC, id DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;

        row.map(|row| {
            let mode: String = row.get("context_mode");
            Ok(SessionContextRow {
                session_id: row.get("session_id"),
                git_hash: row.try_get("git_hash").ok().flatten(),
                context_mode: string_to_context_mode(&mode)?,
                loaded_themes: parse_string_list(row.try_get("loaded_themes").ok()),
                loaded_flows: parse_string_list(row.try_get("loaded_flows").ok()),
                loaded_files: parse_string_list(row.try_get("loaded_files").ok()),
                last_activity: row.get("last_activity"),
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    /// The task queue entry (pause context) for a task.
    pub async fn queued_context(&self, task_id: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT context_snapshot FROM task_queue WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_pm_error)
            .map(Option::flatten)
    }

    /// Whether a file was written through the store after the given instant.
    pub async fn file_written_since(
        &self,
        path: &std::path::Path,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_modifications WHERE file_path = ? AND operation = 'write' AND modified_at > ?",
        )
        .bind(path.to_string_lossy().into_owned())
        .bind(since)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_pm_error)?;
        Ok(count > 0)
    }
}

//! Task, subtask and sidequest lifecycle.
//!
//! The scheduler owns every status transition, the per-task sidequest limit,
//! and the context snapshots taken when a task pauses for a sidequest.
//! Every mutation it performs is one atomic paired write through the store,
//! which is what makes unclean-shutdown recovery loss-free: the last
//! committed work unit is exactly the state the next session resumes from.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use pm_core::{
    config::ProjectConfig,
    error::{PmError, Result},
    ids,
    models::{
        AcceptanceCriterion, ContextMode, ContextSnapshot, EntityKind, FlowReference,
        ImpactLevel, Milestone, MilestoneStatus, ParentKind, Priority, Severity, Sidequest,
        Subtask, Task, WorkStatus,
    },
    validation::FlowRefValidator,
};
use store::{common, ChangeSet, ChangeType, JsonStyle, OrdinalScope, SqlValue, Store};

use crate::fsutil;
use crate::theme_flow::ThemeFlowIndex;

/// Input for task creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub milestone_id: String,
    pub primary_theme: String,
    #[serde(default)]
    pub related_themes: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// Input for subtask creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub description: String,
    #[serde(default)]
    pub flow_references: Vec<FlowReference>,
    #[serde(default)]
    pub files: Vec<String>,
    pub context_mode: Option<ContextMode>,
}

/// Input for sidequest creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidequestSpec {
    pub title: String,
    #[serde(default)]
    pub scope_description: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_priority")]
    pub urgency: Priority,
    #[serde(default = "default_impact")]
    pub impact: ImpactLevel,
    pub primary_theme: String,
}

fn default_impact() -> ImpactLevel {
    ImpactLevel::Minimal
}

/// Addresses one work item for progress updates and transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkItemRef {
    Task { id: String },
    Sidequest { id: String },
    Subtask { parent_id: String, id: String },
}

/// Result of completing a sidequest: the archived sidequest plus the parent
/// context restored from the pause snapshot, when the parent resumed.
#[derive(Debug, Clone, PartialEq)]
pub struct SidequestCompletion {
    pub sidequest: Sidequest,
    pub parent_resumed: bool,
    pub restored_context: Option<ContextSnapshot>,
}

/// `Tasks/completion-path.json`: the declared milestones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionPathDoc {
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

/// Lifecycle owner for tasks, subtasks and sidequests.
pub struct Scheduler {
    store: Arc<Store>,
    config: Arc<ProjectConfig>,
    index: Arc<RwLock<ThemeFlowIndex>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        config: Arc<ProjectConfig>,
        index: Arc<RwLock<ThemeFlowIndex>>,
    ) -> Self {
        Self {
            store,
            config,
            index,
        }
    }

    /// Load the declared milestones from `completion-path.json`.
    pub fn completion_path(&self) -> Result<CompletionPathDoc> {
        let path = self.store.layout().completion_path();
        if !path.exists() {
            return Ok(CompletionPathDoc::default());
        }
        fsutil::read_json(&path)
    }

    /// Create a task under a milestone. Requires a resolvable milestone and
    /// a known primary theme.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        if spec.title.trim().is_empty() {
            return Err(PmError::empty_field("title"));
        }
        ids::validate_milestone_id(&spec.milestone_id)?;

        let path = self.completion_path()?;
        if !path.milestones.iter().any(|m| m.id == spec.milestone_id) {
            return Err(PmError::MissingMilestone(spec.milestone_id));
        }

        {
            let index = self.index.read().await;
            if !index.contains_theme(&spec.primary_theme) {
                return Err(PmError::UnknownTheme(spec.primary_theme));
            }
            for theme in &spec.related_themes {
                if !index.contains_theme(theme) {
                    return Err(PmError::UnknownTheme(theme.clone()));
                }
            }
        }

        let now = Utc::now();
        let task = Task {
            id: ids::task_id(now),
            title: spec.title,
            status: WorkStatus::Pending,
            priority: spec.priority,
            milestone_id: spec.milestone_id,
            primary_theme: spec.primary_theme,
            related_themes: spec.related_themes,
            progress: 0,
            acceptance_criteria: spec
                .acceptance_criteria
                .into_iter()
                .map(|description| AcceptanceCriterion {
                    description,
                    satisfied: false,
                })
                .collect(),
            dependencies: spec.dependencies,
            blocked_reason: None,
            escalation_count: 0,
            created_at: now,
            last_updated: now,
        };

        let change = ChangeSet::new(format!("create task {}", task.id))
            .statement(
                "INSERT INTO task_status (task_id, title, status, priority, milestone_id, primary_theme, \
                 related_themes, progress, acceptance_criteria, dependencies, created_at, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
                vec![
                    task.id.clone().into(),
                    task.title.clone().into(),
                    common::status_to_string(task.status).into(),
                    common::priority_to_string(task.priority).into(),
                    task.milestone_id.clone().into(),
                    task.primary_theme.clone().into(),
                    common::string_list(&task.related_themes).into(),
                    SqlValue::Text(serde_json::to_string(&task.acceptance_criteria).unwrap_or_default()),
                    common::string_list(&task.dependencies).into(),
                    now.into(),
                    now.into(),
                ],
            )
            .write_json(
                self.store.layout().active_task_file(&task.id),
                render_task_file(&task, &[]),
                JsonStyle::Machine,
            )
            .notify(EntityKind::Task, &task.id, ChangeType::Created);

        self.store.apply(change).await?;
        tracing::info!(task_id = %task.id, milestone = %task.milestone_id, "Task created");
        Ok(task)
    }

    /// Create a subtask under a task or sidequest. Flow references are
    /// checked against the index per the configured validation level.
    pub async fn create_subtask(
        &self,
        parent_kind: ParentKind,
        parent_id: &str,
        spec: SubtaskSpec,
    ) -> Result<Subtask> {
        let parent_status = match parent_kind {
            ParentKind::Task => {
                self.require_task(parent_id).await?.status
            }
            ParentKind::Sidequest => {
                self.require_sidequest(parent_id).await?.status
            }
        };
        if parent_status.is_terminal() {
            return Err(PmError::Validation(format!(
                "Cannot add subtasks to terminal parent '{parent_id}'"
            )));
        }

        {
            let index = self.index.read().await;
            let findings = FlowRefValidator::validate(
                self.config.validation.flow_references,
                index.catalog(),
                &spec.flow_references,
            )?;
            for finding in findings {
                tracing::warn!(
                    reference = %finding.reference,
                    "{}",
                    finding.message
                );
            }
        }

        let existing = self.store.subtasks_of(parent_id).await?;
        let now = Utc::now();
        let subtask = Subtask {
            id: ids::subtask_id(existing.len() as u32 + 1),
            parent_id: parent_id.to_string(),
            parent_kind,
            description: spec.description,
            status: WorkStatus::Pending,
            flow_references: spec.flow_references,
            files: spec.files,
            context_mode: spec
                .context_mode
                .unwrap_or(self.config.context_loading.default_mode),
            progress: 0,
            created_at: now,
            last_updated: now,
        };

        let mut change = ChangeSet::new(format!("create subtask {}/{}", parent_id, subtask.id))
            .statement(
                "INSERT INTO subtask_status (parent_id, parent_kind, subtask_id, description, status, \
                 flow_references, files, context_mode, progress, created_at, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
                vec![
                    subtask.parent_id.clone().into(),
                    subtask.parent_kind.to_string().into(),
                    subtask.id.clone().into(),
                    subtask.description.clone().into(),
                    common::status_to_string(subtask.status).into(),
                    SqlValue::Text(serde_json::to_string(&subtask.flow_references).unwrap_or_default()),
                    common::string_list(&subtask.files).into(),
                    common::context_mode_to_string(subtask.context_mode).into(),
                    now.into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::Subtask, &subtask.id, ChangeType::Created);

        if parent_kind == ParentKind::Task {
            let task = self.require_task(parent_id).await?;
            let mut subtasks = existing;
            subtasks.push(subtask.clone());
            change = change.write_json(
                self.store.layout().active_task_file(parent_id),
                render_task_file(&task, &subtasks),
                JsonStyle::Machine,
            );
        }

        self.store.apply(change).await?;
        Ok(subtask)
    }

    /// Move a task to in-progress for the session. Fails with
    /// `ConcurrentTask` when another task is already running.
    pub async fn start_task(&self, task_id: &str, session_id: &str) -> Result<Task> {
        let mut task = self.require_task(task_id).await?;

        if let Some(running) = self.store.in_progress_task(session_id).await? {
            if running.id != task_id {
                return Err(PmError::ConcurrentTask(running.id));
            }
            return Ok(running);
        }
        if !task.status.can_transition_to(WorkStatus::InProgress) {
            return Err(PmError::forbidden_transition(
                task_id,
                task.status,
                WorkStatus::InProgress,
            ));
        }

        task.status = WorkStatus::InProgress;
        task.blocked_reason = None;
        let subtasks = self.store.subtasks_of(task_id).await?;

        let change = ChangeSet::new(format!("start task {task_id}"))
            .statement(
                "UPDATE task_status SET status = 'in-progress', blocked_reason = NULL, session_id = ? WHERE task_id = ?",
                vec![session_id.into(), task_id.into()],
            )
            .write_json(
                self.store.layout().active_task_file(task_id),
                render_task_file(&task, &subtasks),
                JsonStyle::Machine,
            )
            .notify(EntityKind::Task, task_id, ChangeType::Updated);

        self.store.apply(change).await?;
        tracing::info!(task_id, session_id, "Task started");
        Ok(task)
    }

    /// Transition a task through the state graph, enforcing completion
    /// gates and cancellation cascade.
    pub async fn transition_task(&self, task_id: &str, new_status: WorkStatus) -> Result<Task> {
        let mut task = self.require_task(task_id).await?;

        if !task.status.can_transition_to(new_status) {
            return Err(PmError::forbidden_transition(task_id, task.status, new_status));
        }

        let subtasks = self.store.subtasks_of(task_id).await?;
        let active_sidequests = self.store.active_sidequests_by_task(task_id).await?;

        if new_status == WorkStatus::Completed {
            if subtasks.iter().any(|s| s.status != WorkStatus::Completed) {
                return Err(PmError::forbidden_transition(task_id, task.status, new_status));
            }
            if !active_sidequests.is_empty() {
                return Err(PmError::forbidden_transition(task_id, task.status, new_status));
            }
            if !task.acceptance_satisfied() {
                return Err(PmError::forbidden_transition(task_id, task.status, new_status));
            }
        }

        task.status = new_status;
        if new_status != WorkStatus::Blocked {
            task.blocked_reason = None;
        }

        let mut change = ChangeSet::new(format!("transition task {task_id} to {new_status}"))
            .statement(
                "UPDATE task_status SET status = ?, blocked_reason = ? WHERE task_id = ?",
                vec![
                    common::status_to_string(new_status).into(),
                    task.blocked_reason.clone().into(),
                    task_id.into(),
                ],
            )
            .notify(EntityKind::Task, task_id, ChangeType::Updated);

        if new_status == WorkStatus::Cancelled {
            // Cancelling a parent cancels its live sidequests and discards
            // the pause snapshot.
            for sidequest in &active_sidequests {
                change = change
                    .statement(
                        "UPDATE sidequest_status SET status = 'cancelled' WHERE sidequest_id = ?",
                        vec![sidequest.sidequest_id.clone().into()],
                    )
                    .rename(
                        self.store.layout().sidequest_file(&sidequest.sidequest_id),
                        self.store
                            .layout()
                            .archived_sidequest_file(&sidequest.sidequest_id),
                    )
                    .notify(
                        EntityKind::Sidequest,
                        &sidequest.sidequest_id,
                        ChangeType::Updated,
                    );
            }
            change = change.statement(
                "DELETE FROM task_queue WHERE task_id = ?",
                vec![task_id.into()],
            );
        }

        if new_status.is_terminal() {
            let active = self.store.layout().active_task_file(task_id);
            change = change
                .write_json(
                    active.clone(),
                    render_task_file(&task, &subtasks),
                    JsonStyle::Machine,
                )
                .rename(active, self.store.layout().archived_task_file(task_id))
                .notify(EntityKind::Task, task_id, ChangeType::Archived);
        } else {
            change = change.write_json(
                self.store.layout().active_task_file(task_id),
                render_task_file(&task, &subtasks),
                JsonStyle::Machine,
            );
        }

        self.store.apply(change).await?;
        tracing::info!(task_id, status = %new_status, "Task transitioned");
        Ok(task)
    }

    /// Transition a subtask (same graph as tasks minus cancellation).
    pub async fn transition_subtask(
        &self,
        parent_id: &str,
        subtask_id: &str,
        new_status: WorkStatus,
    ) -> Result<Subtask> {
        let mut subtask = self
            .store
            .get_subtask(parent_id, subtask_id)
            .await?
            .ok_or_else(|| PmError::not_found("subtask", subtask_id))?;

        if !subtask.status.can_transition_to_as_subtask(new_status) {
            return Err(PmError::forbidden_transition(
                subtask_id,
                subtask.status,
                new_status,
            ));
        }
        subtask.status = new_status;

        let mut change = ChangeSet::new(format!(
            "transition subtask {parent_id}/{subtask_id} to {new_status}"
        ))
        .statement(
            "UPDATE subtask_status SET status = ? WHERE parent_id = ? AND subtask_id = ?",
            vec![
                common::status_to_string(new_status).into(),
                parent_id.into(),
                subtask_id.into(),
            ],
        )
        .notify(EntityKind::Subtask, subtask_id, ChangeType::Updated);

        if subtask.parent_kind == ParentKind::Task {
            if let Some(task) = self.store.get_task(parent_id).await? {
                let mut subtasks = self.store.subtasks_of(parent_id).await?;
                if let Some(slot) = subtasks.iter_mut().find(|s| s.id == subtask.id) {
                    slot.status = new_status;
                }
                change = change.write_json(
                    self.store.layout().active_task_file(parent_id),
                    render_task_file(&task, &subtasks),
                    JsonStyle::Machine,
                );
            }
        }

        self.store.apply(change).await?;
        Ok(subtask)
    }

    /// The effective sidequest limit for a task: the session override when
    /// present, otherwise the configured maximum.
    pub async fn effective_sidequest_limit(&self, task_id: &str) -> Result<u32> {
        let row = self.store.sidequest_limit_status(task_id).await?;
        Ok(row
            .and_then(|r| r.session_limit_override)
            .unwrap_or(self.config.tasks.max_active_sidequests))
    }

    /// Create a sidequest under an in-progress (or already paused) task.
    ///
    /// At the limit this returns `LimitExceeded` carrying the four advisory
    /// resolutions and mutates nothing. Otherwise the parent is paused with
    /// a context snapshot and the sidequest lands in one paired write.
    pub async fn create_sidequest(
        &self,
        parent_task_id: &str,
        spec: SidequestSpec,
    ) -> Result<Sidequest> {
        let parent = self.require_task(parent_task_id).await?;
        if !matches!(parent.status, WorkStatus::InProgress | WorkStatus::Blocked) {
            return Err(PmError::Validation(format!(
                "Task '{parent_task_id}' must be in-progress to spawn a sidequest (is {})",
                parent.status
            )));
        }

        let active = self.store.active_sidequests_by_task(parent_task_id).await?;
        let limit = self.effective_sidequest_limit(parent_task_id).await?;
        if active.len() as u32 >= limit {
            return Err(PmError::LimitExceeded {
                task_id: parent_task_id.to_string(),
                active: active.len() as u32,
                limit,
            });
        }

        {
            let index = self.index.read().await;
            if !index.contains_theme(&spec.primary_theme) {
                return Err(PmError::UnknownTheme(spec.primary_theme));
            }
        }

        let now = Utc::now();
        let id_template = format!("SQ-{}-{{{{ordinal3}}}}", now.format("%Y%m%d%H%M%S"));
        let mut inherited = vec![parent.primary_theme.clone()];
        inherited.extend(parent.related_themes.iter().cloned());

        let sidequest = Sidequest {
            id: id_template.clone(),
            parent_task_id: parent_task_id.to_string(),
            title: spec.title,
            scope_description: spec.scope_description,
            reason: spec.reason,
            urgency: spec.urgency,
            impact: spec.impact,
            status: WorkStatus::Pending,
            primary_theme: spec.primary_theme,
            inherited_themes: inherited,
            changed_parent_scope: false,
            created_at: now,
            last_updated: now,
        };

        let pausing = parent.status == WorkStatus::InProgress;
        let blocked_reason = format!("sidequest:{id_template}");

        let mut change = ChangeSet::new(format!("create sidequest under {parent_task_id}"))
            .with_ordinal(OrdinalScope::Sidequest {
                parent_task_id: parent_task_id.to_string(),
            })
            .statement(
                "INSERT INTO sidequest_status (sidequest_id, parent_task_id, ordinal, title, scope_description, \
                 reason, urgency, impact, status, primary_theme, inherited_themes, changed_parent_scope, \
                 created_at, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, 0, ?, ?)",
                vec![
                    id_template.clone().into(),
                    parent_task_id.into(),
                    "{{ordinal}}".into(),
                    sidequest.title.clone().into(),
                    sidequest.scope_description.clone().into(),
                    sidequest.reason.clone().into(),
                    common::priority_to_string(sidequest.urgency).into(),
                    common::impact_to_string(sidequest.impact).into(),
                    sidequest.primary_theme.clone().into(),
                    common::string_list(&sidequest.inherited_themes).into(),
                    now.into(),
                    now.into(),
                ],
            )
            .write_json(
                self.store.layout().sidequest_file(&id_template),
                serde_json::to_value(&sidequest).unwrap_or_default(),
                JsonStyle::Machine,
            )
            .notify(EntityKind::Sidequest, &id_template, ChangeType::Created);

        if pausing {
            let snapshot = self.capture_context_snapshot(parent_task_id, now).await?;
            if let Some(paused_subtask) = &snapshot.paused_subtask_id {
                change = change.statement(
                    "INSERT INTO subtask_sidequest_relationships (parent_task_id, subtask_id, sidequest_id, created_at) \
                     VALUES (?, ?, ?, ?)",
                    vec![
                        parent_task_id.into(),
                        paused_subtask.clone().into(),
                        id_template.clone().into(),
                        now.into(),
                    ],
                );
            }
            change = change
                .statement(
                    "INSERT INTO task_queue (task_id, queued_at, reason, context_snapshot) VALUES (?, ?, ?, ?) \
                     ON CONFLICT(task_id) DO UPDATE SET queued_at = excluded.queued_at, \
                     reason = excluded.reason, context_snapshot = excluded.context_snapshot",
                    vec![
                        parent_task_id.into(),
                        now.into(),
                        blocked_reason.clone().into(),
                        SqlValue::Text(serde_json::to_string(&snapshot).unwrap_or_default()),
                    ],
                )
                .statement(
                    "UPDATE task_status SET status = 'blocked', blocked_reason = ? WHERE task_id = ?",
                    vec![blocked_reason.clone().into(), parent_task_id.into()],
                );

            let mut paused_parent = parent.clone();
            paused_parent.status = WorkStatus::Blocked;
            paused_parent.blocked_reason = Some(blocked_reason);
            let subtasks = self.store.subtasks_of(parent_task_id).await?;
            change = change
                .write_json(
                    self.store.layout().active_task_file(parent_task_id),
                    render_task_file(&paused_parent, &subtasks),
                    JsonStyle::Machine,
                )
                .notify(EntityKind::Task, parent_task_id, ChangeType::Updated);
        }

        let applied = self.store.apply(change).await?;
        let ordinal = applied
            .ordinal
            .ok_or_else(|| PmError::Internal("Sidequest ordinal was not allocated".to_string()))?;
        let id = id_template.replace("{{ordinal3}}", &format!("{ordinal:03}"));

        let created = self
            .store
            .get_sidequest(&id)
            .await?
            .ok_or_else(|| PmError::Internal(format!("Sidequest '{id}' missing after insert")))?;
        tracing::info!(sidequest_id = %id, parent_task_id, "Sidequest created, parent paused");
        Ok(created)
    }

    /// Start a pending sidequest.
    pub async fn start_sidequest(&self, sidequest_id: &str) -> Result<Sidequest> {
        let mut sidequest = self.require_sidequest(sidequest_id).await?;
        if !sidequest.status.can_transition_to(WorkStatus::InProgress) {
            return Err(PmError::forbidden_transition(
                sidequest_id,
                sidequest.status,
                WorkStatus::InProgress,
            ));
        }
        sidequest.status = WorkStatus::InProgress;

        let change = ChangeSet::new(format!("start sidequest {sidequest_id}"))
            .statement(
                "UPDATE sidequest_status SET status = 'in-progress' WHERE sidequest_id = ?",
                vec![sidequest_id.into()],
            )
            .write_json(
                self.store.layout().sidequest_file(sidequest_id),
                serde_json::to_value(&sidequest).unwrap_or_default(),
                JsonStyle::Machine,
            )
            .notify(EntityKind::Sidequest, sidequest_id, ChangeType::Updated);
        self.store.apply(change).await?;
        Ok(sidequest)
    }

    /// Complete a sidequest: verify its subtasks, archive its file, and
    /// resume the parent from the pause snapshot when no other sidequest
    /// keeps it blocked.
    pub async fn complete_sidequest(&self, sidequest_id: &str) -> Result<SidequestCompletion> {
        let mut sidequest = self.require_sidequest(sidequest_id).await?;
        if !sidequest.status.can_transition_to(WorkStatus::Completed) {
            return Err(PmError::forbidden_transition(
                sidequest_id,
                sidequest.status,
                WorkStatus::Completed,
            ));
        }

        let subtasks = self.store.subtasks_of(sidequest_id).await?;
        if subtasks.iter().any(|s| s.status != WorkStatus::Completed) {
            return Err(PmError::Validation(format!(
                "Sidequest '{sidequest_id}' has incomplete subtasks"
            )));
        }

        let parent_id = sidequest.parent_task_id.clone();
        // A scope-changing sidequest must have rewritten the parent task
        // file before it can archive. The reference instant is the moment
        // the scope change was marked (`last_updated`), not creation: the
        // creating write itself touches the parent file.
        if sidequest.changed_parent_scope {
            let parent_file = self.store.layout().active_task_file(&parent_id);
            let updated = self
                .store
                .file_written_since(&parent_file, sidequest.last_updated)
                .await?;
            if !updated {
                return Err(PmError::Validation(format!(
                    "Sidequest '{sidequest_id}' changed the scope of '{parent_id}' but the task file was never updated"
                )));
            }
        }

        let others_active = self
            .store
            .active_sidequests_by_task(&parent_id)
            .await?
            .into_iter()
            .filter(|row| row.sidequest_id != sidequest_id)
            .count();
        let parent_resumed = others_active == 0;

        let restored_context = match self.store.queued_context(&parent_id).await? {
            Some(raw) => common::parse_context_snapshot(Some(raw))?,
            None => None,
        };

        sidequest.status = WorkStatus::Completed;
        let mut change = ChangeSet::new(format!("complete sidequest {sidequest_id}"))
            .statement(
                "UPDATE sidequest_status SET status = 'completed' WHERE sidequest_id = ?",
                vec![sidequest_id.into()],
            )
            .write_json(
                self.store.layout().sidequest_file(sidequest_id),
                serde_json::to_value(&sidequest).unwrap_or_default(),
                JsonStyle::Machine,
            )
            .rename(
                self.store.layout().sidequest_file(sidequest_id),
                self.store.layout().archived_sidequest_file(sidequest_id),
            )
            .notify(EntityKind::Sidequest, sidequest_id, ChangeType::Archived);

        if parent_resumed {
            change = change
                .statement(
                    "UPDATE task_status SET status = 'in-progress', blocked_reason = NULL WHERE task_id = ? AND status = 'blocked'",
                    vec![parent_id.clone().into()],
                )
                .statement(
                    "DELETE FROM task_queue WHERE task_id = ?",
                    vec![parent_id.clone().into()],
                )
                .notify(EntityKind::Task, &parent_id, ChangeType::Updated);

            if let Some(mut parent) = self.store.get_task(&parent_id).await? {
                parent.status = WorkStatus::InProgress;
                parent.blocked_reason = None;
                let parent_subtasks = self.store.subtasks_of(&parent_id).await?;
                change = change.write_json(
                    self.store.layout().active_task_file(&parent_id),
                    render_task_file(&parent, &parent_subtasks),
                    JsonStyle::Machine,
                );
            }
        }

        self.store.apply(change).await?;
        tracing::info!(
            sidequest_id,
            parent_task_id = %parent_id,
            parent_resumed,
            "Sidequest completed"
        );

        Ok(SidequestCompletion {
            sidequest,
            parent_resumed,
            restored_context: restored_context.filter(|_| parent_resumed),
        })
    }

    /// Mark a sidequest as having changed its parent task's scope.
    pub async fn mark_scope_change(&self, sidequest_id: &str) -> Result<()> {
        let mut sidequest = self.require_sidequest(sidequest_id).await?;
        sidequest.changed_parent_scope = true;
        let change = ChangeSet::new(format!("mark scope change on {sidequest_id}"))
            .statement(
                "UPDATE sidequest_status SET changed_parent_scope = 1 WHERE sidequest_id = ?",
                vec![sidequest_id.into()],
            )
            .write_json(
                self.store.layout().sidequest_file(sidequest_id),
                serde_json::to_value(&sidequest).unwrap_or_default(),
                JsonStyle::Machine,
            )
            .notify(EntityKind::Sidequest, sidequest_id, ChangeType::Updated);
        self.store.apply(change).await?;
        Ok(())
    }

    /// Update progress on a work item. Every invocation is one atomic
    /// paired write; this is the real-time preservation contract that makes
    /// unclean-shutdown recovery loss-free.
    pub async fn update_progress(
        &self,
        item: WorkItemRef,
        progress: u8,
        notes: Option<String>,
    ) -> Result<()> {
        let progress = progress.min(100);
        let now = Utc::now();

        let change = match &item {
            WorkItemRef::Task { id } => {
                let mut task = self.require_task(id).await?;
                task.progress = progress;
                let subtasks = self.store.subtasks_of(id).await?;
                let mut value = render_task_file(&task, &subtasks);
                if let Some(note) = &notes {
                    value["lastProgressNote"] = json!(note);
                }
                ChangeSet::new(format!("progress {id} -> {progress}"))
                    .statement(
                        "UPDATE task_status SET progress = ? WHERE task_id = ?",
                        vec![u32::from(progress).into(), id.clone().into()],
                    )
                    .statement(
                        "INSERT INTO task_metrics (task_id, metric, value, recorded_at) VALUES (?, 'progress', ?, ?)",
                        vec![
                            id.clone().into(),
                            SqlValue::Real(f64::from(progress)),
                            now.into(),
                        ],
                    )
                    .write_json(
                        self.store.layout().active_task_file(id),
                        value,
                        JsonStyle::Machine,
                    )
                    .notify(EntityKind::Task, id, ChangeType::Updated)
            }
            WorkItemRef::Sidequest { id } => {
                let sidequest = self.require_sidequest(id).await?;
                let mut value = serde_json::to_value(&sidequest).unwrap_or_default();
                value["progress"] = json!(progress);
                if let Some(note) = &notes {
                    value["lastProgressNote"] = json!(note);
                }
                ChangeSet::new(format!("progress {id} -> {progress}"))
                    .statement(
                        "UPDATE sidequest_status SET last_updated = ? WHERE sidequest_id = ?",
                        vec![now.into(), id.clone().into()],
                    )
                    .write_json(
                        self.store.layout().sidequest_file(id),
                        value,
                        JsonStyle::Machine,
                    )
                    .notify(EntityKind::Sidequest, id, ChangeType::Updated)
            }
            WorkItemRef::Subtask { parent_id, id } => {
                let subtask = self
                    .store
                    .get_subtask(parent_id, id)
                    .await?
                    .ok_or_else(|| PmError::not_found("subtask", id))?;
                let mut change = ChangeSet::new(format!("progress {parent_id}/{id} -> {progress}"))
                    .statement(
                        "UPDATE subtask_status SET progress = ? WHERE parent_id = ? AND subtask_id = ?",
                        vec![
                            u32::from(progress).into(),
                            parent_id.clone().into(),
                            id.clone().into(),
                        ],
                    )
                    .notify(EntityKind::Subtask, id, ChangeType::Updated);
                if subtask.parent_kind == ParentKind::Task {
                    if let Some(task) = self.store.get_task(parent_id).await? {
                        let mut subtasks = self.store.subtasks_of(parent_id).await?;
                        if let Some(slot) = subtasks.iter_mut().find(|s| s.id == *id) {
                            slot.progress = progress;
                        }
                        let mut value = render_task_file(&task, &subtasks);
                        if let Some(note) = &notes {
                            value["lastProgressNote"] = json!(note);
                        }
                        change = change.write_json(
                            self.store.layout().active_task_file(parent_id),
                            value,
                            JsonStyle::Machine,
                        );
                    }
                }
                change
            }
        };

        self.store.apply(change).await?;
        Ok(())
    }

    /// Raise the sidequest limit for this session only, recording the
    /// decision as a noteworthy event.
    pub async fn raise_sidequest_limit(
        &self,
        task_id: &str,
        new_limit: u32,
        session_id: &str,
    ) -> Result<()> {
        self.require_task(task_id).await?;
        if new_limit < self.config.tasks.max_active_sidequests {
            return Err(PmError::Validation(format!(
                "Session override {new_limit} is below the configured limit {}",
                self.config.tasks.max_active_sidequests
            )));
        }
        let now = Utc::now();
        let event_id = ids::event_id(now);
        let change = ChangeSet::new(format!("raise sidequest limit on {task_id}"))
            .statement(
                "INSERT INTO task_sidequest_limits (task_id, active_sidequests_count, session_limit_override, last_updated) \
                 VALUES (?, 0, ?, ?) \
                 ON CONFLICT(task_id) DO UPDATE SET session_limit_override = excluded.session_limit_override, \
                 last_updated = excluded.last_updated",
                vec![task_id.into(), new_limit.into(), now.into()],
            )
            .statement(
                "INSERT INTO noteworthy_events (event_id, event_type, title, related_task, related_session, impact, reasoning, outcome, created_at) \
                 VALUES (?, 'decision', ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    event_id.clone().into(),
                    format!("Sidequest limit raised to {new_limit}").into(),
                    task_id.into(),
                    session_id.into(),
                    common::severity_to_string(Severity::Medium).into(),
                    "limit_exceeded resolution: raise_limit".into(),
                    format!("session override {new_limit} on {task_id}").into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::NoteworthyEvent, event_id, ChangeType::Created);
        self.store.apply(change).await?;
        Ok(())
    }

    /// Complete a milestone. Gated on milestone dependencies, required
    /// flow states, and every implementation plan being completed.
    pub async fn complete_milestone(&self, milestone_id: &str) -> Result<Milestone> {
        let mut doc = self.completion_path()?;
        let position = doc
            .milestones
            .iter()
            .position(|m| m.id == milestone_id)
            .ok_or_else(|| PmError::not_found("milestone", milestone_id))?;

        {
            let milestone = &doc.milestones[position];
            if milestone.status == MilestoneStatus::Completed {
                return Err(PmError::forbidden_transition(
                    milestone_id,
                    MilestoneStatus::Completed,
                    MilestoneStatus::Completed,
                ));
            }

            for dependency in &milestone.dependencies {
                let done = doc
                    .milestones
                    .iter()
                    .any(|m| &m.id == dependency && m.status == MilestoneStatus::Completed);
                if !done {
                    return Err(PmError::forbidden_transition(
                        milestone_id,
                        milestone.status,
                        MilestoneStatus::Completed,
                    ));
                }
            }

            // Every required flow must have reached its required state.
            let index = self.index.read().await;
            for (flow_id, required) in &milestone.required_flows {
                let state = index
                    .flow(flow_id)
                    .map(|f| f.state())
                    .ok_or_else(|| PmError::UnknownFlowReference(flow_id.clone()))?;
                if state < *required {
                    return Err(PmError::forbidden_transition(
                        milestone_id,
                        milestone.status,
                        MilestoneStatus::Completed,
                    ));
                }
            }

            // Every implementation plan must have been archived to completed/.
            for plan_id in &milestone.implementation_plans {
                if self.store.layout().active_plan_file(plan_id).exists() {
                    return Err(PmError::forbidden_transition(
                        milestone_id,
                        milestone.status,
                        MilestoneStatus::Completed,
                    ));
                }
            }
        }

        doc.milestones[position].status = MilestoneStatus::Completed;
        let completed = doc.milestones[position].clone();

        let now = Utc::now();
        let event_id = ids::event_id(now);
        let change = ChangeSet::new(format!("complete milestone {milestone_id}"))
            .write_json(
                self.store.layout().completion_path(),
                serde_json::to_value(&doc).unwrap_or_default(),
                JsonStyle::UserEdited,
            )
            .statement(
                "INSERT INTO noteworthy_events (event_id, event_type, title, impact, reasoning, outcome, created_at) \
                 VALUES (?, 'decision', ?, ?, ?, ?, ?)",
                vec![
                    event_id.clone().into(),
                    format!("Milestone {milestone_id} completed").into(),
                    common::severity_to_string(Severity::High).into(),
                    "all required flows and plans satisfied".into(),
                    format!("{milestone_id} -> completed").into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::Milestone, milestone_id, ChangeType::Updated)
            .notify(EntityKind::NoteworthyEvent, event_id, ChangeType::Created);

        self.store.apply(change).await?;
        tracing::info!(milestone_id, "Milestone completed");
        Ok(completed)
    }

    async fn capture_context_snapshot(
        &self,
        task_id: &str,
        at: chrono::DateTime<Utc>,
    ) -> Result<ContextSnapshot> {
        let subtasks = self.store.subtasks_of(task_id).await?;
        let paused = subtasks
            .iter()
            .find(|s| s.status == WorkStatus::InProgress);

        let session = self.store.latest_session_context().await?;
        let (themes, flows, files) = session
            .map(|s| (s.loaded_themes, s.loaded_flows, s.loaded_files))
            .unwrap_or_default();

        Ok(ContextSnapshot {
            paused_subtask_id: paused.map(|s| s.id.clone()),
            paused_progress: paused.map(|s| s.progress).unwrap_or(0),
            loaded_themes: themes,
            loaded_flows: flows,
            loaded_files: files,
            paused_at: at,
        })
    }

    async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PmError::not_found("task", task_id))
    }

    async fn require_sidequest(&self, sidequest_id: &str) -> Result<Sidequest> {
        self.store
            .get_sidequest(sidequest_id)
            .await?
            .ok_or_else(|| PmError::not_found("sidequest", sidequest_id))
    }
}

/// Render a task and its subtasks to the `Tasks/active/<id>.json` document.
pub fn render_task_file(task: &Task, subtasks: &[Subtask]) -> serde_json::Value {
    let mut value = serde_json::to_value(task).unwrap_or_default();
    value["subtasks"] = serde_json::to_value(subtasks).unwrap_or_default();
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_ref_serde() {
        let item: WorkItemRef = serde_json::from_str(
            r#"{"kind": "subtask", "parent_id": "TASK-20250712090000", "id": "ST-02"}"#,
        )
        .unwrap();
        assert_eq!(
            item,
            WorkItemRef::Subtask {
                parent_id: "TASK-20250712090000".to_string(),
                id: "ST-02".to_string()
            }
        );
    }

    #[test]
    fn test_task_spec_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"title": "Add webhooks", "milestone_id": "M-01", "primary_theme": "payment"}"#,
        )
        .unwrap();
        assert_eq!(spec.priority, Priority::Medium);
        assert!(spec.related_themes.is_empty());
        assert!(spec.acceptance_criteria.is_empty());
    }

    #[test]
    fn test_render_task_file_includes_subtasks() {
        let now = Utc::now();
        let task = Task {
            id: "TASK-20250712090000".to_string(),
            title: "t".to_string(),
            status: WorkStatus::InProgress,
            priority: Priority::Medium,
            milestone_id: "M-01".to_string(),
            primary_theme: "payment".to_string(),
            related_themes: vec![],
            progress: 10,
            acceptance_criteria: vec![],
            dependencies: vec![],
            blocked_reason: None,
            escalation_count: 0,
            created_at: now,
            last_updated: now,
        };
        let subtask = Subtask {
            id: "ST-01".to_string(),
            parent_id: task.id.clone(),
            parent_kind: ParentKind::Task,
            description: "step".to_string(),
            status: WorkStatus::Pending,
            flow_references: vec![],
            files: vec![],
            context_mode: ContextMode::Focused,
            progress: 0,
            created_at: now,
            last_updated: now,
        };

        let value = render_task_file(&task, &[subtask]);
        assert_eq!(value["id"], "TASK-20250712090000");
        assert_eq!(value["subtasks"][0]["id"], "ST-01");
    }
}

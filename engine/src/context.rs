//! Theme/flow-driven context selection with bounded escalation.
//!
//! The loader chooses the minimum sufficient set of files for the current
//! work item: focused starts from the primary theme alone, expanded adds
//! linked themes, wide exposes everything. A task gets at most one
//! escalation; going wide always requires an explicit user decision, which
//! is captured as a noteworthy event.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use pm_core::{
    config::ProjectConfig,
    error::{PmError, Result},
    ids,
    models::{ContextMode, EntityKind, Severity, Task},
};
use store::{common, ChangeSet, ChangeType, Store};

use crate::fsutil;
use crate::theme_flow::ThemeFlowIndex;

/// Directory READMEs load at most this many bytes each; larger files are
/// truncated to their first 2 KiB, never dropped.
const README_SIZE_CAP: u64 = 2 * 1024;

/// The selected context for a work item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextPlan {
    pub mode: ContextMode,
    pub themes: Vec<String>,
    pub flows: Vec<String>,
    pub flow_files: Vec<String>,
    pub files: Vec<PathBuf>,
    pub readmes: Vec<PathBuf>,
    pub estimated_bytes: u64,
    pub warnings: Vec<String>,
}

/// Outcome of an escalation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// The loader widened the context on its own (focused -> expanded)
    Widened(ContextPlan),
    /// Wide context was granted by explicit user approval
    Approved(ContextPlan),
}

/// Chooses what the agent sees.
pub struct ContextLoader {
    store: Arc<Store>,
    config: Arc<ProjectConfig>,
    index: Arc<RwLock<ThemeFlowIndex>>,
}

impl ContextLoader {
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

    /// Select context for a task at the given mode (or the configured
    /// default). Narrow first: themes resolve to files, flows to flow
    /// files bounded by `maxFlowFiles`, plus directory READMEs and the
    /// always-accessible set; an over-budget selection is truncated least
    /// relevant first.
    pub async fn load_for_task(&self, task: &Task, mode: Option<ContextMode>) -> Result<ContextPlan> {
        let mode = mode.unwrap_or(self.config.context_loading.default_mode);
        let index = self.index.read().await;

        let mut themes = vec![task.primary_theme.clone()];
        match mode {
            ContextMode::Focused => {}
            ContextMode::Expanded => {
                for theme in &task.related_themes {
                    if !themes.contains(theme) {
                        themes.push(theme.clone());
                    }
                }
                for linked in index.linked_themes(&task.primary_theme) {
                    if !themes.contains(&linked) {
                        themes.push(linked);
                    }
                }
            }
            ContextMode::Wide => {
                for theme in index.theme_names() {
                    if !themes.contains(&theme) {
                        themes.push(theme);
                    }
                }
            }
        }

        let mut plan = ContextPlan {
            mode,
            themes,
            ..Default::default()
        };

        // Flows, ordered by declared relevance and bounded
        let max_flows = self.config.context_loading.max_flow_files as usize;
        let flows = index.flows_for_theme(&task.primary_theme, max_flows);
        plan.flows = flows.iter().map(|f| f.flow_id.clone()).collect();
        plan.flow_files = index.flow_files_for(&flows);

        // Theme paths resolve to concrete files
        let layout = self.store.layout();
        let root = layout.project_root();
        for theme_name in plan.themes.clone() {
            let Some(theme) = index.theme(&theme_name) else {
                plan.warnings
                    .push(format!("theme '{theme_name}' is not in the index"));
                continue;
            };
            for path in &theme.paths {
                for file in fsutil::expand_path(root, path) {
                    if !plan.files.contains(&file) {
                        plan.files.push(file);
                    }
                }
            }
            for shared in theme.shared_files.keys() {
                let full = root.join(shared);
                if full.exists() && !plan.files.contains(&full) {
                    plan.files.push(full);
                }
            }
        }

        // Directory READMEs, each loaded up to 2 KiB
        if self.config.context_loading.readme_first {
            let mut dirs: Vec<PathBuf> = Vec::new();
            for file in &plan.files {
                if let Some(parent) = file.parent() {
                    if !dirs.contains(&parent.to_path_buf()) {
                        dirs.push(parent.to_path_buf());
                    }
                }
            }
            for dir in dirs {
                let readme = dir.join("README.md");
                if readme.exists() && !plan.readmes.contains(&readme) {
                    plan.readmes.push(readme);
                }
            }
        }

        // Always-accessible set: root config/docs and entry points
        for path in layout.always_accessible() {
            if path.exists() && !plan.files.contains(&path) {
                plan.files.push(path);
            }
        }

        // Oversized files get flagged for modularization
        let max_lines = self.config.project.max_file_line_count as usize;
        for file in &plan.files {
            let lines = fsutil::line_count(file);
            if lines > max_lines {
                plan.warnings.push(format!(
                    "{} has {lines} lines (limit {max_lines}); flag for modularization",
                    file.display()
                ));
            }
        }

        self.enforce_budget(&mut plan, &index);
        Ok(plan)
    }

    /// Request a broader context for a task.
    ///
    /// focused -> expanded happens without approval when the caller's
    /// sufficiency check failed; expanded -> wide requires `approved` and
    /// is recorded as an event. A task's single escalation budget is spent
    /// either way; a second request is refused with advice to spawn a
    /// sidequest or get explicit approval.
    pub async fn escalate(
        &self,
        task: &Task,
        current: ContextMode,
        reason: &str,
        approved: bool,
    ) -> Result<Escalation> {
        let Some(next) = current.escalated() else {
            return Err(PmError::Validation(
                "Context is already wide; nothing to escalate".to_string(),
            ));
        };

        if task.escalation_count >= 1 {
            return Err(PmError::Validation(format!(
                "Task '{}' already used its context escalation; spawn a sidequest or request user approval for a fresh scope",
                task.id
            )));
        }

        if next == ContextMode::Wide && !approved {
            return Err(PmError::Validation(
                "Escalation to wide context requires explicit user approval".to_string(),
            ));
        }

        let now = Utc::now();
        let event_id = ids::event_id(now);
        let change = ChangeSet::new(format!("escalate context for {}", task.id))
            .statement(
                "UPDATE task_status SET escalation_count = escalation_count + 1 WHERE task_id = ?",
                vec![task.id.clone().into()],
            )
            .statement(
                "INSERT INTO noteworthy_events (event_id, event_type, title, primary_theme, related_task, impact, reasoning, outcome, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    event_id.clone().into(),
                    if next == ContextMode::Wide { "decision" } else { "escalation" }.into(),
                    format!("Context escalated to {next}").into(),
                    task.primary_theme.clone().into(),
                    task.id.clone().into(),
                    common::severity_to_string(if next == ContextMode::Wide {
                        Severity::Medium
                    } else {
                        Severity::Low
                    })
                    .into(),
                    reason.into(),
                    format!("{current} -> {next}").into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::NoteworthyEvent, event_id, ChangeType::Created);
        self.store.apply(change).await?;

        let plan = self.load_for_task(task, Some(next)).await?;
        tracing::info!(task_id = %task.id, from = %current, to = %next, "Context escalated");

        Ok(if next == ContextMode::Wide {
            Escalation::Approved(plan)
        } else {
            Escalation::Widened(plan)
        })
    }

    /// Estimate total size and truncate the least relevant content first
    /// when the memory budget is exceeded: flow files from the back, then
    /// files contributed by non-primary themes.
    ///
    /// The estimate covers everything the plan exposes: theme and
    /// always-accessible files, flow files resolved to their on-disk
    /// paths, and READMEs at their truncated size (a README already
    /// selected as a theme file is counted once, in full).
    fn enforce_budget(&self, plan: &mut ContextPlan, index: &ThemeFlowIndex) {
        let budget = self.config.memory_budget_bytes();
        let layout = self.store.layout();
        let estimate = |plan: &ContextPlan| {
            let files: u64 = plan.files.iter().map(|f| fsutil::file_size(f)).sum();
            let readmes: u64 = plan
                .readmes
                .iter()
                .filter(|readme| !plan.files.contains(*readme))
                .map(|readme| fsutil::file_size(readme).min(README_SIZE_CAP))
                .sum();
            let flows: u64 = plan
                .flow_files
                .iter()
                .map(|name| fsutil::file_size(&layout.flow_file(name)))
                .sum();
            files + readmes + flows
        };

        plan.estimated_bytes = estimate(plan);
        if plan.estimated_bytes <= budget {
            return;
        }

        plan.warnings.push(format!(
            "context estimate {} bytes exceeds budget {budget}; truncating least relevant content",
            plan.estimated_bytes
        ));

        while !plan.flow_files.is_empty() && plan.estimated_bytes > budget {
            plan.flow_files.pop();
            plan.flows.retain(|id| {
                index
                    .flow(id)
                    .map(|f| plan.flow_files.contains(&f.flow_file))
                    .unwrap_or(false)
            });
            plan.estimated_bytes = estimate(plan);
        }

        if plan.estimated_bytes > budget {
            let primary_files: Vec<PathBuf> = plan
                .themes
                .first()
                .and_then(|primary| index.theme(primary))
                .map(|theme| {
                    theme
                        .paths
                        .iter()
                        .flat_map(|p| {
                            fsutil::expand_path(self.store.layout().project_root(), p)
                        })
                        .collect()
                })
                .unwrap_or_default();

            while plan.estimated_bytes > budget {
                let Some(pos) = plan
                    .files
                    .iter()
                    .rposition(|f| !primary_files.contains(f))
                else {
                    break;
                };
                plan.files.remove(pos);
                plan.estimated_bytes = estimate(plan);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_plan_default_mode() {
        let plan = ContextPlan::default();
        assert_eq!(plan.mode, ContextMode::Focused);
        assert!(plan.files.is_empty());
    }
}

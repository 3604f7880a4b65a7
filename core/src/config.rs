//! Project configuration (`UserSettings/config.json`).
//!
//! This is the per-project, user-editable configuration, distinct from the
//! server's own TOML configuration. Every option has a serde default so a
//! missing or partial file behaves like the documented defaults, and a small
//! set of `AI_PM_*` environment variables override the file.

use serde::{Deserialize, Serialize};

use crate::error::{PmError, Result};
use crate::models::ContextMode;

/// Gating level for reference-integrity checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Smart,
    Strict,
    Disabled,
}

impl Default for ValidationLevel {
    fn default() -> Self {
        ValidationLevel::Smart
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSection {
    /// File size above which the system flags for modularization
    pub max_file_line_count: u32,
    /// Reject placeholder markers in generated code
    pub avoid_placeholders: bool,
    /// Select indented vs minified writer for non-user-edited JSON
    pub minify_json: bool,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            max_file_line_count: 900,
            avoid_placeholders: true,
            minify_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TasksSection {
    /// Sidequests a task may hold in non-terminal state
    pub max_active_sidequests: u32,
    /// Auto-resume an in-progress task on session boot
    pub resume_tasks_on_start: bool,
    /// Whether task creation needs user approval
    pub auto_task_creation: bool,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_active_sidequests: 3,
            resume_tasks_on_start: false,
            auto_task_creation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextLoadingSection {
    /// Initial mode selected by the context loader
    pub default_mode: ContextMode,
    /// Upper bound on flow files loaded per work item
    pub max_flow_files: u32,
    /// Pre-read directory READMEs
    pub readme_first: bool,
    /// Context memory budget in MiB
    pub memory_budget_mib: u32,
}

impl Default for ContextLoadingSection {
    fn default() -> Self {
        Self {
            default_mode: ContextMode::Focused,
            max_flow_files: 3,
            readme_first: true,
            memory_budget_mib: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThemesSection {
    /// Themes a file may be shared by before flagging for reorganization
    pub shared_file_threshold: u32,
    /// Upper bound on a theme's flows array, if set
    pub max_flows_per_theme: Option<u32>,
}

impl Default for ThemesSection {
    fn default() -> Self {
        Self {
            shared_file_threshold: 3,
            max_flows_per_theme: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GitSection {
    pub enabled: bool,
    pub auto_init_repo: bool,
    pub code_change_detection: bool,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_init_repo: true,
            code_change_detection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchManagementSection {
    pub max_active_branches: u32,
    /// Org-main has final authority in merges; no custom conflict resolver
    pub main_branch_authority: bool,
}

impl Default for BranchManagementSection {
    fn default() -> Self {
        Self {
            max_active_branches: 10,
            main_branch_authority: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationSection {
    pub flow_references: ValidationLevel,
    pub theme_references: ValidationLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsSection {
    /// Rows in `noteworthy_events` before current events archive to a dated file
    pub noteworthy_size_limit: u32,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            noteworthy_size_limit: 500,
        }
    }
}

/// The full per-project configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    pub tasks: TasksSection,
    pub context_loading: ContextLoadingSection,
    pub themes: ThemesSection,
    pub git: GitSection,
    pub branch_management: BranchManagementSection,
    pub validation: ValidationSection,
    pub events: EventsSection,
    /// Debug mode (also settable via `AI_PM_DEBUG`)
    pub debug: bool,
}

impl ProjectConfig {
    /// Parse a `UserSettings/config.json` document. Unknown keys are
    /// tolerated; missing sections fall back to defaults.
    pub fn from_json(contents: &str) -> Result<Self> {
        let mut config: ProjectConfig = serde_json::from_str(contents)
            .map_err(|e| PmError::Configuration(format!("Invalid config.json: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override the file: `AI_PM_DEBUG`,
    /// `AI_PM_MAX_FILE_LINES`. (`AI_PM_LOG_LEVEL` and `AI_PM_LOG_RETENTION`
    /// are consumed by the server's telemetry setup, not here.)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(debug) = std::env::var("AI_PM_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
        if let Ok(lines) = std::env::var("AI_PM_MAX_FILE_LINES") {
            if let Ok(parsed) = lines.parse() {
                self.project.max_file_line_count = parsed;
            }
        }
    }

    /// Reject configurations the scheduler cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.max_active_sidequests == 0 {
            return Err(PmError::Configuration(
                "tasks.maxActiveSidequests must be at least 1".to_string(),
            ));
        }
        if self.context_loading.max_flow_files == 0 {
            return Err(PmError::Configuration(
                "contextLoading.maxFlowFiles must be at least 1".to_string(),
            ));
        }
        if self.context_loading.memory_budget_mib == 0 {
            return Err(PmError::Configuration(
                "contextLoading.memoryBudgetMib must be at least 1".to_string(),
            ));
        }
        if self.themes.shared_file_threshold == 0 {
            return Err(PmError::Configuration(
                "themes.sharedFileThreshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Context memory budget in bytes.
    pub fn memory_budget_bytes(&self) -> u64 {
        u64::from(self.context_loading.memory_budget_mib) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.project.max_file_line_count, 900);
        assert!(config.project.avoid_placeholders);
        assert!(config.project.minify_json);
        assert_eq!(config.tasks.max_active_sidequests, 3);
        assert!(!config.tasks.resume_tasks_on_start);
        assert_eq!(config.context_loading.default_mode, ContextMode::Focused);
        assert_eq!(config.context_loading.max_flow_files, 3);
        assert!(config.context_loading.readme_first);
        assert_eq!(config.themes.shared_file_threshold, 3);
        assert!(config.git.enabled);
        assert_eq!(config.branch_management.max_active_branches, 10);
        assert_eq!(config.validation.flow_references, ValidationLevel::Smart);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = ProjectConfig::from_json(
            r#"{ "tasks": { "maxActiveSidequests": 5 }, "project": { "minifyJson": false } }"#,
        )
        .unwrap();
        assert_eq!(config.tasks.max_active_sidequests, 5);
        assert!(!config.project.minify_json);
        // untouched sections keep defaults
        assert_eq!(config.context_loading.max_flow_files, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = ProjectConfig::from_json(r#"{ "tasks": { "maxActiveSidequests": 0 } }"#);
        assert!(matches!(result, Err(PmError::Configuration(_))));

        let result = ProjectConfig::from_json(r#"{ "contextLoading": { "maxFlowFiles": 0 } }"#);
        assert!(matches!(result, Err(PmError::Configuration(_))));
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let result = ProjectConfig::from_json("{ not json");
        assert!(matches!(result, Err(PmError::Configuration(_))));
    }

    #[test]
    fn test_memory_budget_bytes() {
        let config = ProjectConfig::default();
        assert_eq!(config.memory_budget_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_validation_level_serde() {
        let section: ValidationSection =
            serde_json::from_str(r#"{ "flowReferences": "strict" }"#).unwrap();
        assert_eq!(section.flow_references, ValidationLevel::Strict);
        assert_eq!(section.theme_references, ValidationLevel::Smart);
    }
}

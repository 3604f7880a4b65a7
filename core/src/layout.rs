//! On-disk layout of the organizational state.
//!
//! Everything under `projectManagement/` plus the rows in `project.db` forms
//! the complete AI-visible model of the project. The paths here are a fixed
//! contract; other components never build them by hand.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Path map for one project root.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    /// `projectManagement/`, the organizational tree.
    pub fn management_dir(&self) -> PathBuf {
        self.root.join("projectManagement")
    }

    pub fn blueprint_dir(&self) -> PathBuf {
        self.management_dir().join("ProjectBlueprint")
    }

    pub fn blueprint_file(&self) -> PathBuf {
        self.blueprint_dir().join("blueprint.md")
    }

    pub fn blueprint_metadata(&self) -> PathBuf {
        self.blueprint_dir().join("metadata.json")
    }

    pub fn flow_dir(&self) -> PathBuf {
        self.management_dir().join("ProjectFlow")
    }

    pub fn flow_index(&self) -> PathBuf {
        self.flow_dir().join("flow-index.json")
    }

    /// `<domain>-flow.json` under `ProjectFlow/`.
    pub fn flow_file(&self, file_name: &str) -> PathBuf {
        self.flow_dir().join(file_name)
    }

    pub fn logic_dir(&self) -> PathBuf {
        self.management_dir().join("ProjectLogic")
    }

    pub fn projectlogic(&self) -> PathBuf {
        self.logic_dir().join("projectlogic.jsonl")
    }

    pub fn themes_dir(&self) -> PathBuf {
        self.management_dir().join("Themes")
    }

    pub fn themes_index(&self) -> PathBuf {
        self.themes_dir().join("themes.json")
    }

    pub fn theme_file(&self, theme: &str) -> PathBuf {
        self.themes_dir().join(format!("{theme}.json"))
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.management_dir().join("Tasks")
    }

    pub fn completion_path(&self) -> PathBuf {
        self.tasks_dir().join("completion-path.json")
    }

    pub fn active_task_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join("active").join(format!("{task_id}.json"))
    }

    pub fn archived_task_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join("archive").join(format!("{task_id}.json"))
    }

    pub fn sidequest_file(&self, sidequest_id: &str) -> PathBuf {
        self.tasks_dir()
            .join("sidequests")
            .join(format!("{sidequest_id}.json"))
    }

    pub fn archived_sidequest_file(&self, sidequest_id: &str) -> PathBuf {
        self.tasks_dir()
            .join("sidequests")
            .join("archive")
            .join(format!("{sidequest_id}.json"))
    }

    pub fn implementations_dir(&self) -> PathBuf {
        self.management_dir().join("Implementations")
    }

    pub fn active_plan_file(&self, plan_id: &str) -> PathBuf {
        self.implementations_dir()
            .join("active")
            .join(format!("{plan_id}.md"))
    }

    pub fn completed_plan_file(&self, plan_id: &str) -> PathBuf {
        self.implementations_dir()
            .join("completed")
            .join(format!("{plan_id}.md"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.management_dir().join("Logs")
    }

    pub fn noteworthy_file(&self) -> PathBuf {
        self.logs_dir().join("noteworthy.json")
    }

    /// Dated archive target for noteworthy events.
    pub fn noteworthy_archive_file(&self, date: DateTime<Utc>) -> PathBuf {
        self.logs_dir()
            .join(format!("noteworthy-archived-{}.json", date.format("%Y-%m-%d")))
    }

    pub fn placeholders_dir(&self) -> PathBuf {
        self.management_dir().join("Placeholders")
    }

    pub fn todos_file(&self) -> PathBuf {
        self.placeholders_dir().join("todos.jsonl")
    }

    pub fn user_settings_dir(&self) -> PathBuf {
        self.management_dir().join("UserSettings")
    }

    pub fn config_file(&self) -> PathBuf {
        self.user_settings_dir().join("config.json")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.management_dir().join("database")
    }

    pub fn database_file(&self) -> PathBuf {
        self.database_dir().join("project.db")
    }

    /// `.ai-pm-meta.json` at the project root; present only on work branches.
    pub fn branch_meta_file(&self) -> PathBuf {
        self.root.join(".ai-pm-meta.json")
    }

    /// Every directory the store must be able to write into.
    pub fn all_directories(&self) -> Vec<PathBuf> {
        vec![
            self.blueprint_dir(),
            self.flow_dir(),
            self.logic_dir(),
            self.themes_dir(),
            self.tasks_dir().join("active"),
            self.tasks_dir().join("archive"),
            self.tasks_dir().join("sidequests"),
            self.tasks_dir().join("sidequests").join("archive"),
            self.implementations_dir().join("active"),
            self.implementations_dir().join("completed"),
            self.logs_dir(),
            self.placeholders_dir(),
            self.user_settings_dir(),
            self.database_dir(),
        ]
    }

    /// Root config/doc files and source-root entry points that are always in
    /// context regardless of theme selection.
    pub fn always_accessible(&self) -> Vec<PathBuf> {
        const ROOT_FILES: [&str; 8] = [
            "README.md",
            "CONTRIBUTING.md",
            "package.json",
            "Cargo.toml",
            "pyproject.toml",
            "go.mod",
            ".env.example",
            "Makefile",
        ];
        const ENTRY_POINTS: [&str; 6] = [
            "src/main.rs",
            "src/lib.rs",
            "src/index.ts",
            "src/index.js",
            "src/app.ts",
            "src/main.py",
        ];
        ROOT_FILES
            .iter()
            .chain(ENTRY_POINTS.iter())
            .map(|f| self.root.join(f))
            .collect()
    }
}

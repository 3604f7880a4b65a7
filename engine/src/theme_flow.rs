//! Theme/flow index: which files belong to which themes, and which flows
//! belong to which themes.
//!
//! Definitions are read from `Themes/*.json`, `ProjectFlow/flow-index.json`
//! and the flow files it names. The index is rebuilt whenever those files
//! change; the `theme_flows` edge table in the database is refreshed from it
//! so the store's views stay queryable without touching the file tree.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use pm_core::{
    config::ProjectConfig,
    error::{PmError, Result},
    layout::ProjectLayout,
    models::{Flow, Theme},
    validation::FlowCatalog,
};
use store::{ChangeSet, SqlValue};

use crate::fsutil;

/// One entry of `flow-index.json`: a domain flow file and the flows in it,
/// ordered by declared relevance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowIndexEntry {
    pub file: String,
    pub flows: Vec<String>,
    #[serde(default)]
    pub primary_themes: Vec<String>,
}

/// The central flow index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowIndexDoc {
    #[serde(default)]
    pub flow_files: Vec<FlowIndexEntry>,
}

/// A flow file on disk: the flows of one domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowFileDoc {
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// A file shared by more themes than the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFileWarning {
    pub file: String,
    pub themes: Vec<String>,
}

/// In-memory resolution index over themes and flows.
#[derive(Debug, Clone, Default)]
pub struct ThemeFlowIndex {
    themes: BTreeMap<String, Theme>,
    flows: BTreeMap<String, Flow>,
    /// flow-id -> position in its file's declared relevance order
    relevance: BTreeMap<String, usize>,
    file_to_themes: BTreeMap<String, Vec<String>>,
    catalog: FlowCatalog,
}

impl ThemeFlowIndex {
    /// Build the index from the organizational tree. Missing files mean an
    /// empty index (a freshly initialized project), not an error.
    pub fn load(layout: &ProjectLayout) -> Result<Self> {
        let mut index = Self::default();

        let themes_index = layout.themes_index();
        if themes_index.exists() {
            let names: Vec<String> = fsutil::read_json(&themes_index)?;
            for name in names {
                let path = layout.theme_file(&name);
                if !path.exists() {
                    tracing::warn!(theme = %name, "themes.json names a theme with no file");
                    continue;
                }
                let theme: Theme = fsutil::read_json(&path)?;
                index.insert_theme(theme);
            }
        }

        let flow_index_path = layout.flow_index();
        if flow_index_path.exists() {
            let doc: FlowIndexDoc = fsutil::read_json(&flow_index_path)?;
            for entry in &doc.flow_files {
                let path = layout.flow_file(&entry.file);
                if !path.exists() {
                    tracing::warn!(file = %entry.file, "flow-index.json names a missing flow file");
                    continue;
                }
                let file_doc: FlowFileDoc = fsutil::read_json(&path)?;
                for flow in file_doc.flows {
                    let declared = entry.flows.iter().position(|id| id == &flow.flow_id);
                    index.insert_flow(flow, declared.unwrap_or(usize::MAX));
                }
            }
        }

        Ok(index)
    }

    pub fn insert_theme(&mut self, theme: Theme) {
        for path in &theme.paths {
            self.file_to_themes
                .entry(path.clone())
                .or_default()
                .push(theme.name.clone());
        }
        for shared in theme.shared_files.keys() {
            let entry = self.file_to_themes.entry(shared.clone()).or_default();
            if !entry.contains(&theme.name) {
                entry.push(theme.name.clone());
            }
        }
        self.themes.insert(theme.name.clone(), theme);
    }

    pub fn insert_flow(&mut self, flow: Flow, relevance: usize) {
        self.catalog.insert_flow(
            &flow.flow_id,
            &flow.flow_file,
            flow.steps.iter().map(|s| s.step_id.clone()),
        );
        self.relevance.insert(flow.flow_id.clone(), relevance);
        self.flows.insert(flow.flow_id.clone(), flow);
    }

    pub fn theme(&self, name: &str) -> Option<&Theme> {
        self.themes.get(name)
    }

    pub fn theme_names(&self) -> Vec<String> {
        self.themes.keys().cloned().collect()
    }

    pub fn contains_theme(&self, name: &str) -> bool {
        self.themes.contains_key(name)
    }

    pub fn flow(&self, flow_id: &str) -> Option<&Flow> {
        self.flows.get(flow_id)
    }

    /// Themes that claim a file, either directly or through a path prefix
    /// (a theme owning `src/auth` owns `src/auth/oauth.js`).
    pub fn themes_for_file(&self, file: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(direct) = self.file_to_themes.get(file) {
            out.extend(direct.iter().cloned());
        }
        for (path, themes) in &self.file_to_themes {
            if path != file && file.starts_with(path.trim_end_matches('/')) {
                let boundary = file.as_bytes().get(path.trim_end_matches('/').len());
                if boundary == Some(&b'/') {
                    for theme in themes {
                        if !out.contains(theme) {
                            out.push(theme.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// Flows primarily tied to a theme, in declared relevance order,
    /// bounded by `max`.
    pub fn flows_for_theme(&self, theme: &str, max: usize) -> Vec<&Flow> {
        let mut flows: Vec<&Flow> = self
            .flows
            .values()
            .filter(|f| f.primary_themes.iter().any(|t| t == theme))
            .collect();
        flows.sort_by_key(|f| self.relevance.get(&f.flow_id).copied().unwrap_or(usize::MAX));
        flows.truncate(max);
        flows
    }

    /// Distinct flow files for a set of flows, preserving order.
    pub fn flow_files_for(&self, flows: &[&Flow]) -> Vec<String> {
        let mut files = Vec::new();
        for flow in flows {
            if !files.contains(&flow.flow_file) {
                files.push(flow.flow_file.clone());
            }
        }
        files
    }

    /// The validation catalog over every indexed flow.
    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    /// Files shared by more themes than the threshold allows.
    pub fn shared_file_warnings(&self, threshold: usize) -> Vec<SharedFileWarning> {
        self.file_to_themes
            .iter()
            .filter(|(_, themes)| themes.len() > threshold)
            .map(|(file, themes)| SharedFileWarning {
                file: file.clone(),
                themes: themes.clone(),
            })
            .collect()
    }

    /// Linked themes of a theme, restricted to ones that exist.
    pub fn linked_themes(&self, name: &str) -> Vec<String> {
        self.theme(name)
            .map(|t| {
                t.linked_themes
                    .iter()
                    .filter(|l| self.themes.contains_key(*l))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Change set refreshing `flow_status`, `flow_step_status` and
    /// `theme_flows` from the index, so views reflect the file tree.
    pub fn sync_changeset(&self, config: &ProjectConfig) -> ChangeSet {
        let now = Utc::now();
        let mut change = ChangeSet::new("sync theme/flow index")
            .statement("DELETE FROM theme_flows", vec![])
            .statement("DELETE FROM flow_step_status", vec![])
            .statement("DELETE FROM flow_status", vec![]);

        let max_flows = config
            .themes
            .max_flows_per_theme
            .map(|m| m as usize)
            .unwrap_or(usize::MAX);

        for flow in self.flows.values() {
            change = change.statement(
                "INSERT INTO flow_status (flow_id, flow_file, name, status, completion_percentage, primary_themes, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                vec![
                    flow.flow_id.clone().into(),
                    flow.flow_file.clone().into(),
                    flow.name.clone().into(),
                    store::common::flow_state_to_string(flow.state()).into(),
                    u32::from(flow.completion_percentage).into(),
                    SqlValue::Text(
                        serde_json::to_string(&flow.primary_themes).unwrap_or_default(),
                    ),
                    now.into(),
                ],
            );
            for step in &flow.steps {
                change = change.statement(
                    "INSERT INTO flow_step_status (flow_id, step_id, description, dependencies, status, last_updated) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    vec![
                        flow.flow_id.clone().into(),
                        step.step_id.clone().into(),
                        step.description.clone().into(),
                        SqlValue::Text(
                            serde_json::to_string(&step.dependencies).unwrap_or_default(),
                        ),
                        store::common::flow_state_to_string(step.status).into(),
                        now.into(),
                    ],
                );
            }
        }

        for theme in self.themes.values() {
            let flows = self.flows_for_theme(&theme.name, max_flows);
            for (order, flow) in flows.iter().enumerate() {
                change = change.statement(
                    "INSERT INTO theme_flows (theme_name, flow_id, relevance_order, created_at) \
                     VALUES (?, ?, ?, ?)",
                    vec![
                        theme.name.clone().into(),
                        flow.flow_id.clone().into(),
                        (order as u32).into(),
                        now.into(),
                    ],
                );
            }
        }

        change
    }

    /// Render a theme back to its file path and document for a paired write.
    pub fn theme_file_value(theme: &Theme) -> serde_json::Value {
        serde_json::to_value(theme).unwrap_or_default()
    }

    /// Render `themes.json` from the current theme set.
    pub fn themes_index_value(&self) -> serde_json::Value {
        serde_json::to_value(self.theme_names()).unwrap_or_default()
    }
}

/// Read a theme file from disk by name; used when rewriting a single theme.
pub fn load_theme(layout: &ProjectLayout, name: &str) -> Result<Theme> {
    let path = layout.theme_file(name);
    if !path.exists() {
        return Err(PmError::UnknownTheme(name.to_string()));
    }
    fsutil::read_json(&path)
}

/// Whether a directory looks like an initialized organizational tree.
pub fn has_organizational_state(project_root: &Path) -> bool {
    project_root.join("projectManagement").is_dir()
}

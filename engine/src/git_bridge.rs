//! External-change detection and organizational reconciliation.
//!
//! On boot the bridge compares the repository HEAD with the last hash the
//! organizational state was synchronized against. Changed files are
//! classified per-file by three signals in precedence order: direct theme
//! mapping, directory-token inference, then name-pattern inference. The
//! highest-precedence signal selects the proposed theme; weaker signals are
//! recorded as corroboration, and a disagreeing weaker signal forces user
//! approval. Only direct mappings are unambiguous enough to apply
//! automatically; inferred assignments always wait for the user. Every
//! applied decision lands as a `decision` noteworthy event.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use git2::{Delta, Oid, Repository};
use serde::{Deserialize, Serialize};

use pm_core::{
    config::ProjectConfig,
    error::{PmError, Result},
    models::{EntityKind, ReconciliationStatus, Severity},
};
use store::{common, ChangeSet, ChangeType, JsonStyle, SqlValue, Store};

use crate::theme_flow::{load_theme, ThemeFlowIndex};

/// Canonical directory tokens and the theme stems they suggest.
const DIR_TOKENS: [(&str, &str); 8] = [
    ("auth/", "auth"),
    ("user/", "user"),
    ("payment/", "payment"),
    ("api/", "api"),
    ("ui/", "ui"),
    ("database/", "database"),
    ("admin/", "admin"),
    ("config/", "config"),
];

/// Name-pattern stems checked against the file name.
const NAME_PATTERNS: [&str; 9] = [
    "auth", "login", "payment", "billing", "user", "profile", "api", "config", "test",
];

/// How a file changed between the two synchronized states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

/// Reconciliation strategy for one proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Unambiguous addition or removal; applied without asking
    Auto,
    /// New themes, multi-candidate assignments, flagged deletions
    UserApproval,
    /// Structural changes and multi-theme deletions
    Manual,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Auto => write!(f, "auto"),
            Strategy::UserApproval => write!(f, "user_approval"),
            Strategy::Manual => write!(f, "manual"),
        }
    }
}

/// One per-file reconciliation proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThemeProposal {
    pub file: String,
    pub change: ChangeKind,
    pub severity: Severity,
    /// Proposed theme; `None` when only manual handling makes sense
    pub theme: Option<String>,
    /// The proposed theme does not exist yet
    pub new_theme: bool,
    pub strategy: Strategy,
    /// The signals that fired, for the audit trail
    pub signals: Vec<String>,
}

/// The full result of a detection pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationPlan {
    pub project_path: String,
    pub prior_hash: Option<String>,
    pub current_hash: Option<String>,
    pub proposals: Vec<ThemeProposal>,
    pub status: ReconciliationStatus,
}

impl ReconciliationPlan {
    pub fn requires_user(&self) -> bool {
        matches!(
            self.status,
            ReconciliationStatus::PendingApproval | ReconciliationStatus::ManualRequired
        )
    }
}

/// Detects external source changes and drives reconciliation.
pub struct GitBridge {
    store: Arc<Store>,
    config: Arc<ProjectConfig>,
    git_lock: Arc<Mutex<()>>,
}

impl GitBridge {
    pub fn new(store: Arc<Store>, config: Arc<ProjectConfig>, git_lock: Arc<Mutex<()>>) -> Self {
        Self {
            store,
            config,
            git_lock,
        }
    }

    fn project_path(&self) -> String {
        self.store
            .layout()
            .project_root()
            .to_string_lossy()
            .into_owned()
    }

    /// Current HEAD hash, `None` when the project is not a repository or
    /// has no commits yet.
    pub fn current_head_hash(&self) -> Option<String> {
        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = Repository::open(self.store.layout().project_root()).ok()?;
        let head = repo.head().ok()?;
        head.peel_to_commit().ok().map(|c| c.id().to_string())
    }

    /// Compare HEAD against the last synchronized hash, classify every
    /// changed file, auto-apply the unambiguous part, and return the plan.
    pub async fn detect_changes(&self, index: &ThemeFlowIndex) -> Result<ReconciliationPlan> {
        let project_path = self.project_path();

        if !self.config.git.enabled || !self.config.git.code_change_detection {
            return Ok(ReconciliationPlan {
                project_path,
                prior_hash: None,
                current_hash: None,
                proposals: vec![],
                status: ReconciliationStatus::Clean,
            });
        }

        let current = self.current_head_hash();
        let prior = self.store.get_git_state(&project_path).await?;
        let prior_hash = prior.as_ref().map(|p| p.current_git_hash.clone());

        let Some(current_hash) = current else {
            return Ok(ReconciliationPlan {
                project_path,
                prior_hash,
                current_hash: None,
                proposals: vec![],
                status: ReconciliationStatus::Clean,
            });
        };

        if prior_hash.as_deref() == Some(current_hash.as_str()) {
            // fast boot: nothing moved
            return Ok(ReconciliationPlan {
                project_path,
                prior_hash,
                current_hash: Some(current_hash),
                proposals: vec![],
                status: ReconciliationStatus::Clean,
            });
        }

        if prior.is_none() {
            // first sighting of this repository: record the baseline
            self.write_state(&project_path, &current_hash, None, "baseline", &[], ReconciliationStatus::Clean)
                .await?;
            return Ok(ReconciliationPlan {
                project_path,
                prior_hash: None,
                current_hash: Some(current_hash),
                proposals: vec![],
                status: ReconciliationStatus::Clean,
            });
        }

        let changed = self.diff_name_status(prior_hash.as_deref().unwrap_or_default(), &current_hash)?;
        let proposals: Vec<ThemeProposal> = changed
            .into_iter()
            .filter(|(path, _)| {
                !path.starts_with("projectManagement/") && path != ".ai-pm-meta.json"
            })
            .map(|(path, kind)| analyze_file(index, &path, kind))
            .collect();

        let status = if proposals.iter().any(|p| p.strategy == Strategy::Manual) {
            ReconciliationStatus::ManualRequired
        } else if proposals.iter().any(|p| p.strategy == Strategy::UserApproval) {
            ReconciliationStatus::PendingApproval
        } else if proposals.is_empty() {
            ReconciliationStatus::Clean
        } else {
            ReconciliationStatus::Reconciled
        };

        // Auto proposals apply immediately; everything else waits for the
        // user. Either way the state row moves to the new hash so the
        // pending work is tracked against it.
        let auto: Vec<&ThemeProposal> = proposals
            .iter()
            .filter(|p| p.strategy == Strategy::Auto)
            .collect();
        self.apply_proposals(&auto, &project_path, &current_hash, prior_hash.as_deref(), status)
            .await?;

        tracing::info!(
            changed = proposals.len(),
            auto = auto.len(),
            status = %status,
            "External change detection finished"
        );

        Ok(ReconciliationPlan {
            project_path,
            prior_hash,
            current_hash: Some(current_hash),
            proposals,
            status,
        })
    }

    /// Apply user-approved proposals from a previous plan.
    pub async fn approve(
        &self,
        plan: &ReconciliationPlan,
        approved_files: &[String],
    ) -> Result<ReconciliationStatus> {
        let approved: Vec<&ThemeProposal> = plan
            .proposals
            .iter()
            .filter(|p| p.strategy != Strategy::Auto && approved_files.contains(&p.file))
            .collect();
        if approved.is_empty() {
            return Ok(plan.status);
        }

        let outstanding = plan
            .proposals
            .iter()
            .filter(|p| p.strategy != Strategy::Auto)
            .filter(|p| !approved_files.contains(&p.file))
            .count();
        let status = if outstanding == 0 {
            ReconciliationStatus::Reconciled
        } else {
            plan.status
        };

        let current_hash = plan
            .current_hash
            .clone()
            .ok_or_else(|| PmError::Validation("Plan has no current hash".to_string()))?;
        self.apply_proposals(
            &approved,
            &plan.project_path,
            &current_hash,
            plan.prior_hash.as_deref(),
            status,
        )
        .await?;
        Ok(status)
    }

    fn diff_name_status(&self, old: &str, new: &str) -> Result<Vec<(String, ChangeKind)>> {
        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = Repository::open(self.store.layout().project_root())
            .map_err(|e| PmError::Git(e.message().to_string()))?;

        let new_commit = repo
            .find_commit(Oid::from_str(new).map_err(|e| PmError::Git(e.message().to_string()))?)
            .map_err(|e| PmError::Git(e.message().to_string()))?;
        let new_tree = new_commit
            .tree()
            .map_err(|e| PmError::Git(e.message().to_string()))?;

        // A rewritten or garbage-collected prior hash degrades to a full
        // comparison against the empty tree.
        let old_tree = Oid::from_str(old)
            .ok()
            .and_then(|oid| repo.find_commit(oid).ok())
            .and_then(|c| c.tree().ok());

        let diff = repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)
            .map_err(|e| PmError::Git(e.message().to_string()))?;

        let mut changed = Vec::new();
        for delta in diff.deltas() {
            let kind = match delta.status() {
                Delta::Added | Delta::Untracked => ChangeKind::Added,
                Delta::Modified => ChangeKind::Modified,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Renamed => ChangeKind::Renamed,
                _ => continue,
            };
            let path = match kind {
                ChangeKind::Deleted => delta.old_file().path(),
                _ => delta.new_file().path(),
            };
            if let Some(path) = path {
                changed.push((path.to_string_lossy().into_owned(), kind));
            }
        }
        Ok(changed)
    }

    async fn apply_proposals(
        &self,
        proposals: &[&ThemeProposal],
        project_path: &str,
        current_hash: &str,
        prior_hash: Option<&str>,
        status: ReconciliationStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let mut affected: Vec<String> = Vec::new();
        let mut change = ChangeSet::new("apply reconciliation");

        for proposal in proposals {
            if let Some(theme_name) = &proposal.theme {
                if !affected.contains(theme_name) {
                    affected.push(theme_name.clone());
                }
                if !proposal.new_theme {
                    let layout = self.store.layout();
                    if let Ok(mut theme) = load_theme(layout, theme_name) {
                        let mutated = match proposal.change {
                            ChangeKind::Added | ChangeKind::Modified | ChangeKind::Renamed => {
                                if !theme.paths.contains(&proposal.file) {
                                    theme.paths.push(proposal.file.clone());
                                    true
                                } else {
                                    false
                                }
                            }
                            ChangeKind::Deleted => {
                                let before = theme.paths.len() + theme.shared_files.len();
                                theme.paths.retain(|p| p != &proposal.file);
                                theme.shared_files.remove(&proposal.file);
                                before != theme.paths.len() + theme.shared_files.len()
                            }
                        };
                        if mutated {
                            change = change
                                .write_json(
                                    layout.theme_file(theme_name),
                                    ThemeFlowIndex::theme_file_value(&theme),
                                    JsonStyle::UserEdited,
                                )
                                .statement(
                                    "INSERT INTO theme_evolution (theme_name, change_type, detail, changed_at) VALUES (?, ?, ?, ?)",
                                    vec![
                                        theme_name.clone().into(),
                                        proposal.change.to_string().into(),
                                        proposal.file.clone().into(),
                                        now.into(),
                                    ],
                                )
                                .notify(EntityKind::Theme, theme_name, ChangeType::Updated);
                        }
                    }
                }
            }

            change = change.statement(
                "INSERT INTO git_change_impacts (project_path, file_path, change_type, severity, proposed_theme, strategy, signals, approved, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    project_path.into(),
                    proposal.file.clone().into(),
                    proposal.change.to_string().into(),
                    common::severity_to_string(proposal.severity).into(),
                    proposal.theme.clone().into(),
                    proposal.strategy.to_string().into(),
                    SqlValue::Text(serde_json::to_string(&proposal.signals).unwrap_or_default()),
                    (proposal.strategy != Strategy::Auto).into(),
                    now.into(),
                ],
            );

            let event_id = format!(
                "event-{}-{}",
                now.timestamp_millis(),
                proposal.file.replace('/', "-")
            );
            change = change
                .statement(
                    "INSERT INTO noteworthy_events (event_id, event_type, title, primary_theme, impact, reasoning, outcome, created_at) \
                     VALUES (?, 'decision', ?, ?, ?, ?, ?, ?)",
                    vec![
                        event_id.clone().into(),
                        format!("Reconciled {} ({})", proposal.file, proposal.change).into(),
                        proposal.theme.clone().into(),
                        common::severity_to_string(proposal.severity).into(),
                        proposal.signals.join("; ").into(),
                        format!("strategy {}", proposal.strategy).into(),
                        now.into(),
                    ],
                )
                .notify(EntityKind::NoteworthyEvent, event_id, ChangeType::Created);
        }

        change = self
            .state_statements(change, project_path, current_hash, prior_hash, &affected, status, now)
            .await?;
        self.store.apply(change).await?;
        Ok(())
    }

    async fn write_state(
        &self,
        project_path: &str,
        current_hash: &str,
        prior_hash: Option<&str>,
        summary: &str,
        affected: &[String],
        status: ReconciliationStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let change = ChangeSet::new(format!("git state: {summary}"));
        let change = self
            .state_statements(change, project_path, current_hash, prior_hash, affected, status, now)
            .await?;
        self.store.apply(change).await?;
        Ok(())
    }

    async fn state_statements(
        &self,
        change: ChangeSet,
        project_path: &str,
        current_hash: &str,
        prior_hash: Option<&str>,
        affected: &[String],
        status: ReconciliationStatus,
        now: chrono::DateTime<Utc>,
    ) -> Result<ChangeSet> {
        // one current row per path; prior rows stay for audit
        Ok(change
            .statement(
                "UPDATE git_project_state SET is_current = 0 WHERE project_path = ? AND is_current = 1",
                vec![project_path.into()],
            )
            .statement(
                "INSERT INTO git_project_state (project_path, current_git_hash, last_known_hash, last_sync, change_summary, affected_themes, reconciliation_status, is_current) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
                vec![
                    project_path.into(),
                    current_hash.into(),
                    prior_hash.map(str::to_string).into(),
                    now.into(),
                    format!("{} theme(s) affected", affected.len()).into(),
                    common::string_list(affected).into(),
                    common::reconciliation_status_to_string(status).into(),
                ],
            )
            .notify(
                EntityKind::GitProjectState,
                project_path,
                ChangeType::Updated,
            ))
    }
}

/// Classify one changed file. Signal precedence: direct theme mapping,
/// then directory tokens, then name patterns. The strongest signal picks
/// the theme; weaker signals corroborate it or, when they disagree,
/// downgrade the strategy to user approval. A directory or name match at
/// `medium` severity is a proposal, not a decision: only direct mappings
/// apply without asking.
pub fn analyze_file(index: &ThemeFlowIndex, path: &str, change: ChangeKind) -> ThemeProposal {
    let mut signals = Vec::new();

    let direct = index.themes_for_file(path);
    if !direct.is_empty() {
        signals.push(format!("direct:{}", direct.join("+")));
    }

    let lowered = path.to_ascii_lowercase();
    let mut dir_candidates: Vec<String> = Vec::new();
    for (token, stem) in DIR_TOKENS {
        if lowered.contains(token) {
            signals.push(format!("dir:{token}"));
            for theme in index.theme_names() {
                if theme_matches_stem(&theme, stem) && !dir_candidates.contains(&theme) {
                    dir_candidates.push(theme);
                }
            }
            if dir_candidates.is_empty() {
                dir_candidates.push(stem.to_string());
            }
        }
    }

    let file_name = lowered.rsplit('/').next().unwrap_or(&lowered).to_string();
    let mut name_candidates: Vec<String> = Vec::new();
    for stem in NAME_PATTERNS {
        if file_name.contains(stem) {
            signals.push(format!("name:{stem}"));
            for theme in index.theme_names() {
                if theme_matches_stem(&theme, stem) && !name_candidates.contains(&theme) {
                    name_candidates.push(theme);
                }
            }
        }
    }

    // Deletions are about the themes that referenced the file.
    if change == ChangeKind::Deleted {
        return match direct.len() {
            0 => ThemeProposal {
                file: path.to_string(),
                change,
                severity: Severity::Low,
                theme: None,
                new_theme: false,
                strategy: Strategy::Auto,
                signals,
            },
            1 => ThemeProposal {
                file: path.to_string(),
                change,
                severity: Severity::High,
                theme: Some(direct[0].clone()),
                new_theme: false,
                strategy: Strategy::UserApproval,
                signals,
            },
            _ => ThemeProposal {
                file: path.to_string(),
                change,
                severity: Severity::Critical,
                theme: None,
                new_theme: false,
                strategy: Strategy::Manual,
                signals,
            },
        };
    }

    // Precedence: the strongest signal selects the candidate set; the
    // weaker tiers only corroborate or contest it.
    let tiers = [&direct, &dir_candidates, &name_candidates];
    let Some(selected_tier) = tiers.iter().position(|t| !t.is_empty()) else {
        // nothing recognized this file; leave it alone
        return ThemeProposal {
            file: path.to_string(),
            change,
            severity: Severity::Low,
            theme: None,
            new_theme: false,
            strategy: Strategy::Auto,
            signals,
        };
    };
    let candidates = tiers[selected_tier];
    let severity = if selected_tier < 2 {
        Severity::Medium
    } else {
        Severity::Low
    };

    let selected = candidates[0].clone();
    let new_theme = !index.contains_theme(&selected);

    let mut contested = false;
    for weaker in tiers.iter().skip(selected_tier + 1) {
        if !weaker.is_empty() && !weaker.contains(&selected) {
            contested = true;
        }
    }

    // Auto only for a direct single-theme mapping nothing disagrees with;
    // inferred assignments go to the user even with one candidate.
    let strategy =
        if selected_tier == 0 && candidates.len() == 1 && !new_theme && !contested {
            Strategy::Auto
        } else {
            Strategy::UserApproval
        };

    ThemeProposal {
        file: path.to_string(),
        change,
        severity,
        theme: Some(selected),
        new_theme,
        strategy,
        signals,
    }
}

fn theme_matches_stem(theme: &str, stem: &str) -> bool {
    theme == stem || theme.starts_with(stem) || stem.starts_with(theme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::models::Theme;
    use std::collections::BTreeMap;

    fn index_with(themes: &[(&str, &[&str])]) -> ThemeFlowIndex {
        let mut index = ThemeFlowIndex::default();
        for (name, paths) in themes {
            index.insert_theme(Theme {
                name: name.to_string(),
                category: "functional".to_string(),
                description: String::new(),
                paths: paths.iter().map(|p| p.to_string()).collect(),
                linked_themes: vec![],
                shared_files: BTreeMap::new(),
                keywords: vec![],
            });
        }
        index
    }

    #[test]
    fn test_direct_mapping_applies_automatically() {
        let index = index_with(&[("authentication", &["src/auth"])]);
        let proposal = analyze_file(&index, "src/auth/oauth.js", ChangeKind::Added);

        assert_eq!(proposal.theme.as_deref(), Some("authentication"));
        assert_eq!(proposal.strategy, Strategy::Auto);
        assert_eq!(proposal.severity, Severity::Medium);
        assert!(proposal.signals.iter().any(|s| s.starts_with("direct:")));
        assert!(proposal.signals.iter().any(|s| s.starts_with("dir:")));
    }

    #[test]
    fn test_single_theme_directory_and_name_match_waits_for_approval() {
        // the file is not in any theme's list; directory and name both
        // point at the one existing authentication theme
        let index = index_with(&[("authentication", &["lib/auth_core"])]);
        let proposal = analyze_file(&index, "src/auth/oauth.js", ChangeKind::Added);

        assert_eq!(proposal.theme.as_deref(), Some("authentication"));
        assert!(!proposal.new_theme);
        assert_eq!(proposal.severity, Severity::Medium);
        assert_eq!(proposal.strategy, Strategy::UserApproval);
        assert!(proposal.signals.iter().any(|s| s.starts_with("dir:")));
        assert!(proposal.signals.iter().any(|s| s.starts_with("name:")));
    }

    #[test]
    fn test_directory_inference_for_unmapped_file() {
        let index = index_with(&[("payment", &["src/billing"])]);
        let proposal = analyze_file(&index, "src/payment/refunds.js", ChangeKind::Added);
        assert_eq!(proposal.theme.as_deref(), Some("payment"));
        assert!(!proposal.new_theme);
        assert_eq!(proposal.severity, Severity::Medium);
        assert_eq!(proposal.strategy, Strategy::UserApproval);
    }

    #[test]
    fn test_disagreeing_signals_force_review_of_direct_match() {
        let index = index_with(&[
            ("payment", &["src/payment"]),
            ("authentication", &["lib/auth"]),
        ]);
        // direct says payment, the file name says authentication
        let proposal = analyze_file(&index, "src/payment/auth_hook.js", ChangeKind::Added);
        assert_eq!(proposal.theme.as_deref(), Some("payment"));
        assert_eq!(proposal.strategy, Strategy::UserApproval);
        assert_eq!(proposal.severity, Severity::Medium);
    }

    #[test]
    fn test_unknown_directory_token_proposes_new_theme() {
        let index = index_with(&[("payment", &["src/billing"])]);
        let proposal = analyze_file(&index, "src/admin/panel.js", ChangeKind::Added);
        assert_eq!(proposal.theme.as_deref(), Some("admin"));
        assert!(proposal.new_theme);
        assert_eq!(proposal.strategy, Strategy::UserApproval);
    }

    #[test]
    fn test_multi_theme_deletion_is_manual_and_critical() {
        let index = index_with(&[
            ("authentication", &["src/shared/token.js"]),
            ("security", &["src/shared/token.js"]),
        ]);
        let proposal = analyze_file(&index, "src/shared/token.js", ChangeKind::Deleted);
        assert_eq!(proposal.strategy, Strategy::Manual);
        assert_eq!(proposal.severity, Severity::Critical);
        assert!(proposal.theme.is_none());
    }

    #[test]
    fn test_single_theme_deletion_flags_for_review() {
        let index = index_with(&[("authentication", &["src/auth/legacy.js"])]);
        let proposal = analyze_file(&index, "src/auth/legacy.js", ChangeKind::Deleted);
        assert_eq!(proposal.strategy, Strategy::UserApproval);
        assert_eq!(proposal.theme.as_deref(), Some("authentication"));
        assert_eq!(proposal.severity, Severity::High);
    }

    #[test]
    fn test_unrecognized_file_is_left_alone() {
        let index = index_with(&[("payment", &["src/billing"])]);
        let proposal = analyze_file(&index, "docs/notes.md", ChangeKind::Added);
        assert!(proposal.theme.is_none());
        assert_eq!(proposal.strategy, Strategy::Auto);
        assert!(proposal.signals.is_empty());
    }

    #[test]
    fn test_name_pattern_is_weakest_signal() {
        let index = index_with(&[("user", &["src/people"])]);
        let proposal = analyze_file(&index, "src/misc/user_export.rs", ChangeKind::Added);
        assert_eq!(proposal.theme.as_deref(), Some("user"));
        assert_eq!(proposal.severity, Severity::Low);
        assert_eq!(proposal.strategy, Strategy::UserApproval);
    }
}

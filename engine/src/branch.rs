//! Canonical-branch and work-branch management.
//!
//! One canonical branch (`ai-pm-org-main`) carries the organizational
//! state; parallel work happens on sequentially numbered
//! `ai-pm-org-branch-NNN` branches cut from it. Branch numbers are
//! allocated by the same database transaction that registers the branch.
//! Merging goes through native Git: conflicts surface in standard Git form
//! and the canonical branch has final authority; nothing here implements a
//! custom resolver.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use git2::{build::CheckoutBuilder, BranchType, Repository, Signature};
use serde::{Deserialize, Serialize};

use pm_core::{
    config::ProjectConfig,
    error::{PmError, Result},
    ids::{self, ORG_MAIN_BRANCH},
    models::{
        AuthorSource, Branch, BranchAuthor, BranchMeta, BranchStatus, EntityKind, Severity,
    },
};
use store::{common, ChangeSet, ChangeType, OrdinalScope, Store};

/// Stale thresholds: no commits in 14 days, or age beyond 30 days.
const STALE_IDLE_DAYS: i64 = 14;
const STALE_AGE_DAYS: i64 = 30;

/// How `ensure_org_main` satisfied the invariant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrgMainOutcome {
    /// Local canonical branch already present
    Existing,
    /// Checked out from `origin/ai-pm-org-main` (team-clone case)
    ClonedFromRemote,
    /// Recreated from the user's main with organizational files present
    Restored,
    /// Created fresh from the user's main
    Initialized,
}

/// Result of a merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeReport {
    pub branch: String,
    pub merge_commit: Option<String>,
    pub fast_forward: bool,
    pub deleted: bool,
}

/// Live status of one registered branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchStatusReport {
    pub branch: Branch,
    pub exists_in_git: bool,
    pub is_current_head: bool,
    pub tip_hash: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub idle_stale: bool,
    pub age_stale: bool,
}

impl BranchStatusReport {
    pub fn is_stale(&self) -> bool {
        self.idle_stale || self.age_stale
    }
}

/// Manages the canonical branch and parallel work branches.
///
/// Git is only ever touched while holding the process-wide Git mutex the
/// server hands in; the repository handle itself is opened per call.
pub struct BranchManager {
    store: Arc<Store>,
    config: Arc<ProjectConfig>,
    git_lock: Arc<Mutex<()>>,
}

impl BranchManager {
    pub fn new(store: Arc<Store>, config: Arc<ProjectConfig>, git_lock: Arc<Mutex<()>>) -> Self {
        Self {
            store,
            config,
            git_lock,
        }
    }

    fn project_root(&self) -> &Path {
        self.store.layout().project_root()
    }

    fn open_repo(&self) -> Result<Repository> {
        match Repository::open(self.project_root()) {
            Ok(repo) => Ok(repo),
            Err(_) if self.config.git.auto_init_repo => {
                let repo = Repository::init(self.project_root()).map_err(git_err)?;
                tracing::info!("Initialized Git repository for project root");
                Ok(repo)
            }
            Err(e) => Err(git_err(e)),
        }
    }

    /// Detect the acting user: git config, then environment, then the
    /// system login, finally the literal `ai-user`. The source is recorded
    /// alongside the identity.
    pub fn detect_author(repo: &Repository) -> BranchAuthor {
        if let Ok(config) = repo.config() {
            if let Ok(name) = config.get_string("user.name") {
                let email = config
                    .get_string("user.email")
                    .unwrap_or_else(|_| format!("{name}@localhost"));
                return BranchAuthor {
                    name,
                    email,
                    source: AuthorSource::GitConfig,
                };
            }
        }
        if let Ok(name) = std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
            if !name.is_empty() {
                return BranchAuthor {
                    email: format!("{name}@localhost"),
                    name,
                    source: AuthorSource::Environment,
                };
            }
        }
        if let Ok(name) = std::env::var("LOGNAME") {
            if !name.is_empty() {
                return BranchAuthor {
                    email: format!("{name}@localhost"),
                    name,
                    source: AuthorSource::System,
                };
            }
        }
        BranchAuthor {
            name: "ai-user".to_string(),
            email: "ai-user@localhost".to_string(),
            source: AuthorSource::Default,
        }
    }

    /// Guarantee the canonical branch exists locally, in preference order:
    /// already present; checked out from the remote of the same name;
    /// recreated from the user's main (restoration when `projectManagement/`
    /// already exists, initialization otherwise).
    pub fn ensure_org_main(&self) -> Result<OrgMainOutcome> {
        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = self.open_repo()?;

        if repo.find_branch(ORG_MAIN_BRANCH, BranchType::Local).is_ok() {
            return Ok(OrgMainOutcome::Existing);
        }

        let remote_name = format!("origin/{ORG_MAIN_BRANCH}");
        if let Ok(remote_branch) = repo.find_branch(&remote_name, BranchType::Remote) {
            let commit = remote_branch.get().peel_to_commit().map_err(git_err)?;
            let mut branch = repo
                .branch(ORG_MAIN_BRANCH, &commit, false)
                .map_err(git_err)?;
            branch.set_upstream(Some(&remote_name)).map_err(git_err)?;
            checkout(&repo, ORG_MAIN_BRANCH)?;
            tracing::info!("Checked out {ORG_MAIN_BRANCH} from {remote_name}");
            return Ok(OrgMainOutcome::ClonedFromRemote);
        }

        let base = head_or_initial_commit(&repo)?;
        repo.branch(ORG_MAIN_BRANCH, &base, false).map_err(git_err)?;
        checkout(&repo, ORG_MAIN_BRANCH)?;

        if self.project_root().join("projectManagement").is_dir() {
            tracing::info!("Restored {ORG_MAIN_BRANCH} around existing organizational state");
            Ok(OrgMainOutcome::Restored)
        } else {
            tracing::info!("Created {ORG_MAIN_BRANCH} from the user's main branch");
            Ok(OrgMainOutcome::Initialized)
        }
    }

    /// Create the next work branch from the canonical branch.
    ///
    /// The branch number comes out of the registering transaction, so two
    /// concurrent creations get consecutive numbers, never the same one.
    /// `.ai-pm-meta.json` is committed on the new branch and exists only
    /// there.
    pub async fn create_work_branch(&self, purpose: &str) -> Result<Branch> {
        self.ensure_org_main()?;

        let active = self.store.active_branch_count().await?;
        if active >= self.config.branch_management.max_active_branches {
            return Err(PmError::Validation(format!(
                "{active} active branches; limit is {}",
                self.config.branch_management.max_active_branches
            )));
        }

        let (author, base_hash) = {
            let _guard = self.git_lock.lock().expect("git mutex poisoned");
            let repo = self.open_repo()?;
            let author = Self::detect_author(&repo);
            let base = repo
                .find_branch(ORG_MAIN_BRANCH, BranchType::Local)
                .map_err(git_err)?
                .get()
                .peel_to_commit()
                .map_err(git_err)?;
            (author, base.id().to_string())
        };

        let now = Utc::now();
        let name_template = format!("{}{{{{ordinal3}}}}", ids::WORK_BRANCH_PREFIX);
        let change = ChangeSet::new("register work branch")
            .with_ordinal(OrdinalScope::Branch)
            .statement(
                "INSERT INTO ai_instance_branches (branch_name, branch_number, purpose, created_at, \
                 created_by_name, created_by_email, created_by_source, git_base_hash, status, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
                vec![
                    name_template.clone().into(),
                    "{{ordinal}}".into(),
                    purpose.into(),
                    now.into(),
                    author.name.clone().into(),
                    author.email.clone().into(),
                    common::author_source_to_string(author.source).into(),
                    base_hash.clone().into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::Branch, &name_template, ChangeType::Created);

        let applied = self.store.apply(change).await?;
        let number = applied
            .ordinal
            .ok_or_else(|| PmError::Internal("Branch number was not allocated".to_string()))?;
        let branch_name = ids::work_branch_name(number);

        let meta = BranchMeta {
            branch_number: number,
            created_at: now,
            created_by: author,
            git_base_hash: base_hash,
        };

        if let Err(err) = self.cut_branch_in_git(&branch_name, &meta) {
            // compensate: the registration row must not survive a failed cut
            let rollback = ChangeSet::new("unregister failed branch").statement(
                "UPDATE ai_instance_branches SET status = 'deleted', deleted_at = ? WHERE branch_name = ?",
                vec![Utc::now().into(), branch_name.clone().into()],
            );
            let _ = self.store.apply(rollback).await;
            return Err(err);
        }

        let branch = self
            .store
            .get_branch(&branch_name)
            .await?
            .ok_or_else(|| PmError::Internal(format!("Branch '{branch_name}' missing after insert")))?;
        tracing::info!(branch = %branch_name, number, purpose, "Work branch created");
        Ok(branch)
    }

    fn cut_branch_in_git(&self, branch_name: &str, meta: &BranchMeta) -> Result<()> {
        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = self.open_repo()?;

        let base = repo
            .find_branch(ORG_MAIN_BRANCH, BranchType::Local)
            .map_err(git_err)?
            .get()
            .peel_to_commit()
            .map_err(git_err)?;
        repo.branch(branch_name, &base, false).map_err(git_err)?;
        checkout(&repo, branch_name)?;

        // .ai-pm-meta.json lives only on the work branch
        let meta_path = self.project_root().join(".ai-pm-meta.json");
        let body = serde_json::to_string_pretty(meta)
            .map_err(|e| PmError::Internal(format!("Meta serialization failed: {e}")))?;
        std::fs::write(&meta_path, format!("{body}\n"))
            .map_err(|e| PmError::Git(format!("Failed to write branch meta: {e}")))?;

        let mut index = repo.index().map_err(git_err)?;
        index
            .add_path(Path::new(".ai-pm-meta.json"))
            .map_err(git_err)?;
        index.write().map_err(git_err)?;
        let tree_id = index.write_tree().map_err(git_err)?;
        let tree = repo.find_tree(tree_id).map_err(git_err)?;

        let signature = signature_for(&meta.created_by)?;
        let head = repo.head().map_err(git_err)?.peel_to_commit().map_err(git_err)?;
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Create {branch_name}"),
            &tree,
            &[&head],
        )
        .map_err(git_err)?;
        Ok(())
    }

    /// Merge a work branch into the canonical branch with native Git
    /// semantics. Conflicts are surfaced as `MergeConflict` and left in
    /// the repository in standard Git form for the user to resolve.
    pub async fn merge_work_branch(&self, branch_name: &str, delete_after: bool) -> Result<MergeReport> {
        let registered = self
            .store
            .get_branch(branch_name)
            .await?
            .ok_or_else(|| PmError::not_found("branch", branch_name))?;
        if registered.status != BranchStatus::Active {
            return Err(PmError::Validation(format!(
                "Branch '{branch_name}' is {}, not active",
                registered.status
            )));
        }

        let (merge_commit, fast_forward) = {
            let _guard = self.git_lock.lock().expect("git mutex poisoned");
            let repo = self.open_repo()?;

            let dirty = dirty_paths(&repo)?;
            if !dirty.is_empty() {
                return Err(PmError::GitDirty(format!(
                    "{} uncommitted change(s), first: {}",
                    dirty.len(),
                    dirty[0]
                )));
            }

            checkout(&repo, ORG_MAIN_BRANCH)?;

            let their_commit = repo
                .find_branch(branch_name, BranchType::Local)
                .map_err(|_| PmError::not_found("git branch", branch_name))?
                .get()
                .peel_to_commit()
                .map_err(git_err)?;
            let annotated = repo.find_annotated_commit(their_commit.id()).map_err(git_err)?;
            let (analysis, _) = repo.merge_analysis(&[&annotated]).map_err(git_err)?;

            let merged = if analysis.is_up_to_date() {
                (None, false)
            } else if analysis.is_fast_forward() {
                let mut reference = repo
                    .find_branch(ORG_MAIN_BRANCH, BranchType::Local)
                    .map_err(git_err)?
                    .into_reference();
                reference
                    .set_target(their_commit.id(), "fast-forward merge")
                    .map_err(git_err)?;
                checkout(&repo, ORG_MAIN_BRANCH)?;
                (Some(their_commit.id().to_string()), true)
            } else {
                repo.merge(&[&annotated], None, None).map_err(git_err)?;
                let mut index = repo.index().map_err(git_err)?;
                if index.has_conflicts() {
                    let conflicts = index
                        .conflicts()
                        .map_err(git_err)?
                        .filter_map(|c| c.ok())
                        .filter_map(|c| c.our.or(c.their))
                        .filter_map(|entry| String::from_utf8(entry.path).ok())
                        .collect();
                    // leave the merge in progress: main has final authority
                    // and standard Git tooling finishes the job
                    return Err(PmError::MergeConflict {
                        branch: branch_name.to_string(),
                        conflicts,
                    });
                }
                let tree_id = index.write_tree_to(&repo).map_err(git_err)?;
                let tree = repo.find_tree(tree_id).map_err(git_err)?;
                let our_commit = repo.head().map_err(git_err)?.peel_to_commit().map_err(git_err)?;
                let signature = signature_for(&Self::detect_author(&repo))?;
                let commit_id = repo
                    .commit(
                        Some("HEAD"),
                        &signature,
                        &signature,
                        &format!("Merge {branch_name} into {ORG_MAIN_BRANCH}"),
                        &tree,
                        &[&our_commit, &their_commit],
                    )
                    .map_err(git_err)?;
                repo.cleanup_state().map_err(git_err)?;
                checkout(&repo, ORG_MAIN_BRANCH)?;
                (Some(commit_id.to_string()), false)
            };

            // .ai-pm-meta.json belongs to work branches only; strip it from
            // the canonical branch when the merge carried it over
            strip_branch_meta(&repo, self.project_root())?;
            merged
        };

        let now = Utc::now();
        let mut change = ChangeSet::new(format!("merge {branch_name}"))
            .statement(
                "UPDATE ai_instance_branches SET status = 'merged', merged_at = ? WHERE branch_name = ?",
                vec![now.into(), branch_name.into()],
            )
            .notify(EntityKind::Branch, branch_name, ChangeType::Updated);

        let mut deleted = false;
        if delete_after {
            self.delete_branch_in_git(branch_name)?;
            change = change.statement(
                "UPDATE ai_instance_branches SET status = 'deleted', deleted_at = ? WHERE branch_name = ?",
                vec![now.into(), branch_name.into()],
            );
            deleted = true;
        }
        self.store.apply(change).await?;

        tracing::info!(branch = %branch_name, fast_forward, deleted, "Work branch merged");
        Ok(MergeReport {
            branch: branch_name.to_string(),
            merge_commit,
            fast_forward,
            deleted,
        })
    }

    /// Registered branches, newest first.
    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        self.store.branches().await
    }

    /// Live Git-backed status of one branch, with staleness flags.
    pub async fn branch_status(&self, branch_name: &str) -> Result<BranchStatusReport> {
        let branch = self
            .store
            .get_branch(branch_name)
            .await?
            .ok_or_else(|| PmError::not_found("branch", branch_name))?;

        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = self.open_repo()?;

        let git_branch = repo.find_branch(branch_name, BranchType::Local).ok();
        let tip = git_branch
            .as_ref()
            .and_then(|b| b.get().peel_to_commit().ok());
        let tip_hash = tip.as_ref().map(|c| c.id().to_string());
        let last_commit_at = tip
            .as_ref()
            .and_then(|c| DateTime::<Utc>::from_timestamp(c.time().seconds(), 0));

        let is_current_head = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(str::to_string))
            .is_some_and(|h| h == branch_name);

        let now = Utc::now();
        let idle_stale = last_commit_at
            .map(|at| now - at > Duration::days(STALE_IDLE_DAYS))
            .unwrap_or(false);
        let age_stale = now - branch.created_at > Duration::days(STALE_AGE_DAYS);

        Ok(BranchStatusReport {
            exists_in_git: git_branch.is_some(),
            is_current_head,
            tip_hash,
            last_commit_at,
            idle_stale,
            age_stale,
            branch,
        })
    }

    /// Stale active branches worth warning about. Never deletes anything.
    pub async fn stale_branches(&self) -> Result<Vec<BranchStatusReport>> {
        let mut stale = Vec::new();
        for branch in self.store.branches().await? {
            if branch.status != BranchStatus::Active {
                continue;
            }
            let report = self.branch_status(&branch.name).await?;
            if report.is_stale() {
                stale.push(report);
            }
        }
        Ok(stale)
    }

    /// Delete a work branch. Only on explicit user request; an unmerged
    /// branch needs `force`.
    pub async fn delete_branch(&self, branch_name: &str, force: bool) -> Result<()> {
        if branch_name == ORG_MAIN_BRANCH {
            return Err(PmError::Validation(
                "The canonical branch cannot be deleted".to_string(),
            ));
        }
        let branch = self
            .store
            .get_branch(branch_name)
            .await?
            .ok_or_else(|| PmError::not_found("branch", branch_name))?;
        if branch.status == BranchStatus::Active && !force {
            return Err(PmError::Validation(format!(
                "Branch '{branch_name}' is unmerged; pass force to delete anyway"
            )));
        }

        self.delete_branch_in_git(branch_name)?;

        let now = Utc::now();
        let event_id = ids::event_id(now);
        let change = ChangeSet::new(format!("delete branch {branch_name}"))
            .statement(
                "UPDATE ai_instance_branches SET status = 'deleted', deleted_at = ? WHERE branch_name = ?",
                vec![now.into(), branch_name.into()],
            )
            .statement(
                "INSERT INTO noteworthy_events (event_id, event_type, title, impact, reasoning, outcome, created_at) \
                 VALUES (?, 'decision', ?, ?, 'explicit user request', ?, ?)",
                vec![
                    event_id.into(),
                    format!("Branch {branch_name} deleted").into(),
                    common::severity_to_string(Severity::Low).into(),
                    format!("{branch_name} removed").into(),
                    now.into(),
                ],
            )
            .notify(EntityKind::Branch, branch_name, ChangeType::Deleted);
        self.store.apply(change).await?;
        Ok(())
    }

    fn delete_branch_in_git(&self, branch_name: &str) -> Result<()> {
        let _guard = self.git_lock.lock().expect("git mutex poisoned");
        let repo = self.open_repo()?;
        if let Ok(mut branch) = repo.find_branch(branch_name, BranchType::Local) {
            if repo
                .head()
                .ok()
                .and_then(|h| h.shorthand().map(str::to_string))
                .is_some_and(|h| h == branch_name)
            {
                checkout(&repo, ORG_MAIN_BRANCH)?;
            }
            branch.delete().map_err(git_err)?;
        }
        Ok(())
    }
}

fn git_err(err: git2::Error) -> PmError {
    PmError::Git(err.message().to_string())
}

fn signature_for(author: &BranchAuthor) -> Result<Signature<'static>> {
    Signature::now(&author.name, &author.email).map_err(git_err)
}

fn checkout(repo: &Repository, branch_name: &str) -> Result<()> {
    let (object, reference) = repo
        .revparse_ext(branch_name)
        .map_err(git_err)?;
    let mut builder = CheckoutBuilder::new();
    builder.safe();
    repo.checkout_tree(&object, Some(&mut builder))
        .map_err(git_err)?;
    match reference {
        Some(reference) => {
            let name = reference
                .name()
                .ok_or_else(|| PmError::Git("Branch reference has no name".to_string()))?;
            repo.set_head(name).map_err(git_err)?;
        }
        None => repo.set_head_detached(object.id()).map_err(git_err)?,
    }
    Ok(())
}

/// Remove `.ai-pm-meta.json` from the canonical branch after a merge
/// carried it over from a work branch. The file exists only on work
/// branches.
fn strip_branch_meta(repo: &Repository, project_root: &Path) -> Result<()> {
    let meta_rel = Path::new(".ai-pm-meta.json");
    let head_tree = repo
        .head()
        .map_err(git_err)?
        .peel_to_tree()
        .map_err(git_err)?;
    if head_tree.get_path(meta_rel).is_err() {
        return Ok(());
    }

    let mut index = repo.index().map_err(git_err)?;
    index.remove_path(meta_rel).map_err(git_err)?;
    index.write().map_err(git_err)?;
    let tree_id = index.write_tree().map_err(git_err)?;
    let tree = repo.find_tree(tree_id).map_err(git_err)?;
    let parent = repo
        .head()
        .map_err(git_err)?
        .peel_to_commit()
        .map_err(git_err)?;
    let signature = Signature::now("ai-user", "ai-user@localhost").map_err(git_err)?;
    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        "Remove work-branch metadata",
        &tree,
        &[&parent],
    )
    .map_err(git_err)?;

    let on_disk = project_root.join(meta_rel);
    if on_disk.exists() {
        std::fs::remove_file(&on_disk)
            .map_err(|e| PmError::Git(format!("Failed to remove branch meta: {e}")))?;
    }
    Ok(())
}

/// Paths with uncommitted changes. Ignored files and the live database
/// directory (process state, never merge content) do not count as dirty.
fn dirty_paths(repo: &Repository) -> Result<Vec<String>> {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut options)).map_err(git_err)?;
    Ok(statuses
        .iter()
        .filter(|entry| !entry.status().is_ignored())
        .filter_map(|entry| entry.path().map(str::to_string))
        .filter(|path| !path.starts_with("projectManagement/database/"))
        .collect())
}

/// The HEAD commit, or an initial empty commit for a brand-new repository.
fn head_or_initial_commit(repo: &Repository) -> Result<git2::Commit<'_>> {
    if let Ok(head) = repo.head() {
        return head.peel_to_commit().map_err(git_err);
    }
    // unborn branch: create the initial commit so branching has a base
    let signature = Signature::now("ai-user", "ai-user@localhost").map_err(git_err)?;
    let tree_id = {
        let mut index = repo.index().map_err(git_err)?;
        index.write_tree().map_err(git_err)?
    };
    let tree = repo.find_tree(tree_id).map_err(git_err)?;
    let commit_id = repo
        .commit(Some("HEAD"), &signature, &signature, "Initial commit", &tree, &[])
        .map_err(git_err)?;
    repo.find_commit(commit_id).map_err(git_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_report_shape() {
        let report = MergeReport {
            branch: "ai-pm-org-branch-001".to_string(),
            merge_commit: None,
            fast_forward: false,
            deleted: false,
        };
        assert_eq!(report.branch, "ai-pm-org-branch-001");
    }

    #[test]
    fn test_stale_flags() {
        let now = Utc::now();
        let branch = Branch {
            name: "ai-pm-org-branch-001".to_string(),
            number: 1,
            purpose: "auth".to_string(),
            created_at: now - Duration::days(45),
            created_by: BranchAuthor {
                name: "dev".to_string(),
                email: "dev@localhost".to_string(),
                source: AuthorSource::GitConfig,
            },
            git_base_hash: "abc".to_string(),
            status: BranchStatus::Active,
        };
        let report = BranchStatusReport {
            branch,
            exists_in_git: true,
            is_current_head: false,
            tip_hash: Some("abc".to_string()),
            last_commit_at: Some(now - Duration::days(20)),
            idle_stale: true,
            age_stale: true,
        };
        assert!(report.is_stale());
    }
}

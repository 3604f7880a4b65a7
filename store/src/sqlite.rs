use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::sync::{broadcast, Mutex};

use pm_core::{
    error::{PmError, Result},
    layout::ProjectLayout,
    models::{
        Branch, EntityKind, GitProjectState, NoteworthyEvent, Session, Sidequest, Subtask, Task,
    },
};

use crate::changeset::{ChangeNotice, ChangeSet, OrdinalScope, SqlValue};
use crate::common::{
    row_to_branch, row_to_event, row_to_git_state, row_to_session, row_to_sidequest,
    row_to_subtask, row_to_task, sqlx_error_to_pm_error,
};
use crate::paired;

const ENTITY_KINDS: [EntityKind; 11] = [
    EntityKind::Session,
    EntityKind::Task,
    EntityKind::Subtask,
    EntityKind::Sidequest,
    EntityKind::Milestone,
    EntityKind::Theme,
    EntityKind::Flow,
    EntityKind::ImplementationPlan,
    EntityKind::NoteworthyEvent,
    EntityKind::Branch,
    EntityKind::GitProjectState,
];

/// Tuning knobs for the store. Defaults match the documented limits.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Pending `apply` calls beyond this receive `Busy`
    pub max_pending_writes: usize,
    /// Bounded retry count for `Conflict`
    pub conflict_retry_limit: u32,
    /// Minify machine-owned JSON artifacts
    pub minify_machine_json: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_pending_writes: 32,
            conflict_retry_limit: 3,
            minify_machine_json: true,
        }
    }
}

/// Receipt for an applied change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub txn_id: String,
    /// The ordinal allocated inside the transaction, when one was requested
    pub ordinal: Option<u32>,
}

/// What boot recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions that never committed; their file changes were undone
    pub rolled_back: Vec<String>,
    /// Transactions that committed but were not swept; cleanup finished
    pub completed: Vec<String>,
}

/// The hybrid file+database store.
///
/// Single logical writer: every mutation flows through [`Store::apply`],
/// which serializes on an internal mutex and executes the paired-write
/// protocol. Reads go straight to the pool. All other components hold
/// entities by id and route mutations here; nothing else writes the file
/// tree or the database.
pub struct Store {
    pool: SqlitePool,
    layout: ProjectLayout,
    options: StoreOptions,
    writer: Mutex<()>,
    pending: AtomicUsize,
    txn_counter: AtomicU64,
    channels: HashMap<EntityKind, broadcast::Sender<ChangeNotice>>,
}

impl Store {
    /// Open (creating if needed) the project database and file tree, run
    /// migrations, and replay any interrupted paired writes.
    pub async fn open(layout: ProjectLayout, options: StoreOptions) -> Result<Self> {
        for dir in layout.all_directories() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                PmError::Database(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }

        let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(layout.database_file())
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_pm_error)?;

        let mut channels = HashMap::new();
        for kind in ENTITY_KINDS {
            let (tx, _rx) = broadcast::channel(64);
            channels.insert(kind, tx);
        }

        let store = Self {
            pool,
            layout,
            options,
            writer: Mutex::new(()),
            pending: AtomicUsize::new(0),
            txn_counter: AtomicU64::new(0),
            channels,
        };

        store.migrate().await?;
        let report = store.recover().await?;
        if !report.rolled_back.is_empty() || !report.completed.is_empty() {
            tracing::info!(
                rolled_back = report.rolled_back.len(),
                completed = report.completed.len(),
                "Paired-write recovery replayed interrupted transactions"
            );
        }
        Ok(store)
    }

    /// Apply all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| PmError::Database(format!("Migration failed: {e}")))?;
        tracing::debug!("Database migrations completed");
        Ok(())
    }

    /// Reconcile the file tree against the database after an unclean
    /// shutdown. The database is authoritative: journals without a commit
    /// marker are rolled back so the caller observes the pre-change state;
    /// committed journals only need their backups swept.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let database_dir = self.layout.database_dir();

        for journal in paired::find_orphan_journals(&database_dir)? {
            let committed: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM store_txns WHERE txn_id = ?)",
            )
            .bind(&journal.txn_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_pm_error)?;

            if committed {
                paired::cleanup(&database_dir, &journal)?;
                report.completed.push(journal.txn_id);
            } else {
                tracing::warn!(
                    txn_id = %journal.txn_id,
                    description = %journal.description,
                    "Rolling back uncommitted paired write"
                );
                paired::rollback(&journal)?;
                paired::cleanup(&database_dir, &journal)?;
                report.rolled_back.push(journal.txn_id);
            }
        }
        Ok(report)
    }

    /// Execute a change set as one serializable unit: either every SQL
    /// statement and every file operation commits, or none do.
    ///
    /// `Conflict` is retried with bounded exponential backoff; every other
    /// error surfaces unaltered. When the queue of pending applies exceeds
    /// the configured bound the call fails fast with `Busy`.
    pub async fn apply(&self, change: ChangeSet) -> Result<Applied> {
        let queued = self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(&self.pending);
        if queued >= self.options.max_pending_writes {
            return Err(PmError::Busy(format!(
                "{queued} writes already queued (limit {})",
                self.options.max_pending_writes
            )));
        }

        let mut attempt = 0;
        loop {
            match self.apply_once(&change).await {
                Err(err) if err.is_retryable() && attempt < self.options.conflict_retry_limit => {
                    attempt += 1;
                    let backoff = std::time::Duration::from_millis(25 << attempt);
                    tracing::debug!(
                        attempt,
                        description = %change.description,
                        "Retrying conflicted write after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn apply_once(&self, change: &ChangeSet) -> Result<Applied> {
        let _writer = self.writer.lock().await;
        let txn_id = self.next_txn_id();
        let now = Utc::now();
        let mut change = change.clone();

        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_pm_error)?;

        // Ordinals come from MAX(n)+1 inside this same transaction, which
        // is what keeps them strictly monotonic under concurrent calls.
        let ordinal = match &change.allocator {
            Some(OrdinalScope::Sidequest { parent_task_id }) => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM sidequest_status WHERE parent_task_id = ?",
                )
                .bind(parent_task_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_pm_error)?;
                Some(next as u32)
            }
            Some(OrdinalScope::Branch) => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(branch_number), 0) + 1 FROM ai_instance_branches",
                )
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_pm_error)?;
                Some(next as u32)
            }
            None => None,
        };
        if let Some(ordinal) = ordinal {
            change.resolve_ordinal(ordinal);
        }

        // Journal before any target is touched; stage temps and pre-images.
        let database_dir = self.layout.database_dir();
        let journal = paired::plan_journal(&txn_id, &change.description, now, &change.file_ops);
        paired::write_journal(&database_dir, &journal)?;
        if let Err(err) =
            paired::stage(&journal, &change.file_ops, self.options.minify_machine_json)
        {
            let _ = paired::rollback(&journal);
            let _ = paired::cleanup(&database_dir, &journal);
            return Err(err);
        }

        if let Err(err) = self.execute_sql_half(&mut tx, &change, &txn_id, now).await {
            let _ = paired::rollback(&journal);
            let _ = paired::cleanup(&database_dir, &journal);
            return Err(err);
        }

        // Make file changes visible, then commit. A crash between these two
        // steps is the window recovery is built for.
        if let Err(err) = paired::promote(&journal) {
            let _ = paired::rollback(&journal);
            let _ = paired::cleanup(&database_dir, &journal);
            return Err(err);
        }

        if let Err(err) = tx.commit().await.map_err(sqlx_error_to_pm_error) {
            let _ = paired::rollback(&journal);
            let _ = paired::cleanup(&database_dir, &journal);
            return Err(err);
        }

        if let Err(err) = paired::cleanup(&database_dir, &journal) {
            // the write is durable; sweeping again on next boot is enough
            tracing::warn!(txn_id = %txn_id, error = %err, "Post-commit cleanup incomplete");
        }

        for notice in &change.notices {
            if let Some(channel) = self.channels.get(&notice.kind) {
                let _ = channel.send(notice.clone());
            }
        }

        tracing::debug!(
            txn_id = %txn_id,
            description = %change.description,
            statements = change.statements.len(),
            files = change.file_ops.len(),
            "Applied change set"
        );

        Ok(Applied { txn_id, ordinal })
    }

    async fn execute_sql_half(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        change: &ChangeSet,
        txn_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        for statement in &change.statements {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = match param {
                    SqlValue::Null => query.bind(None::<String>),
                    SqlValue::Integer(v) => query.bind(*v),
                    SqlValue::Real(v) => query.bind(*v),
                    SqlValue::Text(v) => query.bind(v.clone()),
                    SqlValue::Timestamp(v) => query.bind(*v),
                    SqlValue::Bool(v) => query.bind(*v),
                };
            }
            query
                .execute(&mut **tx)
                .await
                .map_err(sqlx_error_to_pm_error)?;
        }

        // Audit trail for the file half
        for op in &change.file_ops {
            let (operation, path) = match op {
                crate::changeset::FileOp::Write { path, .. } => ("write", path.clone()),
                crate::changeset::FileOp::Rename { to, .. } => ("rename", to.clone()),
                crate::changeset::FileOp::Delete { path } => ("delete", path.clone()),
            };
            sqlx::query(
                "INSERT INTO file_modifications (txn_id, file_path, operation, modified_at) VALUES (?, ?, ?, ?)",
            )
            .bind(txn_id)
            .bind(path.to_string_lossy().into_owned())
            .bind(operation)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(sqlx_error_to_pm_error)?;
        }

        // Referential integrity over the transaction's view
        let violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&mut **tx)
            .await
            .map_err(sqlx_error_to_pm_error)?;
        if !violations.is_empty() {
            let table: String = violations[0].get(0);
            return Err(PmError::Integrity(format!(
                "{} dangling reference(s), first in table '{table}'",
                violations.len()
            )));
        }

        // Commit marker: the final statement of every paired write
        sqlx::query("INSERT INTO store_txns (txn_id, committed_at) VALUES (?, ?)")
            .bind(txn_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(sqlx_error_to_pm_error)?;

        Ok(())
    }

    fn next_txn_id(&self) -> String {
        let counter = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{counter:04}",
            Utc::now().timestamp_millis(),
            std::process::id()
        )
    }

    /// Change notifications for one entity kind. The stream is finite per
    /// session: it ends when the store is dropped.
    pub fn subscribe(&self, kind: EntityKind) -> broadcast::Receiver<ChangeNotice> {
        self.channels
            .get(&kind)
            .expect("channel exists for every entity kind")
            .subscribe()
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Direct pool access for view queries and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Snapshot getters
    // ------------------------------------------------------------------

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.fetch_one("SELECT * FROM task_status WHERE task_id = ?", id, row_to_task)
            .await
    }

    pub async fn get_sidequest(&self, id: &str) -> Result<Option<Sidequest>> {
        self.fetch_one(
            "SELECT * FROM sidequest_status WHERE sidequest_id = ?",
            id,
            row_to_sidequest,
        )
        .await
    }

    pub async fn get_subtask(&self, parent_id: &str, subtask_id: &str) -> Result<Option<Subtask>> {
        let row = sqlx::query("SELECT * FROM subtask_status WHERE parent_id = ? AND subtask_id = ?")
            .bind(parent_id)
            .bind(subtask_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_pm_error)?;
        row.map(|r| row_to_subtask(&r)).transpose()
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.fetch_one("SELECT * FROM sessions WHERE id = ?", id, row_to_session)
            .await
    }

    pub async fn get_branch(&self, name: &str) -> Result<Option<Branch>> {
        self.fetch_one(
            "SELECT * FROM ai_instance_branches WHERE branch_name = ?",
            name,
            row_to_branch,
        )
        .await
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<NoteworthyEvent>> {
        self.fetch_one(
            "SELECT * FROM noteworthy_events WHERE event_id = ?",
            id,
            row_to_event,
        )
        .await
    }

    /// The current Git state row for a project path.
    pub async fn get_git_state(&self, project_path: &str) -> Result<Option<GitProjectState>> {
        self.fetch_one(
            "SELECT * FROM git_project_state WHERE project_path = ? AND is_current = 1",
            project_path,
            row_to_git_state,
        )
        .await
    }

    /// A stored user preference, if set.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM user_preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_pm_error)
    }

    async fn fetch_one<T>(
        &self,
        sql: &str,
        id: &str,
        map: fn(&SqliteRow) -> Result<T>,
    ) -> Result<Option<T>> {
        let row = sqlx::query(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_pm_error)?;
        row.map(|r| map(&r)).transpose()
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("layout", &self.layout)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeType, JsonStyle};
    use pm_core::models::WorkStatus;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let store = Store::open(layout, StoreOptions::default()).await.unwrap();
        (dir, store)
    }

    fn insert_task(task_id: &str) -> ChangeSet {
        ChangeSet::new("create task")
            .statement(
                "INSERT INTO task_status (task_id, title, status, priority, milestone_id, primary_theme, created_at, last_updated) \
                 VALUES (?, ?, 'pending', 'medium', 'M-01', 'payment', ?, ?)",
                vec![
                    task_id.into(),
                    "Test task".into(),
                    Utc::now().into(),
                    Utc::now().into(),
                ],
            )
            .notify(EntityKind::Task, task_id, ChangeType::Created)
    }

    #[tokio::test]
    async fn test_open_creates_tree_and_schema() {
        let (dir, store) = open_store().await;
        assert!(dir.path().join("projectManagement/database/project.db").exists());
        assert!(dir.path().join("projectManagement/Tasks/active").exists());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_status")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_apply_pairs_sql_and_file() {
        let (dir, store) = open_store().await;
        let file = dir.path().join("projectManagement/Tasks/active/TASK-1.json");

        let change = insert_task("TASK-1").write_json(
            &file,
            json!({"id": "TASK-1", "title": "Test task"}),
            JsonStyle::Machine,
        );
        let applied = store.apply(change).await.unwrap();
        assert!(applied.ordinal.is_none());

        let task = store.get_task("TASK-1").await.unwrap().unwrap();
        assert_eq!(task.status, WorkStatus::Pending);
        assert!(file.exists());

        // audit row for the file half
        let ops: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_modifications")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(ops, 1);
    }

    #[tokio::test]
    async fn test_failed_sql_leaves_no_file_change() {
        let (dir, store) = open_store().await;
        let file = dir.path().join("projectManagement/Tasks/active/TASK-2.json");

        let change = ChangeSet::new("broken write")
            .statement("INSERT INTO no_such_table (x) VALUES (?)", vec!["y".into()])
            .write_json(&file, json!({"id": "TASK-2"}), JsonStyle::Machine);

        let result = store.apply(change).await;
        assert!(result.is_err());
        assert!(!file.exists(), "file half must not land when SQL fails");

        // no stray temps, backups or journals
        let database_dir = store.layout().database_dir();
        let leftovers: Vec<_> = std::fs::read_dir(&database_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".txn-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_integrity_violation_rejected() {
        let (_dir, store) = open_store().await;

        // sidequest referencing a task that does not exist
        let change = ChangeSet::new("dangling sidequest").statement(
            "INSERT INTO sidequest_status (sidequest_id, parent_task_id, ordinal, title, primary_theme, created_at, last_updated) \
             VALUES ('SQ-1', 'TASK-MISSING', 1, 't', 'payment', ?, ?)",
            vec![Utc::now().into(), Utc::now().into()],
        );
        let err = store.apply(change).await.unwrap_err();
        assert!(
            matches!(err, PmError::Integrity(_) | PmError::Database(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_sidequest_ordinal_allocation_is_monotonic() {
        let (_dir, store) = open_store().await;
        store.apply(insert_task("TASK-1")).await.unwrap();

        for expected in 1..=3_u32 {
            let change = ChangeSet::new("create sidequest")
                .with_ordinal(OrdinalScope::Sidequest {
                    parent_task_id: "TASK-1".to_string(),
                })
                .statement(
                    "INSERT INTO sidequest_status (sidequest_id, parent_task_id, ordinal, title, primary_theme, created_at, last_updated) \
                     VALUES (?, 'TASK-1', ?, 't', 'security', ?, ?)",
                    vec![
                        "SQ-20250712093015-{{ordinal3}}".into(),
                        "{{ordinal}}".into(),
                        Utc::now().into(),
                        Utc::now().into(),
                    ],
                );
            let applied = store.apply(change).await.unwrap();
            assert_eq!(applied.ordinal, Some(expected));
        }

        let sq = store
            .get_sidequest("SQ-20250712093015-002")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sq.parent_task_id, "TASK-1");
    }

    #[tokio::test]
    async fn test_trigger_maintains_active_sidequest_count() {
        let (_dir, store) = open_store().await;
        store.apply(insert_task("TASK-1")).await.unwrap();

        for n in 1..=2_i64 {
            let change = ChangeSet::new("create sidequest").statement(
                "INSERT INTO sidequest_status (sidequest_id, parent_task_id, ordinal, title, primary_theme, created_at, last_updated) \
                 VALUES (?, 'TASK-1', ?, 't', 'security', ?, ?)",
                vec![
                    format!("SQ-X-{n:03}").into(),
                    n.into(),
                    Utc::now().into(),
                    Utc::now().into(),
                ],
            );
            store.apply(change).await.unwrap();
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT active_sidequests_count FROM task_sidequest_limits WHERE task_id = 'TASK-1'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 2);

        // completing one decrements via the trigger
        store
            .apply(ChangeSet::new("complete sidequest").statement(
                "UPDATE sidequest_status SET status = 'completed' WHERE sidequest_id = 'SQ-X-001'",
                vec![],
            ))
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT active_sidequests_count FROM task_sidequest_limits WHERE task_id = 'TASK-1'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_subscription_receives_notice() {
        let (_dir, store) = open_store().await;
        let mut rx = store.subscribe(EntityKind::Task);

        store.apply(insert_task("TASK-1")).await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, EntityKind::Task);
        assert_eq!(notice.id, "TASK-1");
        assert_eq!(notice.change, ChangeType::Created);
    }

    #[tokio::test]
    async fn test_one_in_progress_task_per_session_index() {
        let (_dir, store) = open_store().await;

        store
            .apply(ChangeSet::new("session").statement(
                "INSERT INTO sessions (id, start_time, last_activity) VALUES ('S1', ?, ?)",
                vec![Utc::now().into(), Utc::now().into()],
            ))
            .await
            .unwrap();
        store.apply(insert_task("TASK-1")).await.unwrap();
        store.apply(insert_task("TASK-2")).await.unwrap();

        store
            .apply(ChangeSet::new("start 1").statement(
                "UPDATE task_status SET status = 'in-progress', session_id = 'S1' WHERE task_id = 'TASK-1'",
                vec![],
            ))
            .await
            .unwrap();

        let err = store
            .apply(ChangeSet::new("start 2").statement(
                "UPDATE task_status SET status = 'in-progress', session_id = 'S1' WHERE task_id = 'TASK-2'",
                vec![],
            ))
            .await
            .unwrap_err();
        // unique partial index -> surfaced as an exhausted Conflict retry
        assert!(matches!(err, PmError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let (_dir, store) = open_store().await;
        assert!(store.get_preference("boot.mode").await.unwrap().is_none());

        store
            .apply(ChangeSet::new("set preference").statement(
                "INSERT INTO user_preferences (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                vec!["boot.mode".into(), "fast".into(), Utc::now().into()],
            ))
            .await
            .unwrap();

        assert_eq!(
            store.get_preference("boot.mode").await.unwrap().as_deref(),
            Some("fast")
        );
    }
}

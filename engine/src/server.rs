//! The explicit handle that owns every orchestrator component.
//!
//! No module-level registries, no implicit statics: one `Server` value owns
//! the store, the scheduler, the context loader, the branch manager and the
//! git bridge, plus the process-wide Git mutex they share. Tools receive
//! the handle as a parameter; lifecycle is tied to the process.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::RwLock;

use pm_core::{
    config::ProjectConfig,
    error::Result,
    layout::ProjectLayout,
};
use store::{Store, StoreOptions};

use crate::branch::BranchManager;
use crate::context::ContextLoader;
use crate::git_bridge::GitBridge;
use crate::scheduler::Scheduler;
use crate::theme_flow::ThemeFlowIndex;

/// Owner of all orchestrator components for one project.
pub struct Server {
    store: Arc<Store>,
    config: Arc<ProjectConfig>,
    index: Arc<RwLock<ThemeFlowIndex>>,
    scheduler: Scheduler,
    context_loader: ContextLoader,
    branch_manager: BranchManager,
    git_bridge: GitBridge,
    current_session: RwLock<Option<String>>,
}

impl Server {
    /// Open the project's store, build the theme/flow index, and wire the
    /// components around them.
    pub async fn initialize(project_root: impl Into<std::path::PathBuf>, config: ProjectConfig) -> Result<Self> {
        let layout = ProjectLayout::new(project_root);
        let store_options = StoreOptions {
            minify_machine_json: config.project.minify_json,
            ..Default::default()
        };
        let store = Arc::new(Store::open(layout.clone(), store_options).await?);
        let config = Arc::new(config);

        let index = Arc::new(RwLock::new(ThemeFlowIndex::load(&layout)?));
        {
            // keep the edge tables in step with the files we just read
            let guard = index.read().await;
            store.apply(guard.sync_changeset(&config)).await?;
        }

        // one Git mutex for the whole process; only BranchManager and
        // GitBridge ever touch the repository
        let git_lock = Arc::new(StdMutex::new(()));

        let scheduler = Scheduler::new(store.clone(), config.clone(), index.clone());
        let context_loader = ContextLoader::new(store.clone(), config.clone(), index.clone());
        let branch_manager = BranchManager::new(store.clone(), config.clone(), git_lock.clone());
        let git_bridge = GitBridge::new(store.clone(), config.clone(), git_lock);

        tracing::info!(
            project_root = %store.layout().project_root().display(),
            "Orchestrator server initialized"
        );

        Ok(Self {
            store,
            config,
            index,
            scheduler,
            context_loader,
            branch_manager,
            git_bridge,
            current_session: RwLock::new(None),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Arc<ProjectConfig> {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn context_loader(&self) -> &ContextLoader {
        &self.context_loader
    }

    pub fn branch_manager(&self) -> &BranchManager {
        &self.branch_manager
    }

    pub fn git_bridge(&self) -> &GitBridge {
        &self.git_bridge
    }

    pub fn index(&self) -> Arc<RwLock<ThemeFlowIndex>> {
        self.index.clone()
    }

    /// Rebuild the theme/flow index from the file tree and refresh the
    /// database edge tables.
    pub async fn reload_index(&self) -> Result<()> {
        let fresh = ThemeFlowIndex::load(self.store.layout())?;
        let change = fresh.sync_changeset(&self.config);
        {
            let mut guard = self.index.write().await;
            *guard = fresh;
        }
        self.store.apply(change).await?;
        Ok(())
    }

    pub async fn current_session(&self) -> Option<String> {
        self.current_session.read().await.clone()
    }

    pub(crate) async fn set_current_session(&self, session_id: &str) {
        *self.current_session.write().await = Some(session_id.to_string());
    }

    pub(crate) async fn clear_current_session(&self) {
        *self.current_session.write().await = None;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("project_root", &self.store.layout().project_root())
            .finish_non_exhaustive()
    }
}

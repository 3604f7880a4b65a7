use anyhow::{Context, Result};
use engine::Server;
use mcp_protocol::{McpOrchestratorHandler, McpServer};
use pm_core::{layout::ProjectLayout, ProjectConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load the per-project configuration (`UserSettings/config.json`).
/// A missing file means defaults; `AI_PM_*` environment overrides apply
/// either way.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let layout = ProjectLayout::new(project_root);
    let path = layout.config_file();

    let mut config = if path.exists() {
        info!("Loading project configuration from {}", path.display());
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ProjectConfig::from_json(&body).context("Invalid project configuration")?
    } else {
        info!("No project configuration found; using defaults");
        ProjectConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Build the engine server for the project.
pub async fn create_engine(project_root: &Path) -> Result<Arc<Server>> {
    info!("Initializing orchestrator engine");

    let project_config = load_project_config(project_root)?;
    let server = Server::initialize(project_root, project_config)
        .await
        .context("Failed to initialize orchestrator engine")?;

    info!("Orchestrator engine initialized");
    Ok(Arc::new(server))
}

/// Create and configure the MCP server around the engine.
pub fn create_server(engine: Arc<Server>) -> McpServer {
    info!("Creating MCP server");
    let handler = Arc::new(McpOrchestratorHandler::new(engine));
    McpServer::new(handler)
}

/// Initialize the complete application: engine plus transport.
pub async fn initialize_app(project_root: &Path) -> Result<McpServer> {
    info!("Initializing application");

    let engine = create_engine(project_root)
        .await
        .context("Failed to create engine")?;
    let server = create_server(engine);

    info!("Application initialized");
    Ok(server)
}

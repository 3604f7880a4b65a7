mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::{resolve_project_root, Config};
use setup::initialize_app;
use telemetry::{init_telemetry, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ai-pm-mcp")]
#[command(about = "AI Project Manager MCP Server - work and context orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Start the MCP server
    #[arg(long)]
    start: bool,

    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Project root directory (will create projectManagement/ inside)
    #[arg(long, env = "PROJECT_ROOT")]
    project_root: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Listen address override (default: 127.0.0.1)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level override
    #[arg(long, env = "AI_PM_LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!("Loading configuration from file: {}", config_file);
            Config::from_file(config_file)?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env()?
        }
    };

    // Apply CLI overrides
    if let Some(ref listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr.clone();
    }
    config.server.port = cli.port;

    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    if !cli.start {
        println!("AI Project Manager MCP Server");
        println!();
        println!("Usage:");
        println!("  ai-pm-mcp --start --port=3000 --project-root=/path/to/project");
        println!();
        println!("This will:");
        println!("  - Open (or create) projectManagement/ and its database in the project root");
        println!("  - Recover any interrupted writes and restore the prior session state");
        println!("  - Serve the orchestrator tools over JSON-RPC on the given port");
        println!();
        println!("For more options, use: ai-pm-mcp --help");
        return Ok(());
    }

    let project_root =
        resolve_project_root(cli.project_root.as_deref()).context("Invalid project root")?;

    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    log_startup_info(&config, &project_root);

    let server = initialize_app(&project_root)
        .await
        .context("Failed to initialize application")?;

    println!("AI Project Manager MCP Server is ready");
    println!("  Listening on: http://{}", config.server_address());
    println!("  Project root: {}", project_root.display());
    println!();
    println!("Press Ctrl+C to shutdown");

    // Setup graceful shutdown handling
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(());
    });

    let server_addr = config.server_address();
    tokio::select! {
        result = server.serve(&server_addr) => {
            match result {
                Ok(_) => {
                    info!("MCP server shut down cleanly");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "MCP server error");
                    std::process::exit(3);
                }
            }
        }
        _ = shutdown_rx => {
            info!("Shutdown signal received, stopping server");
            Ok(())
        }
    }
}

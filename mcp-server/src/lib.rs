//! MCP Server Library
//!
//! This library provides the binary's building blocks: server configuration
//! management, telemetry initialization, and application setup wiring the
//! orchestrator engine to its protocol transport.

pub mod config;
pub mod setup;
pub mod telemetry;

pub use config::Config;
pub use setup::{create_engine, create_server, initialize_app, load_project_config};
pub use telemetry::init_telemetry;

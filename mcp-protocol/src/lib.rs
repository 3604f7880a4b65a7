//! Protocol surface for the work and context orchestrator.
//!
//! This crate maps tool calls onto the engine: typed parameters, a tagged
//! tool registry keyed by stable ids, JSON-RPC error mapping that carries
//! each error's stable kind and details payload, and a thin axum transport
//! (JSON-RPC POST + SSE + health). The MCP wire protocol details beyond
//! that are out of scope here; the registry is the contract.

pub mod error;
pub mod handler;
pub mod params;
pub mod registry;
pub mod serialization;
pub mod server;

pub use error::McpError;
pub use handler::{HealthStatus, McpOrchestratorHandler};
pub use registry::{ToolId, ALL_TOOLS};
pub use server::McpServer;

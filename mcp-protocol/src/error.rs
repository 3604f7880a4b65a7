//! Error handling for the MCP protocol surface.
//!
//! Maps orchestrator errors to JSON-RPC error objects carrying the stable
//! error kind and the structured details payload (resolutions included).

use pm_core::PmError;
use serde_json::{json, Value};
use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum McpError {
    #[error("{0}")]
    Domain(PmError),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session is read-only: {0}")]
    ReadOnly(String),
}

impl McpError {
    /// Convert to JSON-RPC error code
    pub fn to_error_code(&self) -> i32 {
        match self {
            McpError::Domain(err) => match err {
                PmError::NotFound(_) => -32001,
                PmError::Validation(_) => -32002,
                PmError::LimitExceeded { .. } => -32003,
                PmError::StateTransitionForbidden { .. } => -32004,
                PmError::Busy(_) => -32005,
                PmError::Conflict(_) => -32006,
                PmError::MergeConflict { .. } => -32007,
                PmError::GitDirty(_) => -32008,
                PmError::ReconciliationRequired(_) => -32009,
                PmError::SessionExpired(_) => -32010,
                _ => -32011,
            },
            McpError::UnknownTool(_) => -32601,
            McpError::Protocol(_) => -32600,
            McpError::Serialization(_) => -32602,
            McpError::ReadOnly(_) => -32012,
        }
    }

    /// Stable machine-readable kind string for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::Domain(err) => err.kind(),
            McpError::UnknownTool(_) => "not_found",
            McpError::Protocol(_) => "protocol",
            McpError::Serialization(_) => "serialization",
            McpError::ReadOnly(_) => "read_only",
        }
    }

    /// Structured details payload; recoverable errors include their
    /// suggested resolutions.
    pub fn details(&self) -> Value {
        match self {
            McpError::Domain(err) => err.details(),
            McpError::UnknownTool(id) => json!({ "tool": id }),
            _ => json!({}),
        }
    }

    /// Convert to a JSON-RPC error response
    pub fn to_json_rpc_error(&self, id: Option<Value>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.to_error_code(),
                "message": self.to_string(),
                "data": {
                    "kind": self.kind(),
                    "details": self.details(),
                }
            },
            "id": id
        })
    }
}

impl From<PmError> for McpError {
    fn from(err: PmError) -> Self {
        McpError::Domain(err)
    }
}

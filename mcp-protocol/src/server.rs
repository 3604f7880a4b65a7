//! JSON-RPC + SSE transport over axum.
//!
//! The transport itself is deliberately thin: one POST endpoint for
//! JSON-RPC, one SSE stream with a heartbeat, one health probe. Method
//! routing goes through the tagged [`ToolId`] registry; everything else is
//! the handler's business.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Sse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use crate::error::McpError;
use crate::handler::McpOrchestratorHandler;
use crate::params::*;
use crate::registry::{ToolId, ALL_TOOLS};
use crate::serialization::{create_success_response, deserialize_params, serialize_result};

/// The MCP server binding a handler to its transport.
pub struct McpServer {
    handler: Arc<McpOrchestratorHandler>,
}

impl McpServer {
    pub fn new(handler: Arc<McpOrchestratorHandler>) -> Self {
        Self { handler }
    }

    /// Serve until the listener fails or the task is cancelled.
    pub async fn serve(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_router();

        info!("Starting MCP server on {addr}");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Router with all endpoints.
    pub fn create_router(self) -> Router {
        Router::new()
            .route("/mcp/v1", get(sse_handler))
            .route("/mcp/v1/rpc", post(rpc_handler))
            .route("/health", get(health_handler))
            .with_state(self.handler)
    }
}

/// Route one JSON-RPC request through the registry.
pub async fn route_method(
    handler: &McpOrchestratorHandler,
    method: &str,
    params: Value,
    id: Option<Value>,
) -> Value {
    match execute_method(handler, method, params).await {
        Ok(value) => create_success_response(id, value),
        Err(err) => err.to_json_rpc_error(id),
    }
}

/// Execute one tool by id. Unknown ids produce a structured not-found;
/// mutating tools are refused while the session is read-only.
pub async fn execute_method(
    handler: &McpOrchestratorHandler,
    method: &str,
    params: Value,
) -> Result<Value, McpError> {
    let Some(tool) = ToolId::parse(method) else {
        return Err(McpError::UnknownTool(method.to_string()));
    };

    if tool.is_mutating() && handler.is_read_only() && tool != ToolId::SessionBoot {
        return Err(McpError::ReadOnly(
            "boot degraded; only read-only tools are available".to_string(),
        ));
    }

    if tool.is_mutating() && tool != ToolId::SessionBoot {
        // activity stamp; failures here must not mask the real call
        if let Err(err) = handler.touch_session().await {
            tracing::debug!(error = %err, "Session activity stamp failed");
        }
    }

    match tool {
        ToolId::TaskCreate => {
            let params: CreateTaskParams = deserialize_params(params)?;
            serialize_result(&handler.create_task(params).await?)
        }
        ToolId::TaskStart => {
            let params: StartTaskParams = deserialize_params(params)?;
            serialize_result(&handler.start_task(&params.task_id).await?)
        }
        ToolId::TaskTransition => {
            let params: TransitionTaskParams = deserialize_params(params)?;
            serialize_result(&handler.transition_task(&params.task_id, params.status).await?)
        }
        ToolId::TaskGet => {
            let params: GetTaskParams = deserialize_params(params)?;
            serialize_result(&handler.get_task(&params.task_id).await?)
        }
        ToolId::TaskList => serialize_result(&handler.list_tasks().await?),
        ToolId::SubtaskCreate => {
            let params: CreateSubtaskParams = deserialize_params(params)?;
            serialize_result(
                &handler
                    .create_subtask(params.parent_kind, &params.parent_id, params.spec)
                    .await?,
            )
        }
        ToolId::SubtaskTransition => {
            let params: TransitionSubtaskParams = deserialize_params(params)?;
            serialize_result(
                &handler
                    .transition_subtask(&params.parent_id, &params.subtask_id, params.status)
                    .await?,
            )
        }
        ToolId::WorkUpdateProgress => {
            let params: UpdateProgressParams = deserialize_params(params)?;
            handler
                .update_progress(params.item, params.progress, params.notes)
                .await?;
            Ok(json!({ "updated": true }))
        }
        ToolId::SidequestCreate => {
            let params: CreateSidequestParams = deserialize_params(params)?;
            serialize_result(
                &handler
                    .create_sidequest(&params.parent_task_id, params.spec)
                    .await?,
            )
        }
        ToolId::SidequestStart => {
            let params: SidequestIdParams = deserialize_params(params)?;
            serialize_result(&handler.start_sidequest(&params.sidequest_id).await?)
        }
        ToolId::SidequestComplete => {
            let params: SidequestIdParams = deserialize_params(params)?;
            let completion = handler.complete_sidequest(&params.sidequest_id).await?;
            Ok(json!({
                "sidequest": serialize_result(&completion.sidequest)?,
                "parent_resumed": completion.parent_resumed,
                "restored_context": serialize_result(&completion.restored_context)?,
            }))
        }
        ToolId::SidequestListActive => {
            let params: ListActiveSidequestsParams = deserialize_params(params)?;
            let rows = handler.list_active_sidequests(&params.task_id).await?;
            let rows: Vec<Value> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "sidequest_id": row.sidequest_id,
                        "parent_task_id": row.parent_task_id,
                        "ordinal": row.ordinal,
                        "title": row.title,
                        "status": row.status.to_string(),
                        "impact": row.impact.to_string(),
                        "primary_theme": row.primary_theme,
                        "created_at": row.created_at,
                    })
                })
                .collect();
            Ok(Value::Array(rows))
        }
        ToolId::SidequestRaiseLimit => {
            let params: RaiseLimitParams = deserialize_params(params)?;
            handler
                .raise_sidequest_limit(&params.task_id, params.new_limit)
                .await?;
            Ok(json!({ "new_limit": params.new_limit }))
        }
        ToolId::MilestoneComplete => {
            let params: CompleteMilestoneParams = deserialize_params(params)?;
            serialize_result(&handler.complete_milestone(&params.milestone_id).await?)
        }
        ToolId::ContextLoad => {
            let params: LoadContextParams = deserialize_params(params)?;
            serialize_result(&handler.load_context(&params.task_id, params.mode).await?)
        }
        ToolId::ContextEscalate => {
            let params: EscalateContextParams = deserialize_params(params)?;
            serialize_result(
                &handler
                    .escalate_context(
                        &params.task_id,
                        params.current_mode,
                        &params.reason,
                        params.approved,
                    )
                    .await?,
            )
        }
        ToolId::BranchEnsureOrgMain => serialize_result(&handler.ensure_org_main().await?),
        ToolId::BranchCreate => {
            let params: CreateBranchParams = deserialize_params(params)?;
            serialize_result(&handler.create_branch(&params.purpose).await?)
        }
        ToolId::BranchMerge => {
            let params: MergeBranchParams = deserialize_params(params)?;
            serialize_result(
                &handler
                    .merge_branch(&params.branch_name, params.delete_after)
                    .await?,
            )
        }
        ToolId::BranchList => serialize_result(&handler.list_branches().await?),
        ToolId::BranchStatus => {
            let params: BranchNameParams = deserialize_params(params)?;
            serialize_result(&handler.branch_status(&params.branch_name).await?)
        }
        ToolId::BranchDelete => {
            let params: DeleteBranchParams = deserialize_params(params)?;
            handler
                .delete_branch(&params.branch_name, params.force)
                .await?;
            Ok(json!({ "deleted": params.branch_name }))
        }
        ToolId::SessionBoot => {
            let params: BootSessionParams = deserialize_params(params)?;
            serialize_result(&handler.boot_session(params.force_comprehensive).await?)
        }
        ToolId::SessionStatus => serialize_result(&handler.session_status().await?),
        ToolId::SessionTerminate => {
            handler.terminate_session().await?;
            Ok(json!({ "terminated": true }))
        }
        ToolId::ReconcileDetect => serialize_result(&handler.detect_changes().await?),
        ToolId::ReconcileApprove => {
            let params: ApproveReconciliationParams = deserialize_params(params)?;
            serialize_result(&handler.approve_reconciliation(&params.files).await?)
        }
        ToolId::HealthCheck => serialize_result(&handler.health_check().await?),
    }
}

/// SSE endpoint for server-initiated events and keepalives.
async fn sse_handler(
    State(_handler): State<Arc<McpOrchestratorHandler>>,
) -> Result<Sse<UnboundedReceiverStream<Result<axum::response::sse::Event, axum::Error>>>, StatusCode>
{
    let (tx, rx) = mpsc::unbounded_channel();

    let capabilities: Vec<&str> = ALL_TOOLS.iter().map(|t| t.as_str()).collect();
    let welcome_event = axum::response::sse::Event::default().data(
        json!({
            "jsonrpc": "2.0",
            "method": "connection_established",
            "params": {
                "server": "ai-pm-mcp",
                "version": env!("CARGO_PKG_VERSION"),
                "capabilities": capabilities,
            }
        })
        .to_string(),
    );
    if tx.send(Ok(welcome_event)).is_err() {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let heartbeat_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let heartbeat = axum::response::sse::Event::default()
                .event("heartbeat")
                .data("ping");
            if heartbeat_tx.send(Ok(heartbeat)).is_err() {
                break;
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)))
}

/// JSON-RPC endpoint.
async fn rpc_handler(
    State(handler): State<Arc<McpOrchestratorHandler>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request.get("id").cloned();

    let method = match request.get("method").and_then(|v| v.as_str()) {
        Some(method) => method,
        None => {
            let error =
                McpError::Protocol("Missing or invalid 'method' field in JSON-RPC request".to_string());
            return Json(error.to_json_rpc_error(id));
        }
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    tracing::debug!(method, "RPC request");
    Json(route_method(&handler, method, params, id).await)
}

/// Health check endpoint.
async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::Server;
    use pm_core::config::ProjectConfig;
    use tempfile::TempDir;

    async fn handler() -> (TempDir, Arc<McpOrchestratorHandler>) {
        let dir = TempDir::new().unwrap();
        let server = Server::initialize(dir.path(), ProjectConfig::default())
            .await
            .unwrap();
        (dir, Arc::new(McpOrchestratorHandler::new(Arc::new(server))))
    }

    #[tokio::test]
    async fn test_unknown_method_yields_structured_not_found() {
        let (_dir, handler) = handler().await;
        let response = route_method(&handler, "task.destroy", Value::Null, Some(json!(1))).await;
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["data"]["kind"], "not_found");
        assert_eq!(response["error"]["data"]["details"]["tool"], "task.destroy");
    }

    #[tokio::test]
    async fn test_health_check_dispatch() {
        let (_dir, handler) = handler().await;
        let response = route_method(&handler, "health.check", Value::Null, Some(json!(2))).await;
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["result"]["database"], true);
        assert_eq!(response["result"]["session_active"], false);
    }

    #[tokio::test]
    async fn test_malformed_params_are_serialization_errors() {
        let (_dir, handler) = handler().await;
        let response = route_method(
            &handler,
            "task.start",
            json!({ "wrong_field": 1 }),
            Some(json!(3)),
        )
        .await;
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_session_boot_and_status_round_trip() {
        let (_dir, handler) = handler().await;

        let boot = route_method(&handler, "session.boot", json!({}), Some(json!(4))).await;
        let session_id = boot["result"]["session_id"].as_str().unwrap().to_string();
        assert!(session_id.starts_with("session-"));

        let status = route_method(&handler, "session.status", Value::Null, Some(json!(5))).await;
        assert_eq!(status["result"]["id"], session_id.as_str());
        assert_eq!(status["result"]["status"], "active");
    }
}

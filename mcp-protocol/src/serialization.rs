//! Serialization utilities for the protocol surface.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::McpError;

/// Deserialize JSON-RPC params into a typed parameter struct.
pub fn deserialize_params<T>(params: Value) -> Result<T, McpError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(params).map_err(|e| McpError::Serialization(e.to_string()))
}

/// Serialize a typed result for the wire.
pub fn serialize_result<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::Serialization(e.to_string()))
}

/// Create a successful JSON-RPC response.
pub fn create_success_response(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CreateBranchParams;

    #[test]
    fn test_deserialize_params() {
        let params: CreateBranchParams =
            deserialize_params(json!({ "purpose": "auth work" })).unwrap();
        assert_eq!(params.purpose, "auth work");

        let bad: Result<CreateBranchParams, _> = deserialize_params(json!({ "nope": 1 }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_success_response() {
        let response = create_success_response(Some(json!(1)), json!({"ok": true}));
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["ok"], true);
    }
}

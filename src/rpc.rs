// ===============================
// src/rpc.rs
// ===============================
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Outgoing JSON-RPC 2.0 call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: String,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: new_request_id(),
        }
    }
}

/// `<unix ms>-<32 hex chars>`; never reused, not even for retries.
pub fn new_request_id() -> String {
    let entropy: [u8; 16] = rand::thread_rng().gen();
    format!("{}-{}", Utc::now().timestamp_millis(), hex::encode(entropy))
}

/// Application-level failure reported by the Ledger inside a 2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl UpstreamError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            meta: None,
        }
    }
}

/// Response envelope, returned verbatim even when `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamError>,
    #[serde(default)]
    pub id: Value,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl RpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Application faults stay data: the caller branches on them.
    pub fn into_result(self) -> Result<Value, UpstreamError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ===============================
// src/error.rs
// ===============================
use serde_json::json;
use thiserror::Error;

use crate::config::Layer;
use crate::deal::DealStatus;
use crate::rpc::UpstreamError;
use crate::signer::SignError;
use crate::validator::ValidationErrors;

pub const TIMEOUT_GUIDANCE: &str =
    "endpoint unreachable or silently dropping traffic: check network access, credentials and the IP allowlist";

// Local faults that have no HTTP status of their own (JSON-RPC server-error range)
pub const CODE_SIGNING: i64 = -32001;
pub const CODE_SERIALIZE: i64 = -32002;
pub const CODE_MALFORMED: i64 = -32003;
pub const CODE_LAYER_NOT_CONFIGURED: i64 = -32004;
pub const CODE_VALIDATION: i64 = 422;
pub const CODE_INVALID_TRANSITION: i64 = 4418;

/// Transport, signing and local faults. Cloneable so a single failure can be
/// handed to every caller waiting on the same in-flight request.
#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("timeout after {timeout_ms} ms calling {endpoint}: {guidance}")]
    Timeout {
        endpoint: String,
        timeout_ms: u64,
        guidance: &'static str,
    },
    #[error("network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },
    #[error("400 Bad Request (malformed request): {body}")]
    BadRequest { body: String },
    #[error("401 Unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("403 Forbidden (signature, certificate or IP allowlist): {body}")]
    Forbidden { body: String },
    #[error("upstream unavailable (HTTP {status}), may be retried: {body}")]
    Unavailable { status: u16, body: String },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response body: {0}")]
    MalformedResponse(String),
    #[error("cannot serialize request: {0}")]
    Serialize(String),
    #[error(transparent)]
    Signing(#[from] SignError),
    #[error("layer {0} has no credentials configured")]
    LayerNotConfigured(Layer),
    #[error("deal validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("{action} is not allowed while the deal is {status}")]
    InvalidTransition {
        action: &'static str,
        status: DealStatus,
    },
}

impl LedgerError {
    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 => LedgerError::BadRequest { body },
            401 => LedgerError::Unauthorized { body },
            403 => LedgerError::Forbidden { body },
            500 | 503 => LedgerError::Unavailable { status, body },
            _ => LedgerError::Http { status, body },
        }
    }

    pub fn may_retry(&self) -> bool {
        matches!(self, LedgerError::Unavailable { .. } | LedgerError::Timeout { .. })
    }

    /// Projects a local fault onto the upstream error shape so every fault
    /// goes through the same translator.
    pub fn to_upstream(&self) -> UpstreamError {
        let message = self.to_string();
        match self {
            LedgerError::Timeout { endpoint, timeout_ms, .. } => UpstreamError {
                data: Some(json!({ "endpoint": endpoint, "timeout_ms": timeout_ms })),
                ..UpstreamError::new(504, message)
            },
            LedgerError::Network { endpoint, .. } => UpstreamError {
                data: Some(json!({ "endpoint": endpoint })),
                ..UpstreamError::new(502, message)
            },
            LedgerError::BadRequest { .. } => UpstreamError::new(400, message),
            LedgerError::Unauthorized { .. } => UpstreamError::new(401, message),
            LedgerError::Forbidden { .. } => UpstreamError::new(403, message),
            LedgerError::Unavailable { status, .. } | LedgerError::Http { status, .. } => {
                UpstreamError::new(i64::from(*status), message)
            }
            LedgerError::MalformedResponse(_) => UpstreamError::new(CODE_MALFORMED, message),
            LedgerError::Serialize(_) => UpstreamError::new(CODE_SERIALIZE, message),
            LedgerError::Signing(_) => UpstreamError::new(CODE_SIGNING, message),
            LedgerError::LayerNotConfigured(layer) => UpstreamError {
                data: Some(json!({ "layer": layer })),
                ..UpstreamError::new(CODE_LAYER_NOT_CONFIGURED, message)
            },
            LedgerError::Validation(errors) => UpstreamError {
                data: serde_json::to_value(&errors.issues).ok(),
                ..UpstreamError::new(CODE_VALIDATION, message)
            },
            LedgerError::InvalidTransition { action, status } => UpstreamError {
                data: Some(json!({ "action": action, "status": status })),
                ..UpstreamError::new(CODE_INVALID_TRANSITION, message)
            },
        }
    }
}

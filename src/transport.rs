// ===============================
// src/transport.rs
// ===============================
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{AppConfig, Layer, LayerCredentials};
use crate::error::{LedgerError, TIMEOUT_GUIDANCE};
use crate::metrics::{UPSTREAM_CALLS, UPSTREAM_LATENCY};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::signer::Signer;

pub const HEADER_SIGN_DATA: &str = "sign-data";
pub const HEADER_SIGN_THUMBPRINT: &str = "sign-thumbprint";
pub const HEADER_SIGN_SYSTEM: &str = "sign-system";

/// Endpoint + credential set of one layer.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub endpoint: Url,
    signer: Signer,
    sign_system: String,
    sign_thumbprint: String,
}

impl Upstream {
    /// Fails right away on unusable key material.
    pub fn new(endpoint: Url, creds: &LayerCredentials) -> Result<Self, LedgerError> {
        Ok(Self {
            endpoint,
            signer: Signer::from_pem(&creds.private_key_pem)?,
            sign_system: creds.sign_system.clone(),
            sign_thumbprint: creds.sign_thumbprint.clone(),
        })
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

/// Signed JSON-RPC over HTTPS. No retries and no caching here.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    http: reqwest::Client,
    timeout: Duration,
    pre: Option<Upstream>,
    prod: Option<Upstream>,
}

impl RpcTransport {
    pub fn new(timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Network {
                endpoint: String::new(),
                message: format!("http client init: {e}"),
            })?;
        Ok(Self {
            http,
            timeout,
            pre: None,
            prod: None,
        })
    }

    /// Every configured layer must carry a usable key, otherwise startup aborts.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, LedgerError> {
        let mut transport = Self::new(cfg.timeout)?;
        for layer in Layer::ALL {
            let lc = cfg.layer(layer);
            if let Some(creds) = &lc.credentials {
                let upstream = Upstream::new(lc.endpoint.clone(), creds).map_err(|e| {
                    error!(%layer, ?e, "signing key rejected");
                    e
                })?;
                transport = transport.with_upstream(layer, upstream);
            }
        }
        Ok(transport)
    }

    pub fn with_upstream(mut self, layer: Layer, upstream: Upstream) -> Self {
        match layer {
            Layer::Pre => self.pre = Some(upstream),
            Layer::Prod => self.prod = Some(upstream),
        }
        self
    }

    pub fn upstream(&self, layer: Layer) -> Result<&Upstream, LedgerError> {
        let upstream = match layer {
            Layer::Pre => self.pre.as_ref(),
            Layer::Prod => self.prod.as_ref(),
        };
        upstream.ok_or(LedgerError::LayerNotConfigured(layer))
    }

    pub fn configured_layers(&self) -> Vec<Layer> {
        Layer::ALL
            .into_iter()
            .filter(|l| self.upstream(*l).is_ok())
            .collect()
    }

    /// One signed POST. A JSON-RPC `error` in a 2xx body is returned, not raised.
    pub async fn call(&self, layer: Layer, method: &str, params: Value) -> Result<RpcResponse, LedgerError> {
        let upstream = self.upstream(layer)?;

        // 1) serialize once; these exact bytes are signed and sent
        let request = RpcRequest::new(method, params);
        let body = serde_json::to_vec(&request).map_err(|e| LedgerError::Serialize(e.to_string()))?;

        // 2) sign
        let signature = upstream.signer.sign(&body)?;

        // 3) send
        let endpoint = upstream.endpoint.as_str();
        let started = Instant::now();
        let sent = self
            .http
            .post(upstream.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_SIGN_DATA, signature)
            .header(HEADER_SIGN_THUMBPRINT, &upstream.sign_thumbprint)
            .header(HEADER_SIGN_SYSTEM, &upstream.sign_system)
            .body(body)
            .send()
            .await;

        let result = match sent {
            Ok(rsp) => {
                let status = rsp.status();
                match rsp.text().await {
                    Ok(text) if status.is_success() => serde_json::from_str::<RpcResponse>(&text)
                        .map_err(|e| LedgerError::MalformedResponse(format!("{e}; body: {}", truncate(&text)))),
                    Ok(text) => Err(LedgerError::from_status(status.as_u16(), text)),
                    Err(e) => Err(self.classify(endpoint, e)),
                }
            }
            Err(e) => Err(self.classify(endpoint, e)),
        };

        // 4) log + metrics
        let elapsed_ms = started.elapsed().as_millis() as u64;
        UPSTREAM_LATENCY.observe(elapsed_ms as f64);
        let outcome = outcome_label(&result);
        UPSTREAM_CALLS
            .with_label_values(&[method, layer.as_str(), &outcome])
            .inc();
        match &result {
            Ok(rsp) if rsp.is_error() => {
                let code = rsp.error.as_ref().map(|e| e.code).unwrap_or_default();
                info!(%method, %layer, elapsed_ms, code, id = %request.id, "ledger call returned error");
            }
            Ok(_) => info!(%method, %layer, elapsed_ms, id = %request.id, "ledger call ok"),
            Err(e) => warn!(%method, %layer, elapsed_ms, id = %request.id, error = %e, "ledger call failed"),
        }
        result
    }

    fn classify(&self, endpoint: &str, e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Timeout {
                endpoint: endpoint.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
                guidance: TIMEOUT_GUIDANCE,
            }
        } else {
            debug!(?e, "transport error detail");
            LedgerError::Network {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        }
    }
}

fn outcome_label(result: &Result<RpcResponse, LedgerError>) -> String {
    match result {
        Ok(rsp) if rsp.is_error() => "app_error".into(),
        Ok(_) => "ok".into(),
        Err(LedgerError::Timeout { .. }) => "timeout".into(),
        Err(LedgerError::Network { .. }) => "network".into(),
        Err(LedgerError::MalformedResponse(_)) => "malformed".into(),
        Err(LedgerError::BadRequest { .. }) => "http_400".into(),
        Err(LedgerError::Unauthorized { .. }) => "http_401".into(),
        Err(LedgerError::Forbidden { .. }) => "http_403".into(),
        Err(LedgerError::Unavailable { status, .. }) | Err(LedgerError::Http { status, .. }) => {
            format!("http_{status}")
        }
        Err(_) => "local".into(),
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

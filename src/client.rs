// ===============================
// src/client.rs
// ===============================
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{cache_key, RateLimitedCache};
use crate::config::{CacheConfig, Layer};
use crate::deal::{DealSnapshot, DealStatus};
use crate::error::LedgerError;
use crate::metrics::DEAL_VALIDATIONS;
use crate::rpc::RpcResponse;
use crate::transport::RpcTransport;
use crate::validator::validate_deal;

/// Read methods the Ledger rate-limits to one identical call per window.
pub const CACHEABLE_METHODS: &[&str] = &[
    "list_beneficiary",
    "get_beneficiary",
    "list_virtual_account",
    "get_virtual_account",
    "list_virtual_transaction",
    "list_payments",
    "get_payment",
    "list_bank_sbp",
];

const BENEFICIARY_READS: &[&str] = &["list_beneficiary", "get_beneficiary"];
const ACCOUNT_READS: &[&str] = &["list_virtual_account", "get_virtual_account", "list_virtual_transaction"];
const PAYMENT_READS: &[&str] = &[
    "list_payments",
    "get_payment",
    "list_virtual_account",
    "get_virtual_account",
    "list_virtual_transaction",
];

/// Reads that go stale after a successful mutation.
pub fn invalidated_reads(method: &str) -> &'static [&'static str] {
    match method {
        m if m.starts_with("create_beneficiary") || m.starts_with("update_beneficiary") => BENEFICIARY_READS,
        "activate_beneficiary" | "deactivate_beneficiary" => BENEFICIARY_READS,
        "create_virtual_account" | "refund_virtual_account" | "execute_deal" => ACCOUNT_READS,
        "cancel_deal_with_executed_recipients" => ACCOUNT_READS,
        m if m.starts_with("transfer_between_virtual_accounts") => ACCOUNT_READS,
        "identification_payment" | "refund_payment" => PAYMENT_READS,
        _ => &[],
    }
}

/// Which methods are cached, and for how long.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    default_ttl: Duration,
    method_ttl: HashMap<String, Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CachePolicy {
    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self {
            default_ttl: cfg.default_ttl,
            method_ttl: cfg.method_ttl.clone(),
        }
    }

    /// `None` = bypass the cache.
    pub fn ttl_for(&self, method: &str) -> Option<Duration> {
        if !CACHEABLE_METHODS.contains(&method) {
            return None;
        }
        Some(self.method_ttl.get(method).copied().unwrap_or(self.default_ttl))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallOutcome {
    pub response: RpcResponse,
    pub from_cache: bool,
}

/// Facade used by the route layer: transport + injected cache + deal guards.
#[derive(Clone)]
pub struct LedgerClient {
    transport: Arc<RpcTransport>,
    cache: RateLimitedCache,
    policy: CachePolicy,
}

impl LedgerClient {
    pub fn new(transport: RpcTransport, cache: RateLimitedCache, policy: CachePolicy) -> Self {
        Self {
            transport: Arc::new(transport),
            cache,
            policy,
        }
    }

    pub fn cache(&self) -> &RateLimitedCache {
        &self.cache
    }

    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    pub async fn call(
        &self,
        layer: Layer,
        method: &str,
        params: Value,
        force_refresh: bool,
    ) -> Result<CallOutcome, LedgerError> {
        let Some(ttl) = self.policy.ttl_for(method) else {
            let response = self.transport.call(layer, method, params).await?;
            if !response.is_error() {
                self.invalidate_after(layer, method);
            }
            return Ok(CallOutcome {
                response,
                from_cache: false,
            });
        };

        let key = cache_key(layer, method, &params);
        let transport = Arc::clone(&self.transport);
        let owned_method = method.to_string();
        let cached = self
            .cache
            .with_cache(
                &key,
                move || async move { transport.call(layer, &owned_method, params).await },
                Some(ttl),
                force_refresh,
            )
            .await?;

        Ok(CallOutcome {
            response: cached.data,
            from_cache: cached.from_cache,
        })
    }

    /// Drops cached reads of one method on one layer.
    pub fn invalidate(&self, layer: Layer, method: &str) -> usize {
        self.cache.invalidate_prefix(layer, method)
    }

    fn invalidate_after(&self, layer: Layer, mutation: &str) {
        for read in invalidated_reads(mutation) {
            let removed = self.cache.invalidate_prefix(layer, read);
            if removed > 0 {
                debug!(%layer, %mutation, %read, removed, "stale reads dropped");
            }
        }
    }

    // ---- Deals ----

    /// Validates locally first; an invalid candidate never reaches the network.
    pub async fn create_deal(&self, layer: Layer, candidate: &Value) -> Result<CallOutcome, LedgerError> {
        let mut deal = validate_deal(candidate).map_err(|errors| {
            DEAL_VALIDATIONS.with_label_values(&["rejected"]).inc();
            warn!(%layer, issues = errors.len(), "deal rejected before sending");
            LedgerError::Validation(errors)
        })?;
        DEAL_VALIDATIONS.with_label_values(&["accepted"]).inc();

        if deal.ext_key.is_none() {
            deal.ext_key = Some(Uuid::new_v4().to_string());
        }
        self.call(layer, "create_deal", deal.to_params(), false).await
    }

    pub async fn update_deal(
        &self,
        layer: Layer,
        deal: &DealSnapshot,
        candidate: &Value,
    ) -> Result<CallOutcome, LedgerError> {
        guard("update_deal", deal.status, DealStatus::can_edit)?;
        let valid = validate_deal(candidate).map_err(LedgerError::Validation)?;
        let params = json!({ "deal_id": deal.id, "deal_data": valid.to_params() });
        self.call(layer, "update_deal", params, false).await
    }

    pub async fn execute_deal(&self, layer: Layer, deal: &DealSnapshot) -> Result<CallOutcome, LedgerError> {
        guard("execute_deal", deal.status, DealStatus::can_execute)?;
        self.call(layer, "execute_deal", json!({ "deal_id": deal.id }), false).await
    }

    pub async fn cancel_deal_with_executed_recipients(
        &self,
        layer: Layer,
        deal: &DealSnapshot,
    ) -> Result<CallOutcome, LedgerError> {
        guard(
            "cancel_deal_with_executed_recipients",
            deal.status,
            DealStatus::can_cancel_from_correction,
        )?;
        let params = json!({ "deal_id": deal.id });
        self.call(layer, "cancel_deal_with_executed_recipients", params, false)
            .await
    }

    pub async fn rejected_deal(&self, layer: Layer, deal: &DealSnapshot) -> Result<CallOutcome, LedgerError> {
        guard("rejected_deal", deal.status, |s| s.can_transition_to(DealStatus::Rejected))?;
        self.call(layer, "rejected_deal", json!({ "deal_id": deal.id }), false).await
    }

    pub async fn get_deal(&self, layer: Layer, deal_id: &str) -> Result<CallOutcome, LedgerError> {
        self.call(layer, "get_deal", json!({ "deal_id": deal_id }), false).await
    }

    pub async fn list_deals(&self, layer: Layer, filters: Value) -> Result<CallOutcome, LedgerError> {
        self.call(layer, "list_deals", filters, false).await
    }

    pub async fn check_deal_compliance(&self, layer: Layer, deal_id: &str) -> Result<CallOutcome, LedgerError> {
        self.call(layer, "compliance_check_deal", json!({ "deal_id": deal_id }), false)
            .await
    }
}

impl DealSnapshot {
    /// Reads `{"deal": {...}}` or a bare deal object out of a `get_deal` result.
    pub fn from_result(result: &Value) -> Option<Self> {
        let deal = result.get("deal").unwrap_or(result);
        serde_json::from_value(deal.clone()).ok()
    }
}

fn guard(action: &'static str, status: DealStatus, allowed: impl Fn(&DealStatus) -> bool) -> Result<(), LedgerError> {
    if allowed(&status) {
        Ok(())
    } else {
        warn!(%action, %status, "deal action refused by lifecycle");
        Err(LedgerError::InvalidTransition { action, status })
    }
}

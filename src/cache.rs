// ===============================
// src/cache.rs
// ===============================
//
// Rate-limit shim in front of the Ledger read methods:
// - one fresh upstream call per (layer, method, params) per TTL window
// - concurrent misses on the same key share one in-flight call
// - error responses are never stored
// - expiry is checked on read; the sweeper only bounds memory
//
use std::fmt::Write as _;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::Layer;
use crate::error::LedgerError;
use crate::metrics::{CACHE_ENTRIES, CACHE_HITS, CACHE_JOINS, CACHE_MISSES};
use crate::rpc::RpcResponse;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

type Flight = Shared<BoxFuture<'static, Result<RpcResponse, LedgerError>>>;

/// `<layer>:<method>:<canonical params>`.
pub fn cache_key(layer: Layer, method: &str, params: &Value) -> String {
    let mut key = key_prefix(layer, method);
    write_canonical(&mut key, params);
    key
}

/// Shared by every key of one (layer, method).
pub fn key_prefix(layer: Layer, method: &str) -> String {
    format!("{}:{}:", layer.as_str(), method)
}

// Object keys sorted at every depth, no whitespace.
fn write_canonical(out: &mut String, v: &Value) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(k.clone()));
                write_canonical(out, &map[k]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn method_of(key: &str) -> &str {
    key.split(':').nth(1).unwrap_or("?")
}

#[derive(Debug, Clone)]
struct Entry {
    data: RpcResponse,
    cached_at: DateTime<Utc>,
    ttl: Duration,
    expires: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    inflight: HashMap<String, (u64, Flight)>,
    next_flight: u64,
}

impl Inner {
    /// Expired entries behave exactly like absent ones.
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        let expired = now >= self.entries.get(key)?.expires;
        if expired {
            self.entries.remove(key);
            CACHE_ENTRIES.set(self.entries.len() as i64);
            return None;
        }
        self.entries.get(key)
    }

    fn store(&mut self, key: String, data: RpcResponse, ttl: Duration) {
        let entry = Entry {
            data,
            cached_at: Utc::now(),
            ttl,
            expires: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
        CACHE_ENTRIES.set(self.entries.len() as i64);
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires);
        CACHE_ENTRIES.set(self.entries.len() as i64);
        before - self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    pub data: RpcResponse,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub inflight: usize,
}

/// Data age of one key, for "updated N seconds ago" labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_ms: u64,
}

/// Single-process, in-memory, best effort. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimitedCache {
    inner: Arc<Mutex<Inner>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    default_ttl: Duration,
}

impl Default for RateLimitedCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl RateLimitedCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the live entry, or runs `producer` at most once. A miss that
    /// finds the same key already in flight awaits that call instead, errors
    /// included. Only responses without a JSON-RPC `error` are stored.
    /// The producer's future runs on a spawned task; needs a tokio runtime.
    pub async fn with_cache<F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Option<Duration>,
        force_refresh: bool,
    ) -> Result<Cached, LedgerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RpcResponse, LedgerError>> + Send + 'static,
    {
        let method = method_of(key);
        let ttl = ttl.unwrap_or(self.default_ttl);

        let flight = {
            let mut inner = self.inner.lock();
            if !force_refresh {
                if let Some(entry) = inner.live(key, Instant::now()) {
                    let data = entry.data.clone();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    CACHE_HITS.with_label_values(&[method]).inc();
                    debug!(%key, "cache hit");
                    return Ok(Cached { data, from_cache: true });
                }
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            CACHE_MISSES.with_label_values(&[method]).inc();

            if let Some((_, pending)) = inner.inflight.get(key) {
                CACHE_JOINS.with_label_values(&[method]).inc();
                debug!(%key, "joining in-flight call");
                pending.clone()
            } else {
                debug!(%key, force_refresh, "cache miss");
                inner.next_flight += 1;
                let flight_id = inner.next_flight;
                let call = producer();
                let owner = Arc::clone(&self.inner);
                let owned_key = key.to_string();

                // Runs to completion on its own task, so a dropped caller never
                // strands the registration.
                let task = tokio::spawn(async move {
                    let result = call.await;
                    let mut inner = owner.lock();
                    // Invalidated while in flight: hand the result out, keep it out of the cache.
                    let still_registered =
                        matches!(inner.inflight.get(&owned_key), Some((id, _)) if *id == flight_id);
                    if still_registered {
                        inner.inflight.remove(&owned_key);
                        if let Ok(rsp) = &result {
                            if !rsp.is_error() {
                                inner.store(owned_key, rsp.clone(), ttl);
                            }
                        }
                    }
                    result
                });

                let flight: Flight = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(LedgerError::Network {
                            endpoint: String::new(),
                            message: format!("ledger call task ended: {e}"),
                        })
                    })
                }
                .boxed()
                .shared();

                inner.inflight.insert(key.to_string(), (flight_id, flight.clone()));
                flight
            }
        };

        flight.await.map(|data| Cached {
            data,
            from_cache: false,
        })
    }

    /// Live entry without touching the counters.
    pub fn peek(&self, key: &str) -> Option<RpcResponse> {
        self.inner
            .lock()
            .live(key, Instant::now())
            .map(|e| e.data.clone())
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.live(key, now)?;
        let ttl = chrono::Duration::from_std(entry.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Some(EntryInfo {
            cached_at: entry.cached_at,
            expires_at: entry.cached_at + ttl,
            remaining_ms: entry.expires.saturating_duration_since(now).as_millis() as u64,
        })
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.inflight.remove(key);
        let removed = inner.entries.remove(key).is_some();
        CACHE_ENTRIES.set(inner.entries.len() as i64);
        removed
    }

    /// Drops every key of one (layer, method); used after mutations.
    pub fn invalidate_prefix(&self, layer: Layer, method: &str) -> usize {
        let prefix = key_prefix(layer, method);
        let mut inner = self.inner.lock();
        inner.inflight.retain(|k, _| !k.starts_with(&prefix));
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(&prefix));
        CACHE_ENTRIES.set(inner.entries.len() as i64);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(%layer, %method, removed, "cache prefix invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.inflight.clear();
        CACHE_ENTRIES.set(0);
    }

    /// Removes expired entries; returns how many.
    pub fn sweep(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    /// Periodic purge. Ends by itself once every clone of the cache is gone.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // first tick is immediate

            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("cache dropped, sweeper stopped");
                    break;
                };
                let purged = inner.lock().purge_expired(Instant::now());
                if purged > 0 {
                    debug!(purged, "cache sweep");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            inflight: inner.inflight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TIMEOUT_GUIDANCE;
    use crate::rpc::UpstreamError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn ok(result: Value) -> RpcResponse {
        RpcResponse {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id: json!("1"),
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        rsp: RpcResponse,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<RpcResponse, LedgerError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(rsp)
            }
            .boxed()
        }
    }

    #[test]
    fn key_ignores_param_order() {
        let p1 = json!({"page": 1, "filters": {"inn": "7700000000", "is_active": true}});
        let p2 = json!({"filters": {"is_active": true, "inn": "7700000000"}, "page": 1});
        assert_eq!(
            cache_key(Layer::Pre, "list_beneficiary", &p1),
            cache_key(Layer::Pre, "list_beneficiary", &p2)
        );
        assert_ne!(
            cache_key(Layer::Pre, "list_beneficiary", &p1),
            cache_key(Layer::Prod, "list_beneficiary", &p1)
        );
        assert_eq!(
            cache_key(Layer::Pre, "get_payment", &json!({"payment_id": "a:b"})),
            r#"pre:get_payment:{"payment_id":"a:b"}"#
        );
    }

    #[tokio::test]
    async fn hit_skips_producer() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache_key(Layer::Pre, "list_beneficiary", &json!({"page": 1}));

        let first = cache.with_cache(&key, counting(&calls, ok(json!([1]))), None, false).await.unwrap();
        let second = cache.with_cache(&key, counting(&calls, ok(json!([2]))), None, false).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.data, first.data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_exactly_at_ttl() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(300);

        cache.with_cache("k", counting(&calls, ok(json!(1))), Some(ttl), false).await.unwrap();

        tokio::time::advance(Duration::from_millis(299_999)).await;
        assert!(cache.peek("k").is_some());
        assert_eq!(cache.entry_info("k").unwrap().remaining_ms, 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.peek("k").is_none());
        assert!(cache.entry_info("k").is_none());

        let again = cache.with_cache("k", counting(&calls, ok(json!(2))), Some(ttl), false).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_responses_are_not_stored() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let failed = RpcResponse {
            error: Some(UpstreamError::new(4409, "Beneficiary not found")),
            result: None,
            ..ok(Value::Null)
        };

        let first = cache.with_cache("k", counting(&calls, failed), None, false).await.unwrap();
        assert!(first.data.is_error());
        assert!(cache.peek("k").is_none());

        let second = cache.with_cache("k", counting(&calls, ok(json!("fine"))), None, false).await.unwrap();
        assert!(!second.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_replaces_entry() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.with_cache("k", counting(&calls, ok(json!("old"))), None, false).await.unwrap();
        let fresh = cache.with_cache("k", counting(&calls, ok(json!("new"))), None, true).await.unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(cache.peek("k").unwrap().result, Some(json!("new")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_call() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = |calls: Arc<AtomicUsize>| {
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(ok(json!("once")))
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            cache.with_cache("k", slow(Arc::clone(&calls)), None, false),
            cache.with_cache("k", slow(Arc::clone(&calls)), None, false),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().data, b.unwrap().data);
        assert_eq!(cache.stats().inflight, 0);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_receive_the_leaders_error() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let timing_out = |calls: Arc<AtomicUsize>| {
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(15)).await;
                    Err(LedgerError::Timeout {
                        endpoint: "https://ledger".into(),
                        timeout_ms: 15_000,
                        guidance: TIMEOUT_GUIDANCE,
                    })
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            cache.with_cache("k", timing_out(Arc::clone(&calls)), None, false),
            cache.with_cache("k", timing_out(Arc::clone(&calls)), None, false),
        );
        assert!(matches!(a, Err(LedgerError::Timeout { .. })));
        assert!(matches!(b, Err(LedgerError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().inflight, 0);
    }

    #[tokio::test]
    async fn prefix_invalidation_is_scoped() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let keys = [
            cache_key(Layer::Pre, "list_beneficiary", &json!({"page": 1})),
            cache_key(Layer::Pre, "list_beneficiary", &json!({"page": 2})),
            cache_key(Layer::Prod, "list_beneficiary", &json!({"page": 1})),
            cache_key(Layer::Pre, "list_payments", &json!({})),
        ];
        for k in &keys {
            cache.with_cache(k, counting(&calls, ok(json!(k))), None, false).await.unwrap();
        }

        assert_eq!(cache.invalidate_prefix(Layer::Pre, "list_beneficiary"), 2);
        assert!(cache.peek(&keys[0]).is_none());
        assert!(cache.peek(&keys[2]).is_some());
        assert!(cache.invalidate(&keys[3]));
        assert!(!cache.invalidate(&keys[3]));

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_flight_is_not_stored() {
        let cache = RateLimitedCache::default();
        let key = cache_key(Layer::Pre, "list_virtual_account", &json!({}));
        let pending = cache.with_cache(
            &key,
            || {
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(ok(json!("pre-mutation")))
                }
                .boxed()
            },
            None,
            false,
        );
        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate_prefix(Layer::Pre, "list_virtual_account");
        };
        let (res, _) = tokio::join!(pending, invalidate);
        assert_eq!(res.unwrap().data.result, Some(json!("pre-mutation")));
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_leaves_no_stale_flight() {
        let cache = RateLimitedCache::default();
        let slow = || {
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(ok(json!("first")))
            }
            .boxed()
        };

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), cache.with_cache("k", slow, None, false)).await;
        assert!(cancelled.is_err());

        // the call still finishes, deregisters and stores its result
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.stats().inflight, 0);
        assert_eq!(cache.peek("k").unwrap().result, Some(json!("first")));

        tokio::time::advance(Duration::from_secs(3600)).await;
        let fresh = cache
            .with_cache("k", || async { Ok(ok(json!("fresh"))) }.boxed(), None, false)
            .await
            .unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(fresh.data.result, Some(json!("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let cache = RateLimitedCache::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = cache.spawn_sweeper(Duration::from_secs(5));
        cache.with_cache("k", counting(&calls, ok(json!(1))), None, false).await.unwrap();
        assert_eq!(cache.stats().entries, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.stats().entries, 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_touches_expired() {
        let cache = RateLimitedCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.with_cache("short", counting(&calls, ok(json!(1))), Some(Duration::from_secs(10)), false).await.unwrap();
        cache.with_cache("long", counting(&calls, ok(json!(2))), Some(Duration::from_secs(600)), false).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.peek("long").is_some());
    }
}

// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Cache --------
pub static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_cache_hits_total", "reads served from the rate-limit cache"),
        &["method"],
    )
    .unwrap()
});

pub static CACHE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_cache_misses_total", "reads that had to go upstream (incl. forced refresh)"),
        &["method"],
    )
    .unwrap()
});

pub static CACHE_JOINS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_cache_inflight_joins_total", "misses that awaited an identical in-flight call"),
        &["method"],
    )
    .unwrap()
});

pub static CACHE_ENTRIES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ledger_cache_entries", "entries currently held by the cache").unwrap());

// -------- Upstream --------
pub static UPSTREAM_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_upstream_calls_total", "signed JSON-RPC calls (labels: method, layer, outcome)"),
        &["method", "layer", "outcome"],
    )
    .unwrap()
});

pub static UPSTREAM_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("ledger_upstream_latency_ms", "round trip to the Ledger API (ms)")
            .buckets(vec![25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 20_000.0]),
    )
    .unwrap()
});

// -------- Deals / errors --------
pub static DEAL_VALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("deal_validations_total", "deal candidates checked (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static TRANSLATED_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_translated_errors_total", "errors shown to users (label: code)"),
        &["code"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry.
    // AlreadyReg on a second init() is fine, so results are ignored.
    let _ = REGISTRY.register(Box::new(CACHE_HITS.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_MISSES.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_JOINS.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_ENTRIES.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_CALLS.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_LATENCY.clone()));
    let _ = REGISTRY.register(Box::new(DEAL_VALIDATIONS.clone()));
    let _ = REGISTRY.register(Box::new(TRANSLATED_ERRORS.clone()));
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` until the task is dropped or the listener fails.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(%addr, ?e, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

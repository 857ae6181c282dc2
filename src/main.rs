// ===============================
// src/main.rs
// ===============================
/*
 # health check of every configured signing key
 nominal-ops check-keys

 # cached read (second call within 5 min is served locally)
 nominal-ops call --layer pre --method list_beneficiary --params '{"page":1}'

 # sidecar mode: NDJSON requests on stdin, metrics on :9899/metrics
 echo '{"layer":"pre","method":"list_payments","params":{}}' | nominal-ops serve
*/
/*
=============================================================================
Project : nominal_ops — signed Ledger JSON-RPC client for nominal accounts
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Signs and sends JSON-RPC calls to the Ledger API per layer
          (pre/prod), gates read methods behind a rate-limit-aware cache,
          validates multi-party deals before they leave the process and
          translates upstream error codes for operators and end users.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio::{select, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use nominal_ops::cache::cache_key;
use nominal_ops::client::CachePolicy;
use nominal_ops::config::{self, AppConfig, Layer};
use nominal_ops::metrics;
use nominal_ops::payout::{self, CommissionPlan, VendingSale};
use nominal_ops::rpc::UpstreamError;
use nominal_ops::signer::Signer;
use nominal_ops::transport::RpcTransport;
use nominal_ops::{translate, translate_fault, validate_deal, LedgerClient, RateLimitedCache};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const PROBE_BODY: &[u8] = br#"{"jsonrpc":"2.0","method":"echo","params":{},"id":"probe"}"#;

#[derive(Parser, Debug)]
#[command(name = "nominal-ops", version, about = "Ledger nominal-account operations")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Sign a probe body with every configured key; fails on any bad key.
    CheckKeys,
    /// One JSON-RPC call (cached when the method is cache-eligible).
    Call {
        #[arg(long)]
        layer: Layer,
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        /// Skip the cache and refresh the entry.
        #[arg(long)]
        force: bool,
    },
    /// Validate a deal candidate from a JSON file.
    ValidateDeal { file: PathBuf },
    /// Show what users and logs would get for an error code.
    ExplainError {
        code: i64,
        #[arg(long)]
        message: Option<String>,
    },
    /// Compute a vending commission payout and optionally submit it as a deal.
    Payout {
        #[arg(long)]
        sales: PathBuf,
        #[arg(long)]
        virtual_account: Uuid,
        /// Percent of cashless revenue.
        #[arg(long)]
        rate: Decimal,
        #[arg(long, default_value = "Комиссия платформы")]
        recipient: String,
        #[arg(long, default_value = "1.00")]
        min_payout: Decimal,
        #[arg(long)]
        layer: Option<Layer>,
        #[arg(long)]
        submit: bool,
    },
    /// Long-lived sidecar: NDJSON requests on stdin, responses on stdout.
    Serve,
}

#[derive(Debug, Deserialize)]
struct ServeRequest {
    /// Echoed back so callers can match out-of-order answers.
    #[serde(default)]
    id: Value,
    layer: Layer,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    force: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.cmd).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cmd: Cmd) -> Result<ExitCode, BoxError> {
    match cmd {
        Cmd::CheckKeys => check_keys(&config::load()?),
        Cmd::Call {
            layer,
            method,
            params,
            force,
        } => {
            let client = build_client(&config::load()?)?;
            let params: Value = serde_json::from_str(&params)?;
            Ok(print_call(&client, layer, &method, params, force).await)
        }
        Cmd::ValidateDeal { file } => {
            let candidate: Value = serde_json::from_str(&tokio::fs::read_to_string(&file).await?)?;
            match validate_deal(&candidate) {
                Ok(deal) => {
                    println!("{}", serde_json::to_string_pretty(&deal.to_params())?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(errors) => {
                    println!("{}", serde_json::to_string_pretty(&errors)?);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Cmd::ExplainError { code, message } => {
            let t = translate(&UpstreamError::new(code, message.unwrap_or_default()));
            println!("{}", serde_json::to_string_pretty(&t)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Payout {
            sales,
            virtual_account,
            rate,
            recipient,
            min_payout,
            layer,
            submit,
        } => {
            let sales: Vec<VendingSale> = serde_json::from_str(&tokio::fs::read_to_string(&sales).await?)?;
            let plan = CommissionPlan {
                payer_virtual_account: virtual_account,
                rate_percent: rate,
                recipient_name: recipient,
                min_payout,
            };
            let Some(payout) = payout::calculate(&plan, &sales) else {
                info!(sales = sales.len(), "nothing to pay out");
                return Ok(ExitCode::SUCCESS);
            };
            println!("{}", serde_json::to_string_pretty(&payout)?);

            match (submit, layer) {
                (true, Some(layer)) => {
                    let client = build_client(&config::load()?)?;
                    match client.create_deal(layer, &payout.to_deal_candidate()).await {
                        Ok(out) => {
                            println!("{}", serde_json::to_string_pretty(&out)?);
                            Ok(ExitCode::SUCCESS)
                        }
                        Err(e) => {
                            println!("{}", serde_json::to_string_pretty(&translate_fault(&e))?);
                            Ok(ExitCode::FAILURE)
                        }
                    }
                }
                (true, None) => {
                    warn!("--submit needs --layer");
                    Ok(ExitCode::FAILURE)
                }
                _ => Ok(ExitCode::SUCCESS),
            }
        }
        Cmd::Serve => serve(config::load()?).await,
    }
}

fn build_client(cfg: &AppConfig) -> Result<LedgerClient, BoxError> {
    let transport = RpcTransport::from_config(cfg)?;
    info!(
        layers = ?transport.configured_layers(),
        timeout_ms = cfg.timeout.as_millis() as u64,
        cache_ttl_s = cfg.cache.default_ttl.as_secs(),
        "ledger client ready"
    );
    let cache = RateLimitedCache::new(cfg.cache.default_ttl);
    Ok(LedgerClient::new(transport, cache, CachePolicy::from_config(&cfg.cache)))
}

fn check_keys(cfg: &AppConfig) -> Result<ExitCode, BoxError> {
    let mut failures = 0;
    let mut checked = 0;
    for layer in Layer::ALL {
        let Some(creds) = &cfg.layer(layer).credentials else {
            info!(%layer, "no credentials configured, skipped");
            continue;
        };
        checked += 1;
        match Signer::from_pem(&creds.private_key_pem).and_then(|s| s.sign(PROBE_BODY)) {
            Ok(sig) => info!(%layer, sign_system = %creds.sign_system, sig_len = sig.len(), "signing key ok"),
            Err(e) => {
                failures += 1;
                error!(%layer, error = %e, "signing key unusable");
            }
        }
    }
    if checked == 0 {
        warn!("no layer has credentials configured");
    }
    Ok(if failures == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn print_call(client: &LedgerClient, layer: Layer, method: &str, params: Value, force: bool) -> ExitCode {
    match client.call(layer, method, params, force).await {
        Ok(out) => {
            let translated = out.response.error.as_ref().map(translate);
            let line = json!({
                "from_cache": out.from_cache,
                "response": out.response,
                "translated": translated,
            });
            println!("{line}");
            if translated.is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            println!("{}", json!({ "error": translate_fault(&e) }));
            ExitCode::FAILURE
        }
    }
}

async fn serve(cfg: AppConfig) -> Result<ExitCode, BoxError> {
    let client = build_client(&cfg)?;

    // ---- Metrics ----
    metrics::init();
    let metrics_task = cfg.metrics_port.map(|port| tokio::spawn(metrics::serve_metrics(port)));

    // ---- Cache sweeper ----
    let sweeper = client.cache().spawn_sweeper(cfg.cache.sweep_every);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));
    // one task per request line; identical concurrent reads share one upstream call
    let mut requests = JoinSet::new();
    let mut interrupted = false;

    loop {
        select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let client = client.clone();
                        requests.spawn(async move {
                            println!("{}", handle_line(&client, &line).await);
                        });
                    }
                    Ok(None) => {
                        info!(pending = requests.len(), "stdin closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!(?e, "stdin read failed");
                        break;
                    }
                }
            },
            Some(done) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = done {
                    error!(?e, "request task failed");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(pending = requests.len(), "ctrl-c, shutting down");
                interrupted = true;
                break;
            },
            _ = heartbeat.tick() => {
                let s = client.cache().stats();
                info!(hits = s.hits, misses = s.misses, entries = s.entries, inflight = s.inflight, "heartbeat");
            }
        }
    }

    if interrupted {
        requests.abort_all();
    }
    // EOF: let answers already in progress reach stdout
    while requests.join_next().await.is_some() {}

    sweeper.abort();
    if let Some(task) = metrics_task {
        task.abort();
    }
    client.cache().clear();
    Ok(ExitCode::SUCCESS)
}

async fn handle_line(client: &LedgerClient, line: &str) -> Value {
    let req: ServeRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return json!({ "ok": false, "error": format!("bad request line: {e}") }),
    };
    let id = req.id.clone();
    let key = cache_key(req.layer, &req.method, &req.params);
    match client.call(req.layer, &req.method, req.params, req.force).await {
        Ok(out) => json!({
            "id": id,
            "ok": !out.response.is_error(),
            "from_cache": out.from_cache,
            "data_age": client.cache().entry_info(&key),
            "response": out.response,
            "translated": out.response.error.as_ref().map(translate),
        }),
        Err(e) => json!({ "id": id, "ok": false, "error": translate_fault(&e) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nominal_ops::config::LayerCredentials;
    use nominal_ops::transport::Upstream;

    fn client_for(server: &mockito::ServerGuard) -> LedgerClient {
        let creds = LayerCredentials {
            private_key_pem: include_str!("../tests/fixtures/rsa_test_key.pem").to_string(),
            sign_system: "vending-test".to_string(),
            sign_thumbprint: "ab12cd34ef".to_string(),
        };
        let url = url::Url::parse(&format!("{}/rpc", server.url())).unwrap();
        let transport = RpcTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_upstream(Layer::Pre, Upstream::new(url, &creds).unwrap());
        LedgerClient::new(transport, RateLimitedCache::default(), CachePolicy::default())
    }

    #[tokio::test]
    async fn request_lines_run_as_tasks_and_echo_ids() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/rpc")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","result":{"payments":[]},"id":"1"}"#)
            .expect(1)
            .create_async()
            .await;
        let client = client_for(&server);

        let mut requests = JoinSet::new();
        for id in 0..3u64 {
            let client = client.clone();
            let line = format!(r#"{{"id":{id},"layer":"pre","method":"list_payments","params":{{}}}}"#);
            requests.spawn(async move { handle_line(&client, &line).await });
        }

        let mut ids = Vec::new();
        while let Some(answer) = requests.join_next().await {
            let answer = answer.unwrap();
            assert_eq!(answer["ok"], true, "{answer}");
            ids.push(answer["id"].as_u64().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, [0, 1, 2]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_line_is_answered_not_fatal() {
        let server = mockito::Server::new_async().await;
        let answer = handle_line(&client_for(&server), "{not json").await;
        assert_eq!(answer["ok"], false);
        assert!(answer["error"].as_str().unwrap().starts_with("bad request line"));
    }
}

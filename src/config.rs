// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : nominal_ops — signed Ledger JSON-RPC client for nominal accounts
Module  : config.rs
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
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Target environment. Selects both the endpoint and the credential set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Pre,
    Prod,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::Pre, Layer::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Pre => "pre",
            Layer::Prod => "prod",
        }
    }

    // Endpoint default per layer
    pub fn default_url(&self) -> &'static str {
        match self {
            Layer::Pre => "https://pre.tochka.com/api/v1/cyclops/v2/jsonrpc",
            Layer::Prod => "https://api.tochka.com/api/v1/cyclops/v2/jsonrpc",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Layer::Pre => "LEDGER_PRE",
            Layer::Prod => "LEDGER_PROD",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pre" | "preprod" => Ok(Layer::Pre),
            "prod" | "production" => Ok(Layer::Prod),
            other => Err(ConfigError::UnknownLayer(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown layer '{0}' (expected pre or prod)")]
    UnknownLayer(String),
    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("{var} is required when {because} is set")]
    Missing { var: String, because: String },
    #[error("{var}: cannot read key file {path}: {source}")]
    KeyFile {
        var: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Credential material for one layer. The PEM is parsed later by the signer
/// so that a bad key fails the startup health check, not config loading.
#[derive(Clone)]
pub struct LayerCredentials {
    pub private_key_pem: String,
    pub sign_system: String,
    pub sign_thumbprint: String,
}

impl fmt::Debug for LayerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerCredentials")
            .field("private_key_pem", &"<redacted>")
            .field("sign_system", &self.sign_system)
            .field("sign_thumbprint", &self.sign_thumbprint)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub endpoint: Url,
    pub credentials: Option<LayerCredentials>,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    /// Per-method TTL overrides, keyed by lowercase method name.
    pub method_ttl: HashMap<String, Duration>,
    pub sweep_every: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            method_ttl: HashMap::new(),
            sweep_every: Duration::from_secs(DEFAULT_SWEEP_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub pre: LayerConfig,
    pub prod: LayerConfig,
    pub timeout: Duration,
    pub cache: CacheConfig,
    /// `None` disables the metrics endpoint.
    pub metrics_port: Option<u16>,
}

impl AppConfig {
    pub fn layer(&self, layer: Layer) -> &LayerConfig {
        match layer {
            Layer::Pre => &self.pre,
            Layer::Prod => &self.prod,
        }
    }
}

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_SECS: u64 = 60;
const DEFAULT_METRICS_PORT: u16 = 9899;
const TTL_OVERRIDE_PREFIX: &str = "CACHE_TTL_";

/// Reads `.env` (if any) and then the process environment.
pub fn load() -> Result<AppConfig, ConfigError> {
    let _ = dotenv();
    let overrides: Vec<(String, String)> = env::vars()
        .filter(|(k, _)| k.starts_with(TTL_OVERRIDE_PREFIX) && k != "CACHE_TTL_SECS")
        .collect();
    load_from(|key| env::var(key).ok(), &overrides)
}

/// Builds the config from an arbitrary lookup. `ttl_vars` carries the
/// `CACHE_TTL_<METHOD>` pairs, which cannot be discovered through a lookup.
pub fn load_from<F>(lookup: F, ttl_vars: &[(String, String)]) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pre = load_layer(&lookup, Layer::Pre)?;
    let prod = load_layer(&lookup, Layer::Prod)?;

    // ===== Transport =====
    let timeout_ms = parse_num::<u64>(&lookup, "LEDGER_TIMEOUT_MS")?
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(1_000, 60_000);

    // ===== Cache =====
    let default_ttl = parse_num::<u64>(&lookup, "CACHE_TTL_SECS")?.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    let sweep_secs = parse_num::<u64>(&lookup, "CACHE_SWEEP_SECS")?
        .unwrap_or(DEFAULT_SWEEP_SECS)
        .max(1);

    let mut method_ttl = HashMap::new();
    for (var, value) in ttl_vars {
        let Some(method) = var.strip_prefix(TTL_OVERRIDE_PREFIX) else {
            continue;
        };
        if method.is_empty() || method == "SECS" {
            continue;
        }
        let secs: u64 = value.trim().parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::Invalid {
                var: var.clone(),
                value: value.clone(),
                reason: e.to_string(),
            }
        })?;
        method_ttl.insert(method.to_ascii_lowercase(), Duration::from_secs(secs));
    }

    // ===== Metrics =====
    let metrics_port = match parse_num::<u16>(&lookup, "METRICS_PORT")? {
        Some(0) => None,
        Some(p) => Some(p),
        None => Some(DEFAULT_METRICS_PORT),
    };

    Ok(AppConfig {
        pre,
        prod,
        timeout: Duration::from_millis(timeout_ms),
        cache: CacheConfig {
            default_ttl: Duration::from_secs(default_ttl),
            method_ttl,
            sweep_every: Duration::from_secs(sweep_secs),
        },
        metrics_port,
    })
}

fn load_layer<F>(lookup: &F, layer: Layer) -> Result<LayerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = layer.env_prefix();
    let url_var = format!("{prefix}_URL");
    let raw_url = non_empty(lookup(&url_var)).unwrap_or_else(|| layer.default_url().to_string());
    let endpoint = Url::parse(&raw_url).map_err(|e| ConfigError::Invalid {
        var: url_var.clone(),
        value: raw_url.clone(),
        reason: e.to_string(),
    })?;

    let key_var = format!("{prefix}_PRIVATE_KEY");
    let key_path_var = format!("{prefix}_PRIVATE_KEY_PATH");
    let pem = match (non_empty(lookup(&key_var)), non_empty(lookup(&key_path_var))) {
        (Some(inline), _) => Some(inline.replace("\\n", "\n")),
        (None, Some(path)) => Some(std::fs::read_to_string(&path).map_err(|source| {
            ConfigError::KeyFile {
                var: key_path_var.clone(),
                path: path.clone(),
                source,
            }
        })?),
        (None, None) => None,
    };

    let credentials = match pem {
        None => None,
        Some(private_key_pem) => {
            let because = key_var.clone();
            let required = |suffix: &str| -> Result<String, ConfigError> {
                let var = format!("{prefix}_{suffix}");
                non_empty(lookup(&var)).ok_or_else(|| ConfigError::Missing {
                    var,
                    because: because.clone(),
                })
            };
            Some(LayerCredentials {
                private_key_pem,
                sign_system: required("SIGN_SYSTEM")?,
                sign_thumbprint: required("SIGN_THUMBPRINT")?,
            })
        }
    };

    Ok(LayerConfig {
        endpoint,
        credentials,
    })
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_num<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match non_empty(lookup(var)) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            var: var.to_string(),
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_any_variables() {
        let cfg = load_from(lookup_from(&[]), &[]).unwrap();
        assert_eq!(cfg.pre.endpoint.as_str(), Layer::Pre.default_url());
        assert_eq!(cfg.prod.endpoint.as_str(), Layer::Prod.default_url());
        assert!(cfg.pre.credentials.is_none());
        assert_eq!(cfg.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(cfg.metrics_port, Some(9899));
    }

    #[test]
    fn layer_parsing_is_explicit() {
        assert_eq!("PRE".parse::<Layer>().unwrap(), Layer::Pre);
        assert_eq!("production".parse::<Layer>().unwrap(), Layer::Prod);
        assert!("staging".parse::<Layer>().is_err());
    }

    #[test]
    fn credentials_need_system_and_thumbprint() {
        let err = load_from(
            lookup_from(&[("LEDGER_PRE_PRIVATE_KEY", "pem"), ("LEDGER_PRE_SIGN_SYSTEM", "ops")]),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref var, .. } if var == "LEDGER_PRE_SIGN_THUMBPRINT"));

        let cfg = load_from(
            lookup_from(&[
                ("LEDGER_PROD_PRIVATE_KEY", "line1\\nline2"),
                ("LEDGER_PROD_SIGN_SYSTEM", "ops"),
                ("LEDGER_PROD_SIGN_THUMBPRINT", "ABCDEF"),
            ]),
            &[],
        )
        .unwrap();
        let creds = cfg.prod.credentials.unwrap();
        assert_eq!(creds.private_key_pem, "line1\nline2");
        assert!(cfg.pre.credentials.is_none());
    }

    #[test]
    fn per_method_ttl_and_clamped_timeout() {
        let cfg = load_from(
            lookup_from(&[("LEDGER_TIMEOUT_MS", "500"), ("METRICS_PORT", "0")]),
            &[("CACHE_TTL_LIST_PAYMENTS".to_string(), "120".to_string())],
        )
        .unwrap();
        assert_eq!(cfg.timeout, Duration::from_millis(1_000));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(
            cfg.cache.method_ttl.get("list_payments"),
            Some(&Duration::from_secs(120))
        );
    }

    #[test]
    fn bad_url_is_reported_with_variable_name() {
        let err = load_from(lookup_from(&[("LEDGER_PRE_URL", "not a url")]), &[]).unwrap_err();
        assert!(err.to_string().starts_with("LEDGER_PRE_URL"));
    }
}

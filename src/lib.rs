// ===============================
// src/lib.rs
// ===============================
//! Signed JSON-RPC client for the Ledger (nominal account) API.
//!
//! - [`signer`] / [`transport`]: RSA-SHA256 signed calls per layer, typed transport faults
//! - [`cache`]: rate-limit-aware response cache with in-flight de-duplication
//! - [`validator`] / [`deal`]: deal candidates checked and normalized before sending
//! - [`translate`]: upstream codes to user messages, hints and retry flags
//! - [`client`]: the facade route handlers talk to
pub mod cache;
pub mod client;
pub mod config;
pub mod deal;
pub mod error;
pub mod metrics;
pub mod payout;
pub mod rpc;
pub mod signer;
pub mod translate;
pub mod transport;
pub mod validator;

pub use cache::{cache_key, Cached, RateLimitedCache};
pub use client::{CachePolicy, CallOutcome, LedgerClient};
pub use config::{AppConfig, Layer};
pub use deal::{DealSnapshot, DealStatus, ValidDeal};
pub use error::LedgerError;
pub use rpc::{RpcResponse, UpstreamError};
pub use translate::{translate, translate_fault, TranslatedError};
pub use validator::{validate_deal, ValidationErrors};

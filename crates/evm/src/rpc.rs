//! Minimal JSON-RPC 2.0 transport over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::U256;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::trace;

use almoner_core::error::{LedgerError, LedgerResult};
use almoner_core::retry::RetryPolicy;

/// Provider error codes that signal load rather than a bad request.
const LIMIT_EXCEEDED: i64 = -32005;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client for one node endpoint.
pub(crate) struct RpcTransport {
    http: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcTransport {
    pub(crate) fn new(http: reqwest::Client, url: String, retry: RetryPolicy) -> Self {
        Self {
            http,
            url,
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method`, retrying transient failures.
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> LedgerResult<T> {
        self.retry
            .run(method, || self.call_once(method, &params))
            .await
    }

    /// Call `method` exactly once. Used for non-idempotent requests.
    pub(crate) async fn call_once<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &Value,
    ) -> LedgerResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(method, id, "JSON-RPC request");

        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(LedgerError::Unavailable(format!("{method}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::Rejected(format!("{method}: HTTP {status}")));
        }

        let body: RpcResponse = response.json().await.map_err(http_error)?;
        decode_response(method, body)
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: RpcResponse) -> LedgerResult<T> {
    if let Some(error) = body.error {
        let reason = format!("{method}: {} ({})", error.message, error.code);
        return Err(match error.code {
            LIMIT_EXCEEDED | INTERNAL_ERROR => LedgerError::Unavailable(reason),
            _ => LedgerError::Rejected(reason),
        });
    }
    serde_json::from_value(body.result)
        .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
}

/// Map a reqwest failure onto the ledger taxonomy.
pub(crate) fn http_error(e: reqwest::Error) -> LedgerError {
    if e.is_timeout() {
        LedgerError::Timeout(e.to_string())
    } else if e.is_decode() {
        LedgerError::Decode(e.to_string())
    } else {
        LedgerError::Unavailable(e.to_string())
    }
}

// =============================================================================
// Quantities
// =============================================================================

/// Encode a block number as a JSON-RPC quantity.
pub(crate) fn quantity(n: u64) -> String {
    format!("{n:#x}")
}

/// Encode a wei amount as a JSON-RPC quantity.
pub(crate) fn quantity_u256(value: U256) -> String {
    format!("0x{value:x}")
}

fn hex_digits(s: &str) -> LedgerResult<&str> {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| LedgerError::Decode(format!("not a hex quantity: {s:?}")))
}

pub(crate) fn parse_u64(s: &str) -> LedgerResult<u64> {
    u64::from_str_radix(hex_digits(s)?, 16)
        .map_err(|e| LedgerError::Decode(format!("bad quantity {s:?}: {e}")))
}

pub(crate) fn parse_u256(s: &str) -> LedgerResult<U256> {
    U256::from_str_radix(hex_digits(s)?, 16)
        .map_err(|e| LedgerError::Decode(format!("bad quantity {s:?}: {e}")))
}

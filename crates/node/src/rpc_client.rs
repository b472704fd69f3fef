//! JSON-RPC client for the full node the indexer follows.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use exploder_consensus::Hash256;
use exploder_parser::rpc::{RpcBlock, RpcTransaction};
use exploder_primitives::hex::{hash256_from_hex, hash256_to_hex};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Block or transaction unknown to the node.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Node still loading its block index.
pub const RPC_IN_WARMUP: i64 = -28;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const MAX_RETRY_DELAY_MS: u64 = 10_000;

#[derive(Debug)]
pub enum RpcError {
    Transport(String),
    Http(i32),
    Rpc { code: i64, message: String },
    Decode(String),
}

impl RpcError {
    /// Failures worth another attempt after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Http(status) => *status >= 500,
            RpcError::Rpc { code, .. } => *code == RPC_IN_WARMUP,
            RpcError::Decode(_) => false,
        }
    }

    fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Rpc { code, .. } if *code == RPC_INVALID_ADDRESS_OR_KEY)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(message) => write!(f, "rpc transport error: {message}"),
            RpcError::Http(status) => write!(f, "rpc http status {status}"),
            RpcError::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            RpcError::Decode(message) => write!(f, "rpc response decode error: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PeerInfo {
    #[serde(default)]
    pub id: i64,
    pub addr: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub subver: String,
    #[serde(default)]
    pub inbound: bool,
    #[serde(default)]
    pub conntime: u64,
    #[serde(default)]
    pub startingheight: i64,
}

/// The node calls the orchestrator depends on.
pub trait ChainRpc {
    fn get_block_count(&self) -> Result<u32, RpcError>;

    fn get_block_hash(&self, height: u32) -> Result<Hash256, RpcError>;

    /// `Ok(None)` when the node does not know the block.
    fn get_block(&self, hash: &Hash256) -> Result<Option<RpcBlock>, RpcError>;

    /// Verbose transaction; `Ok(None)` when the node does not index it.
    fn get_raw_transaction(&self, txid: &Hash256) -> Result<Option<RpcTransaction>, RpcError>;

    fn get_peer_info(&self) -> Result<Vec<PeerInfo>, RpcError>;
}

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl RpcConfig {
    pub fn new(url: String, user: Option<String>, password: Option<String>, timeout_secs: u64) -> Self {
        Self {
            url,
            user,
            password,
            timeout_secs,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct HttpRpcClient {
    config: RpcConfig,
    authorization: Option<String>,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let authorization = config.user.as_deref().map(|user| {
            let password = config.password.as_deref().unwrap_or_default();
            let token = general_purpose::STANDARD.encode(format!("{user}:{password}"));
            format!("Basic {token}")
        });
        Self {
            config,
            authorization,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Sends `method`, retrying transient failures with exponential backoff.
    pub fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.call_once(method, &params) {
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=self.config.retry_base_ms / 2);
                    let delay = retry_delay(attempt, self.config.retry_base_ms, jitter);
                    log_warn!(
                        "rpc {method} failed (attempt {attempt}/{max_attempts}): {err}; retrying in {}ms",
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn call_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: params.clone(),
        };
        let body = serde_json::to_string(&request).map_err(|err| RpcError::Decode(err.to_string()))?;
        let mut http = minreq::post(self.config.url.as_str())
            .with_header("Content-Type", "application/json")
            .with_body(body);
        if let Some(authorization) = self.authorization.as_deref() {
            http = http.with_header("Authorization", authorization);
        }
        if self.config.timeout_secs > 0 {
            http = http.with_timeout(self.config.timeout_secs);
        }
        let response = http
            .send()
            .map_err(|err| RpcError::Transport(format!("{}: {err}", self.config.url)))?;
        decode_response(response.status_code, response.as_bytes())
    }
}

impl ChainRpc for HttpRpcClient {
    fn get_block_count(&self) -> Result<u32, RpcError> {
        self.call("getblockcount", json!([]))
    }

    fn get_block_hash(&self, height: u32) -> Result<Hash256, RpcError> {
        let hex: String = self.call("getblockhash", json!([height]))?;
        hash256_from_hex(&hex).map_err(|err| RpcError::Decode(format!("getblockhash: {err}")))
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<RpcBlock>, RpcError> {
        not_found_as_none(self.call("getblock", json!([hash256_to_hex(hash)])))
    }

    fn get_raw_transaction(&self, txid: &Hash256) -> Result<Option<RpcTransaction>, RpcError> {
        not_found_as_none(self.call("getrawtransaction", json!([hash256_to_hex(txid), 1])))
    }

    fn get_peer_info(&self) -> Result<Vec<PeerInfo>, RpcError> {
        self.call("getpeerinfo", json!([]))
    }
}

fn not_found_as_none<T>(result: Result<T, RpcError>) -> Result<Option<T>, RpcError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Nodes answer RPC errors with a JSON body on non-2xx statuses, so the body
/// is inspected before the status.
fn decode_response<T: DeserializeOwned>(status: i32, body: &[u8]) -> Result<T, RpcError> {
    match serde_json::from_slice::<RpcResponse<T>>(body) {
        Ok(RpcResponse {
            error: Some(error), ..
        }) => Err(RpcError::Rpc {
            code: error.code,
            message: error.message,
        }),
        Ok(RpcResponse {
            result: Some(result),
            ..
        }) if (200..300).contains(&status) => Ok(result),
        _ if !(200..300).contains(&status) => Err(RpcError::Http(status)),
        Ok(_) => Err(RpcError::Decode("response carries neither result nor error".to_string())),
        Err(err) => Err(RpcError::Decode(err.to_string())),
    }
}

fn retry_delay(attempt: u32, base_ms: u64, jitter_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let backoff = base_ms.saturating_mul(1u64 << exponent).min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(backoff.saturating_add(jitter_ms))
}

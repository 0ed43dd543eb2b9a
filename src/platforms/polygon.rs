//! Polygon JSON-RPC client.
//!
//! Reads ERC-1155 balances from the Conditional Token Framework (CTF)
//! contract and scans its `TransferSingle` logs. Public RPC endpoints
//! throttle aggressively; throttling is reported as
//! `TrackerError::RateLimited` so callers can back off.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::types::{Address, U256};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::platforms::BalanceSource;
use crate::types::TrackerError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_RPC_URL: &str = "https://polygon-rpc.com";
pub const CTF_ADDRESS: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";

/// `balanceOf(address,uint256)` selector.
const BALANCE_OF_SELECTOR: [u8; 4] = [0x00, 0xfd, 0xd5, 0x8e];

/// keccak256("TransferSingle(address,address,address,uint256,uint256)")
pub const TRANSFER_SINGLE_TOPIC: &str =
    "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PolygonRpcClient {
    http: Client,
    rpc_url: String,
    ctf_address: String,
}

impl PolygonRpcClient {
    pub fn new(rpc_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Polygon RPC HTTP client")?;

        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            ctf_address: CTF_ADDRESS.to_string(),
        })
    }

    /// Issue a single JSON-RPC call and unwrap its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value, TrackerError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackerError::RateLimited(format!("HTTP 429: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackerError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))?;
        rpc_result(body)
    }

    /// Latest block height.
    pub async fn block_number(&self) -> Result<u64, TrackerError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| TrackerError::Parse("eth_blockNumber result not a string".into()))?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| TrackerError::Parse(format!("bad block number {hex}: {e}")))
    }

    /// Token ids received by `wallet` via `TransferSingle` in the last
    /// `depth` blocks.
    pub async fn received_token_ids(&self, wallet: &str, depth: u64) -> Result<Vec<String>, TrackerError> {
        let wallet = parse_wallet(wallet)?;
        let latest = self.block_number().await?;
        let from_block = latest.saturating_sub(depth);

        let filter = json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": "latest",
            "address": self.ctf_address,
            "topics": [TRANSFER_SINGLE_TOPIC],
        }]);

        let result = self.call("eth_getLogs", filter).await?;
        let logs = result
            .as_array()
            .ok_or_else(|| TrackerError::Parse("eth_getLogs result not an array".into()))?;

        let ids = logs
            .iter()
            .filter_map(|log| token_id_from_log(log, &wallet))
            .collect::<Vec<_>>();
        debug!(from_block, logs = logs.len(), matched = ids.len(), "Scanned CTF transfer logs");
        Ok(ids)
    }
}

#[async_trait]
impl BalanceSource for PolygonRpcClient {
    async fn balance_of(&self, wallet: &str, asset_id: &str) -> Result<u128, TrackerError> {
        let data = balance_of_calldata(wallet, asset_id)?;
        let result = self
            .call(
                "eth_call",
                json!([{ "to": self.ctf_address, "data": data }, "latest"]),
            )
            .await?;

        let hex = result
            .as_str()
            .ok_or_else(|| TrackerError::Parse("eth_call result not a string".into()))?;
        parse_uint_word(hex)
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Unwrap a JSON-RPC response body, classifying node errors.
pub fn rpc_result(mut body: Value) -> Result<Value, TrackerError> {
    if let Some(err) = body.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(TrackerError::classify(format!("{code}: {message}")));
    }
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(TrackerError::Parse("JSON-RPC response without result".into())),
    }
}

/// ABI-encode `balanceOf(wallet, id)`.
pub fn balance_of_calldata(wallet: &str, asset_id: &str) -> Result<String, TrackerError> {
    let owner = parse_wallet(wallet)?;
    let id = U256::from_dec_str(asset_id)
        .map_err(|e| TrackerError::Parse(format!("invalid token id {asset_id}: {e:?}")))?;

    let mut data = BALANCE_OF_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(owner), Token::Uint(id)]));
    Ok(format!("0x{}", hex::encode(data)))
}

pub fn parse_wallet(wallet: &str) -> Result<Address, TrackerError> {
    wallet
        .parse::<Address>()
        .map_err(|e| TrackerError::Config(format!("invalid wallet address {wallet}: {e:?}")))
}

/// Parse a 32-byte return word into a balance. Balances above `u128::MAX`
/// cannot be real share counts and are rejected.
pub fn parse_uint_word(raw: &str) -> Result<u128, TrackerError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| TrackerError::Parse(format!("bad return data {raw}: {e}")))?;
    if bytes.len() < 32 {
        return Err(TrackerError::Parse(format!(
            "balanceOf returned {} bytes, expected 32",
            bytes.len()
        )));
    }

    let value = U256::from_big_endian(&bytes[..32]);
    if value.bits() > 128 {
        return Err(TrackerError::Parse(format!("balance overflows u128: {raw}")));
    }
    Ok(value.low_u128())
}

/// Extract the token id from a `TransferSingle` log if `to` is `wallet`.
fn token_id_from_log(log: &Value, wallet: &Address) -> Option<String> {
    let topics = log.get("topics")?.as_array()?;
    let to = hex::decode(topics.get(3)?.as_str()?.trim_start_matches("0x")).ok()?;
    if to.len() != 32 || Address::from_slice(&to[12..]) != *wallet {
        return None;
    }

    let data = hex::decode(log.get("data")?.as_str()?.trim_start_matches("0x")).ok()?;
    Some(U256::from_big_endian(data.get(..32)?).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

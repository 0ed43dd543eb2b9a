//! Polygonscan block explorer client.
//!
//! Lists ERC-1155 transfers for the CTF contract. Used only as a
//! discovery hint: the explorer lags the chain and caps page size.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_EXPLORER_URL: &str = "https://api.polygonscan.com/api";

/// Newest transfers requested per call.
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenTransfer {
    #[serde(default)]
    pub to: String,
    #[serde(default, rename = "tokenID")]
    pub token_id: String,
}

pub struct PolygonscanClient {
    http: Client,
    base_url: String,
    api_key: String,
    contract: String,
}

impl PolygonscanClient {
    pub fn new(base_url: &str, api_key: String, contract: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Polygonscan HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key,
            contract: contract.to_string(),
        })
    }

    /// Token ids of the newest transfers into `wallet`.
    pub async fn incoming_token_ids(&self, wallet: &str) -> Result<Vec<String>> {
        let page_size = PAGE_SIZE.to_string();
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[
                ("module", "account"),
                ("action", "token1155tx"),
                ("contractaddress", self.contract.as_str()),
                ("address", wallet),
                ("page", "1"),
                ("offset", page_size.as_str()),
                ("sort", "desc"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("Polygonscan request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Polygonscan error {}", resp.status());
        }

        let body: ExplorerResponse = resp
            .json()
            .await
            .context("Failed to parse Polygonscan response")?;

        Ok(incoming_from_response(body, wallet))
    }
}

/// `status == "0"` with "No transactions found" is an empty wallet, not an
/// error; any other non-"1" status yields nothing.
fn incoming_from_response(body: ExplorerResponse, wallet: &str) -> Vec<String> {
    if body.status != "1" {
        debug!(status = %body.status, message = %body.message, "Polygonscan returned no transfers");
        return Vec::new();
    }

    let transfers: Vec<TokenTransfer> = serde_json::from_value(body.result).unwrap_or_default();
    transfers
        .into_iter()
        .filter(|t| t.to.eq_ignore_ascii_case(wallet) && !t.token_id.is_empty())
        .map(|t| t.token_id)
        .collect()
}

//! Order relay integration.
//!
//! CLOB order placement requires EIP-712 signatures and L2 API
//! credentials. Both live in an external relay service that holds the
//! wallet key; this client only speaks its small REST surface:
//!
//! - `GET  {base}/orders?asset_id=..` lists the wallet's resting orders
//! - `POST {base}/orders` places a GTC limit order
//!
//! Auth: `Authorization: Bearer {api_key}`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::platforms::{OpenOrdersSource, OrderExecutor};
use crate::types::{decimal_from_json, short_id, OpenOrder, OrderReceipt, Side, TrackerError};

const RELAY_NAME: &str = "relay";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    token_id: &'a str,
    price: String,
    size: String,
    side: Side,
    order_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    #[serde(default, alias = "orderID", alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, alias = "errorMsg")]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OrderRelayClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
}

impl OrderRelayClient {
    pub fn new(base_url: &str, api_key: SecretString, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build order relay HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }
}

#[async_trait]
impl OpenOrdersSource for OrderRelayClient {
    async fn open_orders(&self, asset_id: &str) -> Result<Vec<OpenOrder>> {
        let url = format!("{}/orders", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", self.bearer())
            .query(&[("asset_id", asset_id)])
            .send()
            .await
            .context("Open orders request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Relay open orders error {status}: {body}");
        }

        let body: Value = resp.json().await.context("Failed to parse open orders")?;
        let orders = parse_open_orders(&body);
        debug!(asset = %short_id(asset_id), orders = orders.len(), "Fetched open orders");
        Ok(orders)
    }
}

#[async_trait]
impl OrderExecutor for OrderRelayClient {
    async fn submit_sell(&self, asset_id: &str, price: Decimal, size: Decimal) -> Result<OrderReceipt> {
        let url = format!("{}/orders", self.base_url);
        let request = PlaceOrderRequest {
            token_id: asset_id,
            price: price.normalize().to_string(),
            size: size.normalize().to_string(),
            side: Side::Sell,
            order_type: "GTC",
        };

        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Sell order request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackerError::Execution(format!("relay rejected sell order ({status}): {body}")).into());
        }

        let body: PlaceOrderResponse = resp.json().await.context("Failed to parse order response")?;
        let receipt = receipt_from_response(body, asset_id, price, size)?;
        info!(
            asset = %short_id(asset_id),
            order_id = %receipt.order_id,
            status = %receipt.status,
            "Sell order accepted"
        );
        Ok(receipt)
    }

    fn name(&self) -> &str {
        RELAY_NAME
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_open_orders(body: &Value) -> Vec<OpenOrder> {
    let items = body
        .as_array()
        .or_else(|| body.get("data").and_then(Value::as_array))
        .or_else(|| body.get("orders").and_then(Value::as_array));

    items
        .into_iter()
        .flatten()
        .filter_map(|o| {
            let owner = o
                .get("owner")
                .or_else(|| o.get("maker_address"))
                .and_then(Value::as_str)?
                .to_string();
            let size_matched = o
                .get("size_matched")
                .and_then(decimal_from_json)
                .unwrap_or(Decimal::ZERO);
            Some(OpenOrder { owner, size_matched })
        })
        .collect()
}

fn receipt_from_response(
    body: PlaceOrderResponse,
    asset_id: &str,
    price: Decimal,
    size: Decimal,
) -> Result<OrderReceipt> {
    if body.success == Some(false) {
        let reason = body.error.unwrap_or_else(|| "unknown error".into());
        return Err(TrackerError::Execution(format!("relay reported failure: {reason}")).into());
    }
    let order_id = match body.order_id {
        Some(id) if !id.is_empty() => id,
        _ => anyhow::bail!("Relay response carried no order id"),
    };

    Ok(OrderReceipt {
        order_id,
        status: body.status.unwrap_or_else(|| "submitted".into()),
        asset_id: asset_id.to_string(),
        price,
        size,
        dry_run: false,
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Polymarket integration.
//!
//! Uses the public CLOB API for prices and the Data API for fills and
//! aggregated positions. Neither requires authentication. Authenticated
//! calls (open orders, order placement) go through the order relay, see
//! `platforms::relay`.
//!
//! CLOB API: https://clob.polymarket.com
//! Data API: https://data-api.polymarket.com

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use std::future::Future;
use tracing::debug;

use crate::platforms::{PositionsSource, PriceSource, TradeHistorySource};
use crate::types::{decimal_from_json, Fill, PositionSize, PriceError, Side};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const CLOB_API_URL: &str = "https://clob.polymarket.com";
pub const DATA_API_URL: &str = "https://data-api.polymarket.com";

/// Page size for Data API list endpoints.
const DATA_API_LIMIT: usize = 500;

/// Upper bound on `/trades` pages walked per asset lookup.
const MAX_TRADE_PAGES: usize = 20;

/// Positions smaller than this are ignored as closed-out remnants.
const MIN_REPORTED_SIZE: Decimal = rust_decimal_macros::dec!(0.01);

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PolymarketClient {
    http: Client,
    clob_url: String,
    data_url: String,
}

impl PolymarketClient {
    pub fn new(clob_url: &str, data_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Polymarket HTTP client")?;

        Ok(Self {
            http,
            clob_url: clob_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Polymarket API error {status}: {body}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }
}

#[async_trait]
impl PriceSource for PolymarketClient {
    async fn price(&self, asset_id: &str, side: Side) -> Result<Decimal, PriceError> {
        let url = format!("{}/price", self.clob_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", asset_id), ("side", side.as_str())])
            .send()
            .await
            .map_err(|e| PriceError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        classify_price_response(asset_id, status, &body)
    }
}

#[async_trait]
impl TradeHistorySource for PolymarketClient {
    /// `/trades` is wallet-wide and newest first, so every page is
    /// scanned for the asset until a short page ends the history.
    async fn buy_fills(&self, wallet: &str, asset_id: &str) -> Result<Vec<Fill>> {
        let url = format!("{}/trades", self.data_url);
        let limit = DATA_API_LIMIT.to_string();
        let pages = walk_pages(DATA_API_LIMIT, MAX_TRADE_PAGES, |offset| {
            let offset = offset.to_string();
            let url = &url;
            let limit = &limit;
            async move {
                self.get_json(
                    url,
                    &[
                        ("user", wallet),
                        ("side", "BUY"),
                        ("limit", limit.as_str()),
                        ("offset", offset.as_str()),
                    ],
                )
                .await
            }
        })
        .await?;

        let fills: Vec<Fill> = pages.iter().flat_map(|page| parse_fills(page, asset_id)).collect();
        debug!(
            asset = %crate::types::short_id(asset_id),
            pages = pages.len(),
            fills = fills.len(),
            "Fetched buy fills"
        );
        Ok(fills)
    }
}

#[async_trait]
impl PositionsSource for PolymarketClient {
    async fn positions(&self, wallet: &str) -> Result<Vec<PositionSize>> {
        let url = format!("{}/positions", self.data_url);
        let limit = DATA_API_LIMIT.to_string();
        let body = self
            .get_json(&url, &[("user", wallet), ("limit", limit.as_str())])
            .await?;
        Ok(parse_positions(&body))
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Fetch `offset`-paged list bodies until one holds fewer than `page_size`
/// items or `max_pages` have been read.
pub async fn walk_pages<F, Fut>(page_size: usize, max_pages: usize, mut fetch: F) -> Result<Vec<Value>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let mut pages = Vec::new();
    for page in 0..max_pages {
        let body = fetch(page * page_size).await?;
        let full = list_items(&body).len() >= page_size;
        pages.push(body);
        if !full {
            break;
        }
    }
    Ok(pages)
}

/// A missing order book (HTTP 404 or "No orderbook" in the body) means
/// the market resolved; everything else is transient.
pub fn classify_price_response(asset_id: &str, status: StatusCode, body: &str) -> Result<Decimal, PriceError> {
    if status == StatusCode::NOT_FOUND || body.contains("No orderbook") {
        return Err(PriceError::NotFound(asset_id.to_string()));
    }
    if !status.is_success() {
        return Err(PriceError::Transient(format!("HTTP {status}: {body}")));
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| PriceError::Transient(format!("bad price body: {e}")))?;
    value
        .get("price")
        .and_then(decimal_from_json)
        .ok_or_else(|| PriceError::Transient(format!("no price in response: {body}")))
}

/// Data API list bodies are either a bare array or wrapped in
/// `positions` / `data`.
fn list_items(body: &Value) -> &[Value] {
    body.as_array()
        .or_else(|| body.get("positions").and_then(Value::as_array))
        .or_else(|| body.get("data").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn first_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| item.get(*k).filter(|v| !v.is_null()))
}

fn asset_of(item: &Value) -> Option<String> {
    match first_field(item, &["asset", "token_id", "tokenId"])? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_positions(body: &Value) -> Vec<PositionSize> {
    list_items(body)
        .iter()
        .filter_map(|item| {
            let asset_id = asset_of(item)?;
            let size = first_field(item, &["size", "amount", "shares"]).and_then(decimal_from_json)?;
            (size > MIN_REPORTED_SIZE).then_some(PositionSize { asset_id, size })
        })
        .collect()
}

pub fn parse_fills(body: &Value, asset_id: &str) -> Vec<Fill> {
    list_items(body)
        .iter()
        .filter(|item| asset_of(item).as_deref() == Some(asset_id))
        .filter(|item| {
            item.get("side")
                .and_then(Value::as_str)
                .map_or(true, |s| s.eq_ignore_ascii_case("BUY"))
        })
        .filter_map(|item| {
            let price = item.get("price").and_then(decimal_from_json)?;
            let size = item.get("size").and_then(decimal_from_json)?;
            Some(Fill { price, size })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

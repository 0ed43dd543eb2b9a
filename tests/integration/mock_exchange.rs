//! In-memory exchange for integration testing.
//!
//! One `MockExchange` stands in for every collaborator the engine talks
//! to: chain balances, open orders, prices, trade history, the positions
//! API and the order venue. All state is shared behind an `Arc`, so clones
//! handed to different components see the same book.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use harvest::engine::discovery::{DiscoveryContext, DiscoverySource};
use harvest::platforms::{
    BalanceSource, OpenOrdersSource, OrderExecutor, PositionsSource, PriceSource, TradeHistorySource,
};
use harvest::types::{
    Fill, Hint, OpenOrder, OrderReceipt, PositionSize, PriceError, Side, TrackerError,
};

pub const WALLET: &str = "0x1111111111111111111111111111111111111111";

#[derive(Debug, Clone)]
pub enum Quote {
    Price(Decimal),
    NoOrderbook,
    Unavailable,
}

#[derive(Default)]
struct State {
    /// Raw 6-decimal units per asset.
    balances: HashMap<String, u128>,
    quotes: HashMap<String, Quote>,
    fills: HashMap<String, Vec<Fill>>,
    positions: Vec<PositionSize>,
    open_orders: HashMap<String, Vec<OpenOrder>>,
    rate_limited: bool,
    fail_sells: bool,
    sells: Vec<OrderReceipt>,
    balance_calls: HashMap<String, usize>,
    price_calls: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockExchange {
    state: Arc<Mutex<State>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give the wallet `shares` whole shares of `asset_id`.
    pub fn hold(&self, asset_id: &str, shares: u64) -> &Self {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(asset_id.into(), shares as u128 * 1_000_000);
        self
    }

    pub fn quote(&self, asset_id: &str, quote: Quote) -> &Self {
        self.state.lock().unwrap().quotes.insert(asset_id.into(), quote);
        self
    }

    pub fn fill(&self, asset_id: &str, price: Decimal, size: Decimal) -> &Self {
        self.state
            .lock()
            .unwrap()
            .fills
            .entry(asset_id.into())
            .or_default()
            .push(Fill { price, size });
        self
    }

    pub fn report_position(&self, asset_id: &str, size: Decimal) -> &Self {
        self.state.lock().unwrap().positions.push(PositionSize {
            asset_id: asset_id.into(),
            size,
        });
        self
    }

    pub fn resting_order(&self, asset_id: &str, size_matched: Decimal) -> &Self {
        self.state
            .lock()
            .unwrap()
            .open_orders
            .entry(asset_id.into())
            .or_default()
            .push(OpenOrder {
                owner: WALLET.to_string(),
                size_matched,
            });
        self
    }

    pub fn set_rate_limited(&self, on: bool) {
        self.state.lock().unwrap().rate_limited = on;
    }

    pub fn set_fail_sells(&self, on: bool) {
        self.state.lock().unwrap().fail_sells = on;
    }

    pub fn sells(&self) -> Vec<OrderReceipt> {
        self.state.lock().unwrap().sells.clone()
    }

    pub fn balance_calls(&self, asset_id: &str) -> usize {
        self.state.lock().unwrap().balance_calls.get(asset_id).copied().unwrap_or(0)
    }

    pub fn price_calls(&self, asset_id: &str) -> usize {
        self.state.lock().unwrap().price_calls.get(asset_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BalanceSource for MockExchange {
    async fn balance_of(&self, _wallet: &str, asset_id: &str) -> Result<u128, TrackerError> {
        let mut state = self.state.lock().unwrap();
        *state.balance_calls.entry(asset_id.into()).or_default() += 1;
        if state.rate_limited {
            return Err(TrackerError::RateLimited("-32090: Too many requests".into()));
        }
        Ok(state.balances.get(asset_id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl OpenOrdersSource for MockExchange {
    async fn open_orders(&self, asset_id: &str) -> Result<Vec<OpenOrder>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .open_orders
            .get(asset_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceSource for MockExchange {
    async fn price(&self, asset_id: &str, _side: Side) -> Result<Decimal, PriceError> {
        let mut state = self.state.lock().unwrap();
        *state.price_calls.entry(asset_id.into()).or_default() += 1;
        match state.quotes.get(asset_id) {
            Some(Quote::Price(p)) => Ok(*p),
            Some(Quote::NoOrderbook) => Err(PriceError::NotFound(asset_id.into())),
            Some(Quote::Unavailable) | None => Err(PriceError::Transient("gateway timeout".into())),
        }
    }
}

#[async_trait]
impl TradeHistorySource for MockExchange {
    async fn buy_fills(&self, _wallet: &str, asset_id: &str) -> Result<Vec<Fill>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .fills
            .get(asset_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PositionsSource for MockExchange {
    async fn positions(&self, _wallet: &str) -> Result<Vec<PositionSize>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }
}

#[async_trait]
impl OrderExecutor for MockExchange {
    /// Fills immediately: the sold shares leave the wallet.
    async fn submit_sell(&self, asset_id: &str, price: Decimal, size: Decimal) -> Result<OrderReceipt> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sells {
            return Err(anyhow!("not enough balance / allowance"));
        }
        state.balances.insert(asset_id.into(), 0);

        let receipt = OrderReceipt {
            order_id: format!("0xorder{}", state.sells.len() + 1),
            status: "matched".into(),
            asset_id: asset_id.into(),
            price,
            size,
            dry_run: false,
            timestamp: Utc::now(),
        };
        state.sells.push(receipt.clone());
        Ok(receipt)
    }

    fn name(&self) -> &str {
        "mock-exchange"
    }
}

/// Discovery source returning a fixed list, duplicates included.
pub struct ListedSource {
    pub name: &'static str,
    pub ids: Vec<String>,
}

impl ListedSource {
    pub fn new(name: &'static str, ids: &[&str]) -> Self {
        Self {
            name,
            ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl DiscoverySource for ListedSource {
    fn name(&self) -> &str {
        self.name
    }

    async fn discover(&self, _ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        Ok(self.ids.iter().map(|id| Hint::asset(id.as_str())).collect())
    }
}

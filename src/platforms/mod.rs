//! Exchange and chain integrations.
//!
//! Defines the collaborator traits the engine consumes and provides
//! implementations for:
//! - Polygon JSON-RPC: CTF `balanceOf`, block height, transfer logs
//! - Polygonscan: ERC-1155 transfer history
//! - Polymarket CLOB and Data API: prices, fills, positions
//! - Order relay: open orders and sell submission via an external signing service
//!
//! Each trait is small so that tests can stub exactly the calls a
//! component makes.

pub mod polygon;
pub mod polygonscan;
pub mod polymarket;
pub mod relay;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Fill, OpenOrder, OrderReceipt, PositionSize, PriceError, Side, TrackerError};

/// Authoritative share balance for a conditional token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Raw fixed-point balance. Throttling surfaces as
    /// `TrackerError::RateLimited`.
    async fn balance_of(&self, wallet: &str, asset_id: &str) -> Result<u128, TrackerError>;
}

/// Resting orders for an asset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OpenOrdersSource: Send + Sync {
    async fn open_orders(&self, asset_id: &str) -> Result<Vec<OpenOrder>>;
}

/// Current best price for an asset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// `PriceError::NotFound` means the order book no longer exists.
    async fn price(&self, asset_id: &str, side: Side) -> Result<Decimal, PriceError>;
}

/// Historical buy fills for a wallet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeHistorySource: Send + Sync {
    async fn buy_fills(&self, wallet: &str, asset_id: &str) -> Result<Vec<Fill>>;
}

/// Aggregated positions view for a wallet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionsSource: Send + Sync {
    async fn positions(&self, wallet: &str) -> Result<Vec<PositionSize>>;
}

/// Order submission.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit_sell(&self, asset_id: &str, price: Decimal, size: Decimal) -> Result<OrderReceipt>;

    /// Venue name for logging.
    fn name(&self) -> &str;
}

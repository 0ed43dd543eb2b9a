//! Sell executor.
//!
//! Wraps the order venue. In dry-run mode sells are logged and a
//! synthetic receipt is returned; nothing is submitted.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::platforms::OrderExecutor;
use crate::types::{short_id, OrderReceipt};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    venue: Option<Arc<dyn OrderExecutor>>,
    dry_run: bool,
}

impl Executor {
    pub fn new(venue: Option<Arc<dyn OrderExecutor>>, dry_run: bool) -> Self {
        Self { venue, dry_run }
    }

    pub fn dry_run() -> Self {
        Self::new(None, true)
    }

    /// Place a GTC sell for `size` shares at `price`.
    pub async fn sell(&self, asset_id: &str, price: Decimal, size: Decimal) -> Result<OrderReceipt> {
        if self.dry_run {
            info!(
                asset = %short_id(asset_id),
                size = %size,
                price = format!("${:.4}", price),
                value = format!("${:.2}", price * size),
                "[DRY RUN] Would place sell order"
            );
            return Ok(OrderReceipt::dry_run(asset_id, price, size));
        }

        let Some(venue) = self.venue.as_ref() else {
            warn!(asset = %short_id(asset_id), "No order venue configured");
            anyhow::bail!("No order venue configured for live execution");
        };

        info!(
            asset = %short_id(asset_id),
            size = %size,
            price = format!("${:.4}", price),
            venue = venue.name(),
            "Placing sell order"
        );
        venue
            .submit_sell(asset_id, price, size)
            .await
            .with_context(|| format!("Sell via {} failed", venue.name()))
    }
}

// ---------------------------------------------------------------------------
// OrderReceipt helpers
// ---------------------------------------------------------------------------

impl OrderReceipt {
    /// Create a dry-run receipt (no real execution).
    pub fn dry_run(asset_id: &str, price: Decimal, size: Decimal) -> Self {
        Self {
            order_id: format!("dry-run-{}", uuid::Uuid::new_v4()),
            status: "dry-run".to_string(),
            asset_id: asset_id.to_string(),
            price,
            size,
            dry_run: true,
            timestamp: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

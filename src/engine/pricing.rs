//! Entry price resolution for positions without a purchase record.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::platforms::TradeHistorySource;
use crate::types::{short_id, Fill, PurchaseSource};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    pub price: Decimal,
    pub source: PurchaseSource,
}

pub struct EntryPriceResolver {
    history: Arc<dyn TradeHistorySource>,
}

impl EntryPriceResolver {
    pub fn new(history: Arc<dyn TradeHistorySource>) -> Self {
        Self { history }
    }

    /// Weighted average of the wallet's buy fills, or `current_price`
    /// marked as assumed when no fill can be found.
    pub async fn resolve(&self, wallet: &str, asset_id: &str, current_price: Decimal) -> ResolvedEntry {
        match self.history.buy_fills(wallet, asset_id).await {
            Ok(fills) => {
                if let Some(price) = weighted_average(&fills) {
                    info!(asset = %short_id(asset_id), price = %price, fills = fills.len(), "Entry price from trade history");
                    return ResolvedEntry {
                        price,
                        source: PurchaseSource::Api,
                    };
                }
            }
            Err(e) => {
                warn!(asset = %short_id(asset_id), error = %e, "Trade history unavailable");
            }
        }

        warn!(
            asset = %short_id(asset_id),
            price = %current_price,
            "No buy fills found, assuming current price as entry"
        );
        ResolvedEntry {
            price: current_price,
            source: PurchaseSource::Assumed,
        }
    }
}

/// Shares-weighted average price over fills with positive size.
pub fn weighted_average(fills: &[Fill]) -> Option<Decimal> {
    let (cost, size) = fills
        .iter()
        .filter(|f| f.size > Decimal::ZERO)
        .fold((Decimal::ZERO, Decimal::ZERO), |(cost, size), f| {
            (cost + f.price * f.size, size + f.size)
        });
    (size > Decimal::ZERO).then(|| cost / size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::MockTradeHistorySource;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weighted_average() {
        let fills = vec![
            Fill { price: dec!(0.40), size: dec!(100) },
            Fill { price: dec!(0.50), size: dec!(100) },
            Fill { price: dec!(0.99), size: dec!(0) },
        ];
        assert_eq!(weighted_average(&fills), Some(dec!(0.45)));
        assert_eq!(weighted_average(&[]), None);
    }

    #[tokio::test]
    async fn test_resolve_from_fills() {
        let mut history = MockTradeHistorySource::new();
        history
            .expect_buy_fills()
            .returning(|_, _| Ok(vec![Fill { price: dec!(0.30), size: dec!(10) }]));
        let resolver = EntryPriceResolver::new(Arc::new(history));

        let entry = resolver.resolve("0xw", "A", dec!(0.55)).await;
        assert_eq!(entry, ResolvedEntry { price: dec!(0.30), source: PurchaseSource::Api });
    }

    #[tokio::test]
    async fn test_resolve_assumes_current_price() {
        let mut history = MockTradeHistorySource::new();
        history.expect_buy_fills().returning(|_, _| Ok(vec![]));
        let resolver = EntryPriceResolver::new(Arc::new(history));

        let entry = resolver.resolve("0xw", "A", dec!(0.55)).await;
        assert_eq!(entry.source, PurchaseSource::Assumed);
        assert_eq!(entry.price, dec!(0.55));
    }

    #[tokio::test]
    async fn test_resolve_history_error() {
        let mut history = MockTradeHistorySource::new();
        history
            .expect_buy_fills()
            .returning(|_, _| Err(anyhow::anyhow!("data api 502")));
        let resolver = EntryPriceResolver::new(Arc::new(history));

        assert_eq!(resolver.resolve("0xw", "A", dec!(0.2)).await.source, PurchaseSource::Assumed);
    }
}

//! Balance reconciliation.
//!
//! Turns candidate asset ids into sellable positions. The on-chain CTF
//! balance is authoritative; shares already committed to resting orders
//! are subtracted. When the chain read fails the positions API stands in,
//! and positions built from it are tagged `Fallback` so the cycle can
//! re-verify them before selling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::engine::backoff::{BackoffPolicy, Sleeper};
use crate::platforms::{BalanceSource, OpenOrdersSource, PositionsSource};
use crate::types::{short_id, BalanceProvenance, Position, TrackerError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Fixed-point decimals of the token contract.
    pub scale: u32,
    /// Balances at or below this many shares are dust.
    pub min_shares: Decimal,
    /// Flat delay after every chain read sequence.
    pub inter_call_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scale: 6,
            min_shares: dec!(0.0001),
            inter_call_delay: Duration::from_millis(150),
            backoff: BackoffPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOutcome {
    Available(Position),
    /// Every share is committed to resting orders.
    Locked { asset_id: String, shares: Decimal },
    Dust { asset_id: String, shares: Decimal },
    /// Neither the chain nor the fallback produced a balance.
    Unavailable { asset_id: String, reason: String },
}

impl BalanceOutcome {
    pub fn asset_id(&self) -> &str {
        match self {
            BalanceOutcome::Available(p) => &p.asset_id,
            BalanceOutcome::Locked { asset_id, .. }
            | BalanceOutcome::Dust { asset_id, .. }
            | BalanceOutcome::Unavailable { asset_id, .. } => asset_id,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub outcomes: Vec<BalanceOutcome>,
}

impl ReconcileReport {
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.outcomes.iter().filter_map(|o| match o {
            BalanceOutcome::Available(p) => Some(p),
            _ => None,
        })
    }

    pub fn locked(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, BalanceOutcome::Locked { .. })).count()
    }

    pub fn dust(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, BalanceOutcome::Dust { .. })).count()
    }

    pub fn unavailable(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BalanceOutcome::Unavailable { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct BalanceReconciler {
    balances: Arc<dyn BalanceSource>,
    orders: Arc<dyn OpenOrdersSource>,
    positions: Arc<dyn PositionsSource>,
    sleeper: Arc<dyn Sleeper>,
    config: ReconcilerConfig,
}

impl BalanceReconciler {
    pub fn new(
        balances: Arc<dyn BalanceSource>,
        orders: Arc<dyn OpenOrdersSource>,
        positions: Arc<dyn PositionsSource>,
        sleeper: Arc<dyn Sleeper>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            balances,
            orders,
            positions,
            sleeper,
            config,
        }
    }

    pub fn min_shares(&self) -> Decimal {
        self.config.min_shares
    }

    /// Reconcile every candidate. Ids must already exclude resolved markets.
    pub async fn reconcile(&self, wallet: &str, asset_ids: &[String]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut fallback: Option<HashMap<String, Decimal>> = None;

        for asset_id in asset_ids {
            let outcome = match self.chain_balance(wallet, asset_id).await {
                Ok(shares) => self.classify_chain(wallet, asset_id, shares).await,
                Err(e) => {
                    warn!(asset = %short_id(asset_id), error = %e, "Chain balance failed, trying positions API");
                    if fallback.is_none() {
                        fallback = Some(self.fetch_fallback(wallet).await);
                    }
                    let size = fallback.as_ref().and_then(|sizes| sizes.get(asset_id).copied());
                    self.classify_fallback(asset_id, size, &e)
                }
            };
            debug!(asset = %short_id(asset_id), outcome = ?outcome, "Balance reconciled");
            report.outcomes.push(outcome);
        }

        info!(
            candidates = asset_ids.len(),
            available = report.positions().count(),
            locked = report.locked(),
            dust = report.dust(),
            unavailable = report.unavailable(),
            "Balances reconciled"
        );
        report
    }

    /// One authoritative read for a position about to be sold. Returns the
    /// sellable share count.
    pub async fn reverify(&self, wallet: &str, asset_id: &str) -> Result<Decimal, TrackerError> {
        let shares = self.chain_balance(wallet, asset_id).await?;
        let locked = self.locked_shares(wallet, asset_id).await;
        Ok((shares - locked).max(Decimal::ZERO))
    }

    /// `balanceOf` under backoff, followed by the flat inter-call delay.
    async fn chain_balance(&self, wallet: &str, asset_id: &str) -> Result<Decimal, TrackerError> {
        let result = self
            .config
            .backoff
            .retry(self.sleeper.clone(), "balance_of", || self.balances.balance_of(wallet, asset_id))
            .await;
        self.sleeper.sleep(self.config.inter_call_delay).await;

        let units = result?;
        units_to_shares(units, self.config.scale)
    }

    async fn locked_shares(&self, wallet: &str, asset_id: &str) -> Decimal {
        match self.orders.open_orders(asset_id).await {
            Ok(orders) => orders
                .iter()
                .filter(|o| o.owner.eq_ignore_ascii_case(wallet))
                .map(|o| o.size_matched)
                .sum(),
            Err(e) => {
                debug!(asset = %short_id(asset_id), error = %e, "Open orders unavailable, assuming none locked");
                Decimal::ZERO
            }
        }
    }

    async fn classify_chain(&self, wallet: &str, asset_id: &str, shares: Decimal) -> BalanceOutcome {
        if shares <= self.config.min_shares {
            return BalanceOutcome::Dust {
                asset_id: asset_id.to_string(),
                shares,
            };
        }

        let locked = self.locked_shares(wallet, asset_id).await;
        let available = shares - locked;
        if available <= Decimal::ZERO {
            info!(asset = %short_id(asset_id), shares = %shares, locked = %locked, "All shares locked in orders");
            return BalanceOutcome::Locked {
                asset_id: asset_id.to_string(),
                shares,
            };
        }
        if available <= self.config.min_shares {
            return BalanceOutcome::Dust {
                asset_id: asset_id.to_string(),
                shares: available,
            };
        }

        BalanceOutcome::Available(Position {
            asset_id: asset_id.to_string(),
            shares: available,
            provenance: BalanceProvenance::Chain,
        })
    }

    fn classify_fallback(&self, asset_id: &str, size: Option<Decimal>, cause: &TrackerError) -> BalanceOutcome {
        match size {
            Some(shares) if shares > self.config.min_shares => BalanceOutcome::Available(Position {
                asset_id: asset_id.to_string(),
                shares,
                provenance: BalanceProvenance::Fallback,
            }),
            Some(shares) => BalanceOutcome::Dust {
                asset_id: asset_id.to_string(),
                shares,
            },
            None => BalanceOutcome::Unavailable {
                asset_id: asset_id.to_string(),
                reason: cause.to_string(),
            },
        }
    }

    async fn fetch_fallback(&self, wallet: &str) -> HashMap<String, Decimal> {
        match self.positions.positions(wallet).await {
            Ok(list) => list.into_iter().map(|p| (p.asset_id, p.size)).collect(),
            Err(e) => {
                warn!(error = %e, "Positions API fallback failed");
                HashMap::new()
            }
        }
    }
}

/// Raw fixed-point units to shares.
pub fn units_to_shares(units: u128, scale: u32) -> Result<Decimal, TrackerError> {
    let signed = i128::try_from(units).map_err(|_| TrackerError::Parse(format!("balance {units} out of range")))?;
    Decimal::try_from_i128_with_scale(signed, scale)
        .map(|d| d.normalize())
        .map_err(|e| TrackerError::Parse(format!("balance {units} out of range: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

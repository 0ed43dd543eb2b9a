//! Reconciliation cycle.
//!
//! One pass over the wallet:
//! discover → drop resolved → reconcile balances → price → dust filter →
//! entry price → evaluate → sell → record.
//!
//! Assets are processed one at a time. Anything that goes wrong with one
//! asset is logged and recorded in its outcome; the rest of the cycle
//! carries on.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::discovery::{backfill, DiscoveryContext, TokenDiscovery};
use crate::engine::executor::Executor;
use crate::engine::pricing::EntryPriceResolver;
use crate::engine::reconciler::{BalanceOutcome, BalanceReconciler};
use crate::platforms::PriceSource;
use crate::storage::LedgerStore;
use crate::strategy::{is_dust_value, Action, Evaluation, ExitStrategy};
use crate::types::{
    short_id, BalanceProvenance, ExtraFields, Position, PriceError, PurchaseRecord, PurchaseSource,
    SaleRecord, Side,
};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Balance at or below the minimum sellable size.
    Dust,
    /// All shares committed to resting orders.
    Locked,
    /// No balance from chain or fallback.
    BalanceUnavailable,
    /// Price query failed transiently.
    PriceUnavailable,
    /// Position value below the configured floor.
    DustValue,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Dust => "dust balance",
            SkipReason::Locked => "locked in orders",
            SkipReason::BalanceUnavailable => "balance unavailable",
            SkipReason::PriceUnavailable => "price unavailable",
            SkipReason::DustValue => "value below floor",
        };
        f.write_str(s)
    }
}

/// Terminal state of one asset within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetOutcome {
    Skipped { asset_id: String, reason: SkipReason },
    /// Order book gone; moved to the resolved set this cycle.
    Resolved { asset_id: String },
    Held { asset_id: String, evaluation: Evaluation },
    Sold { sale: SaleRecord },
    /// Sell decided but only logged.
    DryRun { asset_id: String, evaluation: Evaluation },
    SellFailed { asset_id: String, error: String },
    /// Ledger write or other unexpected failure.
    Errored { asset_id: String, error: String },
}

impl AssetOutcome {
    pub fn asset_id(&self) -> &str {
        match self {
            AssetOutcome::Sold { sale } => &sale.asset_id,
            AssetOutcome::Skipped { asset_id, .. }
            | AssetOutcome::Resolved { asset_id }
            | AssetOutcome::Held { asset_id, .. }
            | AssetOutcome::DryRun { asset_id, .. }
            | AssetOutcome::SellFailed { asset_id, .. }
            | AssetOutcome::Errored { asset_id, .. } => asset_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub discovered: usize,
    /// Discovered ids filtered out because they were already resolved.
    pub resolved_skipped: usize,
    /// Assets with an available balance.
    pub positions: usize,
    pub outcomes: Vec<AssetOutcome>,
    /// Realised P&L of this cycle's sales.
    pub session_pnl: Decimal,
    /// Unrealised P&L across held positions.
    pub unrealised_pnl: Decimal,
    pub total_profit: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&AssetOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    pub fn sold(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Sold { .. }))
    }

    pub fn held(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Held { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::SellFailed { .. } | AssetOutcome::Errored { .. }))
    }

    pub fn dry_runs(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::DryRun { .. }))
    }

    pub fn newly_resolved(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Resolved { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Skipped { .. }))
    }

    pub fn outcome(&self, asset_id: &str) -> Option<&AssetOutcome> {
        self.outcomes.iter().find(|o| o.asset_id() == asset_id)
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct ReconciliationLoop {
    wallet: String,
    store: LedgerStore,
    discovery: TokenDiscovery,
    reconciler: BalanceReconciler,
    prices: Arc<dyn PriceSource>,
    resolver: EntryPriceResolver,
    strategy: ExitStrategy,
    executor: Executor,
    min_position_value: Decimal,
    cycle_count: u64,
}

impl ReconciliationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet: impl Into<String>,
        store: LedgerStore,
        discovery: TokenDiscovery,
        reconciler: BalanceReconciler,
        prices: Arc<dyn PriceSource>,
        resolver: EntryPriceResolver,
        strategy: ExitStrategy,
        executor: Executor,
        min_position_value: Decimal,
    ) -> Self {
        Self {
            wallet: wallet.into(),
            store,
            discovery,
            reconciler,
            prices,
            resolver,
            strategy,
            executor,
            min_position_value,
            cycle_count: 0,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Run one full cycle. Per-asset failures never abort the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle_count += 1;
        info!(cycle = self.cycle_count, "Scanning positions");

        let discovered = {
            let ctx = DiscoveryContext {
                wallet: &self.wallet,
                ledger: self.store.ledger(),
            };
            self.discovery.discover(&ctx).await
        };
        if let Err(e) = backfill(&mut self.store, &discovered) {
            warn!(error = %e, "Backfill from discovery hints failed");
        }

        let (candidates, resolved): (Vec<String>, Vec<String>) = discovered
            .asset_ids
            .iter()
            .cloned()
            .partition(|id| !self.store.is_resolved(id));

        let balances = self.reconciler.reconcile(&self.wallet, &candidates).await;

        let mut report = CycleReport {
            cycle_number: self.cycle_count,
            discovered: discovered.asset_ids.len(),
            resolved_skipped: resolved.len(),
            positions: balances.positions().count(),
            outcomes: Vec::with_capacity(balances.outcomes.len()),
            session_pnl: Decimal::ZERO,
            unrealised_pnl: Decimal::ZERO,
            total_profit: Decimal::ZERO,
            timestamp: Utc::now(),
        };

        for outcome in balances.outcomes {
            let asset_outcome = match outcome {
                BalanceOutcome::Available(position) => self.process_position(&position).await,
                BalanceOutcome::Dust { asset_id, .. } => AssetOutcome::Skipped {
                    asset_id,
                    reason: SkipReason::Dust,
                },
                BalanceOutcome::Locked { asset_id, .. } => AssetOutcome::Skipped {
                    asset_id,
                    reason: SkipReason::Locked,
                },
                BalanceOutcome::Unavailable { asset_id, .. } => AssetOutcome::Skipped {
                    asset_id,
                    reason: SkipReason::BalanceUnavailable,
                },
            };

            match &asset_outcome {
                AssetOutcome::Sold { sale } => report.session_pnl += sale.pnl,
                AssetOutcome::Held { evaluation, .. } => report.unrealised_pnl += evaluation.pnl,
                _ => {}
            }
            report.outcomes.push(asset_outcome);
        }

        report.total_profit = self.store.total_profit();
        log_report(&report);
        report
    }

    async fn process_position(&mut self, position: &Position) -> AssetOutcome {
        let asset_id = position.asset_id.as_str();
        info!(position = %position, "Evaluating position");

        let price = match self.prices.price(asset_id, Side::Buy).await {
            Ok(price) => price,
            Err(PriceError::NotFound(_)) => {
                return match self.store.mark_resolved(asset_id) {
                    Ok(()) => AssetOutcome::Resolved {
                        asset_id: asset_id.to_string(),
                    },
                    Err(e) => errored(asset_id, e),
                };
            }
            Err(e @ PriceError::Transient(_)) => {
                warn!(asset = %short_id(asset_id), error = %e, "Price unavailable, skipping this cycle");
                return AssetOutcome::Skipped {
                    asset_id: asset_id.to_string(),
                    reason: SkipReason::PriceUnavailable,
                };
            }
        };

        if is_dust_value(price, position.shares, self.min_position_value) {
            info!(
                asset = %short_id(asset_id),
                value = format!("${:.2}", price * position.shares),
                "Position below minimum value, skipping"
            );
            return AssetOutcome::Skipped {
                asset_id: asset_id.to_string(),
                reason: SkipReason::DustValue,
            };
        }

        let entry = match self.store.purchase(asset_id) {
            Some(record) => record.buy_price,
            None => {
                let resolved = self.resolver.resolve(&self.wallet, asset_id, price).await;
                let record = PurchaseRecord::new(resolved.price, position.shares, resolved.source);
                if let Err(e) = self.store.record_purchase(asset_id, record) {
                    return errored(asset_id, e);
                }
                if resolved.source == PurchaseSource::Assumed {
                    // Assumed entry equals the current price; nothing to decide yet.
                    return AssetOutcome::Held {
                        asset_id: asset_id.to_string(),
                        evaluation: Evaluation::hold(),
                    };
                }
                resolved.price
            }
        };

        let evaluation = self.strategy.evaluate(entry, price, position.shares);
        info!(
            asset = %short_id(asset_id),
            entry = %entry,
            price = %price,
            pnl = format!("{:+.2}", evaluation.pnl),
            pnl_pct = format!("{:+.1}%", evaluation.pnl_pct),
            reason = %evaluation.reason,
            "Position evaluated"
        );
        if evaluation.action == Action::Hold {
            return AssetOutcome::Held {
                asset_id: asset_id.to_string(),
                evaluation,
            };
        }

        let shares = match position.provenance {
            BalanceProvenance::Chain => position.shares,
            BalanceProvenance::Fallback => match self.reconciler.reverify(&self.wallet, asset_id).await {
                Ok(shares) if shares > self.reconciler.min_shares() => shares,
                Ok(shares) => {
                    warn!(asset = %short_id(asset_id), shares = %shares, "Re-verified balance is dust, holding");
                    return AssetOutcome::Held {
                        asset_id: asset_id.to_string(),
                        evaluation,
                    };
                }
                Err(e) => {
                    warn!(asset = %short_id(asset_id), error = %e, "Could not re-verify fallback balance, holding");
                    return AssetOutcome::Held {
                        asset_id: asset_id.to_string(),
                        evaluation,
                    };
                }
            },
        };
        let evaluation = if shares == position.shares {
            evaluation
        } else {
            self.strategy.evaluate(entry, price, shares)
        };

        self.sell(asset_id, entry, price, shares, evaluation).await
    }

    async fn sell(
        &mut self,
        asset_id: &str,
        entry: Decimal,
        price: Decimal,
        shares: Decimal,
        evaluation: Evaluation,
    ) -> AssetOutcome {
        let receipt = match self.executor.sell(asset_id, price, shares).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(asset = %short_id(asset_id), error = format!("{e:#}"), "Sell failed");
                return AssetOutcome::SellFailed {
                    asset_id: asset_id.to_string(),
                    error: format!("{e:#}"),
                };
            }
        };

        if receipt.dry_run {
            return AssetOutcome::DryRun {
                asset_id: asset_id.to_string(),
                evaluation,
            };
        }

        let sale = SaleRecord {
            asset_id: asset_id.to_string(),
            buy_price: entry,
            sell_price: price,
            shares,
            pnl: evaluation.pnl,
            pnl_pct: evaluation.pnl_pct,
            timestamp: receipt.timestamp,
            order_id: Some(receipt.order_id),
            extra: ExtraFields::new(),
        };
        match self.store.record_sale(sale.clone()) {
            Ok(()) => AssetOutcome::Sold { sale },
            Err(e) => errored(asset_id, e),
        }
    }
}

fn errored(asset_id: &str, e: anyhow::Error) -> AssetOutcome {
    error!(asset = %short_id(asset_id), error = format!("{e:#}"), "Ledger update failed");
    AssetOutcome::Errored {
        asset_id: asset_id.to_string(),
        error: format!("{e:#}"),
    }
}

fn log_report(report: &CycleReport) {
    info!(
        cycle = report.cycle_number,
        discovered = report.discovered,
        resolved_skipped = report.resolved_skipped,
        positions = report.positions,
        sold = report.sold(),
        held = report.held(),
        failed = report.failed(),
        dry_run = report.dry_runs(),
        newly_resolved = report.newly_resolved(),
        skipped = report.skipped(),
        session_pnl = format!("${:+.2}", report.session_pnl),
        unrealised = format!("${:+.2}", report.unrealised_pnl),
        total_profit = format!("${:+.2}", report.total_profit),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

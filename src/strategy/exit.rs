//! Exit rules.
//!
//! Decides whether to liquidate a position from its entry price, the
//! current price and its size. Pure and deterministic: no I/O, no clock.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Take-profit trigger. One kind per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TakeProfit {
    /// Sell once the market price reaches this absolute level.
    Price(Decimal),
    /// Sell once unrealised P&L reaches this percentage.
    Percent(Decimal),
}

impl fmt::Display for TakeProfit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeProfit::Price(p) => write!(f, "price >= ${p}"),
            TakeProfit::Percent(x) => write!(f, "pnl >= {x}%"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitConfig {
    pub take_profit: TakeProfit,
    /// Negative percentage, e.g. -10.
    pub stop_loss_pct: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit: TakeProfit::Price(dec!(0.90)),
            stop_loss_pct: dec!(-10),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hold,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Hold,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::Hold => write!(f, "hold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub action: Action,
    pub reason: ExitReason,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
}

impl Evaluation {
    /// Flat hold: no P&L, no trigger.
    pub fn hold() -> Self {
        Self {
            action: Action::Hold,
            reason: ExitReason::Hold,
            pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
        }
    }
}

pub struct ExitStrategy {
    config: ExitConfig,
}

impl ExitStrategy {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Take-profit is checked first, so it wins if both rules fire.
    /// P&L outside the `Decimal` range yields a hold.
    pub fn evaluate(&self, entry: Decimal, current: Decimal, shares: Decimal) -> Evaluation {
        let diff = current.checked_sub(entry);
        let pnl = diff.and_then(|d| d.checked_mul(shares));
        let pnl_pct = if entry.is_zero() {
            Some(Decimal::ZERO)
        } else {
            diff.and_then(|d| d.checked_div(entry))
                .and_then(|r| r.checked_mul(dec!(100)))
        };
        let (Some(pnl), Some(pnl_pct)) = (pnl, pnl_pct) else {
            warn!(entry = %entry, current = %current, shares = %shares, "P&L out of range, holding");
            return Evaluation::hold();
        };

        let take_profit = match self.config.take_profit {
            TakeProfit::Price(target) => current >= target,
            TakeProfit::Percent(target) => pnl_pct >= target,
        };

        let (action, reason) = if take_profit {
            (Action::Sell, ExitReason::TakeProfit)
        } else if pnl_pct <= self.config.stop_loss_pct {
            (Action::Sell, ExitReason::StopLoss)
        } else {
            (Action::Hold, ExitReason::Hold)
        };

        Evaluation {
            action,
            reason,
            pnl,
            pnl_pct,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

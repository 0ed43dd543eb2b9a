//! Strategy layer: exit rules and position-size filters.

pub mod exit;

use rust_decimal::Decimal;

pub use exit::{Action, Evaluation, ExitConfig, ExitReason, ExitStrategy, TakeProfit};

/// A position worth less than `min_value` at `price` is not worth acting on.
pub fn is_dust_value(price: Decimal, shares: Decimal, min_value: Decimal) -> bool {
    price * shares < min_value
}

//! Shared types for the HARVEST engine.
//!
//! These types form the data model used across all modules: ledger
//! records, discovery hints, collaborator payloads and the error taxonomy.
//! They are kept free of I/O so that storage, platform and engine modules
//! can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unknown JSON fields carried through a load/save cycle untouched.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Truncate an asset id for log output. Token ids are 77-digit integers.
pub fn short_id(asset_id: &str) -> &str {
    match asset_id.char_indices().nth(20) {
        Some((idx, _)) => &asset_id[..idx],
        None => asset_id,
    }
}

/// Read a decimal from a JSON number or numeric string. APIs in this space
/// mix both freely ("0.55" vs 0.55).
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    use rust_decimal::prelude::FromPrimitive;
    use std::str::FromStr;

    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
        }
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Decimal::from(i)),
            None => n.as_f64().and_then(Decimal::from_f64),
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a purchase record's entry price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseSource {
    /// Shares-weighted average of confirmed buy fills.
    Api,
    /// No verifiable fills; current market price recorded as entry.
    Assumed,
    /// Opportunistically taken from a discovery hint. Records written
    /// before the field existed load as this variant.
    #[default]
    Backfilled,
}

impl fmt::Display for PurchaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseSource::Api => write!(f, "api"),
            PurchaseSource::Assumed => write!(f, "assumed"),
            PurchaseSource::Backfilled => write!(f, "backfilled"),
        }
    }
}

/// Which source produced a position's share count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceProvenance {
    /// On-chain `balanceOf` minus shares locked in open orders.
    Chain,
    /// Positions API approximation, used after the chain read failed.
    Fallback,
}

impl fmt::Display for BalanceProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceProvenance::Chain => write!(f, "chain"),
            BalanceProvenance::Fallback => write!(f, "fallback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Cost basis for an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub buy_price: Decimal,
    pub shares: Decimal,
    #[serde(with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: PurchaseSource,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl PurchaseRecord {
    pub fn new(buy_price: Decimal, shares: Decimal, source: PurchaseSource) -> Self {
        Self {
            buy_price,
            shares,
            timestamp: Utc::now(),
            source,
            extra: ExtraFields::new(),
        }
    }
}

impl fmt::Display for PurchaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} shares @ ${:.4} ({}, {})",
            self.shares,
            self.buy_price,
            self.source,
            self.timestamp.format("%Y-%m-%d %H:%M"),
        )
    }
}

/// An executed liquidation. Immutable once appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    #[serde(rename = "token_id")]
    pub asset_id: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub shares: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    #[serde(with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl fmt::Display for SaleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{}… {} shares ${:.4} -> ${:.4} ({sign}{:.2} / {sign}{:.1}%)",
            short_id(&self.asset_id),
            self.shares,
            self.buy_price,
            self.sell_price,
            self.pnl,
            self.pnl_pct,
        )
    }
}

// ---------------------------------------------------------------------------
// Positions and collaborator payloads
// ---------------------------------------------------------------------------

/// A sellable holding, recomputed every cycle and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub asset_id: String,
    pub shares: Decimal,
    pub provenance: BalanceProvenance,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}… {} shares [{}]",
            short_id(&self.asset_id),
            self.shares,
            self.provenance,
        )
    }
}

/// An existence hint from a discovery source, optionally with entry data.
#[derive(Debug, Clone, PartialEq)]
pub struct Hint {
    pub asset_id: String,
    pub price: Option<Decimal>,
    pub shares: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Hint {
    /// A bare existence hint.
    pub fn asset(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            price: None,
            shares: None,
            timestamp: None,
        }
    }

    /// Whether the hint carries enough data to backfill a purchase record.
    pub fn has_entry(&self) -> bool {
        matches!((self.price, self.shares), (Some(p), Some(s)) if p > Decimal::ZERO && s > Decimal::ZERO)
    }
}

/// One of this market's resting orders, as reported by the CLOB.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub owner: String,
    pub size_matched: Decimal,
}

/// A historical buy fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub price: Decimal,
    pub size: Decimal,
}

/// A position as reported by the aggregated positions API.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSize {
    pub asset_id: String,
    pub size: Decimal,
}

/// Receipt returned after a sell order is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub status: String,
    pub asset_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for OrderReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELL {}… {} @ ${:.4} [{} {}]",
            short_id(&self.asset_id),
            self.size,
            self.price,
            self.order_id,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for HARVEST.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl TrackerError {
    /// Whether a retry under backoff may succeed.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TrackerError::RateLimited(_))
    }

    /// Classify a JSON-RPC or HTTP error message. Polygon nodes report
    /// throttling as code -32090 / -32005 or with a free-text message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("-32090")
            || lower.contains("-32005")
        {
            TrackerError::RateLimited(message)
        } else {
            TrackerError::Network(message)
        }
    }
}

/// Outcome of a failed price query.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PriceError {
    /// No order book for the asset: the market has resolved.
    #[error("No order book for {0}")]
    NotFound(String),

    /// Anything else; the asset is retried next cycle.
    #[error("Price unavailable: {0}")]
    Transient(String),
}

// ---------------------------------------------------------------------------
// Timestamp serde
// ---------------------------------------------------------------------------

/// RFC 3339 timestamps on write; on read also accepts the naive
/// `YYYY-MM-DDTHH:MM:SS[.ffffff]` form older ledgers contain (taken as UTC).
pub mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_short_id_truncates() {
        let id = "71321045679252212594626385532706912750332728571942532289631379312455583992563";
        assert_eq!(short_id(id), "71321045679252212594");
        assert_eq!(short_id("123"), "123");
    }

    #[test]
    fn test_decimal_from_json() {
        use serde_json::json;
        assert_eq!(decimal_from_json(&json!("0.55")), Some(dec!(0.55)));
        assert_eq!(decimal_from_json(&json!(12)), Some(dec!(12)));
        assert_eq!(decimal_from_json(&json!("1e-4")), Some(dec!(0.0001)));
        assert!(decimal_from_json(&json!(0.25)).is_some());
        assert!(decimal_from_json(&json!(null)).is_none());
        assert!(decimal_from_json(&json!("abc")).is_none());
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Sell.as_str(), "SELL");
    }

    #[test]
    fn test_purchase_source_defaults_to_backfilled() {
        let json = r#"{"buy_price": 0.42, "shares": 10.0, "timestamp": "2025-03-01T10:15:30.123456"}"#;
        let record: PurchaseRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source, PurchaseSource::Backfilled);
        assert_eq!(record.buy_price, dec!(0.42));
    }

    #[test]
    fn test_purchase_source_serializes_lowercase() {
        let record = PurchaseRecord::new(dec!(0.5), dec!(2), PurchaseSource::Assumed);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["source"], "assumed");
    }

    #[test]
    fn test_purchase_record_preserves_unknown_fields() {
        let json = r#"{"buy_price": 0.3, "shares": 5, "timestamp": "2025-03-01T10:15:30Z", "source": "api", "market": "Will it rain?"}"#;
        let record: PurchaseRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra.get("market").and_then(|v| v.as_str()), Some("Will it rain?"));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["market"], "Will it rain?");
    }

    #[test]
    fn test_sale_record_uses_token_id_key() {
        let sale = SaleRecord {
            asset_id: "123".into(),
            buy_price: dec!(0.4),
            sell_price: dec!(0.95),
            shares: dec!(100),
            pnl: dec!(55),
            pnl_pct: dec!(137.5),
            timestamp: Utc::now(),
            order_id: None,
            extra: ExtraFields::new(),
        };
        let value = serde_json::to_value(&sale).unwrap();
        assert_eq!(value["token_id"], "123");
        assert!(value.get("order_id").is_none());
    }

    #[test]
    fn test_iso_timestamp_accepts_legacy_forms() {
        assert!(iso_timestamp::parse("2025-01-10T12:34:56.123456").is_some());
        assert!(iso_timestamp::parse("2025-01-10T12:34:56").is_some());
        assert!(iso_timestamp::parse("2025-01-10T12:34:56+00:00").is_some());
        assert!(iso_timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_hint_has_entry() {
        let mut hint = Hint::asset("1");
        assert!(!hint.has_entry());
        hint.price = Some(dec!(0.3));
        hint.shares = Some(dec!(10));
        assert!(hint.has_entry());
        hint.price = Some(Decimal::ZERO);
        assert!(!hint.has_entry());
    }

    #[test]
    fn test_classify_rate_limit_messages() {
        assert!(TrackerError::classify("{'code': -32090, 'message': 'Too many requests'}").is_rate_limited());
        assert!(TrackerError::classify("daily Rate Limit reached").is_rate_limited());
        assert!(!TrackerError::classify("connection reset by peer").is_rate_limited());
    }

    #[test]
    fn test_error_display() {
        let e = TrackerError::Http { status: 503, message: "unavailable".into() };
        assert_eq!(e.to_string(), "HTTP error 503: unavailable");
        let p = PriceError::NotFound("42".into());
        assert_eq!(p.to_string(), "No order book for 42");
    }

    #[test]
    fn test_sale_display_sign() {
        let sale = SaleRecord {
            asset_id: "9".into(),
            buy_price: dec!(0.5),
            sell_price: dec!(0.43),
            shares: dec!(50),
            pnl: dec!(-3.5),
            pnl_pct: dec!(-14),
            timestamp: Utc::now(),
            order_id: Some("abc".into()),
            extra: ExtraFields::new(),
        };
        let display = sale.to_string();
        assert!(display.contains("-3.50"));
        assert!(!display.contains("+"));
    }
}

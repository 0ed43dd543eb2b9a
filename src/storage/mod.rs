//! Persistence layer.
//!
//! The ledger records purchases, sales, cumulative profit and the set of
//! resolved markets. `LedgerStore` is the only way to mutate it: every
//! mutating method changes the in-memory ledger and flushes it through
//! the injected `LedgerBackend` before returning, so a crash between two
//! calls never loses a completed sale.
//!
//! The JSON backend writes to `<path>.tmp` and renames over the target,
//! which keeps the previous file intact if the process dies mid-write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::types::{short_id, ExtraFields, PurchaseRecord, PurchaseSource, SaleRecord, TrackerError};

/// Default ledger file path.
pub const DEFAULT_LEDGER_FILE: &str = "profit_taking_trades.json";

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Persisted aggregate of all trading activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub purchases: BTreeMap<String, PurchaseRecord>,
    #[serde(default)]
    pub sales: Vec<SaleRecord>,
    #[serde(default)]
    pub total_profit: Decimal,
    #[serde(default)]
    pub resolved_markets: Vec<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Ledger {
    /// Sum of realised P&L across the sale log.
    pub fn realised_pnl(&self) -> Decimal {
        self.sales.iter().map(|s| s.pnl).sum()
    }

    pub fn is_resolved(&self, asset_id: &str) -> bool {
        self.resolved_markets.iter().any(|r| r == asset_id)
    }

    /// Timestamp of the most recent sale of this asset, if any.
    pub fn last_sale_at(&self, asset_id: &str) -> Option<DateTime<Utc>> {
        self.sales
            .iter()
            .filter(|s| s.asset_id == asset_id)
            .map(|s| s.timestamp)
            .max()
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Durable storage for the ledger.
pub trait LedgerBackend: Send + Sync {
    /// Load the ledger, or `None` if nothing has been persisted yet.
    fn load(&self) -> Result<Option<Ledger>>;

    /// Persist the full ledger. Must be atomic with respect to crashes.
    fn save(&self, ledger: &Ledger) -> Result<()>;
}

/// JSON file backend with write-temp-then-rename.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl LedgerBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<Ledger>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No ledger found, starting fresh");
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read ledger from {}", self.path.display()))?;

        let ledger: Ledger = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse ledger from {}", self.path.display()))?;

        Ok(Some(ledger))
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        let json = serde_json::to_string_pretty(ledger).context("Failed to serialise ledger")?;
        let tmp = self.tmp_path();

        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write ledger to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move ledger into {}", self.path.display()))?;

        debug!(path = %self.path.display(), "Ledger flushed");
        Ok(())
    }
}

/// In-memory backend. Clones share the same slot, so tests can inspect
/// what was flushed and count writes.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    slot: Arc<Mutex<Option<Ledger>>>,
    writes: Arc<Mutex<u64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: Ledger) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(ledger))),
            writes: Arc::new(Mutex::new(0)),
        }
    }

    /// Last flushed ledger.
    pub fn snapshot(&self) -> Option<Ledger> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    /// Number of flushes performed.
    pub fn writes(&self) -> u64 {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl LedgerBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Ledger>> {
        Ok(self.snapshot())
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("memory ledger poisoned"))?;
        *slot = Some(ledger.clone());
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owns the ledger and its backend.
pub struct LedgerStore {
    ledger: Ledger,
    backend: Box<dyn LedgerBackend>,
}

impl LedgerStore {
    /// Load the ledger from the backend (or start empty) and repair a
    /// `total_profit` that has drifted from the sale log, as well as
    /// purchase records left behind for resolved markets.
    pub fn open(backend: Box<dyn LedgerBackend>) -> Result<Self> {
        let ledger = backend.load()?.unwrap_or_default();
        let mut store = Self { ledger, backend };
        let mut repaired = false;

        if let Err(e) = store.verify() {
            error!(error = %e, "Ledger total drifted from sale log, recomputing");
            store.ledger.total_profit = store.ledger.realised_pnl();
            repaired = true;
        }

        let stale: Vec<String> = store
            .ledger
            .purchases
            .keys()
            .filter(|id| store.ledger.is_resolved(id))
            .cloned()
            .collect();
        for asset_id in &stale {
            store.ledger.purchases.remove(asset_id);
            warn!(asset = %short_id(asset_id), "Dropping purchase record of resolved market");
        }
        repaired |= !stale.is_empty();

        if repaired {
            store.flush()?;
        }

        info!(
            purchases = store.ledger.purchases.len(),
            sales = store.ledger.sales.len(),
            resolved = store.ledger.resolved_markets.len(),
            total_profit = %store.ledger.total_profit,
            "Ledger loaded"
        );
        Ok(store)
    }

    /// Convenience constructor for the JSON file backend.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Box::new(JsonFileBackend::new(path)))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn purchase(&self, asset_id: &str) -> Option<&PurchaseRecord> {
        self.ledger.purchases.get(asset_id)
    }

    pub fn is_resolved(&self, asset_id: &str) -> bool {
        self.ledger.is_resolved(asset_id)
    }

    pub fn total_profit(&self) -> Decimal {
        self.ledger.total_profit
    }

    /// Check that `total_profit` equals the sum of sale P&L.
    pub fn verify(&self) -> Result<(), TrackerError> {
        let realised = self.ledger.realised_pnl();
        if realised != self.ledger.total_profit {
            return Err(TrackerError::Ledger(format!(
                "total_profit {} != sum of sales {}",
                self.ledger.total_profit, realised
            )));
        }
        Ok(())
    }

    /// Create or replace the purchase record for an asset.
    pub fn record_purchase(&mut self, asset_id: &str, record: PurchaseRecord) -> Result<()> {
        if self.ledger.is_resolved(asset_id) {
            return Err(TrackerError::Ledger(format!(
                "{asset_id} is resolved; refusing purchase record"
            ))
            .into());
        }

        info!(
            asset = %short_id(asset_id),
            price = %record.buy_price,
            shares = %record.shares,
            source = %record.source,
            "Purchase recorded"
        );
        self.ledger.purchases.insert(asset_id.to_string(), record);
        self.flush()
    }

    /// Append a sale, consume the purchase record and add to total profit.
    ///
    /// Fails without mutating anything if the asset has no purchase record.
    pub fn record_sale(&mut self, sale: SaleRecord) -> Result<()> {
        if !self.ledger.purchases.contains_key(&sale.asset_id) {
            return Err(TrackerError::Ledger(format!(
                "no purchase record for {}; refusing sale",
                sale.asset_id
            ))
            .into());
        }

        self.ledger.purchases.remove(&sale.asset_id);
        self.ledger.total_profit += sale.pnl;
        info!(
            sale = %sale,
            total_profit = %self.ledger.total_profit,
            "Sale recorded"
        );
        self.ledger.sales.push(sale);
        self.flush()
    }

    /// Move an asset to the terminal resolved set. Idempotent.
    pub fn mark_resolved(&mut self, asset_id: &str) -> Result<()> {
        let had_purchase = self.ledger.purchases.remove(asset_id).is_some();
        let newly_resolved = !self.ledger.is_resolved(asset_id);
        if newly_resolved {
            self.ledger.resolved_markets.push(asset_id.to_string());
        }
        if !had_purchase && !newly_resolved {
            return Ok(());
        }

        info!(
            asset = %short_id(asset_id),
            dropped_purchase = had_purchase,
            "Market resolved, will skip in future scans"
        );
        self.flush()
    }

    /// Drop every `assumed` purchase record so the entry price is resolved
    /// again on the next encounter. Returns the number removed.
    pub fn purge_assumed(&mut self) -> Result<usize> {
        let before = self.ledger.purchases.len();
        self.ledger
            .purchases
            .retain(|_, record| record.source != PurchaseSource::Assumed);
        let removed = before - self.ledger.purchases.len();

        if removed > 0 {
            warn!(removed, "Purged assumed entry prices");
            self.flush()?;
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        self.backend.save(&self.ledger)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

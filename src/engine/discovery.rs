//! Token discovery.
//!
//! No single upstream reliably lists every position a wallet holds, so
//! discovery asks several sources and merges the answers:
//!
//! 1. The ledger's own purchase records
//! 2. The acquisition bot's JSONL trade log
//! 3. Polygonscan ERC-1155 transfer history
//! 4. The Data API positions view
//! 5. A scan of recent `TransferSingle` logs on chain
//! 6. A grep of the acquisition bot's text log (last resort)
//!
//! Sources only supply candidate ids and, where they can, entry hints.
//! Whether a position really exists is decided later by the reconciler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::platforms::polygon::PolygonRpcClient;
use crate::platforms::polygonscan::PolygonscanClient;
use crate::platforms::PositionsSource;
use crate::storage::{Ledger, LedgerStore};
use crate::types::{decimal_from_json, iso_timestamp, short_id, Hint, PurchaseRecord, PurchaseSource};

/// Default companion bot trade log.
pub const DEFAULT_BUY_LOG: &str = "trades_log.json";
/// Default companion bot text log for the last-resort grep.
pub const DEFAULT_TEXT_LOG: &str = "autonomous_bot.log";

const DEFAULT_GREP_LINES: usize = 1000;
const DEFAULT_SCAN_DEPTH: u64 = 500;

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// What a source may look at.
pub struct DiscoveryContext<'a> {
    pub wallet: &'a str,
    pub ledger: &'a Ledger,
}

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    /// Last-resort sources run only when every other source came back empty.
    fn last_resort(&self) -> bool {
        false
    }

    async fn discover(&self, ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>>;
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Assets with an open purchase record.
pub struct LedgerSource;

#[async_trait]
impl DiscoverySource for LedgerSource {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn discover(&self, ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        Ok(ctx.ledger.purchases.keys().map(Hint::asset).collect())
    }
}

/// The acquisition bot's line-oriented JSON trade log.
pub struct BuyBotLogSource {
    path: PathBuf,
}

impl BuyBotLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DiscoverySource for BuyBotLogSource {
    fn name(&self) -> &str {
        "buy-log"
    }

    async fn discover(&self, _ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No buy log present");
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read buy log {}", self.path.display()))?;
        Ok(parse_buy_log(&content))
    }
}

/// Keep the latest BUY per token. Lines without a timestamp rank by file
/// order, after any timestamped entry for the same token.
pub fn parse_buy_log(content: &str) -> Vec<Hint> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, (usize, Hint)> = HashMap::new();
    let mut skipped = 0usize;

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            skipped += 1;
            continue;
        };

        let is_buy = entry
            .get("action")
            .and_then(Value::as_str)
            .map_or(true, |a| a.eq_ignore_ascii_case("BUY"));
        if !is_buy {
            continue;
        }
        let asset_id = match entry.get("token_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let hint = Hint {
            asset_id: asset_id.clone(),
            price: entry.get("price").and_then(decimal_from_json),
            shares: entry.get("shares").and_then(decimal_from_json),
            timestamp: entry
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(iso_timestamp::parse),
        };

        match latest.get(&asset_id) {
            None => {
                order.push(asset_id.clone());
                latest.insert(asset_id, (line_no, hint));
            }
            Some((_, current)) if supersedes(&hint, current) => {
                latest.insert(asset_id, (line_no, hint));
            }
            Some(_) => {}
        }
    }

    if skipped > 0 {
        debug!(skipped, "Skipped malformed buy log lines");
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id).map(|(_, hint)| hint))
        .collect()
}

fn supersedes(candidate: &Hint, current: &Hint) -> bool {
    match (candidate.timestamp, current.timestamp) {
        (Some(a), Some(b)) => a >= b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

/// Incoming ERC-1155 transfers from the block explorer.
pub struct ExplorerTransferSource {
    client: Arc<PolygonscanClient>,
}

impl ExplorerTransferSource {
    pub fn new(client: Arc<PolygonscanClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoverySource for ExplorerTransferSource {
    fn name(&self) -> &str {
        "polygonscan"
    }

    async fn discover(&self, ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        let ids = self.client.incoming_token_ids(ctx.wallet).await?;
        Ok(ids.into_iter().map(Hint::asset).collect())
    }
}

/// Aggregated positions from the Data API.
pub struct PositionsApiSource {
    positions: Arc<dyn PositionsSource>,
}

impl PositionsApiSource {
    pub fn new(positions: Arc<dyn PositionsSource>) -> Self {
        Self { positions }
    }
}

#[async_trait]
impl DiscoverySource for PositionsApiSource {
    fn name(&self) -> &str {
        "positions-api"
    }

    async fn discover(&self, ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        let positions = self.positions.positions(ctx.wallet).await?;
        Ok(positions
            .into_iter()
            .map(|p| Hint {
                shares: Some(p.size),
                ..Hint::asset(p.asset_id)
            })
            .collect())
    }
}

/// Recent `TransferSingle` logs addressed to the wallet.
pub struct ChainLogScanSource {
    rpc: Arc<PolygonRpcClient>,
    depth: u64,
}

impl ChainLogScanSource {
    pub fn new(rpc: Arc<PolygonRpcClient>, depth: u64) -> Self {
        let depth = if depth == 0 { DEFAULT_SCAN_DEPTH } else { depth };
        Self { rpc, depth }
    }
}

#[async_trait]
impl DiscoverySource for ChainLogScanSource {
    fn name(&self) -> &str {
        "chain-logs"
    }

    async fn discover(&self, ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        let ids = self.rpc.received_token_ids(ctx.wallet, self.depth).await?;
        Ok(ids.into_iter().map(Hint::asset).collect())
    }
}

/// `token_id=<digits>` occurrences in the tail of a text log.
pub struct LogGrepSource {
    path: PathBuf,
    tail_lines: usize,
}

impl LogGrepSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail_lines: DEFAULT_GREP_LINES,
        }
    }
}

#[async_trait]
impl DiscoverySource for LogGrepSource {
    fn name(&self) -> &str {
        "log-grep"
    }

    fn last_resort(&self) -> bool {
        true
    }

    async fn discover(&self, _ctx: &DiscoveryContext<'_>) -> Result<Vec<Hint>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read log {}", self.path.display()))?;
        Ok(grep_token_ids(&content, self.tail_lines)
            .into_iter()
            .map(Hint::asset)
            .collect())
    }
}

pub fn grep_token_ids(content: &str, tail_lines: usize) -> Vec<String> {
    const NEEDLE: &str = "token_id=";

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail_lines);
    let mut ids = Vec::new();

    for line in &lines[start..] {
        let mut rest = *line;
        while let Some(pos) = rest.find(NEEDLE) {
            rest = &rest[pos + NEEDLE.len()..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if !digits.is_empty() {
                ids.push(digits);
            }
        }
    }
    ids
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Merged discovery output.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryReport {
    /// Unique ids in first-seen order.
    pub asset_ids: Vec<String>,
    /// Highest-ranked hint carrying entry data, per asset.
    pub hints: HashMap<String, Hint>,
    /// Ids contributed per source, for logging.
    pub per_source: Vec<(String, usize)>,
}

impl DiscoveryReport {
    fn absorb(&mut self, source: &str, hints: Vec<Hint>) {
        self.per_source.push((source.to_string(), hints.len()));
        for hint in hints {
            if !self.asset_ids.contains(&hint.asset_id) {
                self.asset_ids.push(hint.asset_id.clone());
            }
            if hint.has_entry() && !self.hints.contains_key(&hint.asset_id) {
                self.hints.insert(hint.asset_id.clone(), hint);
            }
        }
    }
}

pub struct TokenDiscovery {
    sources: Vec<Box<dyn DiscoverySource>>,
}

impl TokenDiscovery {
    pub fn new(sources: Vec<Box<dyn DiscoverySource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Query every source in rank order. A failing source is skipped.
    pub async fn discover(&self, ctx: &DiscoveryContext<'_>) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for source in self.sources.iter().filter(|s| !s.last_resort()) {
            self.run_source(source.as_ref(), ctx, &mut report).await;
        }
        if report.asset_ids.is_empty() {
            for source in self.sources.iter().filter(|s| s.last_resort()) {
                self.run_source(source.as_ref(), ctx, &mut report).await;
            }
        }

        info!(
            assets = report.asset_ids.len(),
            with_entry = report.hints.len(),
            "Discovery complete"
        );
        report
    }

    async fn run_source(&self, source: &dyn DiscoverySource, ctx: &DiscoveryContext<'_>, report: &mut DiscoveryReport) {
        match source.discover(ctx).await {
            Ok(hints) => {
                debug!(source = source.name(), found = hints.len(), "Discovery source finished");
                report.absorb(source.name(), hints);
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "Discovery source failed, skipping");
            }
        }
    }
}

/// Create `backfilled` purchase records from entry hints. Skips assets that
/// already have a record, are resolved, or were sold at or after the hint.
pub fn backfill(store: &mut LedgerStore, report: &DiscoveryReport) -> Result<usize> {
    let mut created = 0;

    for asset_id in &report.asset_ids {
        let Some(hint) = report.hints.get(asset_id) else {
            continue;
        };
        let (Some(price), Some(shares)) = (hint.price, hint.shares) else {
            continue;
        };
        if store.purchase(asset_id).is_some() || store.is_resolved(asset_id) {
            continue;
        }
        if sold_since(store.ledger(), asset_id, hint.timestamp) {
            debug!(asset = %short_id(asset_id), "Hint predates last sale, not backfilling");
            continue;
        }

        let mut record = PurchaseRecord::new(price, shares, PurchaseSource::Backfilled);
        if let Some(ts) = hint.timestamp {
            record.timestamp = ts;
        }
        store.record_purchase(asset_id, record)?;
        created += 1;
    }

    if created > 0 {
        info!(created, "Backfilled purchase records from discovery hints");
    }
    Ok(created)
}

/// Undated hints are treated as older than any sale.
fn sold_since(ledger: &Ledger, asset_id: &str, hint_ts: Option<DateTime<Utc>>) -> bool {
    match (ledger.last_sale_at(asset_id), hint_ts) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(sold), Some(hinted)) => sold >= hinted,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

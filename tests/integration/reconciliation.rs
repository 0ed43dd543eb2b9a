//! Multi-cycle behaviour of the reconciliation loop.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use harvest::engine::backoff::RecordingSleeper;
use harvest::engine::cycle::{AssetOutcome, ReconciliationLoop, SkipReason};
use harvest::engine::discovery::{BuyBotLogSource, DiscoverySource, LedgerSource, TokenDiscovery};
use harvest::engine::executor::Executor;
use harvest::engine::pricing::EntryPriceResolver;
use harvest::engine::reconciler::{BalanceReconciler, ReconcilerConfig};
use harvest::storage::{Ledger, LedgerStore, MemoryBackend};
use harvest::strategy::{ExitConfig, ExitStrategy};
use harvest::types::{PurchaseRecord, PurchaseSource};

use crate::mock_exchange::{ListedSource, MockExchange, Quote, WALLET};

// ---- helpers -----------------------------------------------------------

fn ledger_with(purchases: &[(&str, Decimal, Decimal)]) -> Ledger {
    let mut ledger = Ledger::default();
    for (id, price, shares) in purchases {
        ledger
            .purchases
            .insert(id.to_string(), PurchaseRecord::new(*price, *shares, PurchaseSource::Api));
    }
    ledger
}

fn build_loop(
    exchange: &MockExchange,
    store: LedgerStore,
    extra_sources: Vec<Box<dyn DiscoverySource>>,
    dry_run: bool,
) -> ReconciliationLoop {
    let mut sources: Vec<Box<dyn DiscoverySource>> = vec![Box::new(LedgerSource)];
    sources.extend(extra_sources);

    let shared = Arc::new(exchange.clone());
    let reconciler = BalanceReconciler::new(
        shared.clone(),
        shared.clone(),
        shared.clone(),
        Arc::new(RecordingSleeper::new()),
        ReconcilerConfig::default(),
    );

    ReconciliationLoop::new(
        WALLET,
        store,
        TokenDiscovery::new(sources),
        reconciler,
        shared.clone(),
        EntryPriceResolver::new(shared.clone()),
        ExitStrategy::new(ExitConfig::default()),
        Executor::new(Some(shared), dry_run),
        dec!(0.50),
    )
}

fn memory_loop(exchange: &MockExchange, ledger: Ledger) -> (ReconciliationLoop, MemoryBackend) {
    let backend = MemoryBackend::with_ledger(ledger);
    let store = LedgerStore::open(Box::new(backend.clone())).unwrap();
    (build_loop(exchange, store, vec![], false), backend)
}

// ---- decision scenarios ------------------------------------------------

#[tokio::test]
async fn test_take_profit_sells_and_records() {
    let exchange = MockExchange::new();
    exchange.hold("A", 100).quote("A", Quote::Price(dec!(0.95)));
    let (mut lp, _) = memory_loop(&exchange, ledger_with(&[("A", dec!(0.40), dec!(100))]));

    let report = lp.run_cycle().await;

    assert_eq!(report.sold(), 1);
    let sale = &lp.store().ledger().sales[0];
    assert_eq!(sale.pnl, dec!(55));
    assert_eq!(sale.pnl_pct, dec!(137.5));
    assert_eq!(sale.sell_price, dec!(0.95));
    assert_eq!(sale.order_id.as_deref(), Some("0xorder1"));
    assert!(lp.store().purchase("A").is_none());
    assert_eq!(lp.store().total_profit(), dec!(55));
    assert_eq!(report.session_pnl, dec!(55));
}

#[tokio::test]
async fn test_stop_loss_sells_at_a_loss() {
    let exchange = MockExchange::new();
    exchange.hold("B", 50).quote("B", Quote::Price(dec!(0.43)));
    let (mut lp, _) = memory_loop(&exchange, ledger_with(&[("B", dec!(0.50), dec!(50))]));

    let report = lp.run_cycle().await;

    match report.outcome("B") {
        Some(AssetOutcome::Sold { sale }) => {
            assert_eq!(sale.pnl, dec!(-3.5));
            assert_eq!(sale.pnl_pct, dec!(-14));
        }
        other => panic!("expected sale, got {other:?}"),
    }
    assert_eq!(lp.store().total_profit(), dec!(-3.5));
}

#[tokio::test]
async fn test_between_thresholds_holds() {
    let exchange = MockExchange::new();
    exchange.hold("C", 20).quote("C", Quote::Price(dec!(0.55)));
    let (mut lp, _) = memory_loop(&exchange, ledger_with(&[("C", dec!(0.50), dec!(20))]));

    let report = lp.run_cycle().await;

    match report.outcome("C") {
        Some(AssetOutcome::Held { evaluation, .. }) => assert_eq!(evaluation.pnl_pct, dec!(10)),
        other => panic!("expected hold, got {other:?}"),
    }
    assert!(exchange.sells().is_empty());
    assert!(lp.store().purchase("C").is_some());
}

// ---- resolution ----------------------------------------------------------

#[tokio::test]
async fn test_resolved_market_is_terminal() {
    let exchange = MockExchange::new();
    exchange.hold("D", 10).quote("D", Quote::NoOrderbook);
    let backend = MemoryBackend::with_ledger(ledger_with(&[("D", dec!(0.30), dec!(10))]));
    let store = LedgerStore::open(Box::new(backend.clone())).unwrap();
    // The positions API keeps listing the asset after resolution.
    let mut lp = build_loop(&exchange, store, vec![Box::new(ListedSource::new("api", &["D"]))], false);

    let first = lp.run_cycle().await;
    assert_eq!(first.newly_resolved(), 1);
    assert!(lp.store().is_resolved("D"));
    assert!(lp.store().purchase("D").is_none());
    assert!(lp.store().ledger().sales.is_empty());

    for _ in 0..3 {
        let report = lp.run_cycle().await;
        assert_eq!(report.resolved_skipped, 1);
        assert!(report.outcome("D").is_none());
    }
    assert_eq!(exchange.balance_calls("D"), 1);
    assert_eq!(exchange.price_calls("D"), 1);

    let persisted = backend.snapshot().unwrap();
    assert_eq!(persisted.resolved_markets, vec!["D".to_string()]);
}

#[tokio::test]
async fn test_transient_price_error_is_not_resolution() {
    let exchange = MockExchange::new();
    exchange.hold("E", 10).quote("E", Quote::Unavailable);
    let (mut lp, _) = memory_loop(&exchange, ledger_with(&[("E", dec!(0.30), dec!(10))]));

    let report = lp.run_cycle().await;

    assert_eq!(
        report.outcome("E"),
        Some(&AssetOutcome::Skipped { asset_id: "E".into(), reason: SkipReason::PriceUnavailable })
    );
    assert!(!lp.store().is_resolved("E"));
    assert!(lp.store().purchase("E").is_some());
}

// ---- discovery -----------------------------------------------------------

#[tokio::test]
async fn test_overlapping_sources_query_each_asset_once() {
    let exchange = MockExchange::new();
    for id in ["A", "B", "C"] {
        exchange.hold(id, 10).quote(id, Quote::Unavailable);
    }
    let backend = MemoryBackend::with_ledger(ledger_with(&[("A", dec!(0.5), dec!(10))]));
    let store = LedgerStore::open(Box::new(backend)).unwrap();
    let mut lp = build_loop(
        &exchange,
        store,
        vec![
            Box::new(ListedSource::new("log", &["A", "B", "A"])),
            Box::new(ListedSource::new("api", &["B", "C"])),
        ],
        false,
    );

    let report = lp.run_cycle().await;

    assert_eq!(report.discovered, 3);
    for id in ["A", "B", "C"] {
        assert_eq!(exchange.balance_calls(id), 1, "asset {id}");
    }
}

#[tokio::test]
async fn test_buy_log_backfills_entry_price() {
    let path = std::env::temp_dir().join(format!("harvest_buylog_{}.json", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        "{\"token_id\": \"L\", \"price\": 0.40, \"shares\": 100, \"timestamp\": \"2025-02-01T09:00:00\", \"action\": \"BUY\"}\n",
    )
    .unwrap();

    let exchange = MockExchange::new();
    exchange.hold("L", 100).quote("L", Quote::Price(dec!(0.95)));
    let store = LedgerStore::open(Box::new(MemoryBackend::new())).unwrap();
    let mut lp = build_loop(&exchange, store, vec![Box::new(BuyBotLogSource::new(&path))], false);

    let report = lp.run_cycle().await;

    match report.outcome("L") {
        Some(AssetOutcome::Sold { sale }) => assert_eq!(sale.buy_price, dec!(0.40)),
        other => panic!("expected sale, got {other:?}"),
    }

    // The log still lists the buy, but it predates the sale.
    let again = lp.run_cycle().await;
    assert!(lp.store().purchase("L").is_none());
    assert_eq!(again.sold(), 0);
    assert_eq!(exchange.sells().len(), 1);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_unknown_position_without_fills_is_assumed_then_purgeable() {
    let exchange = MockExchange::new();
    exchange.hold("U", 40).quote("U", Quote::Price(dec!(0.62)));
    let backend = MemoryBackend::new();
    let store = LedgerStore::open(Box::new(backend.clone())).unwrap();
    let mut lp = build_loop(&exchange, store, vec![Box::new(ListedSource::new("api", &["U"]))], false);

    let report = lp.run_cycle().await;
    assert!(matches!(report.outcome("U"), Some(AssetOutcome::Held { .. })));
    assert_eq!(lp.store().purchase("U").unwrap().source, PurchaseSource::Assumed);

    let mut reopened = LedgerStore::open(Box::new(backend)).unwrap();
    assert_eq!(reopened.purge_assumed().unwrap(), 1);
    assert!(reopened.purchase("U").is_none());
}

#[tokio::test]
async fn test_unknown_position_with_fills_uses_api_entry() {
    let exchange = MockExchange::new();
    exchange
        .hold("V", 100)
        .quote("V", Quote::Price(dec!(0.92)))
        .fill("V", dec!(0.30), dec!(60))
        .fill("V", dec!(0.50), dec!(40));
    let store = LedgerStore::open(Box::new(MemoryBackend::new())).unwrap();
    let mut lp = build_loop(&exchange, store, vec![Box::new(ListedSource::new("api", &["V"]))], false);

    let report = lp.run_cycle().await;

    match report.outcome("V") {
        Some(AssetOutcome::Sold { sale }) => {
            assert_eq!(sale.buy_price, dec!(0.38));
            assert_eq!(sale.pnl, dec!(54));
        }
        other => panic!("expected sale, got {other:?}"),
    }
}

// ---- safety properties -----------------------------------------------

#[tokio::test]
async fn test_no_double_sell_across_cycles() {
    let exchange = MockExchange::new();
    exchange.hold("A", 100).quote("A", Quote::Price(dec!(0.95)));
    let backend = MemoryBackend::with_ledger(ledger_with(&[("A", dec!(0.40), dec!(100))]));
    let store = LedgerStore::open(Box::new(backend)).unwrap();
    let mut lp = build_loop(&exchange, store, vec![Box::new(ListedSource::new("api", &["A"]))], false);

    assert_eq!(lp.run_cycle().await.sold(), 1);

    // Sold shares are gone from the wallet.
    let report = lp.run_cycle().await;
    assert_eq!(
        report.outcome("A"),
        Some(&AssetOutcome::Skipped { asset_id: "A".into(), reason: SkipReason::Dust })
    );

    // Shares reappear but sit in a matching order: still not sellable.
    exchange.hold("A", 100).resting_order("A", dec!(100));
    let report = lp.run_cycle().await;
    assert_eq!(
        report.outcome("A"),
        Some(&AssetOutcome::Skipped { asset_id: "A".into(), reason: SkipReason::Locked })
    );

    assert_eq!(exchange.sells().len(), 1);
    assert_eq!(lp.store().ledger().sales.len(), 1);
}

#[tokio::test]
async fn test_ledger_conservation_over_many_cycles() {
    let exchange = MockExchange::new();
    let ledger = ledger_with(&[
        ("W1", dec!(0.40), dec!(100)),
        ("W2", dec!(0.50), dec!(50)),
        ("W3", dec!(0.20), dec!(30)),
    ]);
    exchange.hold("W1", 100).quote("W1", Quote::Price(dec!(0.60)));
    exchange.hold("W2", 50).quote("W2", Quote::Price(dec!(0.43)));
    exchange.hold("W3", 30).quote("W3", Quote::Price(dec!(0.21)));
    let (mut lp, backend) = memory_loop(&exchange, ledger);

    // Cycle 1: W2 stops out, the rest hold.
    lp.run_cycle().await;
    // Cycle 2: W1 rallies past take-profit.
    exchange.quote("W1", Quote::Price(dec!(0.91)));
    lp.run_cycle().await;
    // Cycle 3: W3 collapses.
    exchange.quote("W3", Quote::Price(dec!(0.17)));
    lp.run_cycle().await;

    let ledger = lp.store().ledger();
    assert_eq!(ledger.sales.len(), 3);
    let sum: Decimal = ledger.sales.iter().map(|s| s.pnl).sum();
    assert_eq!(ledger.total_profit, sum);
    assert_eq!(sum, dec!(51) + dec!(-3.5) + dec!(-0.9));
    assert!(lp.store().verify().is_ok());

    let reopened = LedgerStore::open(Box::new(backend)).unwrap();
    assert_eq!(reopened.total_profit(), sum);
    assert!(reopened.ledger().purchases.is_empty());
}

#[tokio::test]
async fn test_rate_limited_chain_falls_back_and_holds_until_verified() {
    let exchange = MockExchange::new();
    exchange
        .hold("R", 100)
        .quote("R", Quote::Price(dec!(0.95)))
        .report_position("R", dec!(100));
    exchange.set_rate_limited(true);
    let (mut lp, _) = memory_loop(&exchange, ledger_with(&[("R", dec!(0.40), dec!(100))]));

    let report = lp.run_cycle().await;

    // Three attempts while reconciling, three more for the re-verification.
    assert_eq!(exchange.balance_calls("R"), 6);
    assert!(matches!(report.outcome("R"), Some(AssetOutcome::Held { .. })));
    assert!(exchange.sells().is_empty());

    exchange.set_rate_limited(false);
    let report = lp.run_cycle().await;
    assert_eq!(report.sold(), 1);
}

#[tokio::test]
async fn test_failed_sell_leaves_ledger_and_retries_next_cycle() {
    let exchange = MockExchange::new();
    exchange.hold("S", 100).quote("S", Quote::Price(dec!(0.95)));
    exchange.set_fail_sells(true);
    let (mut lp, backend) = memory_loop(&exchange, ledger_with(&[("S", dec!(0.40), dec!(100))]));
    let writes = backend.writes();

    let report = lp.run_cycle().await;
    assert_eq!(report.failed(), 1);
    assert!(lp.store().purchase("S").is_some());
    assert_eq!(lp.store().total_profit(), Decimal::ZERO);
    assert_eq!(backend.writes(), writes);

    exchange.set_fail_sells(false);
    assert_eq!(lp.run_cycle().await.sold(), 1);
}

#[tokio::test]
async fn test_dry_run_never_submits() {
    let exchange = MockExchange::new();
    exchange.hold("A", 100).quote("A", Quote::Price(dec!(0.95)));
    let backend = MemoryBackend::with_ledger(ledger_with(&[("A", dec!(0.40), dec!(100))]));
    let store = LedgerStore::open(Box::new(backend)).unwrap();
    let mut lp = build_loop(&exchange, store, vec![], true);

    for _ in 0..2 {
        assert_eq!(lp.run_cycle().await.dry_runs(), 1);
    }
    assert!(exchange.sells().is_empty());
    assert!(lp.store().purchase("A").is_some());
}

#[tokio::test]
async fn test_file_ledger_survives_restart() {
    let path = std::env::temp_dir().join(format!("harvest_ledger_{}.json", uuid::Uuid::new_v4()));
    let exchange = MockExchange::new();
    exchange.hold("A", 100).quote("A", Quote::Price(dec!(0.95)));
    exchange.hold("B", 10).quote("B", Quote::NoOrderbook);

    {
        let mut store = LedgerStore::open_file(&path).unwrap();
        store
            .record_purchase("A", PurchaseRecord::new(dec!(0.40), dec!(100), PurchaseSource::Api))
            .unwrap();
        store
            .record_purchase("B", PurchaseRecord::new(dec!(0.70), dec!(10), PurchaseSource::Api))
            .unwrap();
        let mut lp = build_loop(&exchange, store, vec![], false);
        lp.run_cycle().await;
    }

    let reopened = LedgerStore::open_file(&path).unwrap();
    assert_eq!(reopened.ledger().sales.len(), 1);
    assert_eq!(reopened.total_profit(), dec!(55));
    assert!(reopened.is_resolved("B"));
    assert!(reopened.ledger().purchases.is_empty());

    std::fs::remove_file(&path).ok();
}

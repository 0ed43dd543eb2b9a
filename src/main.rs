//! HARVEST: autonomous profit-taking engine for prediction market positions
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger, wires the exchange and chain clients, and runs the
//! reconciliation loop until Ctrl+C.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use harvest::config::AppConfig;
use harvest::engine::backoff::TokioSleeper;
use harvest::engine::cycle::ReconciliationLoop;
use harvest::engine::discovery::{
    BuyBotLogSource, ChainLogScanSource, DiscoverySource, ExplorerTransferSource, LedgerSource,
    LogGrepSource, PositionsApiSource, TokenDiscovery,
};
use harvest::engine::executor::Executor;
use harvest::engine::pricing::EntryPriceResolver;
use harvest::engine::reconciler::BalanceReconciler;
use harvest::platforms::polygon::{PolygonRpcClient, CTF_ADDRESS};
use harvest::platforms::polygonscan::PolygonscanClient;
use harvest::platforms::polymarket::PolymarketClient;
use harvest::platforms::relay::OrderRelayClient;
use harvest::platforms::OrderExecutor;
use harvest::storage::LedgerStore;
use harvest::strategy::ExitStrategy;

const CONFIG_PATH: &str = "config.toml";

const BANNER: &str = r#"
 _   _    _    ______     _______ ____ _____
| | | |  / \  |  _ \ \   / / ____/ ___|_   _|
| |_| | / _ \ | |_) \ \ / /|  _| \___ \ | |
|  _  |/ ___ \|  _ < \ V / | |___ ___) || |
|_| |_/_/   \_\_| \_\ \_/  |_____|____/ |_|

  Position reconciliation & profit-taking engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = if Path::new(CONFIG_PATH).exists() {
        AppConfig::load(CONFIG_PATH)?
    } else {
        AppConfig::parse("")?
    };

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        scan_interval_secs = cfg.agent.scan_interval_secs,
        take_profit = %cfg.thresholds.take_profit,
        stop_loss_pct = %cfg.thresholds.stop_loss_pct,
        min_position_value = %cfg.thresholds.min_position_value,
        dry_run = cfg.execution.dry_run,
        "HARVEST starting up"
    );

    // -- Credentials (fatal if missing) ------------------------------------

    let wallet = AppConfig::resolve_env(&cfg.agent.wallet_address_env)
        .context("Wallet address is required")?;
    let relay_key = if cfg.execution.dry_run {
        AppConfig::resolve_secret(&cfg.execution.relay_api_key_env).ok()
    } else {
        Some(
            AppConfig::resolve_secret(&cfg.execution.relay_api_key_env)
                .context("Order relay API key is required for live trading")?,
        )
    };

    // -- Ledger --------------------------------------------------------------

    let mut store = LedgerStore::open_file(&cfg.ledger.path)?;
    if cfg.ledger.purge_assumed_on_start {
        let removed = store.purge_assumed()?;
        info!(removed, "Purged assumed entry prices on startup");
    }

    // -- Clients ---------------------------------------------------------------

    let timeout = cfg.endpoints.timeout_secs;
    let rpc = Arc::new(PolygonRpcClient::new(&cfg.endpoints.polygon_rpc, timeout)?);
    let polymarket = Arc::new(PolymarketClient::new(
        &cfg.endpoints.clob,
        &cfg.endpoints.data_api,
        timeout,
    )?);
    let relay = match relay_key {
        Some(key) => Some(Arc::new(OrderRelayClient::new(&cfg.endpoints.order_relay, key, timeout)?)),
        None => {
            warn!("No order relay key, open orders will read as empty");
            None
        }
    };

    // -- Discovery sources -------------------------------------------------

    let d = &cfg.discovery;
    let mut sources: Vec<Box<dyn DiscoverySource>> = vec![
        Box::new(LedgerSource),
        Box::new(BuyBotLogSource::new(&d.buy_log_path)),
    ];
    if d.explorer_enabled {
        match AppConfig::resolve_env(&d.explorer_api_key_env) {
            Ok(key) => {
                let client = PolygonscanClient::new(&cfg.endpoints.polygonscan, key, CTF_ADDRESS, timeout)?;
                sources.push(Box::new(ExplorerTransferSource::new(Arc::new(client))));
            }
            Err(_) => warn!(env = %d.explorer_api_key_env, "No Polygonscan key, explorer discovery disabled"),
        }
    }
    if d.positions_api_enabled {
        sources.push(Box::new(PositionsApiSource::new(polymarket.clone())));
    }
    if d.chain_scan_enabled {
        sources.push(Box::new(ChainLogScanSource::new(rpc.clone(), d.chain_scan_depth)));
    }
    if d.log_grep_enabled {
        sources.push(Box::new(LogGrepSource::new(&d.text_log_path)));
    }
    let discovery = TokenDiscovery::new(sources);
    info!(sources = ?discovery.source_names(), "Discovery sources configured");

    // -- Engine --------------------------------------------------------------

    let orders: Arc<dyn harvest::platforms::OpenOrdersSource> = match &relay {
        Some(relay) => relay.clone(),
        None => Arc::new(NoOpenOrders),
    };
    let reconciler = BalanceReconciler::new(
        rpc.clone(),
        orders,
        polymarket.clone(),
        Arc::new(TokioSleeper),
        cfg.reconciler_config(),
    );
    let venue = relay.map(|r| r as Arc<dyn OrderExecutor>);
    let executor = Executor::new(venue, cfg.execution.dry_run);

    let mut cycle = ReconciliationLoop::new(
        wallet,
        store,
        discovery,
        reconciler,
        polymarket.clone(),
        EntryPriceResolver::new(polymarket.clone()),
        ExitStrategy::new(cfg.exit_config()),
        executor,
        cfg.thresholds.min_position_value,
    );

    // -- Main loop -------------------------------------------------------

    let scan_interval = Duration::from_secs(cfg.agent.scan_interval_secs);
    let mut interval = tokio::time::interval(scan_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.scan_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cycle.run_cycle().await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!(
        cycles = cycle.cycle_count(),
        total_profit = format!("${:+.2}", cycle.store().total_profit()),
        open_positions = cycle.store().ledger().purchases.len(),
        "HARVEST shut down cleanly."
    );

    Ok(())
}

/// Stand-in when no relay is configured (dry-run without credentials).
struct NoOpenOrders;

#[async_trait::async_trait]
impl harvest::platforms::OpenOrdersSource for NoOpenOrders {
    async fn open_orders(&self, _asset_id: &str) -> Result<Vec<harvest::types::OpenOrder>> {
        Ok(Vec::new())
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("harvest=info"));

    let json_logging = std::env::var("HARVEST_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

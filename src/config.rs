//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a file only needs the values it changes.
//! Secrets (wallet address, API keys) are referenced by env-var name in the
//! config and resolved at startup.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::backoff::BackoffPolicy;
use crate::engine::discovery::{DEFAULT_BUY_LOG, DEFAULT_TEXT_LOG};
use crate::engine::reconciler::ReconcilerConfig;
use crate::platforms::polygon::DEFAULT_RPC_URL;
use crate::platforms::polygonscan::DEFAULT_EXPLORER_URL;
use crate::platforms::polymarket::{CLOB_API_URL, DATA_API_URL};
use crate::storage::DEFAULT_LEDGER_FILE;
use crate::strategy::{ExitConfig, TakeProfit};
use crate::types::TrackerError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub thresholds: ThresholdsConfig,
    pub balance: BalanceConfig,
    pub discovery: DiscoveryConfig,
    pub ledger: LedgerConfig,
    pub endpoints: EndpointsConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub scan_interval_secs: u64,
    /// Env var holding the proxy wallet address.
    pub wallet_address_env: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "HARVEST-001".into(),
            scan_interval_secs: 600,
            wallet_address_env: "POLYMARKET_WALLET_ADDRESS".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub take_profit: TakeProfit,
    pub stop_loss_pct: Decimal,
    /// Positions worth less than this (USDC) are skipped.
    pub min_position_value: Decimal,
    /// Balances at or below this many shares are dust.
    pub min_shares: Decimal,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            take_profit: TakeProfit::Price(dec!(0.90)),
            stop_loss_pct: dec!(-10),
            min_position_value: dec!(0.50),
            min_shares: dec!(0.0001),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BalanceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter: f64,
    pub inter_call_delay_ms: u64,
    pub decimals: u32,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            jitter: 0.0,
            inter_call_delay_ms: 150,
            decimals: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub buy_log_path: String,
    pub text_log_path: String,
    pub explorer_enabled: bool,
    /// Env var holding the Polygonscan API key.
    pub explorer_api_key_env: String,
    pub positions_api_enabled: bool,
    pub chain_scan_enabled: bool,
    pub chain_scan_depth: u64,
    pub log_grep_enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            buy_log_path: DEFAULT_BUY_LOG.into(),
            text_log_path: DEFAULT_TEXT_LOG.into(),
            explorer_enabled: true,
            explorer_api_key_env: "POLYGONSCAN_API_KEY".into(),
            positions_api_enabled: true,
            chain_scan_enabled: true,
            chain_scan_depth: 500,
            log_grep_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
    /// Drop `assumed` entry prices at startup so they get re-resolved.
    pub purge_assumed_on_start: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_LEDGER_FILE.into(),
            purge_assumed_on_start: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointsConfig {
    pub polygon_rpc: String,
    pub clob: String,
    pub data_api: String,
    pub polygonscan: String,
    pub order_relay: String,
    pub timeout_secs: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            polygon_rpc: DEFAULT_RPC_URL.into(),
            clob: CLOB_API_URL.into(),
            data_api: DATA_API_URL.into(),
            polygonscan: DEFAULT_EXPLORER_URL.into(),
            order_relay: "http://127.0.0.1:8787".into(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub dry_run: bool,
    /// Env var holding the order relay API key. Required unless dry-run.
    pub relay_api_key_env: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            relay_api_key_env: "ORDER_RELAY_API_KEY".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations that cannot work.
    pub fn validate(&self) -> Result<(), TrackerError> {
        let t = &self.thresholds;
        match t.take_profit {
            TakeProfit::Price(p) if p <= Decimal::ZERO || p > Decimal::ONE => {
                return Err(TrackerError::Config(format!(
                    "take-profit price {p} must be in (0, 1]"
                )));
            }
            TakeProfit::Percent(x) if x <= Decimal::ZERO => {
                return Err(TrackerError::Config(format!(
                    "take-profit percent {x} must be positive"
                )));
            }
            _ => {}
        }
        if t.stop_loss_pct >= Decimal::ZERO {
            return Err(TrackerError::Config(format!(
                "stop_loss_pct {} must be negative",
                t.stop_loss_pct
            )));
        }
        if t.min_position_value < Decimal::ZERO || t.min_shares <= Decimal::ZERO {
            return Err(TrackerError::Config(
                "min_position_value must be >= 0 and min_shares > 0".into(),
            ));
        }
        if self.agent.scan_interval_secs == 0 {
            return Err(TrackerError::Config("scan_interval_secs must be > 0".into()));
        }
        if self.balance.max_attempts == 0 {
            return Err(TrackerError::Config("balance.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.balance.jitter) {
            return Err(TrackerError::Config(format!(
                "balance.jitter {} must be in [0, 1]",
                self.balance.jitter
            )));
        }
        if self.endpoints.timeout_secs == 0 {
            return Err(TrackerError::Config("endpoints.timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn exit_config(&self) -> ExitConfig {
        ExitConfig {
            take_profit: self.thresholds.take_profit,
            stop_loss_pct: self.thresholds.stop_loss_pct,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            scale: self.balance.decimals,
            min_shares: self.thresholds.min_shares,
            inter_call_delay: Duration::from_millis(self.balance.inter_call_delay_ms),
            backoff: BackoffPolicy {
                max_attempts: self.balance.max_attempts,
                base_delay: Duration::from_millis(self.balance.base_delay_ms),
                jitter: self.balance.jitter,
            },
        }
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Like `resolve_env`, for values that must not reach the logs.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        Self::resolve_env(env_name).map(SecretString::new)
    }
}

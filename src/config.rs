//! Venue configuration
//!
//! Loaded from a YAML file. The symbol/asset registry is part of the
//! config; symbols never trade unless both assets are declared here.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core_types::UserId;
use crate::fee::{DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE};
use crate::symbol_registry::SymbolRegistry;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// "hourly" | "daily" | "never"
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub use_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: default_rotation(),
            log_level: default_log_level(),
            use_json: false,
        }
    }
}

fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_file() -> String {
    "spotmatch.log".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Matching engine / pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-symbol command queue capacity; a full queue returns `Busy`.
    #[serde(default = "default_queue_capacity")]
    pub command_queue_capacity: usize,
    /// Submit/cancel reply deadline in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Market order slippage cap in basis points. A MARKET BUY pre-locks
    /// `best_ask * (1 + cap) * qty` of quote and stops walking the book
    /// past the cap price.
    #[serde(default = "default_slippage_bps")]
    pub max_slippage_bps: u64,
    /// Shutdown drain grace period in milliseconds.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: default_queue_capacity(),
            command_timeout_ms: default_command_timeout_ms(),
            max_slippage_bps: default_slippage_bps(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_command_timeout_ms() -> u64 {
    2_000
}
fn default_slippage_bps() -> u64 {
    500
}
fn default_drain_grace_ms() -> u64 {
    5_000
}

/// Event publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Per-subscriber outbound queue capacity; overflow disconnects the
    /// client with `SlowConsumer`.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Depth levels included in published depth events.
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_capacity(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            depth_levels: default_depth_levels(),
        }
    }
}

fn default_outbound_capacity() -> usize {
    1024
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_depth_levels() -> usize {
    20
}

/// Asset declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDef {
    pub asset_id: u32,
    pub name: String,
    /// Internal storage scale. WARNING: never change after initial setup.
    pub scale: u32,
}

/// Symbol declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolDef {
    pub symbol_id: u32,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(default = "default_maker_fee")]
    pub maker_fee_rate: u64,
    #[serde(default = "default_taker_fee")]
    pub taker_fee_rate: u64,
}

fn default_maker_fee() -> u64 {
    DEFAULT_MAKER_FEE
}
fn default_taker_fee() -> u64 {
    DEFAULT_TAKER_FEE
}

/// Complete venue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub events: EventConfig,
    /// Postgres mirror; the in-memory stores stay authoritative when unset.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Account credited with all commission.
    #[serde(default)]
    pub fee_account_id: UserId,
    pub assets: Vec<AssetDef>,
    pub symbols: Vec<SymbolDef>,
}

impl AppConfig {
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: AppConfig =
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {path}"))?;
        Ok(config)
    }

    /// Build and validate the symbol registry from the declarations.
    pub fn build_registry(&self) -> anyhow::Result<SymbolRegistry> {
        let mut registry = SymbolRegistry::new();
        for asset in &self.assets {
            registry
                .add_asset(asset.asset_id, &asset.name, asset.scale)
                .map_err(|e| anyhow::anyhow!("asset {}: {e}", asset.name))?;
        }
        for sym in &self.symbols {
            let base = registry
                .asset_id(&sym.base)
                .ok_or_else(|| anyhow::anyhow!("symbol {}: unknown base {}", sym.symbol, sym.base))?;
            let quote = registry.asset_id(&sym.quote).ok_or_else(|| {
                anyhow::anyhow!("symbol {}: unknown quote {}", sym.symbol, sym.quote)
            })?;
            registry
                .add_symbol_with_fees(
                    sym.symbol_id,
                    &sym.symbol,
                    base,
                    quote,
                    sym.maker_fee_rate,
                    sym.taker_fee_rate,
                )
                .map_err(|e| anyhow::anyhow!("symbol {}: {e}", sym.symbol))?;
        }
        Ok(registry)
    }
}

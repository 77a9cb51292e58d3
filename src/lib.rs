//! spotmatch - spot exchange core
//!
//! Price/time-priority matching engine with an authoritative balance
//! ledger and best-effort event fan-out.
//!
//! # Modules
//!
//! - [`core_types`] - Core type aliases (AssetId, UserId, ...)
//! - [`config`] - Venue configuration (assets, symbols, limits)
//! - [`models`] - Order, trade and transaction types
//! - [`money`] - Scaled fixed-point conversion and exact arithmetic
//! - [`fee`] - Commission schedule
//! - [`symbol_registry`] - Explicit symbol -> (base, quote) registry
//! - [`balance_store`] - Per-(user, asset) ledger with free/locked partitions
//! - [`order_store`] - Order lifecycle store
//! - [`trade_store`] - Append-only trade log
//! - [`orderbook`] - BTreeMap-based per-symbol book
//! - [`engine`] - Per-symbol matching state machine
//! - [`pipeline`] - Symbol workers, bounded queues, the venue front door
//! - [`events`] - Subscriber fan-out with heartbeats and slow-consumer cuts
//! - [`funding`] - Deposit/withdrawal transactions
//! - [`persistence`] - Postgres mirror of the in-memory stores

pub mod balance_store;
pub mod config;
pub mod core_types;
pub mod engine;
pub mod error;
pub mod events;
pub mod fee;
pub mod funding;
pub mod logging;
pub mod models;
pub mod money;
pub mod order_store;
pub mod orderbook;
pub mod persistence;
pub mod pipeline;
pub mod symbol_registry;
pub mod trade_store;

// Convenient re-exports at crate root
pub use balance_store::{BalanceSnapshot, BalanceStore, Settlement};
pub use config::AppConfig;
pub use core_types::{AssetId, ClientId, OrderId, SeqNum, SymbolId, TradeId, UserId};
pub use engine::{CancelAck, SubmitRequest, SymbolEngine};
pub use error::EngineError;
pub use events::{Channel, EventPublisher, Subscription};
pub use models::{Order, OrderStatus, OrderType, Side, TimeInForce, Trade};
pub use order_store::OrderStore;
pub use orderbook::OrderBook;
pub use pipeline::{SubmitCommand, Venue};
pub use symbol_registry::SymbolRegistry;
pub use trade_store::TradeStore;

//! Pipeline - per-symbol single-writer workers behind bounded queues
//!
//! The engine is partitioned by symbol: each symbol's commands are
//! processed strictly sequentially by one worker task, and distinct
//! symbols run in parallel. The `Venue` front door owns the workers and
//! the shared stores and exposes the full inbound command surface
//! (transport is out of scope - an external layer calls these methods).
//!
//! # Backpressure and deadlines
//!
//! Per-symbol command queues are bounded (default 10,000): a full queue
//! returns `Busy` to the caller without blocking. Submit and cancel
//! callers wait for the worker's reply under a deadline (default 2 s) and
//! get `TimedOut` past it - the worker still finishes the command in
//! order, so engine state stays consistent.
//!
//! # Startup and shutdown
//!
//! Every book is hydrated from the order store before any worker starts
//! accepting commands. Shutdown closes all intakes, lets workers drain
//! their queues within a grace period, then stops the heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::balance_store::BalanceStore;
use crate::config::AppConfig;
use crate::core_types::{OrderId, SymbolId, UserId};
use crate::engine::{CancelAck, SubmitRequest, SymbolEngine};
use crate::error::EngineError;
use crate::events::EventPublisher;
use crate::events::messages::{DepthPayload, OrderSnapshot, ResyncSnapshot, TradeSnapshot};
use crate::funding::{FundingLedger, Transaction};
use crate::models::{Order, OrderType, Side, TimeInForce};
use crate::order_store::OrderStore;
use crate::orderbook::DepthSnapshot;
use crate::symbol_registry::{SymbolInfo, SymbolRegistry};
use crate::trade_store::TradeStore;

/// Book query depth bounds.
pub const MIN_DEPTH_LIMIT: usize = 5;
pub const MAX_DEPTH_LIMIT: usize = 1000;
/// Trade history query bound.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Client-facing submission, decimal amounts at the boundary.
#[derive(Debug, Clone)]
pub struct SubmitCommand {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub client_order_id: Option<String>,
    pub display_qty: Option<Decimal>,
}

/// Cancel acknowledgement; idempotent re-cancels set `already_terminal`.
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub order: OrderSnapshot,
    pub already_terminal: bool,
}

/// Per-user asset balance view.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

enum EngineCommand {
    Submit {
        req: SubmitRequest,
        reply: oneshot::Sender<Result<Order, EngineError>>,
    },
    Cancel {
        order_id: OrderId,
        user_id: UserId,
        reply: oneshot::Sender<Result<CancelAck, EngineError>>,
    },
    Depth {
        limit: usize,
        reply: oneshot::Sender<DepthSnapshot>,
    },
    Resync {
        reply: oneshot::Sender<ResyncSnapshot>,
    },
}

struct SymbolWorker {
    tx: mpsc::Sender<EngineCommand>,
    handle: tokio::task::JoinHandle<()>,
}

/// The venue front door: shared stores plus one worker per symbol.
pub struct Venue {
    registry: Arc<SymbolRegistry>,
    balances: Arc<BalanceStore>,
    orders: Arc<OrderStore>,
    trades: Arc<TradeStore>,
    publisher: Arc<EventPublisher>,
    funding: FundingLedger,
    workers: FxHashMap<SymbolId, SymbolWorker>,
    command_timeout: Duration,
    drain_grace: Duration,
    halted: Arc<AtomicBool>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Venue {
    /// Build the stores, hydrate every symbol's book, then start the
    /// workers and the heartbeat. Hydration completes for all symbols
    /// before any command is accepted.
    pub fn start(
        config: &AppConfig,
        registry: Arc<SymbolRegistry>,
        pool: Option<PgPool>,
    ) -> Result<Venue, EngineError> {
        let balances = Arc::new(BalanceStore::new(config.fee_account_id));
        let orders = Arc::new(OrderStore::new());
        let trades = Arc::new(TradeStore::new());
        let publisher = Arc::new(EventPublisher::new(config.events.outbound_queue_capacity));
        Self::start_with_stores(config, registry, balances, orders, trades, publisher, pool)
    }

    /// As `start`, but over pre-seeded stores (recovery, tests).
    #[allow(clippy::too_many_arguments)]
    pub fn start_with_stores(
        config: &AppConfig,
        registry: Arc<SymbolRegistry>,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
        publisher: Arc<EventPublisher>,
        pool: Option<PgPool>,
    ) -> Result<Venue, EngineError> {
        let order_ids = Arc::new(AtomicU64::new(0));
        let trade_ids = Arc::new(AtomicU64::new(0));
        let halted = Arc::new(AtomicBool::new(false));

        // Hydrate all books before any worker runs: the stores are not
        // mutated again until the workers start consuming commands.
        let mut engines: Vec<SymbolEngine> = Vec::new();
        for info in registry.iter_symbols() {
            let mut engine = SymbolEngine::new(
                info.clone(),
                Arc::clone(&registry),
                Arc::clone(&balances),
                Arc::clone(&orders),
                Arc::clone(&trades),
                Arc::clone(&publisher),
                Arc::clone(&order_ids),
                Arc::clone(&trade_ids),
                config.engine.max_slippage_bps,
                config.events.depth_levels,
            );
            engine.hydrate()?;
            engines.push(engine);
        }

        let mut workers = FxHashMap::default();
        for engine in engines {
            let symbol_id = registry
                .symbol_id(engine.symbol())
                .ok_or_else(|| EngineError::invariant("engine for unregistered symbol"))?;
            let (tx, rx) = mpsc::channel(config.engine.command_queue_capacity.max(1));
            let handle = tokio::spawn(run_worker(engine, rx, Arc::clone(&halted)));
            workers.insert(symbol_id, SymbolWorker { tx, handle });
        }

        let heartbeat = publisher
            .start_heartbeat(Duration::from_secs(config.events.heartbeat_interval_secs.max(1)));

        info!(symbols = workers.len(), "venue started");
        Ok(Venue {
            funding: FundingLedger::new(Arc::clone(&balances), Arc::clone(&registry), pool),
            registry,
            balances,
            orders,
            trades,
            publisher,
            workers,
            command_timeout: Duration::from_millis(config.engine.command_timeout_ms.max(1)),
            drain_grace: Duration::from_millis(config.engine.drain_grace_ms),
            halted,
            heartbeat,
        })
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn registry(&self) -> &Arc<SymbolRegistry> {
        &self.registry
    }

    pub fn balance_store(&self) -> &Arc<BalanceStore> {
        &self.balances
    }

    /// True once any symbol worker halted on an invariant violation.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // ============================================================
    // COMMANDS
    // ============================================================

    pub async fn submit(&self, cmd: SubmitCommand) -> Result<OrderSnapshot, EngineError> {
        let info = self
            .registry
            .symbol_by_name(&cmd.symbol)
            .ok_or_else(|| EngineError::validation(format!("unknown symbol {}", cmd.symbol)))?
            .clone();
        let req = to_submit_request(&info, &cmd)?;
        let worker = self.workers.get(&info.symbol_id).ok_or(EngineError::Busy)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        enqueue(&worker.tx, EngineCommand::Submit { req, reply: reply_tx })?;
        let order = self.await_reply(reply_rx).await??;
        Ok(OrderSnapshot::from_order(&order, &info))
    }

    /// Cancel by `(user, order_id)`; the symbol is resolved from the
    /// stored order. Idempotent for terminal orders.
    pub async fn cancel(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<CancelResponse, EngineError> {
        // Symbol routing only; the owning worker enforces ownership and
        // answers foreign cancels with NotCancellable.
        let order = self.orders.get_any(order_id).ok_or(EngineError::NotFound)?;
        let info = self
            .registry
            .symbol(order.symbol_id)
            .ok_or(EngineError::NotFound)?
            .clone();
        let worker = self.workers.get(&info.symbol_id).ok_or(EngineError::Busy)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        enqueue(
            &worker.tx,
            EngineCommand::Cancel {
                order_id,
                user_id,
                reply: reply_tx,
            },
        )?;
        let ack = self.await_reply(reply_rx).await??;
        Ok(match ack {
            CancelAck::Cancelled(order) => CancelResponse {
                order: OrderSnapshot::from_order(&order, &info),
                already_terminal: false,
            },
            CancelAck::AlreadyTerminal(order) => CancelResponse {
                order: OrderSnapshot::from_order(&order, &info),
                already_terminal: true,
            },
        })
    }

    pub async fn deposit(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Transaction, EngineError> {
        self.funding.deposit(user_id, asset, amount).await
    }

    pub async fn withdraw(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        address: &str,
    ) -> Result<Transaction, EngineError> {
        self.funding.withdraw(user_id, asset, amount, address).await
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn query_order(&self, user_id: UserId, order_id: OrderId) -> Option<OrderSnapshot> {
        let order = self.orders.get(order_id, user_id)?;
        let info = self.registry.symbol(order.symbol_id)?;
        Some(OrderSnapshot::from_order(&order, info))
    }

    /// Aggregated book, depth limit clamped to 5..=1000. Served by the
    /// symbol worker so the snapshot is consistent with command order.
    pub async fn query_book(
        &self,
        symbol: &str,
        depth_limit: usize,
    ) -> Result<DepthPayload, EngineError> {
        let info = self
            .registry
            .symbol_by_name(symbol)
            .ok_or_else(|| EngineError::validation(format!("unknown symbol {symbol}")))?
            .clone();
        let worker = self.workers.get(&info.symbol_id).ok_or(EngineError::Busy)?;
        let limit = depth_limit.clamp(MIN_DEPTH_LIMIT, MAX_DEPTH_LIMIT);

        let (reply_tx, reply_rx) = oneshot::channel();
        enqueue(&worker.tx, EngineCommand::Depth { limit, reply: reply_tx })?;
        let snapshot = self.await_reply(reply_rx).await?;
        Ok(DepthPayload::from_snapshot(&snapshot, &info))
    }

    pub fn query_user_trades(
        &self,
        user_id: UserId,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TradeSnapshot>, EngineError> {
        let symbol_id = match symbol {
            Some(name) => Some(
                self.registry
                    .symbol_id(name)
                    .ok_or_else(|| EngineError::validation(format!("unknown symbol {name}")))?,
            ),
            None => None,
        };
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        Ok(self
            .trades
            .by_user(user_id, symbol_id, limit)
            .iter()
            .filter_map(|trade| TradeSnapshot::from_trade(trade, &self.registry))
            .collect())
    }

    pub fn query_balances(&self, user_id: UserId) -> Vec<BalanceView> {
        self.balances
            .balances_of(user_id)
            .into_iter()
            .filter_map(|(asset_id, snapshot)| {
                let asset = self.registry.asset(asset_id)?;
                Some(BalanceView {
                    asset: asset.name.clone(),
                    free: self.registry.amount_to_decimal(asset_id, snapshot.free)?,
                    locked: self.registry.amount_to_decimal(asset_id, snapshot.locked)?,
                })
            })
            .collect()
    }

    pub fn query_transactions(&self, user_id: UserId) -> Vec<Transaction> {
        self.funding.by_user(user_id)
    }

    /// Recovery snapshot for event subscribers: open orders + top-of-book.
    pub async fn resync(&self, symbol: &str) -> Result<ResyncSnapshot, EngineError> {
        let info = self
            .registry
            .symbol_by_name(symbol)
            .ok_or_else(|| EngineError::validation(format!("unknown symbol {symbol}")))?;
        let worker = self.workers.get(&info.symbol_id).ok_or(EngineError::Busy)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        enqueue(&worker.tx, EngineCommand::Resync { reply: reply_tx })?;
        self.await_reply(reply_rx).await
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, EngineError> {
        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // The worker dropped the reply without answering: it halted.
            Ok(Err(_)) => Err(EngineError::Busy),
            Err(_) => Err(EngineError::TimedOut),
        }
    }

    // ============================================================
    // SHUTDOWN
    // ============================================================

    /// Graceful drain: close every intake, let workers finish their
    /// queued commands within the grace period, stop the heartbeat.
    /// Returns `false` when any symbol halted on an invariant violation.
    pub async fn shutdown(mut self) -> bool {
        info!("venue shutting down, draining symbol workers");
        let handles: Vec<tokio::task::JoinHandle<()>> = self
            .workers
            .drain()
            .map(|(_, worker)| {
                drop(worker.tx);
                worker.handle
            })
            .collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.drain_grace, drain).await.is_err() {
            warn!("drain grace period expired with workers still busy");
        }
        self.heartbeat.abort();
        let clean = !self.halted.load(Ordering::SeqCst);
        info!(clean, "venue stopped");
        clean
    }
}

fn enqueue(tx: &mpsc::Sender<EngineCommand>, cmd: EngineCommand) -> Result<(), EngineError> {
    tx.try_send(cmd).map_err(|_| EngineError::Busy)
}

/// Convert a boundary command into a scaled request. All decimal parsing
/// errors surface as `Validation` before anything reaches the worker.
fn to_submit_request(info: &SymbolInfo, cmd: &SubmitCommand) -> Result<SubmitRequest, EngineError> {
    let qty = info
        .parse_qty(cmd.qty)
        .map_err(|e| EngineError::validation(format!("qty: {e}")))?;

    let needs_limit_price = matches!(cmd.order_type, OrderType::Limit | OrderType::StopLimit);
    let price = match (needs_limit_price, cmd.price) {
        (true, Some(price)) => info
            .parse_price(price)
            .map_err(|e| EngineError::validation(format!("price: {e}")))?,
        (true, None) => {
            return Err(EngineError::validation("price required for limit orders"));
        }
        (false, None) => 0,
        (false, Some(_)) => {
            return Err(EngineError::validation("price is only valid for limit orders"));
        }
    };

    let needs_stop = cmd.order_type.is_stop();
    let stop_price = match (needs_stop, cmd.stop_price) {
        (true, Some(stop)) => Some(
            info.parse_price(stop)
                .map_err(|e| EngineError::validation(format!("stop price: {e}")))?,
        ),
        (true, None) => return Err(EngineError::validation("stop price required")),
        (false, None) => None,
        (false, Some(_)) => {
            return Err(EngineError::validation(
                "stop price is only valid for stop orders",
            ));
        }
    };

    let display_qty = match cmd.display_qty {
        Some(display) => Some(
            info.parse_qty(display)
                .map_err(|e| EngineError::validation(format!("display qty: {e}")))?,
        ),
        None => None,
    };

    Ok(SubmitRequest {
        user_id: cmd.user_id,
        client_order_id: cmd.client_order_id.clone(),
        side: cmd.side,
        order_type: cmd.order_type,
        qty,
        price,
        stop_price,
        time_in_force: cmd.time_in_force,
        display_qty,
    })
}

/// The single-writer loop for one symbol. Commands apply strictly in
/// arrival order; a fatal engine error halts the worker after answering
/// the in-flight caller.
async fn run_worker(
    mut engine: SymbolEngine,
    mut rx: mpsc::Receiver<EngineCommand>,
    halted: Arc<AtomicBool>,
) {
    let symbol = engine.symbol().to_string();
    info!(%symbol, "symbol worker started");
    while let Some(command) = rx.recv().await {
        match command {
            EngineCommand::Submit { req, reply } => {
                let started_at = Utc::now();
                let result = engine.submit(req);
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                if fatal {
                    if let Err(e) = &result {
                        error!(
                            %symbol,
                            %started_at,
                            "fatal engine error, halting symbol worker: {e}"
                        );
                    }
                    halted.store(true, Ordering::SeqCst);
                }
                let _ = reply.send(result);
                if fatal {
                    return;
                }
            }
            EngineCommand::Cancel {
                order_id,
                user_id,
                reply,
            } => {
                let result = engine.cancel(order_id, user_id);
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                if fatal {
                    if let Err(e) = &result {
                        error!(%symbol, order_id, "fatal engine error, halting symbol worker: {e}");
                    }
                    halted.store(true, Ordering::SeqCst);
                }
                let _ = reply.send(result);
                if fatal {
                    return;
                }
            }
            EngineCommand::Depth { limit, reply } => {
                let _ = reply.send(engine.depth(limit));
            }
            EngineCommand::Resync { reply } => {
                let _ = reply.send(engine.resync());
            }
        }
    }
    info!(%symbol, "symbol worker drained and stopped");
}

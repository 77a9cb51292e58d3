//! Matching engine - per-symbol single-writer state machine
//!
//! One `SymbolEngine` owns one symbol's order book and processes that
//! symbol's commands strictly sequentially; distinct symbols run on
//! separate workers (see the pipeline module). Every mutation of the book,
//! the order/trade stores and the balance ledger for a symbol happens here.
//!
//! # Matching loop
//!
//! After a new limit order rests, the loop runs while the book is crossed
//! (`best_bid >= best_ask`). The order that arrived earlier at the top of
//! its side is the maker; the trade executes at the maker's limit price,
//! so price improvement always accrues to the taker.
//!
//! # Failure semantics
//!
//! `settle` runs before any book or store mutation for a fill. If it
//! reports an `InvariantViolation` the in-flight match is abandoned with
//! the book unchanged, the error is logged with full context and the
//! symbol worker halts until manual intervention. Event publication
//! failures never roll back state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::balance_store::{BalanceStore, Settlement};
use crate::core_types::{AssetId, OrderId, SeqNum, UserId};
use crate::error::EngineError;
use crate::events::messages::{DepthPayload, OrderSnapshot, ResyncSnapshot, TradeSnapshot};
use crate::events::{Channel, EventPublisher};
use crate::fee::calculate_fee;
use crate::models::{Order, OrderStatus, OrderType, Side, TimeInForce, Trade};
use crate::order_store::OrderStore;
use crate::orderbook::{BookOrder, DepthSnapshot, OrderBook};
use crate::symbol_registry::{SymbolInfo, SymbolRegistry};
use crate::trade_store::TradeStore;

/// A validated, scaled submission. Decimal parsing and symbol resolution
/// happen at the pipeline boundary; the engine only sees scaled integers.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub client_order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: u64,
    /// Limit price; 0 for MARKET / STOP.
    pub price: u64,
    pub stop_price: Option<u64>,
    pub time_in_force: TimeInForce,
    pub display_qty: Option<u64>,
}

/// Cancel acknowledgement. Cancels are idempotent: re-cancelling a
/// terminal order succeeds with `AlreadyTerminal` and no state change.
#[derive(Debug, Clone)]
pub enum CancelAck {
    Cancelled(Order),
    AlreadyTerminal(Order),
}

impl CancelAck {
    pub fn order(&self) -> &Order {
        match self {
            CancelAck::Cancelled(order) | CancelAck::AlreadyTerminal(order) => order,
        }
    }
}

/// Remaining locked funds backing an order's unfilled remainder.
#[derive(Debug, Clone, Copy)]
struct OrderLock {
    asset: AssetId,
    remaining: u64,
}

/// A stop order resting off-book until its trigger fires.
#[derive(Debug, Clone)]
struct PendingStop {
    order_id: OrderId,
    side: Side,
    stop_price: u64,
    seq: SeqNum,
    /// Walk bound for the market leg of a triggered STOP, fixed at
    /// acceptance from the locked amount. None for STOP_LIMIT.
    price_bound: Option<u64>,
}

/// One side of a fill.
#[derive(Debug, Clone, Copy)]
struct Party {
    user_id: UserId,
    order_id: OrderId,
    /// The buy order's limit price, for price-improvement lock release.
    /// None when this party buys at market.
    limit_price: Option<u64>,
    /// Whether this party's order rests in the book (its top-of-side
    /// entry must advance with the fill).
    in_book: bool,
}

/// Per-symbol matching state machine.
pub struct SymbolEngine {
    info: SymbolInfo,
    registry: Arc<SymbolRegistry>,
    balances: Arc<BalanceStore>,
    orders: Arc<OrderStore>,
    trades: Arc<TradeStore>,
    publisher: Arc<EventPublisher>,
    book: OrderBook,
    stops: Vec<PendingStop>,
    locks: FxHashMap<OrderId, OrderLock>,
    order_ids: Arc<AtomicU64>,
    trade_ids: Arc<AtomicU64>,
    seq: SeqNum,
    last_trade_price: Option<u64>,
    max_slippage_bps: u64,
    depth_levels: usize,
}

impl SymbolEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: SymbolInfo,
        registry: Arc<SymbolRegistry>,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
        publisher: Arc<EventPublisher>,
        order_ids: Arc<AtomicU64>,
        trade_ids: Arc<AtomicU64>,
        max_slippage_bps: u64,
        depth_levels: usize,
    ) -> Self {
        Self {
            info,
            registry,
            balances,
            orders,
            trades,
            publisher,
            book: OrderBook::new(),
            stops: Vec::new(),
            locks: FxHashMap::default(),
            order_ids,
            trade_ids,
            seq: 0,
            last_trade_price: None,
            max_slippage_bps,
            depth_levels,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.info.symbol
    }

    /// Rebuild the book, the stop ledger and the lock bookkeeping from the
    /// order store. Balance rows are assumed to already carry the matching
    /// locked amounts (they are restored by the same bootstrapper).
    pub fn hydrate(&mut self) -> Result<(), EngineError> {
        let open = self.orders.open_by_symbol(self.info.symbol_id, None);
        let restored = open.len();
        for order in open {
            self.seq = self.seq.max(order.seq);
            self.order_ids.fetch_max(order.order_id, Ordering::Relaxed);

            let lock = self.resting_lock(&order)?;
            self.locks.insert(order.order_id, lock);

            if order.order_type.is_stop() {
                let stop_price = order
                    .stop_price
                    .ok_or_else(|| EngineError::invariant("stop order without stop price"))?;
                let price_bound = match order.order_type {
                    OrderType::Stop => Some(self.market_bound(order.side, stop_price)?),
                    _ => None,
                };
                self.stops.push(PendingStop {
                    order_id: order.order_id,
                    side: order.side,
                    stop_price,
                    seq: order.seq,
                    price_bound,
                });
            } else {
                self.book.insert(BookOrder::from(&order));
            }
        }
        info!(symbol = %self.info.symbol, restored, "order book hydrated");
        Ok(())
    }

    /// Lock still backing a resting order's remainder, for hydration.
    fn resting_lock(&self, order: &Order) -> Result<OrderLock, EngineError> {
        match order.side {
            Side::Sell => Ok(OrderLock {
                asset: self.info.base_asset_id,
                remaining: order.remaining_qty(),
            }),
            Side::Buy => {
                let price = match order.order_type {
                    OrderType::Limit | OrderType::StopLimit => order.price,
                    OrderType::Stop => {
                        let stop_price = order
                            .stop_price
                            .ok_or_else(|| EngineError::invariant("stop order without stop price"))?;
                        self.market_bound(Side::Buy, stop_price)?
                    }
                    OrderType::Market => {
                        return Err(EngineError::invariant("market order resting in store"));
                    }
                };
                let remaining = self
                    .info
                    .quote_amount(price, order.remaining_qty())
                    .map_err(|e| EngineError::invariant(format!("hydrate lock: {e}")))?;
                Ok(OrderLock {
                    asset: self.info.quote_asset_id,
                    remaining,
                })
            }
        }
    }

    // ============================================================
    // SUBMIT
    // ============================================================

    pub fn submit(&mut self, req: SubmitRequest) -> Result<Order, EngineError> {
        self.validate(&req)?;

        let now = Utc::now();
        let order_id = self.order_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.seq += 1;
        let order = Order {
            order_id,
            user_id: req.user_id,
            client_order_id: req.client_order_id.clone(),
            symbol_id: self.info.symbol_id,
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            stop_price: req.stop_price,
            qty: req.qty,
            filled_qty: 0,
            display_qty: req.display_qty,
            status: OrderStatus::Open,
            time_in_force: req.time_in_force,
            seq: self.seq,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        // Market orders walk up to a slippage-capped price; the cap also
        // sizes the quote pre-lock for market buys. An empty opposite book
        // leaves nothing to price against: reject without locking.
        let price_bound = match order.order_type {
            OrderType::Market => {
                let reference = match order.side {
                    Side::Buy => self.book.best_ask(),
                    Side::Sell => self.book.best_bid(),
                };
                match reference {
                    Some(best) => Some(self.market_bound(order.side, best)?),
                    None => {
                        debug!(order_id, symbol = %self.info.symbol, "market order into empty book");
                        return self.persist_rejected(order);
                    }
                }
            }
            OrderType::Stop => {
                let stop_price = order
                    .stop_price
                    .ok_or_else(|| EngineError::validation("stop price required"))?;
                Some(self.market_bound(order.side, stop_price)?)
            }
            _ => None,
        };

        let (lock_asset, lock_amount) = self.lock_requirement(&order, price_bound)?;
        if let Err(err) = self.balances.lock(order.user_id, lock_asset, lock_amount) {
            return match err {
                EngineError::InsufficientFunds { .. } => {
                    self.persist_rejected(order)?;
                    Err(err)
                }
                other => Err(other),
            };
        }

        if let Err(err) = self.orders.insert(order.clone()) {
            // The order never existed; give the lock back.
            self.balances.unlock(order.user_id, lock_asset, lock_amount)?;
            return Err(err);
        }
        self.locks.insert(order_id, OrderLock {
            asset: lock_asset,
            remaining: lock_amount,
        });
        self.publish_order(&order);

        match order.order_type {
            OrderType::Stop | OrderType::StopLimit => {
                let stop_price = order
                    .stop_price
                    .ok_or_else(|| EngineError::invariant("stop order without stop price"))?;
                self.stops.push(PendingStop {
                    order_id,
                    side: order.side,
                    stop_price,
                    seq: order.seq,
                    price_bound,
                });
                Ok(order)
            }
            OrderType::Market => {
                let bound = price_bound
                    .ok_or_else(|| EngineError::invariant("market order without price bound"))?;
                let result = self.execute_market(&order, bound)?;
                self.trigger_stops()?;
                self.publish_depth();
                Ok(result)
            }
            OrderType::Limit => {
                if order.time_in_force == TimeInForce::Fok {
                    let available = self
                        .book
                        .available_qty(order.side.opposite(), Some(order.price));
                    if available < order.qty as u128 {
                        self.lock_release_all(order_id, order.user_id)?;
                        let rejected = self.orders.mark_rejected(order_id)?;
                        self.publish_order(&rejected);
                        return Ok(rejected);
                    }
                }

                self.book.insert(BookOrder::from(&order));
                self.run_match_loop()?;

                let current = self
                    .orders
                    .get_any(order_id)
                    .ok_or_else(|| EngineError::invariant("submitted order vanished"))?;
                let final_order = if order.time_in_force == TimeInForce::Ioc
                    && current.is_open()
                    && current.remaining_qty() > 0
                {
                    self.book.remove(order_id);
                    self.lock_release_all(order_id, order.user_id)?;
                    let cancelled = self.orders.mark_cancelled(order_id, order.user_id)?;
                    self.publish_order(&cancelled);
                    cancelled
                } else {
                    current
                };

                self.trigger_stops()?;
                self.publish_depth();
                Ok(final_order)
            }
        }
    }

    fn validate(&self, req: &SubmitRequest) -> Result<(), EngineError> {
        if req.qty == 0 {
            return Err(EngineError::validation("quantity must be positive"));
        }
        let needs_limit_price =
            matches!(req.order_type, OrderType::Limit | OrderType::StopLimit);
        if needs_limit_price && req.price == 0 {
            return Err(EngineError::validation("price must be positive"));
        }
        if !needs_limit_price && req.price != 0 {
            return Err(EngineError::validation("price is only valid for limit orders"));
        }
        match req.order_type {
            OrderType::Stop | OrderType::StopLimit => {
                if req.stop_price.is_none_or(|p| p == 0) {
                    return Err(EngineError::validation("stop price must be positive"));
                }
                if req.time_in_force != TimeInForce::Gtc {
                    return Err(EngineError::validation(
                        "stop orders are good-til-cancelled",
                    ));
                }
            }
            _ => {
                if req.stop_price.is_some() {
                    return Err(EngineError::validation(
                        "stop price is only valid for stop orders",
                    ));
                }
            }
        }
        if req.order_type == OrderType::Market && req.time_in_force == TimeInForce::Fok {
            return Err(EngineError::validation(
                "fill-or-kill applies to limit orders",
            ));
        }
        if let Some(display) = req.display_qty {
            if req.order_type != OrderType::Limit {
                return Err(EngineError::validation(
                    "iceberg display requires a limit order",
                ));
            }
            if display == 0 || display > req.qty {
                return Err(EngineError::validation(
                    "display quantity must be within (0, quantity]",
                ));
            }
        }
        Ok(())
    }

    /// Asset and amount to lock for an accepted order. BUY locks quote at
    /// the limit price (or the slippage-capped bound for market legs),
    /// SELL locks the base quantity.
    fn lock_requirement(
        &self,
        order: &Order,
        price_bound: Option<u64>,
    ) -> Result<(AssetId, u64), EngineError> {
        match order.side {
            Side::Sell => Ok((self.info.base_asset_id, order.qty)),
            Side::Buy => {
                let lock_price = match order.order_type {
                    OrderType::Limit | OrderType::StopLimit => order.price,
                    OrderType::Market | OrderType::Stop => price_bound.ok_or_else(|| {
                        EngineError::invariant("buy lock without a price bound")
                    })?,
                };
                let amount = self
                    .info
                    .quote_amount(lock_price, order.qty)
                    .map_err(|_| EngineError::validation("order notional too large"))?;
                if amount == 0 {
                    return Err(EngineError::validation(
                        "order notional below minimum increment",
                    ));
                }
                Ok((self.info.quote_asset_id, amount))
            }
        }
    }

    /// Slippage-capped walk bound for a market leg: above the reference
    /// price for buys, below it for sells.
    fn market_bound(&self, side: Side, reference: u64) -> Result<u64, EngineError> {
        let slip = (reference as u128 * self.max_slippage_bps as u128) / 10_000;
        match side {
            Side::Buy => u64::try_from(reference as u128 + slip)
                .map_err(|_| EngineError::validation("price too large")),
            Side::Sell => Ok(reference.saturating_sub(slip as u64)),
        }
    }

    fn persist_rejected(&self, mut order: Order) -> Result<Order, EngineError> {
        let now = Utc::now();
        order.status = OrderStatus::Rejected;
        order.updated_at = now;
        order.closed_at = Some(now);
        self.orders.insert(order.clone())?;
        self.publish_order(&order);
        Ok(order)
    }

    // ============================================================
    // MATCHING
    // ============================================================

    /// Match while the book is crossed. The earlier arrival at the top of
    /// its side is the maker and sets the trade price.
    fn run_match_loop(&mut self) -> Result<(), EngineError> {
        loop {
            let (price, qty, buyer, seller, maker_side) = {
                let Some(bid) = self.book.peek_top(Side::Buy) else { break };
                let Some(ask) = self.book.peek_top(Side::Sell) else { break };
                if bid.price < ask.price {
                    break;
                }
                let maker_side = if bid.seq <= ask.seq { Side::Buy } else { Side::Sell };
                let price = match maker_side {
                    Side::Buy => bid.price,
                    Side::Sell => ask.price,
                };
                let qty = bid.remaining_qty().min(ask.remaining_qty());
                let buyer = Party {
                    user_id: bid.user_id,
                    order_id: bid.order_id,
                    limit_price: Some(bid.price),
                    in_book: true,
                };
                let seller = Party {
                    user_id: ask.user_id,
                    order_id: ask.order_id,
                    limit_price: None,
                    in_book: true,
                };
                (price, qty, buyer, seller, maker_side)
            };
            self.execute_trade(price, qty, buyer, seller, maker_side)?;
        }
        Ok(())
    }

    /// Walk the opposite side consuming at each level's price until the
    /// order fills, the book exhausts or the bound is crossed. The
    /// residual never rests: it is rejected when nothing filled, cancelled
    /// otherwise.
    fn execute_market(&mut self, order: &Order, price_bound: u64) -> Result<Order, EngineError> {
        let opposite = order.side.opposite();
        loop {
            let current = self
                .orders
                .get_any(order.order_id)
                .ok_or_else(|| EngineError::invariant("market order vanished"))?;
            if current.is_filled() {
                break;
            }
            let Some((top_price, top_user, top_order_id, top_remaining)) = self
                .book
                .peek_top(opposite)
                .map(|top| (top.price, top.user_id, top.order_id, top.remaining_qty()))
            else {
                break;
            };
            let acceptable = match order.side {
                Side::Buy => top_price <= price_bound,
                Side::Sell => top_price >= price_bound,
            };
            if !acceptable {
                debug!(
                    order_id = order.order_id,
                    top_price, price_bound, "market walk stopped at slippage cap"
                );
                break;
            }
            let qty = current.remaining_qty().min(top_remaining);
            let (buyer, seller) = match order.side {
                Side::Buy => (
                    Party {
                        user_id: order.user_id,
                        order_id: order.order_id,
                        limit_price: None,
                        in_book: false,
                    },
                    Party {
                        user_id: top_user,
                        order_id: top_order_id,
                        limit_price: None,
                        in_book: true,
                    },
                ),
                Side::Sell => (
                    Party {
                        user_id: top_user,
                        order_id: top_order_id,
                        limit_price: Some(top_price),
                        in_book: true,
                    },
                    Party {
                        user_id: order.user_id,
                        order_id: order.order_id,
                        limit_price: None,
                        in_book: false,
                    },
                ),
            };
            self.execute_trade(top_price, qty, buyer, seller, opposite)?;
        }

        let current = self
            .orders
            .get_any(order.order_id)
            .ok_or_else(|| EngineError::invariant("market order vanished"))?;
        if current.is_filled() {
            return Ok(current);
        }
        self.lock_release_all(order.order_id, order.user_id)?;
        let terminal = if current.filled_qty == 0 {
            self.orders.mark_rejected(order.order_id)?
        } else {
            self.orders.mark_cancelled(order.order_id, order.user_id)?
        };
        self.publish_order(&terminal);
        Ok(terminal)
    }

    /// Settle and record one fill.
    ///
    /// `settle` runs first: a failure there aborts the fill with the book
    /// and the stores untouched, and propagates as fatal.
    fn execute_trade(
        &mut self,
        price: u64,
        qty: u64,
        buyer: Party,
        seller: Party,
        maker_side: Side,
    ) -> Result<(), EngineError> {
        let quote_amount = self
            .info
            .quote_amount(price, qty)
            .map_err(|e| EngineError::invariant(format!("quote amount: {e}")))?;
        let (buyer_rate, seller_rate) = match maker_side {
            Side::Buy => (self.info.maker_fee_rate, self.info.taker_fee_rate),
            Side::Sell => (self.info.taker_fee_rate, self.info.maker_fee_rate),
        };
        // Commission on the received asset: buyer pays base, seller quote.
        let buyer_fee = calculate_fee(qty, buyer_rate);
        let seller_fee = calculate_fee(quote_amount, seller_rate);

        self.balances.settle(&Settlement {
            buyer: buyer.user_id,
            seller: seller.user_id,
            base: self.info.base_asset_id,
            quote: self.info.quote_asset_id,
            qty,
            quote_amount,
            buyer_fee,
            seller_fee,
        })?;

        if buyer.in_book {
            self.book.fill_top(Side::Buy, qty);
        }
        if seller.in_book {
            self.book.fill_top(Side::Sell, qty);
        }

        let buyer_prev = self
            .orders
            .get_any(buyer.order_id)
            .ok_or_else(|| EngineError::invariant("buyer order missing"))?;
        let buyer_order = self
            .orders
            .update_fill(buyer.order_id, buyer_prev.filled_qty + qty)?;
        let seller_prev = self
            .orders
            .get_any(seller.order_id)
            .ok_or_else(|| EngineError::invariant("seller order missing"))?;
        let seller_order = self
            .orders
            .update_fill(seller.order_id, seller_prev.filled_qty + qty)?;

        // Lock bookkeeping. The buyer spent `quote_amount` of its locked
        // quote; a limit buyer filling below its limit gets the price
        // improvement unlocked immediately so the remaining lock is always
        // `limit * remaining_qty`.
        self.lock_consume(buyer.order_id, quote_amount);
        if buyer_order.is_filled() {
            self.lock_release_all(buyer.order_id, buyer.user_id)?;
        } else if let Some(limit) = buyer.limit_price {
            let target = self
                .info
                .quote_amount(limit, buyer_order.remaining_qty())
                .map_err(|e| EngineError::invariant(format!("lock target: {e}")))?;
            self.lock_release_down_to(buyer.order_id, buyer.user_id, target)?;
        }
        self.lock_consume(seller.order_id, qty);
        if seller_order.is_filled() {
            self.lock_release_all(seller.order_id, seller.user_id)?;
        }

        let trade_id = self.trade_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (maker_order_id, taker_order_id, taker_side) = match maker_side {
            Side::Buy => (buyer.order_id, seller.order_id, Side::Sell),
            Side::Sell => (seller.order_id, buyer.order_id, Side::Buy),
        };
        let trade = Trade {
            trade_id,
            symbol_id: self.info.symbol_id,
            maker_order_id,
            taker_order_id,
            buyer_user_id: buyer.user_id,
            seller_user_id: seller.user_id,
            price,
            qty,
            buyer_fee,
            seller_fee,
            taker_side,
            created_at: Utc::now(),
        };
        self.trades.insert(trade.clone());
        self.last_trade_price = Some(price);

        self.publish_trade(&trade);
        self.publish_order(&buyer_order);
        self.publish_order(&seller_order);
        Ok(())
    }

    // ============================================================
    // STOP TRIGGERS
    // ============================================================

    /// Fire stops whose trigger the last trade price crossed. Activations
    /// can trade and move the price, so the check loops until quiescent.
    fn trigger_stops(&mut self) -> Result<(), EngineError> {
        loop {
            let Some(last) = self.last_trade_price else {
                return Ok(());
            };
            if self.stops.is_empty() {
                return Ok(());
            }
            let (mut fired, waiting): (Vec<PendingStop>, Vec<PendingStop>) = self
                .stops
                .drain(..)
                .partition(|stop| match stop.side {
                    Side::Buy => last >= stop.stop_price,
                    Side::Sell => last <= stop.stop_price,
                });
            self.stops = waiting;
            if fired.is_empty() {
                return Ok(());
            }
            fired.sort_by_key(|stop| stop.seq);
            for stop in fired {
                self.activate_stop(stop)?;
            }
        }
    }

    fn activate_stop(&mut self, stop: PendingStop) -> Result<(), EngineError> {
        let Some(order) = self.orders.get_any(stop.order_id) else {
            return Ok(());
        };
        if !order.is_open() {
            return Ok(());
        }
        debug!(order_id = order.order_id, stop_price = stop.stop_price, "stop triggered");
        match order.order_type {
            OrderType::Stop => {
                let bound = stop
                    .price_bound
                    .ok_or_else(|| EngineError::invariant("stop without price bound"))?;
                self.execute_market(&order, bound)?;
            }
            OrderType::StopLimit => {
                self.book.insert(BookOrder::from(&order));
                self.run_match_loop()?;
            }
            _ => {
                return Err(EngineError::invariant("non-stop order in stop ledger"));
            }
        }
        self.publish_depth();
        Ok(())
    }

    // ============================================================
    // CANCEL
    // ============================================================

    pub fn cancel(&mut self, order_id: OrderId, user_id: UserId) -> Result<CancelAck, EngineError> {
        let order = self.orders.get_any(order_id).ok_or(EngineError::NotFound)?;
        if order.user_id != user_id {
            return Err(EngineError::NotCancellable);
        }
        if order.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal(order));
        }

        let was_in_book = self.book.remove(order_id).is_some();
        self.stops.retain(|stop| stop.order_id != order_id);
        self.lock_release_all(order_id, user_id)?;
        let cancelled = self.orders.mark_cancelled(order_id, user_id)?;
        self.publish_order(&cancelled);
        if was_in_book {
            self.publish_depth();
        }
        Ok(CancelAck::Cancelled(cancelled))
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn depth(&self, limit: usize) -> DepthSnapshot {
        self.book.aggregate_depth(limit)
    }

    pub fn best_bid(&self) -> Option<u64> {
        self.book.best_bid()
    }

    pub fn best_ask(&self) -> Option<u64> {
        self.book.best_ask()
    }

    /// Recovery snapshot: the symbol's open orders plus top-of-book.
    pub fn resync(&self) -> ResyncSnapshot {
        let open_orders = self
            .orders
            .open_by_symbol(self.info.symbol_id, None)
            .iter()
            .map(|order| OrderSnapshot::from_order(order, &self.info))
            .collect();
        ResyncSnapshot {
            symbol: self.info.symbol.clone(),
            open_orders,
            best_bid: self.book.best_bid().map(|p| self.info.price_to_decimal(p)),
            best_ask: self.book.best_ask().map(|p| self.info.price_to_decimal(p)),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    // ============================================================
    // LOCK BOOKKEEPING
    // ============================================================

    fn lock_consume(&mut self, order_id: OrderId, amount: u64) {
        if let Some(lock) = self.locks.get_mut(&order_id) {
            lock.remaining = lock.remaining.saturating_sub(amount);
        }
    }

    fn lock_release_down_to(
        &mut self,
        order_id: OrderId,
        user_id: UserId,
        target: u64,
    ) -> Result<(), EngineError> {
        let Some(lock) = self.locks.get_mut(&order_id) else {
            return Ok(());
        };
        if lock.remaining > target {
            let release = lock.remaining - target;
            let asset = lock.asset;
            lock.remaining = target;
            self.balances.unlock(user_id, asset, release)?;
        }
        Ok(())
    }

    fn lock_release_all(&mut self, order_id: OrderId, user_id: UserId) -> Result<(), EngineError> {
        if let Some(lock) = self.locks.remove(&order_id) {
            if lock.remaining > 0 {
                self.balances.unlock(user_id, lock.asset, lock.remaining)?;
            }
        }
        Ok(())
    }

    // ============================================================
    // EVENTS
    // ============================================================

    fn publish_order(&self, order: &Order) {
        let snapshot = OrderSnapshot::from_order(order, &self.info);
        match serde_json::to_value(&snapshot) {
            Ok(data) => self.publisher.publish(Channel::Order, &self.info.symbol, data),
            Err(e) => warn!(order_id = order.order_id, "order event serialization failed: {e}"),
        }
    }

    fn publish_trade(&self, trade: &Trade) {
        let Some(snapshot) = TradeSnapshot::from_trade(trade, &self.registry) else {
            warn!(trade_id = trade.trade_id, "trade event dropped: symbol not in registry");
            return;
        };
        match serde_json::to_value(&snapshot) {
            Ok(data) => self.publisher.publish(Channel::Trade, &self.info.symbol, data),
            Err(e) => warn!(trade_id = trade.trade_id, "trade event serialization failed: {e}"),
        }
    }

    fn publish_depth(&self) {
        let snapshot = self.book.aggregate_depth(self.depth_levels);
        let payload = DepthPayload::from_snapshot(&snapshot, &self.info);
        match serde_json::to_value(&payload) {
            Ok(data) => self.publisher.publish(Channel::Depth, &self.info.symbol, data),
            Err(e) => warn!(symbol = %self.info.symbol, "depth event serialization failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_registry::SymbolRegistry;

    const BTC: AssetId = 1;
    const USDT: AssetId = 2;
    const FEE_ACCOUNT: UserId = 0;

    struct Fixture {
        engine: SymbolEngine,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
    }

    fn fixture() -> Fixture {
        let mut registry = SymbolRegistry::new();
        registry.add_asset(BTC, "BTC", 8).unwrap();
        registry.add_asset(USDT, "USDT", 6).unwrap();
        registry.add_symbol(1, "BTCUSDT", BTC, USDT).unwrap();
        let registry = Arc::new(registry);
        let balances = Arc::new(BalanceStore::new(FEE_ACCOUNT));
        let orders = Arc::new(OrderStore::new());
        let trades = Arc::new(TradeStore::new());
        let publisher = Arc::new(EventPublisher::new(64));
        let info = registry.symbol(1).unwrap().clone();
        let engine = SymbolEngine::new(
            info,
            Arc::clone(&registry),
            Arc::clone(&balances),
            Arc::clone(&orders),
            Arc::clone(&trades),
            publisher,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            500,
            20,
        );
        Fixture {
            engine,
            balances,
            orders,
            trades,
        }
    }

    fn btc(units: f64) -> u64 {
        (units * 1e8).round() as u64
    }

    fn usdt(units: f64) -> u64 {
        (units * 1e6).round() as u64
    }

    fn limit(user: UserId, side: Side, price: u64, qty: u64) -> SubmitRequest {
        SubmitRequest {
            user_id: user,
            client_order_id: None,
            side,
            order_type: OrderType::Limit,
            qty,
            price,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            display_qty: None,
        }
    }

    #[test]
    fn test_simple_cross_settles_both_sides() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(30_000.0)).unwrap();

        let sell = f
            .engine
            .submit(limit(1, Side::Sell, usdt(30_000.0), btc(1.0)))
            .unwrap();
        assert_eq!(sell.status, OrderStatus::Open);

        let buy = f
            .engine
            .submit(limit(2, Side::Buy, usdt(30_000.0), btc(1.0)))
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(f.trades.len(), 1);

        let trade = &f.trades.by_symbol(1, 1)[0];
        assert_eq!(trade.price, usdt(30_000.0));
        assert_eq!(trade.qty, btc(1.0));
        assert_eq!(trade.maker_order_id, sell.order_id);
        assert_eq!(trade.taker_side, Side::Buy);

        // Seller: locked BTC fully spent, received quote minus 0.1% fee.
        let seller_base = f.balances.get_balance(1, BTC).unwrap();
        assert_eq!((seller_base.free, seller_base.locked), (0, 0));
        assert_eq!(f.balances.get_balance(1, USDT).unwrap().free, usdt(29_970.0));

        // Buyer: locked USDT fully spent, received base minus 0.1% fee.
        let buyer_quote = f.balances.get_balance(2, USDT).unwrap();
        assert_eq!((buyer_quote.free, buyer_quote.locked), (0, 0));
        assert_eq!(f.balances.get_balance(2, BTC).unwrap().free, btc(0.999));

        // Fees landed on the fee account.
        assert_eq!(f.balances.get_balance(FEE_ACCOUNT, BTC).unwrap().free, btc(0.001));
        assert_eq!(
            f.balances.get_balance(FEE_ACCOUNT, USDT).unwrap().free,
            usdt(30.0)
        );
    }

    #[test]
    fn test_partial_fill_keeps_maker_on_top() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(2.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(100.0)).unwrap();

        let sell = f
            .engine
            .submit(limit(1, Side::Sell, usdt(100.0), btc(2.0)))
            .unwrap();
        let buy = f
            .engine
            .submit(limit(2, Side::Buy, usdt(100.0), btc(1.0)))
            .unwrap();

        assert_eq!(buy.status, OrderStatus::Filled);
        let sell_now = f.orders.get_any(sell.order_id).unwrap();
        assert_eq!(sell_now.status, OrderStatus::PartiallyFilled);
        assert_eq!(sell_now.filled_qty, btc(1.0));
        assert_eq!(f.engine.best_ask(), Some(usdt(100.0)));
        assert_eq!(
            f.engine.depth(5).asks,
            vec![(usdt(100.0), btc(1.0))]
        );
    }

    #[test]
    fn test_price_priority_trades_at_maker_price() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(2.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(101.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();
        f.engine.submit(limit(1, Side::Sell, usdt(99.0), btc(1.0))).unwrap();

        let buy = f
            .engine
            .submit(limit(2, Side::Buy, usdt(101.0), btc(1.0)))
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);

        let trade = &f.trades.by_symbol(1, 1)[0];
        // Best priced ask (99) matched first, at the maker's price.
        assert_eq!(trade.price, usdt(99.0));
        assert_eq!(f.engine.best_ask(), Some(usdt(100.0)));
    }

    #[test]
    fn test_time_priority_fifo() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(2, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(3, USDT, usdt(100.0)).unwrap();

        let first = f
            .engine
            .submit(limit(1, Side::Sell, usdt(100.0), btc(1.0)))
            .unwrap();
        f.engine.submit(limit(2, Side::Sell, usdt(100.0), btc(1.0))).unwrap();

        f.engine.submit(limit(3, Side::Buy, usdt(100.0), btc(1.0))).unwrap();

        let trade = &f.trades.by_symbol(1, 1)[0];
        assert_eq!(trade.maker_order_id, first.order_id);
        assert_eq!(trade.seller_user_id, 1);
    }

    #[test]
    fn test_insufficient_funds_rejects_and_persists() {
        let mut f = fixture();
        let err = f
            .engine
            .submit(limit(9, Side::Buy, usdt(30_000.0), btc(1.0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        // The rejection is persisted and retrievable.
        let rejected = f.orders.open_by_user(9);
        assert!(rejected.is_empty());
        let stored = f.orders.get_any(1).unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        // No book or balance disturbance.
        assert!(f.engine.best_bid().is_none());
        assert!(f.balances.get_balance(9, USDT).is_none());
    }

    #[test]
    fn test_ioc_residual_cancelled() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(200.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();

        let mut req = limit(2, Side::Buy, usdt(100.0), btc(2.0));
        req.time_in_force = TimeInForce::Ioc;
        let buy = f.engine.submit(req).unwrap();

        assert_eq!(buy.status, OrderStatus::Cancelled);
        assert_eq!(buy.filled_qty, btc(1.0));
        assert!(f.engine.best_ask().is_none());
        assert!(f.engine.best_bid().is_none());
        // Residual quote lock fully released.
        assert_eq!(f.balances.get_balance(2, USDT).unwrap().locked, 0);
    }

    #[test]
    fn test_fok_rejects_without_insertion() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(300.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();

        let mut req = limit(2, Side::Buy, usdt(100.0), btc(3.0));
        req.time_in_force = TimeInForce::Fok;
        let buy = f.engine.submit(req).unwrap();

        assert_eq!(buy.status, OrderStatus::Rejected);
        assert_eq!(buy.filled_qty, 0);
        // The resting ask is untouched and the lock is back.
        assert_eq!(f.engine.best_ask(), Some(usdt(100.0)));
        let quote = f.balances.get_balance(2, USDT).unwrap();
        assert_eq!((quote.free, quote.locked), (usdt(300.0), 0));
    }

    #[test]
    fn test_fok_fills_when_liquidity_suffices() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(2.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(200.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();
        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();

        let mut req = limit(2, Side::Buy, usdt(100.0), btc(2.0));
        req.time_in_force = TimeInForce::Fok;
        let buy = f.engine.submit(req).unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
    }

    #[test]
    fn test_cancel_unlocks_remaining() {
        let mut f = fixture();
        f.balances.credit_deposit(1, USDT, usdt(100.0)).unwrap();

        let buy = f
            .engine
            .submit(limit(1, Side::Buy, usdt(100.0), btc(1.0)))
            .unwrap();
        let locked = f.balances.get_balance(1, USDT).unwrap().locked;
        assert_eq!(locked, usdt(100.0));

        let ack = f.engine.cancel(buy.order_id, 1).unwrap();
        assert!(matches!(ack, CancelAck::Cancelled(_)));
        let quote = f.balances.get_balance(1, USDT).unwrap();
        assert_eq!((quote.free, quote.locked), (usdt(100.0), 0));

        // Idempotent: a second cancel acknowledges without change.
        let again = f.engine.cancel(buy.order_id, 1).unwrap();
        assert!(matches!(again, CancelAck::AlreadyTerminal(_)));
    }

    #[test]
    fn test_cancel_foreign_order_not_cancellable() {
        let mut f = fixture();
        f.balances.credit_deposit(1, USDT, usdt(100.0)).unwrap();
        let buy = f
            .engine
            .submit(limit(1, Side::Buy, usdt(100.0), btc(1.0)))
            .unwrap();
        assert_eq!(
            f.engine.cancel(buy.order_id, 42).unwrap_err(),
            EngineError::NotCancellable
        );
        assert_eq!(f.engine.cancel(999, 1).unwrap_err(), EngineError::NotFound);
    }

    #[test]
    fn test_taker_price_improvement_refunds_lock() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(1.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(110.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();
        // Taker bids 110, fills at 100: the 10 USDT improvement unlocks.
        let buy = f
            .engine
            .submit(limit(2, Side::Buy, usdt(110.0), btc(1.0)))
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);

        let quote = f.balances.get_balance(2, USDT).unwrap();
        assert_eq!((quote.free, quote.locked), (usdt(10.0), 0));
    }

    #[test]
    fn test_market_buy_walks_until_slippage_cap() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(3.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(1_000.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();
        f.engine.submit(limit(1, Side::Sell, usdt(104.0), btc(1.0))).unwrap();
        // 5% cap over best ask 100 = 105: this level is out of reach.
        f.engine.submit(limit(1, Side::Sell, usdt(110.0), btc(1.0))).unwrap();

        let market = SubmitRequest {
            user_id: 2,
            client_order_id: None,
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: btc(3.0),
            price: 0,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            display_qty: None,
        };
        let result = f.engine.submit(market).unwrap();

        // Filled 2, residual cancelled, never rested.
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert_eq!(result.filled_qty, btc(2.0));
        assert_eq!(f.engine.best_ask(), Some(usdt(110.0)));
        assert!(f.engine.best_bid().is_none());
        // The cap-sized pre-lock is fully released.
        assert_eq!(f.balances.get_balance(2, USDT).unwrap().locked, 0);
    }

    #[test]
    fn test_market_into_empty_book_rejected() {
        let mut f = fixture();
        f.balances.credit_deposit(2, USDT, usdt(1_000.0)).unwrap();
        let market = SubmitRequest {
            user_id: 2,
            client_order_id: None,
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: btc(1.0),
            price: 0,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            display_qty: None,
        };
        let result = f.engine.submit(market).unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        // Nothing was locked.
        assert_eq!(f.balances.get_balance(2, USDT).unwrap().free, usdt(1_000.0));
    }

    #[test]
    fn test_stop_limit_triggers_on_trade_price() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(3.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(1_000.0)).unwrap();
        f.balances.credit_deposit(3, USDT, usdt(120.0)).unwrap();

        // User 3 arms a stop-limit buy: trigger at 105, limit 110.
        let stop = SubmitRequest {
            user_id: 3,
            client_order_id: None,
            side: Side::Buy,
            order_type: OrderType::StopLimit,
            qty: btc(1.0),
            price: usdt(110.0),
            stop_price: Some(usdt(105.0)),
            time_in_force: TimeInForce::Gtc,
            display_qty: None,
        };
        let armed = f.engine.submit(stop).unwrap();
        assert_eq!(armed.status, OrderStatus::Open);
        // Armed stops are off-book.
        assert!(f.engine.best_bid().is_none());

        // A trade at 100 does not trigger.
        f.engine.submit(limit(1, Side::Sell, usdt(100.0), btc(1.0))).unwrap();
        f.engine.submit(limit(2, Side::Buy, usdt(100.0), btc(1.0))).unwrap();
        assert!(f.orders.get_any(armed.order_id).unwrap().is_open());
        assert!(f.engine.best_bid().is_none());

        // A trade at 106 crosses the trigger; the stop becomes a limit
        // order and lifts the resting 106 ask.
        f.engine.submit(limit(1, Side::Sell, usdt(106.0), btc(2.0))).unwrap();
        f.engine.submit(limit(2, Side::Buy, usdt(106.0), btc(1.0))).unwrap();

        let triggered = f.orders.get_any(armed.order_id).unwrap();
        assert_eq!(triggered.status, OrderStatus::Filled);
        let fills = f.trades.by_order(armed.order_id, 3);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, usdt(106.0));
    }

    #[test]
    fn test_duplicate_client_order_id_rolls_back_lock() {
        let mut f = fixture();
        f.balances.credit_deposit(1, USDT, usdt(500.0)).unwrap();

        let mut first = limit(1, Side::Buy, usdt(100.0), btc(1.0));
        first.client_order_id = Some("dup".into());
        f.engine.submit(first).unwrap();

        let mut second = limit(1, Side::Buy, usdt(100.0), btc(1.0));
        second.client_order_id = Some("dup".into());
        let err = f.engine.submit(second).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Only the first order's lock remains.
        let quote = f.balances.get_balance(1, USDT).unwrap();
        assert_eq!((quote.free, quote.locked), (usdt(400.0), usdt(100.0)));
    }

    #[test]
    fn test_book_never_crossed_at_rest() {
        let mut f = fixture();
        f.balances.credit_deposit(1, BTC, btc(5.0)).unwrap();
        f.balances.credit_deposit(2, USDT, usdt(10_000.0)).unwrap();

        f.engine.submit(limit(1, Side::Sell, usdt(101.0), btc(1.0))).unwrap();
        f.engine.submit(limit(2, Side::Buy, usdt(99.0), btc(1.0))).unwrap();
        f.engine.submit(limit(2, Side::Buy, usdt(103.0), btc(2.0))).unwrap();
        f.engine.submit(limit(1, Side::Sell, usdt(98.0), btc(3.0))).unwrap();

        if let (Some(bid), Some(ask)) = (f.engine.best_bid(), f.engine.best_ask()) {
            assert!(bid < ask, "book crossed at rest: bid {bid} >= ask {ask}");
        }
    }
}

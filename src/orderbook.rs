//! OrderBook - BTreeMap-based price-time priority order book
//!
//! This module contains only the per-symbol book data structure. The
//! matching logic lives in the engine module. The book holds only OPEN and
//! PARTIALLY_FILLED orders; triggered stops enter through the same path as
//! fresh orders.
//!
//! # Key Design:
//! - Asks are stored with normal keys (ascending order, lowest price = best ask)
//! - Bids use negated keys `u64::MAX - price` (so highest price comes first = best bid)
//! - Within a price level orders queue FIFO by acceptance
//!
//! # Complexity:
//! | Operation | Time |
//! |-----------|------|
//! | Insert | O(log n) |
//! | Best price | O(log n) |
//! | Remove by ID | O(1) lookup + O(log n + k) removal |
//! | Depth | O(L) for L levels |

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};

use crate::core_types::{OrderId, SeqNum, UserId};
use crate::models::{Order, Side};

/// A resting order, as tracked by the book. The order store remains the
/// authoritative lifecycle record; the book keeps the hot fields only.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub side: Side,
    pub price: u64,
    pub qty: u64,
    pub filled_qty: u64,
    pub display_qty: Option<u64>,
    pub seq: SeqNum,
}

impl BookOrder {
    #[inline]
    pub fn remaining_qty(&self) -> u64 {
        self.qty - self.filled_qty
    }

    /// Quantity this order contributes to aggregated depth. Iceberg orders
    /// show at most their display quantity.
    #[inline]
    pub fn visible_qty(&self) -> u64 {
        match self.display_qty {
            Some(display) => display.min(self.remaining_qty()),
            None => self.remaining_qty(),
        }
    }
}

impl From<&Order> for BookOrder {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            user_id: order.user_id,
            side: order.side,
            price: order.price,
            qty: order.qty,
            filled_qty: order.filled_qty,
            display_qty: order.display_qty,
            seq: order.seq,
        }
    }
}

/// Aggregated market depth: summed visible quantity per price level.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    /// (price, total_qty), best (highest) bid first
    pub bids: Vec<(u64, u64)>,
    /// (price, total_qty), best (lowest) ask first
    pub asks: Vec<(u64, u64)>,
}

/// The per-symbol order book.
#[derive(Debug, Default)]
pub struct OrderBook {
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<u64, VecDeque<BookOrder>>,
    /// Buy orders: (MAX - price) -> orders (so highest price comes first)
    bids: BTreeMap<u64, VecDeque<BookOrder>>,
    /// OrderId -> (price, side) for O(1) removal lookup
    order_index: FxHashMap<OrderId, (u64, Side)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the best bid price (highest buy price)
    #[inline]
    pub fn best_bid(&self) -> Option<u64> {
        self.bids.first_key_value().map(|(k, _)| u64::MAX - k)
    }

    /// Get the best ask price (lowest sell price)
    #[inline]
    pub fn best_ask(&self) -> Option<u64> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    /// True when `best_bid >= best_ask`. Between commands this must never
    /// hold; the matching loop runs until the book uncrosses.
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }

    /// Number of resting orders.
    pub fn len(&self) -> usize {
        self.order_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order_index.is_empty()
    }

    /// Rest an order in the book, FIFO within its price level.
    pub fn insert(&mut self, order: BookOrder) {
        self.order_index
            .insert(order.order_id, (order.price, order.side));
        match order.side {
            Side::Buy => {
                let key = u64::MAX - order.price;
                self.bids.entry(key).or_default().push_back(order);
            }
            Side::Sell => {
                self.asks.entry(order.price).or_default().push_back(order);
            }
        }
    }

    /// Front of the best price level on a side.
    pub fn peek_top(&self, side: Side) -> Option<&BookOrder> {
        match side {
            Side::Buy => self.bids.first_key_value().and_then(|(_, l)| l.front()),
            Side::Sell => self.asks.first_key_value().and_then(|(_, l)| l.front()),
        }
    }

    /// Apply a fill to the top order of a side. Returns the updated entry
    /// and whether it was removed (fully filled). Cleans up empty levels.
    pub fn fill_top(&mut self, side: Side, qty: u64) -> Option<(BookOrder, bool)> {
        let mut entry = match side {
            Side::Buy => self.bids.first_entry()?,
            Side::Sell => self.asks.first_entry()?,
        };
        let level = entry.get_mut();
        let front = level.front_mut()?;
        front.filled_qty += qty;
        let snapshot = front.clone();
        let removed = snapshot.remaining_qty() == 0;
        if removed {
            level.pop_front();
            if level.is_empty() {
                entry.remove();
            }
            self.order_index.remove(&snapshot.order_id);
        }
        Some((snapshot, removed))
    }

    /// Remove an order by ID only (uses the order index for fast lookup).
    ///
    /// Returns the removed order if found.
    pub fn remove(&mut self, order_id: OrderId) -> Option<BookOrder> {
        let (price, side) = self.order_index.remove(&order_id)?;

        let (book, key) = match side {
            Side::Buy => (&mut self.bids, u64::MAX - price),
            Side::Sell => (&mut self.asks, price),
        };

        let level = book.get_mut(&key)?;
        let pos = level.iter().position(|o| o.order_id == order_id)?;
        let order = level.remove(pos)?;

        if level.is_empty() {
            book.remove(&key);
        }

        Some(order)
    }

    /// Liquidity resting on `side` at acceptable prices, used by the FOK
    /// pre-check. `price_limit` bounds the walk: for asks only levels at or
    /// below it count, for bids only levels at or above it.
    pub fn available_qty(&self, side: Side, price_limit: Option<u64>) -> u128 {
        let mut total: u128 = 0;
        match side {
            Side::Sell => {
                for (&price, level) in &self.asks {
                    if price_limit.is_some_and(|limit| price > limit) {
                        break;
                    }
                    total += level.iter().map(|o| o.remaining_qty() as u128).sum::<u128>();
                }
            }
            Side::Buy => {
                for (&key, level) in &self.bids {
                    let price = u64::MAX - key;
                    if price_limit.is_some_and(|limit| price < limit) {
                        break;
                    }
                    total += level.iter().map(|o| o.remaining_qty() as u128).sum::<u128>();
                }
            }
        }
        total
    }

    /// Top-N aggregated depth per side, summing visible quantity per level.
    pub fn aggregate_depth(&self, limit: usize) -> DepthSnapshot {
        let bids: Vec<(u64, u64)> = self
            .bids
            .iter()
            .take(limit)
            .map(|(&key, level)| {
                let price = u64::MAX - key;
                let qty: u64 = level.iter().map(|o| o.visible_qty()).sum();
                (price, qty)
            })
            .collect();

        let asks: Vec<(u64, u64)> = self
            .asks
            .iter()
            .take(limit)
            .map(|(&price, level)| {
                let qty: u64 = level.iter().map(|o| o.visible_qty()).sum();
                (price, qty)
            })
            .collect();

        DepthSnapshot { bids, asks }
    }
}

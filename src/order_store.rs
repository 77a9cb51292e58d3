//! Order store - lifecycle record of every order
//!
//! Append and update-by-id access, shared by the engine (writes) and the
//! query API (reads). Status transitions are enforced here: terminal
//! states are immutable and `closed_at` is stamped exactly when an order
//! turns terminal.

use std::sync::RwLock;

use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::core_types::{OrderId, SymbolId, UserId};
use crate::error::EngineError;
use crate::models::{Order, OrderStatus, Side};

#[derive(Default)]
struct Inner {
    orders: FxHashMap<OrderId, Order>,
    /// Unique (user, client_order_id) index.
    client_ids: FxHashMap<(UserId, String), OrderId>,
    open_by_symbol: FxHashMap<SymbolId, FxHashSet<OrderId>>,
}

impl Inner {
    fn set_open_membership(&mut self, order: &Order) {
        let set = self.open_by_symbol.entry(order.symbol_id).or_default();
        if order.is_open() {
            set.insert(order.order_id);
        } else {
            set.remove(&order.order_id);
        }
    }
}

pub struct OrderStore {
    inner: RwLock<Inner>,
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::invariant("order store lock poisoned"))
    }

    /// Persist a new order. Rejects a duplicate client order id for the
    /// same user with `Validation`.
    pub fn insert(&self, order: Order) -> Result<(), EngineError> {
        let mut inner = self.write()?;
        if let Some(cid) = &order.client_order_id {
            let key = (order.user_id, cid.clone());
            if inner.client_ids.contains_key(&key) {
                return Err(EngineError::validation(format!(
                    "duplicate client order id {cid}"
                )));
            }
            inner.client_ids.insert(key, order.order_id);
        }
        inner.set_open_membership(&order);
        inner.orders.insert(order.order_id, order);
        Ok(())
    }

    /// Advance an order's filled quantity. Status follows `filled` vs
    /// `quantity`; `closed_at` is stamped when the order turns terminal.
    pub fn update_fill(&self, id: OrderId, new_filled: u64) -> Result<Order, EngineError> {
        let mut inner = self.write()?;
        let order = inner.orders.get_mut(&id).ok_or(EngineError::NotFound)?;
        if order.status.is_terminal() {
            return Err(EngineError::invariant(format!(
                "fill update on terminal order {id}"
            )));
        }
        if new_filled < order.filled_qty || new_filled > order.qty {
            return Err(EngineError::invariant(format!(
                "fill update out of bounds: order {id} filled {} -> {new_filled} of {}",
                order.filled_qty, order.qty
            )));
        }
        order.filled_qty = new_filled;
        let now = Utc::now();
        order.updated_at = now;
        if new_filled == order.qty {
            order.status = OrderStatus::Filled;
            order.closed_at = Some(now);
        } else if new_filled > 0 {
            order.status = OrderStatus::PartiallyFilled;
        }
        let snapshot = order.clone();
        inner.set_open_membership(&snapshot);
        Ok(snapshot)
    }

    /// Cancel an open order. `NotCancellable` for terminal orders,
    /// `NotFound` for unknown or foreign orders.
    pub fn mark_cancelled(&self, id: OrderId, user: UserId) -> Result<Order, EngineError> {
        let mut inner = self.write()?;
        let order = inner.orders.get_mut(&id).ok_or(EngineError::NotFound)?;
        if order.user_id != user {
            return Err(EngineError::NotFound);
        }
        if !order.is_open() {
            return Err(EngineError::NotCancellable);
        }
        let now = Utc::now();
        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        order.closed_at = Some(now);
        let snapshot = order.clone();
        inner.set_open_membership(&snapshot);
        Ok(snapshot)
    }

    /// Reject an order that never entered (or never rested in) the book:
    /// insufficient funds, failed FOK pre-check, unfillable market order.
    pub fn mark_rejected(&self, id: OrderId) -> Result<Order, EngineError> {
        let mut inner = self.write()?;
        let order = inner.orders.get_mut(&id).ok_or(EngineError::NotFound)?;
        if order.status.is_terminal() {
            return Err(EngineError::invariant(format!(
                "reject on terminal order {id}"
            )));
        }
        let now = Utc::now();
        order.status = OrderStatus::Rejected;
        order.updated_at = now;
        order.closed_at = Some(now);
        let snapshot = order.clone();
        inner.set_open_membership(&snapshot);
        Ok(snapshot)
    }

    /// Owner-scoped lookup.
    pub fn get(&self, id: OrderId, user: UserId) -> Option<Order> {
        let inner = self.inner.read().ok()?;
        inner
            .orders
            .get(&id)
            .filter(|o| o.user_id == user)
            .cloned()
    }

    /// Unscoped lookup for engine internals (cancel routing).
    pub fn get_any(&self, id: OrderId) -> Option<Order> {
        let inner = self.inner.read().ok()?;
        inner.orders.get(&id).cloned()
    }

    /// Open orders of a symbol in deterministic hydration order: bids by
    /// descending price, asks by ascending price, FIFO (`seq`) within a
    /// level.
    pub fn open_by_symbol(&self, symbol: SymbolId, limit: Option<usize>) -> Vec<Order> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut open: Vec<Order> = inner
            .open_by_symbol
            .get(&symbol)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.orders.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        open.sort_by(|a, b| {
            use std::cmp::Ordering;
            match (a.side, b.side) {
                (Side::Buy, Side::Sell) => Ordering::Less,
                (Side::Sell, Side::Buy) => Ordering::Greater,
                (Side::Buy, Side::Buy) => b.price.cmp(&a.price).then(a.seq.cmp(&b.seq)),
                (Side::Sell, Side::Sell) => a.price.cmp(&b.price).then(a.seq.cmp(&b.seq)),
            }
        });
        if let Some(limit) = limit {
            open.truncate(limit);
        }
        open
    }

    /// All open orders of one user, for resync snapshots.
    pub fn open_by_user(&self, user: UserId) -> Vec<Order> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut open: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.user_id == user && o.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|o| o.order_id);
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, TimeInForce};

    fn order(id: OrderId, user: UserId, side: Side, price: u64, qty: u64) -> Order {
        let now = Utc::now();
        Order {
            order_id: id,
            user_id: user,
            client_order_id: None,
            symbol_id: 1,
            side,
            order_type: OrderType::Limit,
            price,
            stop_price: None,
            qty,
            filled_qty: 0,
            display_qty: None,
            status: OrderStatus::Open,
            time_in_force: TimeInForce::Gtc,
            seq: id,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    #[test]
    fn test_insert_and_get_scoped_by_owner() {
        let store = OrderStore::new();
        store.insert(order(1, 100, Side::Buy, 50, 10)).unwrap();
        assert!(store.get(1, 100).is_some());
        assert!(store.get(1, 999).is_none());
    }

    #[test]
    fn test_duplicate_client_order_id_rejected() {
        let store = OrderStore::new();
        let mut first = order(1, 100, Side::Buy, 50, 10);
        first.client_order_id = Some("abc".into());
        store.insert(first).unwrap();

        let mut dup = order(2, 100, Side::Buy, 51, 10);
        dup.client_order_id = Some("abc".into());
        assert!(matches!(
            store.insert(dup),
            Err(EngineError::Validation(_))
        ));

        // Same cid from a different user is fine.
        let mut other = order(3, 200, Side::Buy, 51, 10);
        other.client_order_id = Some("abc".into());
        store.insert(other).unwrap();
    }

    #[test]
    fn test_update_fill_transitions() {
        let store = OrderStore::new();
        store.insert(order(1, 100, Side::Buy, 50, 10)).unwrap();

        let partial = store.update_fill(1, 4).unwrap();
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
        assert!(partial.closed_at.is_none());

        let filled = store.update_fill(1, 10).unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert!(filled.closed_at.is_some());

        // Terminal orders are immutable.
        assert!(matches!(
            store.update_fill(1, 10),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_update_fill_bounds() {
        let store = OrderStore::new();
        store.insert(order(1, 100, Side::Buy, 50, 10)).unwrap();
        store.update_fill(1, 5).unwrap();
        assert!(store.update_fill(1, 4).is_err()); // regression
        assert!(store.update_fill(1, 11).is_err()); // beyond quantity
    }

    #[test]
    fn test_mark_cancelled() {
        let store = OrderStore::new();
        store.insert(order(1, 100, Side::Buy, 50, 10)).unwrap();

        let cancelled = store.mark_cancelled(1, 100).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.closed_at.is_some());

        assert_eq!(
            store.mark_cancelled(1, 100).unwrap_err(),
            EngineError::NotCancellable
        );
        assert_eq!(
            store.mark_cancelled(1, 999).unwrap_err(),
            EngineError::NotFound
        );
    }

    #[test]
    fn test_open_by_symbol_hydration_order() {
        let store = OrderStore::new();
        store.insert(order(1, 100, Side::Sell, 101, 10)).unwrap();
        store.insert(order(2, 100, Side::Buy, 99, 10)).unwrap();
        store.insert(order(3, 100, Side::Buy, 100, 10)).unwrap();
        store.insert(order(4, 100, Side::Buy, 100, 10)).unwrap();
        store.insert(order(5, 100, Side::Sell, 102, 10)).unwrap();
        // A filled order must not hydrate.
        store.insert(order(6, 100, Side::Sell, 103, 10)).unwrap();
        store.update_fill(6, 10).unwrap();

        let ids: Vec<OrderId> = store
            .open_by_symbol(1, None)
            .iter()
            .map(|o| o.order_id)
            .collect();
        // Bids first (descending price, FIFO), then asks (ascending price).
        assert_eq!(ids, vec![3, 4, 2, 1, 5]);
    }
}

//! Trade store - append-only record of executed fills
//!
//! Trades are created only inside the matching engine and never modified
//! after insertion. Secondary indexes serve the user/symbol/order queries.

use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::core_types::{OrderId, SymbolId, UserId};
use crate::models::Trade;

#[derive(Default)]
struct Inner {
    trades: Vec<Trade>,
    by_user: FxHashMap<UserId, Vec<usize>>,
    by_symbol: FxHashMap<SymbolId, Vec<usize>>,
    by_order: FxHashMap<OrderId, Vec<usize>>,
}

pub struct TradeStore {
    inner: RwLock<Inner>,
}

impl Default for TradeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn insert(&self, trade: Trade) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let idx = inner.trades.len();
        inner.by_user.entry(trade.buyer_user_id).or_default().push(idx);
        if trade.seller_user_id != trade.buyer_user_id {
            inner
                .by_user
                .entry(trade.seller_user_id)
                .or_default()
                .push(idx);
        }
        inner.by_symbol.entry(trade.symbol_id).or_default().push(idx);
        inner
            .by_order
            .entry(trade.maker_order_id)
            .or_default()
            .push(idx);
        inner
            .by_order
            .entry(trade.taker_order_id)
            .or_default()
            .push(idx);
        inner.trades.push(trade);
    }

    /// Most recent trades of a user, optionally filtered by symbol.
    pub fn by_user(&self, user: UserId, symbol: Option<SymbolId>, limit: usize) -> Vec<Trade> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let Some(indices) = inner.by_user.get(&user) else {
            return Vec::new();
        };
        indices
            .iter()
            .rev()
            .map(|&i| &inner.trades[i])
            .filter(|t| symbol.is_none_or(|s| t.symbol_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent trades of a symbol.
    pub fn by_symbol(&self, symbol: SymbolId, limit: usize) -> Vec<Trade> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let Some(indices) = inner.by_symbol.get(&symbol) else {
            return Vec::new();
        };
        indices
            .iter()
            .rev()
            .take(limit)
            .map(|&i| inner.trades[i].clone())
            .collect()
    }

    /// Fills of one order, visible only to a party of the trade.
    pub fn by_order(&self, order_id: OrderId, user: UserId) -> Vec<Trade> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let Some(indices) = inner.by_order.get(&order_id) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|&i| &inner.trades[i])
            .filter(|t| t.buyer_user_id == user || t.seller_user_id == user)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.trades.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    fn trade(id: u64, buyer: UserId, seller: UserId, symbol: SymbolId) -> Trade {
        Trade {
            trade_id: id,
            symbol_id: symbol,
            maker_order_id: id * 10,
            taker_order_id: id * 10 + 1,
            buyer_user_id: buyer,
            seller_user_id: seller,
            price: 100,
            qty: 1,
            buyer_fee: 0,
            seller_fee: 0,
            taker_side: Side::Buy,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_by_user_filters_and_limits() {
        let store = TradeStore::new();
        store.insert(trade(1, 10, 20, 1));
        store.insert(trade(2, 10, 30, 2));
        store.insert(trade(3, 40, 10, 1));

        let all = store.by_user(10, None, 10);
        assert_eq!(all.len(), 3);
        // Most recent first.
        assert_eq!(all[0].trade_id, 3);

        let sym1 = store.by_user(10, Some(1), 10);
        assert_eq!(sym1.len(), 2);

        let limited = store.by_user(10, None, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].trade_id, 3);
    }

    #[test]
    fn test_by_order_scoped_to_parties() {
        let store = TradeStore::new();
        store.insert(trade(1, 10, 20, 1));
        assert_eq!(store.by_order(10, 10).len(), 1);
        assert_eq!(store.by_order(10, 20).len(), 1);
        assert!(store.by_order(10, 99).is_empty());
    }

    #[test]
    fn test_by_symbol() {
        let store = TradeStore::new();
        store.insert(trade(1, 10, 20, 1));
        store.insert(trade(2, 10, 20, 1));
        assert_eq!(store.by_symbol(1, 10).len(), 2);
        assert!(store.by_symbol(9, 10).is_empty());
    }
}

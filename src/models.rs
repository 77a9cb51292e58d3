//! Order, trade and transaction models shared by the engine and stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{OrderId, SeqNum, SymbolId, TradeId, UserId};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    /// STOP / STOP_LIMIT orders rest off-book until their trigger fires.
    #[inline]
    pub fn is_stop(self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

/// Time in force - policy governing unfilled residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good-til-cancelled: the residual rests in the book.
    #[default]
    Gtc,
    /// Immediate-or-cancel: the residual cancels after the matching loop.
    Ioc,
    /// Fill-or-kill: rejected outright unless the whole quantity can fill.
    Fok,
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states are immutable.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

/// An order as persisted by the order store.
///
/// All amounts are scaled u64 fixed point: `qty`/`filled_qty`/`display_qty`
/// by the base asset scale, `price`/`stop_price` by the quote asset scale
/// (see [`crate::money`]).
///
/// # Invariants
/// - `0 <= filled_qty <= qty`
/// - `status == Filled` iff `filled_qty == qty`
/// - `status == PartiallyFilled` implies `0 < filled_qty < qty`
/// - `closed_at` is set iff `status` is terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    /// Client-supplied identifier, unique per user.
    pub client_order_id: Option<String>,
    pub symbol_id: SymbolId,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price; 0 for MARKET / STOP orders.
    pub price: u64,
    /// Trigger price for STOP / STOP_LIMIT orders.
    pub stop_price: Option<u64>,
    pub qty: u64,
    pub filled_qty: u64,
    /// Iceberg display quantity: caps this order's contribution to
    /// aggregated depth. Matching always uses the full remaining quantity.
    pub display_qty: Option<u64>,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    /// Acceptance sequence within the symbol, used for time priority.
    pub seq: SeqNum,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Order {
    #[inline]
    pub fn remaining_qty(&self) -> u64 {
        self.qty - self.filled_qty
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled_qty == self.qty
    }

    /// Open orders are the only ones eligible for matching or cancel.
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

/// An executed fill. Immutable once created.
///
/// One record carries both sides: the maker is the order that was already
/// resting in the book at the moment of the match, the taker is the
/// incoming order. Commission is charged on the received asset, so
/// `buyer_fee` is denominated in base and `seller_fee` in quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub symbol_id: SymbolId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    /// Execution price: always the maker's limit price.
    pub price: u64,
    pub qty: u64,
    /// Buyer commission, in base asset units.
    pub buyer_fee: u64,
    /// Seller commission, in quote asset units.
    pub seller_fee: u64,
    pub taker_side: Side,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    /// True when the buy side provided the liquidity.
    #[inline]
    pub fn is_buyer_maker(&self) -> bool {
        self.taker_side == Side::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn test_serde_names_match_wire_format() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(
            serde_json::to_string(&OrderType::StopLimit).unwrap(),
            "\"STOP_LIMIT\""
        );
        assert_eq!(serde_json::to_string(&TimeInForce::Gtc).unwrap(), "\"GTC\"");
        assert_eq!(
            serde_json::to_string(&OrderStatus::PartiallyFilled).unwrap(),
            "\"PARTIALLY_FILLED\""
        );
    }
}

//! Outbound event envelopes and payload snapshots
//!
//! Every published event carries `channel`, `symbol`, `data` and a server
//! timestamp. Payloads convert the internal scaled integers to `Decimal`
//! at this boundary; nothing downstream sees raw scaled values.

use std::fmt;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core_types::{OrderId, TradeId, UserId};
use crate::models::{Order, OrderStatus, OrderType, Side, TimeInForce, Trade};
use crate::orderbook::DepthSnapshot;
use crate::symbol_registry::{SymbolInfo, SymbolRegistry};

/// Subscription channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Order,
    Trade,
    Depth,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Order => write!(f, "order"),
            Channel::Trade => write!(f, "trade"),
            Channel::Depth => write!(f, "depth"),
        }
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub channel: Channel,
    pub symbol: String,
    pub data: Value,
    /// Server timestamp, epoch milliseconds.
    pub timestamp: i64,
}

impl EventEnvelope {
    pub fn new(channel: Channel, symbol: &str, data: Value) -> Self {
        Self {
            channel,
            symbol: symbol.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Messages written to a subscriber's outbound queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    Event(EventEnvelope),
    Ping { timestamp: i64 },
}

/// Client-facing order state, emitted on the `order` channel after every
/// state change and returned by order queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: OrderId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
}

impl OrderSnapshot {
    pub fn from_order(order: &Order, info: &SymbolInfo) -> Self {
        Self {
            order_id: order.order_id,
            user_id: order.user_id,
            client_order_id: order.client_order_id.clone(),
            symbol: info.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            status: order.status,
            time_in_force: order.time_in_force,
            price: info.price_to_decimal(order.price),
            stop_price: order.stop_price.map(|p| info.price_to_decimal(p)),
            qty: info.qty_to_decimal(order.qty),
            filled_qty: info.qty_to_decimal(order.filled_qty),
            created_at: order.created_at.timestamp_millis(),
            updated_at: order.updated_at.timestamp_millis(),
            closed_at: order.closed_at.map(|t| t.timestamp_millis()),
        }
    }
}

/// Client-facing fill record, emitted on the `trade` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSnapshot {
    pub trade_id: TradeId,
    pub symbol: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    pub buyer_fee: Decimal,
    pub buyer_fee_asset: String,
    pub seller_fee: Decimal,
    pub seller_fee_asset: String,
    pub taker_side: Side,
    pub is_buyer_maker: bool,
    pub created_at: i64,
}

impl TradeSnapshot {
    pub fn from_trade(trade: &Trade, registry: &SymbolRegistry) -> Option<Self> {
        let info = registry.symbol(trade.symbol_id)?;
        let base_name = registry.asset_name(info.base_asset_id)?.to_string();
        let quote_name = registry.asset_name(info.quote_asset_id)?.to_string();
        Some(Self {
            trade_id: trade.trade_id,
            symbol: info.symbol.clone(),
            price: info.price_to_decimal(trade.price),
            qty: info.qty_to_decimal(trade.qty),
            maker_order_id: trade.maker_order_id,
            taker_order_id: trade.taker_order_id,
            buyer_user_id: trade.buyer_user_id,
            seller_user_id: trade.seller_user_id,
            buyer_fee: info.qty_to_decimal(trade.buyer_fee),
            buyer_fee_asset: base_name,
            seller_fee: info.price_to_decimal(trade.seller_fee),
            seller_fee_asset: quote_name,
            taker_side: trade.taker_side,
            is_buyer_maker: trade.is_buyer_maker(),
            created_at: trade.created_at.timestamp_millis(),
        })
    }
}

/// Aggregated depth, emitted on the `depth` channel and returned by book
/// queries.
#[derive(Debug, Clone, Serialize)]
pub struct DepthPayload {
    pub symbol: String,
    /// (price, qty), best bid first
    pub bids: Vec<(Decimal, Decimal)>,
    /// (price, qty), best ask first
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp: i64,
}

impl DepthPayload {
    pub fn from_snapshot(snapshot: &DepthSnapshot, info: &SymbolInfo) -> Self {
        let level = |&(price, qty): &(u64, u64)| {
            (info.price_to_decimal(price), info.qty_to_decimal(qty))
        };
        Self {
            symbol: info.symbol.clone(),
            bids: snapshot.bids.iter().map(level).collect(),
            asks: snapshot.asks.iter().map(level).collect(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Recovery snapshot for subscribers that missed events: the symbol's open
/// orders plus top-of-book.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncSnapshot {
    pub symbol: String,
    pub open_orders: Vec<OrderSnapshot>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(serde_json::to_string(&Channel::Order).unwrap(), "\"order\"");
        assert_eq!(Channel::Depth.to_string(), "depth");
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = EventEnvelope::new(
            Channel::Trade,
            "BTCUSDT",
            serde_json::json!({"price": "1"}),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["channel"], "trade");
        assert_eq!(value["symbol"], "BTCUSDT");
        assert!(value["timestamp"].is_i64());
    }
}

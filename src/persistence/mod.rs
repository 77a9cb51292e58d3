//! Postgres persistence
//!
//! The engine's in-memory stores are authoritative; this module mirrors
//! them into the relational schema. The mirror worker is an ordinary event
//! subscriber: it consumes the `order` and `trade` channels for every
//! configured symbol and upserts what it sees. Mirror failures are logged
//! and never roll back engine state.

pub mod balances;
pub mod orders;
pub mod schema;
pub mod trades;
pub mod transactions;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::events::messages::{OrderSnapshot, TradeSnapshot};
use crate::events::{Channel, EventPublisher, OutboundMessage};
use crate::symbol_registry::SymbolRegistry;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    Ok(pool)
}

/// Create the mirror schema if it does not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    for statement in schema::SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("schema statement failed")?;
    }
    info!("persistence schema ready");
    Ok(())
}

/// Wire-format text of a serde enum (e.g. `OrderStatus::PartiallyFilled`
/// -> `"PARTIALLY_FILLED"`), so the mirror stores exactly the API names.
pub(crate) fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => anyhow::bail!("expected string-serialized enum, got {other}"),
    }
}

pub(crate) fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {ms}"))
}

/// Spawn the mirror worker: a subscriber on the order and trade channels
/// of every configured symbol.
pub fn spawn_mirror(
    pool: PgPool,
    publisher: Arc<EventPublisher>,
    registry: &SymbolRegistry,
) -> tokio::task::JoinHandle<()> {
    let mut subscription = publisher.connect();
    for info in registry.iter_symbols() {
        let _ = publisher.subscribe(subscription.client_id, Channel::Order, &info.symbol);
        let _ = publisher.subscribe(subscription.client_id, Channel::Trade, &info.symbol);
    }
    let client_id = subscription.client_id;

    tokio::spawn(async move {
        info!(client_id, "persistence mirror started");
        while let Some(message) = subscription.receiver.recv().await {
            match message {
                OutboundMessage::Ping { .. } => publisher.pong(client_id),
                OutboundMessage::Event(envelope) => match envelope.channel {
                    Channel::Order => {
                        match serde_json::from_value::<OrderSnapshot>(envelope.data) {
                            Ok(snapshot) => {
                                if let Err(e) = orders::upsert_order(&pool, &snapshot).await {
                                    warn!(order_id = snapshot.order_id, "order mirror failed: {e}");
                                }
                            }
                            Err(e) => warn!("malformed order event: {e}"),
                        }
                    }
                    Channel::Trade => {
                        match serde_json::from_value::<TradeSnapshot>(envelope.data) {
                            Ok(snapshot) => {
                                if let Err(e) = trades::insert_trade(&pool, &snapshot).await {
                                    warn!(trade_id = snapshot.trade_id, "trade mirror failed: {e}");
                                }
                            }
                            Err(e) => warn!("malformed trade event: {e}"),
                        }
                    }
                    Channel::Depth => {}
                },
            }
        }
        info!(client_id, "persistence mirror stopped");
    })
}

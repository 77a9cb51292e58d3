//! Trade repository - append-only mirror of executed fills

use anyhow::Result;
use sqlx::PgPool;

use crate::events::messages::TradeSnapshot;

use super::{enum_text, millis_to_utc};

/// Insert one trade. Trades are immutable; replayed events are ignored.
pub async fn insert_trade(pool: &PgPool, snapshot: &TradeSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO trades (
            trade_id, symbol, maker_order_id, taker_order_id,
            buyer_user_id, seller_user_id, price, quantity,
            buyer_fee, buyer_fee_asset, seller_fee, seller_fee_asset,
            taker_side, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (trade_id) DO NOTHING
        "#,
    )
    .bind(snapshot.trade_id as i64)
    .bind(&snapshot.symbol)
    .bind(snapshot.maker_order_id as i64)
    .bind(snapshot.taker_order_id as i64)
    .bind(snapshot.buyer_user_id as i64)
    .bind(snapshot.seller_user_id as i64)
    .bind(snapshot.price)
    .bind(snapshot.qty)
    .bind(snapshot.buyer_fee)
    .bind(&snapshot.buyer_fee_asset)
    .bind(snapshot.seller_fee)
    .bind(&snapshot.seller_fee_asset)
    .bind(enum_text(&snapshot.taker_side)?)
    .bind(millis_to_utc(snapshot.created_at)?)
    .execute(pool)
    .await?;
    Ok(())
}

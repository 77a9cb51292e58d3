//! Order repository - mirrors order snapshots into Postgres

use anyhow::Result;
use chrono::DateTime;
use sqlx::PgPool;

use crate::events::messages::OrderSnapshot;

use super::{enum_text, millis_to_utc};

/// Insert or refresh one order row from its latest snapshot. The engine
/// emits a snapshot on every state change, so upserting the whole row
/// keeps the mirror convergent even after dropped events.
pub async fn upsert_order(pool: &PgPool, snapshot: &OrderSnapshot) -> Result<()> {
    let closed_at: Option<DateTime<chrono::Utc>> = match snapshot.closed_at {
        Some(ms) => Some(millis_to_utc(ms)?),
        None => None,
    };
    sqlx::query(
        r#"
        INSERT INTO orders (
            order_id, user_id, client_order_id, symbol, side, order_type,
            status, time_in_force, price, stop_price, quantity,
            filled_quantity, created_at, updated_at, closed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (order_id) DO UPDATE SET
            status = EXCLUDED.status,
            filled_quantity = EXCLUDED.filled_quantity,
            updated_at = EXCLUDED.updated_at,
            closed_at = EXCLUDED.closed_at
        "#,
    )
    .bind(snapshot.order_id as i64)
    .bind(snapshot.user_id as i64)
    .bind(&snapshot.client_order_id)
    .bind(&snapshot.symbol)
    .bind(enum_text(&snapshot.side)?)
    .bind(enum_text(&snapshot.order_type)?)
    .bind(enum_text(&snapshot.status)?)
    .bind(enum_text(&snapshot.time_in_force)?)
    .bind(snapshot.price)
    .bind(snapshot.stop_price)
    .bind(snapshot.qty)
    .bind(snapshot.filled_qty)
    .bind(millis_to_utc(snapshot.created_at)?)
    .bind(millis_to_utc(snapshot.updated_at)?)
    .bind(closed_at)
    .execute(pool)
    .await?;
    Ok(())
}

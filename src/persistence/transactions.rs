//! Transaction repository - funding history mirror

use anyhow::Result;
use sqlx::PgPool;

use crate::funding::Transaction;

use super::enum_text;

/// Record one funding transaction in its final state.
pub async fn insert_transaction(pool: &PgPool, tx: &Transaction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO account_transactions (
            id, user_id, asset, kind, amount, address, status, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(tx.id)
    .bind(tx.user_id as i64)
    .bind(&tx.asset)
    .bind(enum_text(&tx.kind)?)
    .bind(tx.amount)
    .bind(&tx.address)
    .bind(enum_text(&tx.status)?)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

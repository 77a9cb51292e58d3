//! Balance repository - mirror of the in-memory ledger rows

use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::core_types::UserId;

/// Upsert one `(user, asset)` row with its current free/locked amounts.
pub async fn upsert_balance(
    pool: &PgPool,
    user_id: UserId,
    asset: &str,
    free: Decimal,
    locked: Decimal,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO account_balances (user_id, asset, free_balance, locked_balance, updated_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (user_id, asset) DO UPDATE SET
            free_balance = EXCLUDED.free_balance,
            locked_balance = EXCLUDED.locked_balance,
            updated_at = now()
        "#,
    )
    .bind(user_id as i64)
    .bind(asset)
    .bind(free)
    .bind(locked)
    .execute(pool)
    .await?;
    Ok(())
}

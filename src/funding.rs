//! Funding - external deposit and withdrawal transactions
//!
//! Completed transactions are the only legal way to change a user's
//! `free + locked` total outside of matching. Every attempt is recorded,
//! including failures, so the history is a complete audit trail.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::balance_store::BalanceStore;
use crate::core_types::UserId;
use crate::error::EngineError;
use crate::money;
use crate::symbol_registry::SymbolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// One deposit or withdrawal attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub asset: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Records funding transactions and applies them to the balance store.
pub struct FundingLedger {
    balances: Arc<BalanceStore>,
    registry: Arc<SymbolRegistry>,
    pool: Option<PgPool>,
    log: RwLock<Vec<Transaction>>,
}

impl FundingLedger {
    pub fn new(
        balances: Arc<BalanceStore>,
        registry: Arc<SymbolRegistry>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            balances,
            registry,
            pool,
            log: RwLock::new(Vec::new()),
        }
    }

    fn parse(&self, asset: &str, amount: Decimal) -> Result<(u32, u64), EngineError> {
        let asset_id = self
            .registry
            .asset_id(asset)
            .ok_or_else(|| EngineError::validation(format!("unknown asset {asset}")))?;
        let scale = self
            .registry
            .asset(asset_id)
            .map(|a| a.scale)
            .ok_or_else(|| EngineError::validation(format!("unknown asset {asset}")))?;
        let scaled = money::parse_decimal(amount, scale)
            .map_err(|e| EngineError::validation(format!("amount: {e}")))?;
        Ok((asset_id, scaled))
    }

    fn record(&self, tx: Transaction) -> Transaction {
        if let Ok(mut log) = self.log.write() {
            log.push(tx.clone());
        }
        tx
    }

    async fn mirror(&self, tx: &Transaction, user_id: UserId, asset_id: u32, asset: &str) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = crate::persistence::transactions::insert_transaction(pool, tx).await {
            warn!(id = %tx.id, "transaction mirror failed: {e}");
        }
        if let Some(snapshot) = self.balances.get_balance(user_id, asset_id) {
            let Some(free) = self.registry.amount_to_decimal(asset_id, snapshot.free) else {
                return;
            };
            let Some(locked) = self.registry.amount_to_decimal(asset_id, snapshot.locked) else {
                return;
            };
            if let Err(e) = crate::persistence::balances::upsert_balance(
                pool, user_id, asset, free, locked,
            )
            .await
            {
                warn!(user_id, asset, "balance mirror failed: {e}");
            }
        }
    }

    pub async fn deposit(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Transaction, EngineError> {
        let (asset_id, scaled) = self.parse(asset, amount)?;
        let now = Utc::now();
        let mut tx = Transaction {
            id: Uuid::new_v4(),
            user_id,
            asset: asset.to_string(),
            kind: TransactionKind::Deposit,
            amount,
            address: None,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        match self.balances.credit_deposit(user_id, asset_id, scaled) {
            Ok(()) => {
                tx.status = TransactionStatus::Completed;
                tx.updated_at = Utc::now();
                let tx = self.record(tx);
                self.mirror(&tx, user_id, asset_id, asset).await;
                Ok(tx)
            }
            Err(err) => {
                tx.status = TransactionStatus::Failed;
                tx.updated_at = Utc::now();
                let tx = self.record(tx);
                self.mirror(&tx, user_id, asset_id, asset).await;
                Err(err)
            }
        }
    }

    pub async fn withdraw(
        &self,
        user_id: UserId,
        asset: &str,
        amount: Decimal,
        address: &str,
    ) -> Result<Transaction, EngineError> {
        let (asset_id, scaled) = self.parse(asset, amount)?;
        let now = Utc::now();
        let mut tx = Transaction {
            id: Uuid::new_v4(),
            user_id,
            asset: asset.to_string(),
            kind: TransactionKind::Withdrawal,
            amount,
            address: Some(address.to_string()),
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        match self.balances.debit_withdrawal(user_id, asset_id, scaled) {
            Ok(()) => {
                tx.status = TransactionStatus::Completed;
                tx.updated_at = Utc::now();
                let tx = self.record(tx);
                self.mirror(&tx, user_id, asset_id, asset).await;
                Ok(tx)
            }
            Err(err) => {
                tx.status = TransactionStatus::Failed;
                tx.updated_at = Utc::now();
                let tx = self.record(tx);
                self.mirror(&tx, user_id, asset_id, asset).await;
                Err(err)
            }
        }
    }

    pub fn by_user(&self, user_id: UserId) -> Vec<Transaction> {
        self.log
            .read()
            .map(|log| {
                log.iter()
                    .filter(|tx| tx.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

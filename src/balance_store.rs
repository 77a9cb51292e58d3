//! Balance store - authoritative per-(user, asset) ledger
//!
//! Every balance is split into a `free` and a `locked` partition. ALL
//! mutations go through this store; the matching engine is the only caller
//! that moves funds between users, and completed funding transactions are
//! the only legal way to change a user's `free + locked` total outside of
//! matching.
//!
//! # Locking discipline
//!
//! Rows are individually mutex-guarded. Any operation touching more than
//! one row (settlement touches up to six) collects the row handles first,
//! sorts the keys lexicographically by `(user, asset)` and locks in that
//! order. A global lock order precludes deadlock between symbol workers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;

use crate::core_types::{AssetId, UserId};
use crate::error::EngineError;

/// A single ledger row.
///
/// Fields are private: mutation is only possible through checked methods,
/// every one of which either succeeds completely or leaves the row
/// untouched. `version` increments on every successful mutation and is
/// exported in snapshots for audit trails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalanceRow {
    free: u64,
    locked: u64,
    version: u64,
}

impl BalanceRow {
    #[inline]
    pub const fn free(&self) -> u64 {
        self.free
    }

    #[inline]
    pub const fn locked(&self) -> u64 {
        self.locked
    }

    /// Total balance; `None` signals corrupted state.
    #[inline]
    pub const fn total(&self) -> Option<u64> {
        self.free.checked_add(self.locked)
    }

    #[inline]
    pub const fn version(&self) -> u64 {
        self.version
    }

    fn credit(&mut self, amount: u64) -> Result<(), &'static str> {
        self.free = self.free.checked_add(amount).ok_or("credit overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    fn debit(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.free < amount {
            return Err("insufficient free funds");
        }
        self.free -= amount;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    fn lock(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.free < amount {
            return Err("insufficient free funds");
        }
        self.free -= amount;
        self.locked = self.locked.checked_add(amount).ok_or("lock overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    fn unlock(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.locked < amount {
            return Err("insufficient locked funds");
        }
        self.locked -= amount;
        self.free = self.free.checked_add(amount).ok_or("unlock overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Remove settled funds from the locked partition.
    fn spend_locked(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.locked < amount {
            return Err("insufficient locked funds");
        }
        self.locked -= amount;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }
}

/// Read-only view of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub free: u64,
    pub locked: u64,
    pub version: u64,
}

impl From<BalanceRow> for BalanceSnapshot {
    fn from(row: BalanceRow) -> Self {
        Self {
            free: row.free,
            locked: row.locked,
            version: row.version,
        }
    }
}

/// The atomic balance transition accompanying one trade.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    pub buyer: UserId,
    pub seller: UserId,
    pub base: AssetId,
    pub quote: AssetId,
    /// Base quantity traded.
    pub qty: u64,
    /// Quote amount traded (`price * qty` in quote units).
    pub quote_amount: u64,
    /// Buyer commission, in base units.
    pub buyer_fee: u64,
    /// Seller commission, in quote units.
    pub seller_fee: u64,
}

/// Authoritative ledger for all users and assets.
pub struct BalanceStore {
    rows: DashMap<(UserId, AssetId), Arc<Mutex<BalanceRow>>>,
    fee_account: UserId,
}

impl BalanceStore {
    pub fn new(fee_account: UserId) -> Self {
        Self {
            rows: DashMap::new(),
            fee_account,
        }
    }

    pub fn fee_account(&self) -> UserId {
        self.fee_account
    }

    fn row(&self, user: UserId, asset: AssetId) -> Arc<Mutex<BalanceRow>> {
        self.rows
            .entry((user, asset))
            .or_insert_with(Arc::default)
            .clone()
    }

    fn with_row<T>(
        &self,
        user: UserId,
        asset: AssetId,
        f: impl FnOnce(&mut BalanceRow) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let row = self.row(user, asset);
        let mut guard = row
            .lock()
            .map_err(|_| EngineError::invariant("balance row mutex poisoned"))?;
        f(&mut guard)
    }

    pub fn get_balance(&self, user: UserId, asset: AssetId) -> Option<BalanceSnapshot> {
        let row = self.rows.get(&(user, asset))?;
        let guard = row.lock().ok()?;
        Some((*guard).into())
    }

    /// All non-empty rows of one user, sorted by asset.
    pub fn balances_of(&self, user: UserId) -> Vec<(AssetId, BalanceSnapshot)> {
        let mut out: Vec<(AssetId, BalanceSnapshot)> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == user)
            .filter_map(|entry| {
                let guard = entry.value().lock().ok()?;
                Some((entry.key().1, BalanceSnapshot::from(*guard)))
            })
            .filter(|(_, snap)| snap.free > 0 || snap.locked > 0)
            .collect();
        out.sort_by_key(|(asset, _)| *asset);
        out
    }

    /// System-wide `free + locked` for one asset. Used by conservation
    /// checks and operator tooling.
    pub fn total_supply(&self, asset: AssetId) -> u128 {
        self.rows
            .iter()
            .filter(|entry| entry.key().1 == asset)
            .filter_map(|entry| {
                let guard = entry.value().lock().ok()?;
                Some(guard.free as u128 + guard.locked as u128)
            })
            .sum()
    }

    /// Move `amount` from free to locked. Fails with `InsufficientFunds`
    /// when the free partition cannot cover it.
    pub fn lock(&self, user: UserId, asset: AssetId, amount: u64) -> Result<(), EngineError> {
        self.with_row(user, asset, |row| {
            let free = row.free();
            row.lock(amount).map_err(|_| EngineError::InsufficientFunds {
                asset,
                required: amount,
                free,
            })
        })
    }

    /// Move `amount` from locked back to free. A shortfall here is a logic
    /// bug, not a user error: it fails with `InvariantViolation` rather
    /// than clamping.
    pub fn unlock(&self, user: UserId, asset: AssetId, amount: u64) -> Result<(), EngineError> {
        self.with_row(user, asset, |row| {
            row.unlock(amount).map_err(|e| {
                EngineError::invariant(format!("unlock user={user} asset={asset}: {e}"))
            })
        })
    }

    /// External deposit: credits the free partition.
    pub fn credit_deposit(
        &self,
        user: UserId,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), EngineError> {
        self.with_row(user, asset, |row| {
            row.credit(amount).map_err(|e| {
                EngineError::invariant(format!("deposit user={user} asset={asset}: {e}"))
            })
        })
    }

    /// External withdrawal: debits the free partition.
    pub fn debit_withdrawal(
        &self,
        user: UserId,
        asset: AssetId,
        amount: u64,
    ) -> Result<(), EngineError> {
        self.with_row(user, asset, |row| {
            let free = row.free();
            row.debit(amount).map_err(|_| EngineError::InsufficientFunds {
                asset,
                required: amount,
                free,
            })
        })
    }

    /// Settle one trade in a single atomic step:
    ///
    /// - seller `locked(base) -= qty`, buyer `free(base) += qty - buyer_fee`
    /// - buyer `locked(quote) -= quote_amount`, seller `free(quote) += quote_amount - seller_fee`
    /// - commission credits to the fee account
    ///
    /// All touched rows are locked in deterministic key order, the whole
    /// transition is computed on copies with checked arithmetic, and only a
    /// fully valid transition is written back. Any shortfall is an
    /// `InvariantViolation` and leaves every row unchanged.
    pub fn settle(&self, s: &Settlement) -> Result<(), EngineError> {
        if s.buyer_fee > s.qty {
            return Err(EngineError::invariant(format!(
                "buyer fee {} exceeds traded qty {}",
                s.buyer_fee, s.qty
            )));
        }
        if s.seller_fee > s.quote_amount {
            return Err(EngineError::invariant(format!(
                "seller fee {} exceeds quote amount {}",
                s.seller_fee, s.quote_amount
            )));
        }

        let mut keys = vec![
            (s.buyer, s.base),
            (s.buyer, s.quote),
            (s.seller, s.base),
            (s.seller, s.quote),
            (self.fee_account, s.base),
            (self.fee_account, s.quote),
        ];
        keys.sort_unstable();
        keys.dedup();

        let handles: Vec<((UserId, AssetId), Arc<Mutex<BalanceRow>>)> = keys
            .iter()
            .map(|&(user, asset)| ((user, asset), self.row(user, asset)))
            .collect();

        let mut guards: BTreeMap<(UserId, AssetId), MutexGuard<'_, BalanceRow>> = BTreeMap::new();
        for (key, row) in &handles {
            let guard = row
                .lock()
                .map_err(|_| EngineError::invariant("balance row mutex poisoned"))?;
            guards.insert(*key, guard);
        }

        // Stage the transition on copies; commit only if every step checks out.
        let mut next: BTreeMap<(UserId, AssetId), BalanceRow> =
            guards.iter().map(|(key, guard)| (*key, **guard)).collect();

        let step = |next: &mut BTreeMap<(UserId, AssetId), BalanceRow>,
                    key: (UserId, AssetId),
                    ctx: &str,
                    f: &dyn Fn(&mut BalanceRow) -> Result<(), &'static str>|
         -> Result<(), EngineError> {
            let row = next
                .get_mut(&key)
                .ok_or_else(|| EngineError::invariant("settlement row missing"))?;
            f(row).map_err(|e| {
                EngineError::invariant(format!("settle {ctx} user={} asset={}: {e}", key.0, key.1))
            })
        };

        step(&mut next, (s.seller, s.base), "seller base", &|row| {
            row.spend_locked(s.qty)
        })?;
        step(&mut next, (s.buyer, s.base), "buyer base", &|row| {
            row.credit(s.qty - s.buyer_fee)
        })?;
        step(&mut next, (self.fee_account, s.base), "fee base", &|row| {
            row.credit(s.buyer_fee)
        })?;
        step(&mut next, (s.buyer, s.quote), "buyer quote", &|row| {
            row.spend_locked(s.quote_amount)
        })?;
        step(&mut next, (s.seller, s.quote), "seller quote", &|row| {
            row.credit(s.quote_amount - s.seller_fee)
        })?;
        step(&mut next, (self.fee_account, s.quote), "fee quote", &|row| {
            row.credit(s.seller_fee)
        })?;

        for (key, guard) in guards.iter_mut() {
            if let Some(staged) = next.get(key) {
                **guard = *staged;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: AssetId = 1;
    const USDT: AssetId = 2;
    const FEE_ACCOUNT: UserId = 0;

    fn store() -> BalanceStore {
        BalanceStore::new(FEE_ACCOUNT)
    }

    #[test]
    fn test_lock_unlock() {
        let store = store();
        store.credit_deposit(1, USDT, 1_000).unwrap();

        store.lock(1, USDT, 600).unwrap();
        let snap = store.get_balance(1, USDT).unwrap();
        assert_eq!((snap.free, snap.locked), (400, 600));

        store.unlock(1, USDT, 200).unwrap();
        let snap = store.get_balance(1, USDT).unwrap();
        assert_eq!((snap.free, snap.locked), (600, 400));
    }

    #[test]
    fn test_lock_insufficient() {
        let store = store();
        store.credit_deposit(1, USDT, 100).unwrap();
        let err = store.lock(1, USDT, 200).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientFunds {
                asset: USDT,
                required: 200,
                free: 100
            }
        );
        // Row untouched.
        let snap = store.get_balance(1, USDT).unwrap();
        assert_eq!((snap.free, snap.locked), (100, 0));
    }

    #[test]
    fn test_unlock_beyond_locked_is_invariant_violation() {
        let store = store();
        store.credit_deposit(1, USDT, 100).unwrap();
        store.lock(1, USDT, 50).unwrap();
        assert!(matches!(
            store.unlock(1, USDT, 60),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_settle_transfers_and_fees() {
        let store = store();
        // Buyer 1 holds quote, seller 2 holds base.
        store.credit_deposit(1, USDT, 50_000).unwrap();
        store.credit_deposit(2, BTC, 10).unwrap();
        store.lock(1, USDT, 30_000).unwrap();
        store.lock(2, BTC, 1).unwrap();

        store
            .settle(&Settlement {
                buyer: 1,
                seller: 2,
                base: BTC,
                quote: USDT,
                qty: 1,
                quote_amount: 30_000,
                buyer_fee: 0,
                seller_fee: 30,
            })
            .unwrap();

        let buyer_quote = store.get_balance(1, USDT).unwrap();
        assert_eq!((buyer_quote.free, buyer_quote.locked), (20_000, 0));
        assert_eq!(store.get_balance(1, BTC).unwrap().free, 1);

        let seller_base = store.get_balance(2, BTC).unwrap();
        assert_eq!((seller_base.free, seller_base.locked), (9, 0));
        assert_eq!(store.get_balance(2, USDT).unwrap().free, 29_970);

        assert_eq!(store.get_balance(FEE_ACCOUNT, USDT).unwrap().free, 30);
    }

    #[test]
    fn test_settle_conserves_supply() {
        let store = store();
        store.credit_deposit(1, USDT, 100_000).unwrap();
        store.credit_deposit(2, BTC, 500).unwrap();
        store.lock(1, USDT, 60_000).unwrap();
        store.lock(2, BTC, 200).unwrap();

        let usdt_before = store.total_supply(USDT);
        let btc_before = store.total_supply(BTC);

        store
            .settle(&Settlement {
                buyer: 1,
                seller: 2,
                base: BTC,
                quote: USDT,
                qty: 200,
                quote_amount: 60_000,
                buyer_fee: 2,
                seller_fee: 60,
            })
            .unwrap();

        assert_eq!(store.total_supply(USDT), usdt_before);
        assert_eq!(store.total_supply(BTC), btc_before);
    }

    #[test]
    fn test_settle_shortfall_leaves_rows_unchanged() {
        let store = store();
        store.credit_deposit(1, USDT, 30_000).unwrap();
        store.credit_deposit(2, BTC, 1).unwrap();
        store.lock(1, USDT, 30_000).unwrap();
        // Seller never locked base: settle must fail atomically.
        let before_buyer = store.get_balance(1, USDT).unwrap();

        let err = store
            .settle(&Settlement {
                buyer: 1,
                seller: 2,
                base: BTC,
                quote: USDT,
                qty: 1,
                quote_amount: 30_000,
                buyer_fee: 0,
                seller_fee: 30,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(store.get_balance(1, USDT).unwrap(), before_buyer);
        assert_eq!(store.get_balance(2, BTC).unwrap().free, 1);
    }

    #[test]
    fn test_concurrent_settles_do_not_deadlock() {
        use std::sync::Arc;

        let store = Arc::new(store());
        store.credit_deposit(1, USDT, 1_000_000).unwrap();
        store.credit_deposit(2, BTC, 1_000_000).unwrap();
        store.credit_deposit(2, USDT, 1_000_000).unwrap();
        store.credit_deposit(1, BTC, 1_000_000).unwrap();
        store.lock(1, USDT, 500_000).unwrap();
        store.lock(2, BTC, 500_000).unwrap();
        store.lock(2, USDT, 500_000).unwrap();
        store.lock(1, BTC, 500_000).unwrap();

        // Two threads settle with buyer/seller swapped: same four rows,
        // opposite natural orders. The sorted lock order must not deadlock.
        let a = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    store
                        .settle(&Settlement {
                            buyer: 1,
                            seller: 2,
                            base: BTC,
                            quote: USDT,
                            qty: 10,
                            quote_amount: 10,
                            buyer_fee: 0,
                            seller_fee: 0,
                        })
                        .unwrap();
                }
            })
        };
        let b = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    store
                        .settle(&Settlement {
                            buyer: 2,
                            seller: 1,
                            base: BTC,
                            quote: USDT,
                            qty: 10,
                            quote_amount: 10,
                            buyer_fee: 0,
                            seller_fee: 0,
                        })
                        .unwrap();
                }
            })
        };
        a.join().unwrap();
        b.join().unwrap();

        assert_eq!(store.total_supply(BTC), 2_000_000);
        assert_eq!(store.total_supply(USDT), 2_000_000);
    }
}

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{
    read::{AccountBalance, LedgerLine},
    write::NewLedgerLine,
    AccountKey, LineId,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("account already exists: {0}")]
    DuplicateAccount(AccountKey),
    #[error("account row is locked by another transaction: {0}")]
    LockContention(AccountKey),
    #[error("store is busy")]
    Busy,
    #[error("account not found: {0}")]
    AccountNotFound(AccountKey),
    #[error("ledger line not found: {0}")]
    LineNotFound(LineId),
    #[error("scope must be absent or non-empty")]
    InvalidScope,
    #[error("store state poisoned by a panicked writer")]
    Poisoned,
    #[error("{0}")]
    Other(String),
}

pub type TransactionId = u64;

/// Persistence for account balance rows and ledger lines.
///
/// Reads and creates on the store itself run outside any transaction. Every
/// mutation that belongs to a transfer goes through a [`StoreTransaction`]
/// obtained from [`BalanceStore::begin`], normally via [`lock_multi`].
pub trait BalanceStore: Send + Sync {
    /// Whether [`StoreTransaction::lock`] takes a real row-level lock. Stores
    /// without it must serialize whole transactions instead.
    fn supports_row_locking(&self) -> bool;

    fn find(&self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError>;
    fn create(&self, key: &AccountKey) -> Result<AccountBalance, StorageError>;

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError>;

    fn line(&self, id: LineId) -> Result<Option<LedgerLine>, StorageError>;
    fn lines_for(&self, key: &AccountKey) -> Result<Vec<LedgerLine>, StorageError>;
}

/// An open, atomic unit of work. Dropping it without [`commit`] rolls back.
///
/// [`commit`]: StoreTransaction::commit
pub trait StoreTransaction {
    fn id(&self) -> TransactionId;

    fn find(&mut self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError>;
    fn create(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError>;

    /// Reads the row under an exclusive, non-blocking lock held until the
    /// transaction ends. Fails with `LockContention` instead of waiting.
    fn lock(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError>;

    /// Reads the row, locked when `lock` is set, creating it first if it is
    /// missing. A created row is rolled back with the transaction.
    fn get_or_create(&mut self, key: &AccountKey, lock: bool) -> Result<AccountBalance, StorageError> {
        let existing = if lock {
            match self.lock(key) {
                Ok(balance) => Some(balance),
                Err(StorageError::AccountNotFound(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            self.find(key)?
        };
        match existing {
            Some(balance) => Ok(balance),
            None => {
                self.create(key)?;
                if lock {
                    self.lock(key)
                } else {
                    self.find(key)?
                        .ok_or_else(|| StorageError::AccountNotFound(key.clone()))
                }
            }
        }
    }

    fn insert_line(&mut self, line: &NewLedgerLine) -> Result<LedgerLine, StorageError>;
    fn link_partner(&mut self, line_id: LineId, partner_line_id: LineId) -> Result<(), StorageError>;

    /// Re-locks the row and overwrites its balance.
    fn update_balance(&mut self, key: &AccountKey, balance_amount: i64) -> Result<AccountBalance, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Balance snapshots read inside a [`lock_multi`] scope, keyed by account.
#[derive(Debug, Default)]
pub struct LockedBalances {
    balances: BTreeMap<AccountKey, AccountBalance>,
}

impl LockedBalances {
    pub fn get(&self, key: &AccountKey) -> Result<&AccountBalance, StorageError> {
        self.balances
            .get(key)
            .ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Opens one transaction, locks `keys` in ascending [`AccountKey`] order and
/// runs `f` inside it. `f`'s result is committed; any error rolls back.
///
/// Every caller takes locks in the same global order, so two transfers over
/// the same accounts can never each hold the lock the other one needs. On
/// stores without row locking the rows are only read; the store's
/// single-writer transaction is what keeps the scope exclusive.
///
/// With `create_missing`, absent rows are created inside the same
/// transaction, otherwise an absent row fails with `AccountNotFound`.
pub fn lock_multi<S, T, E, F>(store: &S, keys: &[AccountKey], create_missing: bool, f: F) -> Result<T, E>
where
    S: BalanceStore + ?Sized,
    E: From<StorageError>,
    F: FnOnce(&mut dyn StoreTransaction, &LockedBalances) -> Result<T, E>,
{
    let mut ordered: Vec<&AccountKey> = keys.iter().collect();
    ordered.sort();
    ordered.dedup();

    let mut tx = store.begin()?;
    let row_locking = store.supports_row_locking();
    let mut locked = LockedBalances::default();
    for key in ordered {
        let balance = if create_missing {
            tx.get_or_create(key, row_locking)?
        } else if row_locking {
            tx.lock(key)?
        } else {
            tx.find(key)?
                .ok_or_else(|| StorageError::AccountNotFound(key.clone()))?
        };
        tracing::debug!(tx_id = tx.id(), account = %key, row_locking, "Account row acquired");
        locked.balances.insert(key.clone(), balance);
    }

    match f(tx.as_mut(), &locked) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            let tx_id = tx.id();
            if let Err(rollback_err) = tx.rollback() {
                tracing::warn!(tx_id, error = %rollback_err, "Rollback after failure did not complete");
            }
            Err(e)
        }
    }
}

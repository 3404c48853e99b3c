//! In-memory balance store.
//!
//! The whole state sits behind one mutex that a transaction holds from
//! `begin` until commit or rollback, so transactions are fully serialized and
//! no row-level locking is needed. Each transaction keeps an undo log of its
//! writes and replays it backwards on rollback.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use time::OffsetDateTime;

use dualentry_core::{
    AccountBalance, AccountKey, BalanceStore, LedgerLine, LineId, NewLedgerLine, StorageError,
    StoreTransaction, TransactionId,
};

#[derive(Default)]
struct MemoryState {
    balances: BTreeMap<AccountKey, AccountBalance>,
    lines: BTreeMap<LineId, LedgerLine>,
    last_balance_id: i64,
    last_line_id: i64,
}

impl MemoryState {
    fn create(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        if self.balances.contains_key(key) {
            return Err(StorageError::DuplicateAccount(key.clone()));
        }
        self.last_balance_id += 1;
        let now = OffsetDateTime::now_utc();
        let balance = AccountBalance {
            id: self.last_balance_id,
            key: key.clone(),
            balance_amount: 0,
            inserted_at: now,
            updated_at: now,
        };
        self.balances.insert(key.clone(), balance.clone());
        Ok(balance)
    }

    fn lines_for(&self, key: &AccountKey) -> Vec<LedgerLine> {
        self.lines
            .values()
            .filter(|line| &line.account == key)
            .cloned()
            .collect()
    }
}

pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            tx_counter: AtomicU64::new(1),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl BalanceStore for InMemoryStore {
    fn supports_row_locking(&self) -> bool {
        false
    }

    fn find(&self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        Ok(self.state()?.balances.get(key).cloned())
    }

    fn create(&self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        self.state()?.create(key)
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError> {
        let state = self.state()?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction started");
        Ok(Box::new(MemoryTransaction {
            tx_id,
            state,
            undo: Vec::new(),
            finished: false,
        }))
    }

    fn line(&self, id: LineId) -> Result<Option<LedgerLine>, StorageError> {
        Ok(self.state()?.lines.get(&id).cloned())
    }

    fn lines_for(&self, key: &AccountKey) -> Result<Vec<LedgerLine>, StorageError> {
        Ok(self.state()?.lines_for(key))
    }
}

/// One write made inside a transaction, with what it replaced.
enum Undo {
    CreatedBalance(AccountKey),
    BalanceAmount {
        key: AccountKey,
        balance_amount: i64,
        updated_at: OffsetDateTime,
    },
    InsertedLine(LineId),
    PartnerLink {
        line_id: LineId,
        partner_line_id: Option<LineId>,
        updated_at: OffsetDateTime,
    },
}

struct MemoryTransaction<'a> {
    tx_id: TransactionId,
    state: MutexGuard<'a, MemoryState>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn restore(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::CreatedBalance(key) => {
                    self.state.balances.remove(&key);
                }
                Undo::BalanceAmount {
                    key,
                    balance_amount,
                    updated_at,
                } => {
                    if let Some(balance) = self.state.balances.get_mut(&key) {
                        balance.balance_amount = balance_amount;
                        balance.updated_at = updated_at;
                    }
                }
                Undo::InsertedLine(id) => {
                    self.state.lines.remove(&id);
                }
                Undo::PartnerLink {
                    line_id,
                    partner_line_id,
                    updated_at,
                } => {
                    if let Some(line) = self.state.lines.get_mut(&line_id) {
                        line.partner_line_id = partner_line_id;
                        line.updated_at = updated_at;
                    }
                }
            }
        }
        tracing::debug!(tx_id = self.tx_id, "Transaction rolled back");
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn find(&mut self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        Ok(self.state.balances.get(key).cloned())
    }

    fn create(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        let balance = self.state.create(key)?;
        self.undo.push(Undo::CreatedBalance(key.clone()));
        Ok(balance)
    }

    fn lock(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        // The transaction already owns the whole store.
        self.state
            .balances
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    fn insert_line(&mut self, line: &NewLedgerLine) -> Result<LedgerLine, StorageError> {
        if !self
            .state
            .balances
            .values()
            .any(|balance| balance.id == line.account_balance_id)
        {
            return Err(StorageError::AccountNotFound(line.account.clone()));
        }
        self.state.last_line_id += 1;
        let now = OffsetDateTime::now_utc();
        let stored = LedgerLine {
            id: self.state.last_line_id,
            account: line.account.clone(),
            partner: line.partner.clone(),
            amount: line.amount,
            balance_amount: line.balance_amount,
            code: line.code.clone(),
            metadata: line.metadata.clone(),
            partner_line_id: None,
            account_balance_id: line.account_balance_id,
            inserted_at: now,
            updated_at: now,
        };
        self.state.lines.insert(stored.id, stored.clone());
        self.undo.push(Undo::InsertedLine(stored.id));
        Ok(stored)
    }

    fn link_partner(&mut self, line_id: LineId, partner_line_id: LineId) -> Result<(), StorageError> {
        if !self.state.lines.contains_key(&partner_line_id) {
            return Err(StorageError::LineNotFound(partner_line_id));
        }
        let line = self
            .state
            .lines
            .get_mut(&line_id)
            .ok_or(StorageError::LineNotFound(line_id))?;
        self.undo.push(Undo::PartnerLink {
            line_id,
            partner_line_id: line.partner_line_id,
            updated_at: line.updated_at,
        });
        line.partner_line_id = Some(partner_line_id);
        line.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    fn update_balance(&mut self, key: &AccountKey, balance_amount: i64) -> Result<AccountBalance, StorageError> {
        let balance = self
            .state
            .balances
            .get_mut(key)
            .ok_or_else(|| StorageError::AccountNotFound(key.clone()))?;
        self.undo.push(Undo::BalanceAmount {
            key: key.clone(),
            balance_amount: balance.balance_amount,
            updated_at: balance.updated_at,
        });
        balance.balance_amount = balance_amount;
        balance.updated_at = OffsetDateTime::now_utc();
        Ok(balance.clone())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.undo.clear();
        tracing::debug!(tx_id = self.tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.restore();
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dualentry_core::{Currency, Metadata};

    use super::*;

    fn key(identifier: &str) -> AccountKey {
        AccountKey::new(identifier, Currency::new("USD"), None).unwrap()
    }

    fn new_line(balance: &AccountBalance, partner: &AccountKey, amount: i64) -> NewLedgerLine {
        NewLedgerLine {
            account: balance.key.clone(),
            partner: partner.clone(),
            amount,
            balance_amount: balance.balance_amount + amount,
            code: Arc::from("deposit"),
            metadata: Metadata::new(),
            account_balance_id: balance.id,
        }
    }

    #[test]
    fn test_memory_create_rejects_duplicates() {
        let store = InMemoryStore::new();
        let created = store.create(&key("cash")).unwrap();
        assert_eq!(created.balance_amount, 0);
        assert!(matches!(store.create(&key("cash")), Err(StorageError::DuplicateAccount(_))));
        assert_eq!(store.find(&key("cash")).unwrap().unwrap().id, created.id);
    }

    #[test]
    fn test_memory_rollback_reverses_every_kind_of_write() {
        let store = InMemoryStore::new();
        let cash = store.create(&key("cash")).unwrap();
        let bank = store.create(&key("bank")).unwrap();

        let mut tx = store.begin().unwrap();
        let first = tx.insert_line(&new_line(&cash, &bank.key, -10)).unwrap();
        let second = tx.insert_line(&new_line(&bank, &cash.key, 10)).unwrap();
        tx.link_partner(first.id, second.id).unwrap();
        tx.update_balance(&cash.key, -10).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let ghost = tx.create(&key("ghost")).unwrap();
        let third = tx.insert_line(&new_line(&ghost, &cash.key, 5)).unwrap();
        tx.link_partner(first.id, third.id).unwrap();
        tx.update_balance(&cash.key, -99).unwrap();
        tx.update_balance(&cash.key, -98).unwrap();
        tx.rollback().unwrap();

        assert!(store.find(&key("ghost")).unwrap().is_none());
        assert!(store.line(third.id).unwrap().is_none());
        let restored = store.line(first.id).unwrap().unwrap();
        assert_eq!(restored.partner_line_id, Some(second.id));
        assert_eq!(store.find(&cash.key).unwrap().unwrap().balance_amount, -10);
        assert_eq!(store.lines_for(&cash.key).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_get_or_create_in_transaction() {
        let store = InMemoryStore::new();
        let cash = store.create(&key("cash")).unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.get_or_create(&cash.key, false).unwrap().id, cash.id);
        assert_eq!(tx.get_or_create(&cash.key, true).unwrap().id, cash.id);
        let created = tx.get_or_create(&key("bank"), true).unwrap();
        assert_eq!(created.balance_amount, 0);
        let read = tx.get_or_create(&key("vault"), false).unwrap();
        assert_ne!(read.id, created.id);
        tx.commit().unwrap();

        assert_eq!(store.find(&key("bank")).unwrap().unwrap().id, created.id);
        assert_eq!(store.find(&key("vault")).unwrap().unwrap().id, read.id);

        {
            let mut tx = store.begin().unwrap();
            tx.get_or_create(&key("ghost"), true).unwrap();
        }
        assert!(store.find(&key("ghost")).unwrap().is_none());
    }

    #[test]
    fn test_memory_commit_links_lines() {
        let store = InMemoryStore::new();
        let cash = store.create(&key("cash")).unwrap();
        let bank = store.create(&key("bank")).unwrap();

        let mut tx = store.begin().unwrap();
        let debit = tx.insert_line(&new_line(&cash, &bank.key, -10)).unwrap();
        let credit = tx.insert_line(&new_line(&bank, &cash.key, 10)).unwrap();
        tx.link_partner(debit.id, credit.id).unwrap();
        tx.link_partner(credit.id, debit.id).unwrap();
        tx.update_balance(&cash.key, -10).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.line(debit.id).unwrap().unwrap().partner_line_id, Some(credit.id));
        assert_eq!(store.line(credit.id).unwrap().unwrap().partner_line_id, Some(debit.id));
        assert_eq!(store.find(&cash.key).unwrap().unwrap().balance_amount, -10);
    }

    #[test]
    fn test_memory_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let cash = store.create(&key("cash")).unwrap();
        let bank = store.create(&key("bank")).unwrap();

        {
            let mut tx = store.begin().unwrap();
            tx.insert_line(&new_line(&cash, &bank.key, -10)).unwrap();
            tx.update_balance(&cash.key, -10).unwrap();
            tx.create(&key("ghost")).unwrap();
        }

        assert_eq!(store.find(&cash.key).unwrap().unwrap().balance_amount, 0);
        assert!(store.lines_for(&cash.key).unwrap().is_empty());
        assert!(store.find(&key("ghost")).unwrap().is_none());
    }

    #[test]
    fn test_memory_link_requires_existing_partner() {
        let store = InMemoryStore::new();
        let cash = store.create(&key("cash")).unwrap();
        let bank = store.create(&key("bank")).unwrap();

        let mut tx = store.begin().unwrap();
        let debit = tx.insert_line(&new_line(&cash, &bank.key, -10)).unwrap();
        assert!(matches!(tx.link_partner(debit.id, 99), Err(StorageError::LineNotFound(99))));
        tx.rollback().unwrap();
        assert!(store.line(debit.id).unwrap().is_none());
    }
}

use std::sync::Arc;

use dualentry_core::{lock_multi, BalanceStore, LedgerLine, Money};

use crate::{
    account::{Account, AccountOptions},
    config::LedgerConfig,
    error::LedgerError,
    guard, line,
    retry::RetryPolicy,
    transfer::{AccountRef, Receipt, Transfer, TransferOutcome, TransferRequest, TransferStage},
};

/// The transfer engine: immutable configuration plus a balance store.
///
/// A `Ledger` holds no per-transfer state and can be shared across threads;
/// concurrent transfers coordinate only through the store's locks.
pub struct Ledger {
    config: Arc<LedgerConfig>,
    store: Arc<dyn BalanceStore>,
}

impl Ledger {
    pub fn new(config: Arc<LedgerConfig>, store: Arc<dyn BalanceStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn BalanceStore {
        self.store.as_ref()
    }

    pub fn lookup_account(&self, identifier: &str, opts: &AccountOptions) -> Result<Option<Account>, LedgerError> {
        Account::lookup(self.store(), &self.config, identifier, opts)
    }

    pub fn make_account(&self, identifier: &str, opts: &AccountOptions) -> Result<Account, LedgerError> {
        Account::make(self.store(), &self.config, identifier, opts)
    }

    pub fn balance(&self, identifier: &str, opts: &AccountOptions) -> Result<Money, LedgerError> {
        let key = opts.key(identifier, &self.config)?;
        match self.lookup_account(identifier, opts)? {
            Some(account) => Ok(account.balance),
            None => Err(LedgerError::AccountNotFound(key)),
        }
    }

    pub fn lines(&self, identifier: &str, opts: &AccountOptions) -> Result<Vec<LedgerLine>, LedgerError> {
        let key = opts.key(identifier, &self.config)?;
        Ok(self.store.lines_for(&key)?)
    }

    /// Runs a transfer and propagates any failure as an error.
    pub fn transfer(&self, request: TransferRequest) -> Result<Receipt, LedgerError> {
        self.attempt(request).into_result()
    }

    /// Runs a transfer, retrying with backoff while it fails on lock
    /// contention.
    pub fn transfer_with_retry(&self, request: &TransferRequest, policy: &RetryPolicy) -> Result<Receipt, LedgerError> {
        let mut attempt = 1;
        loop {
            match self.transfer(request.clone()) {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "Retrying contended transfer");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Runs a transfer and reports how far it got instead of failing.
    pub fn attempt(&self, request: TransferRequest) -> TransferOutcome {
        let code = request.code.clone();
        let mut stage = TransferStage::Proposed;
        match self.execute(request, &mut stage) {
            Ok(receipt) => {
                tracing::info!(
                    code = %code,
                    from = %receipt.debit.account,
                    to = %receipt.credit.account,
                    amount = receipt.credit.amount,
                    "Transfer committed"
                );
                TransferOutcome::Committed(receipt)
            }
            Err(error) => {
                tracing::warn!(code = %code, %stage, %error, "Transfer failed");
                TransferOutcome::Failed { stage, error }
            }
        }
    }

    fn execute(&self, request: TransferRequest, stage: &mut TransferStage) -> Result<Receipt, LedgerError> {
        let ensure_accounts = request.ensures_accounts();
        let mut transfer = self.propose(request)?;
        guard::validate(&transfer, &self.config)?;
        *stage = TransferStage::Validated;

        // With ensure_accounts, missing rows are created inside the lock scope
        // and roll back with it.
        let from_key = transfer.from.key()?;
        let to_key = transfer.to.key()?;
        if !ensure_accounts {
            Account::require(self.store(), &self.config, &from_key)?;
            Account::require(self.store(), &self.config, &to_key)?;
        }
        *stage = TransferStage::AccountsResolved;

        let money = &transfer.money;
        let from_positive_only = transfer.from.positive_only;
        let (code, metadata) = (&transfer.code, &transfer.metadata);
        let keys = [from_key.clone(), to_key.clone()];
        let (debit, credit, from_after, to_after) =
            lock_multi(self.store(), &keys, ensure_accounts, |tx, locked| -> Result<_, LedgerError> {
                *stage = TransferStage::Locked;
                let from_row = locked.get(&from_key)?;
                let to_row = locked.get(&to_key)?;

                // The pre-lock balance may be stale by now.
                if from_positive_only && from_row.balance() < *money {
                    return Err(LedgerError::InsufficientBalance {
                        account: from_key.clone(),
                        balance: from_row.balance(),
                        requested: money.clone(),
                    });
                }

                let mut debit = line::insert(tx, &-money.clone(), from_row, &to_key, code, metadata)?;
                let mut credit = line::insert(tx, money, to_row, &from_key, code, metadata)?;
                let (debit_id, credit_id) = (debit.id, credit.id);
                line::link_partner(tx, &mut debit, credit_id)?;
                line::link_partner(tx, &mut credit, debit_id)?;
                *stage = TransferStage::LinesRecorded;

                let from_after = tx.update_balance(&from_key, debit.balance_amount)?;
                let to_after = tx.update_balance(&to_key, credit.balance_amount)?;
                *stage = TransferStage::BalancesUpdated;

                Ok((debit, credit, from_after, to_after))
            })?;
        *stage = TransferStage::Committed;

        transfer.from = Account {
            positive_only: transfer.from.positive_only,
            ..Account::from_balance(&from_after, &self.config)
        };
        transfer.to = Account {
            positive_only: transfer.to.positive_only,
            ..Account::from_balance(&to_after, &self.config)
        };
        Ok(Receipt {
            transfer,
            debit,
            credit,
        })
    }

    /// Normalizes both request forms into a `Transfer` with balance
    /// snapshots. Reads only; nothing is created here.
    fn propose(&self, request: TransferRequest) -> Result<Transfer, LedgerError> {
        Ok(Transfer {
            from: self.resolve(request.from)?,
            to: self.resolve(request.to)?,
            money: request.money,
            code: request.code,
            metadata: request.metadata,
        })
    }

    fn resolve(&self, account: AccountRef) -> Result<Account, LedgerError> {
        match account {
            AccountRef::Resolved(account) => {
                account.key()?;
                Ok(Account {
                    positive_only: self.config.positive_only(&account.identifier),
                    ..account
                })
            }
            AccountRef::Named { identifier, options } => {
                let key = options.key(&identifier, &self.config)?;
                Ok(match self.store.find(&key)? {
                    Some(row) => Account::from_balance(&row, &self.config),
                    None => Account::unsaved(&key, &self.config),
                })
            }
        }
    }
}
